//! RTCP: wire formats, shared statistics, and the sender/receiver threads
//! paired with every RTP session.

pub mod packets;
pub mod receiver;
pub mod sender;
pub mod stats;

pub use packets::{
    Bye, RtcpPacket, ReceiverReport, ReportBlock, SdesChunk, SenderReport, SourceDescription,
};
pub use receiver::Receiver;
pub use sender::Sender;
pub use stats::{SharedStats, Stats};
