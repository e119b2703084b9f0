//! RTP: packets, packetization rules, and the per-track session.

pub mod packet;
pub mod packetizer;
pub mod session;

pub use packet::{DEFAULT_MTU, Packet, RTP_HEADER_LEN, RtpHeader};
pub use packetizer::{PacketizeContext, Packetizer, SplitPacketizer, packetizer_for, register_packetizer};
pub use session::{RtpSession, SessionSettings};
