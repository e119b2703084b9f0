//! Byte-stream channel abstraction.
//!
//! RTP, RTCP and RTSP traffic all flow through [`Channel`] objects so the
//! sessions never care whether a track rides its own UDP socket pair or a
//! logical channel interleaved on the RTSP TCP connection.

pub mod interleave;
pub mod tcp;
pub mod udp;

pub use interleave::{InterleavedChannel, TcpMux};
pub use tcp::TcpChannel;
pub use udp::UdpChannel;

use crate::error::Result;

/// Whether a channel owns its transport or shares the RTSP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Dedicated OS socket (UDP pair negotiated via `client_port`).
    Owned,
    /// Logical channel multiplexed on the RTSP TCP socket (`interleaved`).
    Shared,
}

/// Transport description of a channel: kind plus `(local, remote)` ports.
/// For interleaved channels the ports are the one-byte channel ids.
#[derive(Debug, Clone, Copy)]
pub struct ChannelDesc {
    pub kind: ChannelKind,
    pub ports: (u16, u16),
}

/// Uniform read/write surface over UDP sockets, TCP sockets, and
/// interleaved logical channels.
///
/// All methods take `&self`: implementations are internally synchronized so
/// an RTCP sender and receiver can share one bidirectional channel from two
/// threads.
pub trait Channel: Send + Sync {
    /// Read up to `buf.len()` bytes. Blocking behavior follows the
    /// configured mode and read timeout; an expired timeout surfaces as an
    /// error whose [`would_block`](crate::KgdError::would_block) is true.
    fn read_some(&self, buf: &mut [u8]) -> Result<usize>;

    /// Write up to `buf.len()` bytes, returning how many were accepted.
    fn write_some(&self, buf: &[u8]) -> Result<usize>;

    /// Like [`write_some`](Self::write_some), additionally marking the
    /// record boundary where the transport supports it. The default
    /// implementation just writes.
    fn write_last(&self, buf: &[u8]) -> Result<usize> {
        self.write_some(buf)
    }

    /// Toggle blocking reads.
    fn set_read_blocking(&self, blocking: bool) -> Result<()>;

    /// Bound blocking reads to `secs` seconds; `None` blocks indefinitely.
    fn set_read_timeout(&self, secs: Option<f64>) -> Result<()>;

    /// Toggle blocking writes.
    fn set_write_blocking(&self, blocking: bool) -> Result<()>;

    /// Bound blocking writes to `secs` seconds; `None` blocks indefinitely.
    fn set_write_timeout(&self, secs: Option<f64>) -> Result<()>;

    /// Resize the transport send buffer.
    fn set_write_buffer(&self, bytes: usize) -> Result<()>;

    /// Tear the channel down, waking any blocked reader.
    fn close(&self);

    /// Transport description.
    fn description(&self) -> ChannelDesc;
}

pub(crate) fn timeout_duration(secs: Option<f64>) -> Option<std::time::Duration> {
    secs.filter(|s| *s > 0.0).map(std::time::Duration::from_secs_f64)
}
