//! Error types for the streaming engine.

use std::fmt;
use std::io;

use crate::status::Status;

/// Errors that can occur across the stack.
///
/// Variants map to the failure modes of the engine:
///
/// - **Protocol**: [`Managed`](Self::Managed) — client-surfaceable errors
///   carrying an RTSP status, returned as a terse reply on the same CSeq.
/// - **Transport**: [`Channel`](Self::Channel) — socket failures. The
///   [`would_block`](Self::would_block) predicate distinguishes expected
///   timeouts from fatal errors; [`ChannelClosed`](Self::ChannelClosed) is
///   raised by readers of a channel being torn down.
/// - **Media**: [`Eof`](Self::Eof) — past the last frame; the send loop
///   observes it and stops cleanly.
/// - **Invariant breaches**: [`InvalidState`](Self::InvalidState),
///   [`OutOfBounds`](Self::OutOfBounds) — abort the local operation.
/// - **Lookups**: [`SessionNotFound`](Self::SessionNotFound),
///   [`TrackNotFound`](Self::TrackNotFound), [`NotFound`](Self::NotFound).
#[derive(Debug, thiserror::Error)]
pub enum KgdError {
    /// Protocol error with an RTSP status, surfaced to the client.
    #[error("{status}: {detail}")]
    Managed { status: Status, detail: String },

    /// Underlying socket or I/O error on a channel.
    #[error("channel error: {0}")]
    Channel(#[from] io::Error),

    /// The channel was closed while a reader was blocked on it.
    #[error("connection shut down")]
    ChannelClosed,

    /// Past the last frame of the medium.
    #[error("end of input")]
    Eof,

    /// An internal invariant was violated.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// Index past the end of a frame list.
    #[error("position {pos} out of bounds 0..{len}")]
    OutOfBounds { pos: usize, len: usize },

    /// No RTSP session with the given id.
    #[error("session {0} not found")]
    SessionNotFound(u32),

    /// No RTP session for the given track of an RTSP session.
    #[error("track {0:?} not found")]
    TrackNotFound(String),

    /// Generic lookup failure (file, interleave channel, demuxer, ...).
    #[error("{0} not found")]
    NotFound(String),
}

impl KgdError {
    /// Shorthand for a client-surfaceable error.
    pub fn managed(status: Status, detail: impl fmt::Display) -> Self {
        KgdError::Managed {
            status,
            detail: detail.to_string(),
        }
    }

    /// True when this is a channel error a caller should retry after: the
    /// read or write timed out, or the socket would have blocked.
    pub fn would_block(&self) -> bool {
        match self {
            KgdError::Channel(e) => matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// RTSP status this error maps to on the reply path.
    pub fn status(&self) -> Status {
        match self {
            KgdError::Managed { status, .. } => *status,
            KgdError::SessionNotFound(_) => Status::SESSION_NOT_FOUND,
            KgdError::TrackNotFound(_) | KgdError::NotFound(_) => Status::NOT_FOUND,
            _ => Status::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Convenience alias for `Result<T, KgdError>`.
pub type Result<T> = std::result::Result<T, KgdError>;
