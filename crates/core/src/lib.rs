//! # kgd — RTSP/RTP/RTCP streaming server engine
//!
//! Streams the elementary tracks of local container files (and playlists
//! of them) to RTSP clients over UDP or TCP-interleaved transports, with
//! seeking, variable-speed and reverse playback, pause, and live insertion
//! of additional media into an in-progress session.
//!
//! ## Protocol references
//!
//! | RFC | Topic | How this crate uses it |
//! |-----|-------|----------------------|
//! | [RFC 2326](https://tools.ietf.org/html/rfc2326) | RTSP 1.0 | Request/response parsing, session lifecycle, transport negotiation, TCP interleaving |
//! | [RFC 3550](https://tools.ietf.org/html/rfc3550) | RTP/RTCP | Packet formats, SSRC and sequence semantics, SR/RR/SDES/BYE |
//! | [RFC 4566](https://tools.ietf.org/html/rfc4566) | SDP | Session descriptions for DESCRIBE responses |
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │  Server          — accept loop                │
//! │  Connection      — listen loop, dispatch      │
//! ├───────────────────────────────────────────────┤
//! │  methods         — OPTIONS … TEARDOWN         │
//! │  session         — per-Session: aggregate     │
//! │  protocol        — parsing, SDP               │
//! ├───────────────────────────────────────────────┤
//! │  rtp / rtcp      — send loop, reports         │
//! │  timeline        — play/pause/seek clock      │
//! ├───────────────────────────────────────────────┤
//! │  media           — frames, containers, demux  │
//! │  channel         — UDP / TCP / interleaved    │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! Media decoding is external: register a [`media::DemuxerFactory`] and
//! the container loader will pull timestamped elementary-stream packets
//! through it.

pub mod channel;
pub mod clock;
pub mod config;
pub mod connection;
pub mod error;
pub mod media;
pub mod methods;
pub mod protocol;
pub mod rtcp;
pub mod rtp;
pub mod server;
pub mod session;
pub mod status;
pub mod sync;
pub mod timeline;

pub use config::{Config, SharedConfig};
pub use error::{KgdError, Result};
pub use server::Server;
pub use status::Status;
