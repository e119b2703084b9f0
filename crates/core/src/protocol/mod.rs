//! RTSP message parsing and generation.

pub mod request;
pub mod response;
pub mod sdp;

pub use request::{RtspRequest, RtspUrl, TransportSpec};
pub use response::RtspResponse;

use crate::clock;

/// Recognized client software, dispatching timeline behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserAgent {
    Generic,
    Vlc102,
    Vlc106,
    Vlc114,
    LibVlc114,
}

impl UserAgent {
    /// Exact-match on the advertised `User-Agent` strings of known builds;
    /// everything else is treated as generic.
    pub fn from_header(value: &str) -> Self {
        match value {
            "VLC media player (LIVE555 Streaming Media v2008.07.24)" => UserAgent::Vlc102,
            "VLC media player (LIVE555 Streaming Media v2010.02.10)" => UserAgent::Vlc106,
            "VLC media player (LIVE555 Streaming Media v2010.04.09)" => UserAgent::Vlc114,
            "LibVLC/1.1.4 (LIVE555 Streaming Media v2010.04.09)" => UserAgent::LibVlc114,
            _ => UserAgent::Generic,
        }
    }
}

/// A play request as carried by PLAY/PAUSE handling: the `Range` and
/// `Scale` values with their presence flags, stamped with the wall-clock
/// time it was evaluated at. Infinite values mean "unspecified".
#[derive(Debug, Clone, Copy)]
pub struct PlayRequest {
    pub time: f64,
    pub from: f64,
    pub to: f64,
    pub speed: f64,
    pub has_range: bool,
    pub has_scale: bool,
}

impl PlayRequest {
    pub fn new() -> Self {
        PlayRequest {
            time: clock::now(),
            from: f64::INFINITY,
            to: f64::INFINITY,
            speed: f64::INFINITY,
            has_range: false,
            has_scale: false,
        }
    }
}

impl Default for PlayRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PlayRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:.3} - {:.3} x{:.2}]", self.from, self.to, self.speed)
    }
}

/// Size of the next whole packet at the front of the connection's input
/// buffer, or `None` while it is still incomplete.
///
/// A `$`-prefixed record's size comes from the framing length field; a text
/// message ends at the blank line plus whatever `Content-Length` announces.
pub fn next_packet_len(buf: &[u8]) -> Option<usize> {
    if buf.is_empty() {
        return None;
    }
    if buf[0] == b'$' {
        if buf.len() < 4 {
            return None;
        }
        let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        return if buf.len() >= 4 + len {
            Some(4 + len)
        } else {
            None
        };
    }

    let header_end = buf.windows(4).position(|w| w == b"\r\n\r\n")? + 4;
    let header = String::from_utf8_lossy(&buf[..header_end]);
    let content_length = header
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.trim()
                .eq_ignore_ascii_case("Content-Length")
                .then(|| value.trim().parse::<usize>().ok())?
        })
        .unwrap_or(0);
    let total = header_end + content_length;
    (buf.len() >= total).then_some(total)
}
