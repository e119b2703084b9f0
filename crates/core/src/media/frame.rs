use std::sync::Arc;

/// Kind of elementary track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
    Application,
}

impl MediaKind {
    /// SDP `m=` type token.
    pub fn sdp_name(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
            MediaKind::Application => "application",
        }
    }
}

/// A timestamped immutable elementary-stream payload.
///
/// Owned by its medium's frame list; iterators address frames by index and
/// clone them (payload bytes are shared) when handing them out.
#[derive(Debug, Clone)]
pub struct Frame {
    time: f64,
    payload_type: u8,
    is_key: bool,
    medium_pos: usize,
    data: Arc<[u8]>,
}

impl Frame {
    pub fn new(time: f64, is_key: bool, data: impl Into<Arc<[u8]>>) -> Self {
        Frame {
            time,
            payload_type: 0,
            is_key,
            medium_pos: 0,
            data: data.into(),
        }
    }

    /// Presentation time in seconds.
    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn payload_type(&self) -> u8 {
        self.payload_type
    }

    pub fn is_key(&self) -> bool {
        self.is_key
    }

    /// Index of this frame within its medium's list.
    pub fn medium_pos(&self) -> usize {
        self.medium_pos
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Shift the presentation time by `delta` seconds.
    pub fn shift(&mut self, delta: f64) {
        self.time += delta;
    }

    /// Copy with a shifted presentation time; payload bytes are shared.
    pub fn shifted(&self, delta: f64) -> Frame {
        let mut copy = self.clone();
        copy.time += delta;
        copy
    }

    pub(crate) fn set_payload_type(&mut self, pt: u8) {
        self.payload_type = pt;
    }

    pub(crate) fn set_medium_pos(&mut self, pos: usize) {
        self.medium_pos = pos;
    }
}
