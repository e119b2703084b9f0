//! An RTSP session: the aggregate of RTP sessions created under one
//! `Session:` id, with aggregate play/pause/teardown control.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::error::{KgdError, Result};
use crate::media::Container;
use crate::protocol::PlayRequest;
use crate::rtp::RtpSession;

/// Aggregate of per-track RTP sessions, keyed by track name in track
/// order.
pub struct RtspSession {
    id: u32,
    tracks: Mutex<BTreeMap<String, Arc<RtpSession>>>,
    play_issued: AtomicBool,
}

impl RtspSession {
    pub fn new(id: u32) -> Arc<Self> {
        tracing::debug!(session_id = id, "RTSP session created");
        Arc::new(RtspSession {
            id,
            tracks: Mutex::new(BTreeMap::new()),
            play_issued: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Register the RTP session serving one track (SETUP).
    pub fn add_track(&self, track: &str, session: Arc<RtpSession>) {
        self.tracks.lock().insert(track.to_string(), session);
    }

    pub fn track(&self, track: &str) -> Result<Arc<RtpSession>> {
        self.tracks
            .lock()
            .get(track)
            .cloned()
            .ok_or_else(|| KgdError::TrackNotFound(track.to_string()))
    }

    pub fn tracks(&self) -> Vec<Arc<RtpSession>> {
        self.tracks.lock().values().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.lock().is_empty()
    }

    /// Tear down and remove one track's RTP session.
    pub fn remove_track(&self, track: &str) -> Result<()> {
        let session = self
            .tracks
            .lock()
            .remove(track)
            .ok_or_else(|| KgdError::TrackNotFound(track.to_string()))?;
        session.teardown(&PlayRequest::new());
        Ok(())
    }

    /// Whether a play has ever been issued on this session.
    pub fn has_played(&self) -> bool {
        self.play_issued.load(Ordering::Relaxed)
    }

    /// Whether any track's send loop has yet to start (or has ended).
    /// Such a track must go through [`play`](Self::play), not an unpause.
    pub fn any_track_stopped(&self) -> bool {
        self.tracks().iter().any(|s| s.is_stopped())
    }

    /// Aggregate pre-play: prepare every track, merging the effective
    /// ranges into one reply range.
    pub fn play(&self, rq: &PlayRequest) -> Result<PlayRequest> {
        let mut merged: Option<PlayRequest> = None;
        for session in self.tracks() {
            let ret = session.play(rq)?;
            merged = Some(match merged {
                None => ret,
                Some(prev) => merge_ranges(prev, ret),
            });
        }
        self.play_issued.store(true, Ordering::Relaxed);
        merged.ok_or_else(|| KgdError::InvalidState("play on a session with no tracks"))
    }

    /// Aggregate post-play: unpark every send loop.
    pub fn start(&self) {
        for session in self.tracks() {
            session.start();
        }
        self.play_issued.store(true, Ordering::Relaxed);
    }

    pub fn pause(&self, rq: &PlayRequest) {
        for session in self.tracks() {
            session.pause(rq);
        }
    }

    pub fn unpause(&self, rq: &PlayRequest) {
        for session in self.tracks() {
            session.unpause(rq);
        }
    }

    /// Tear everything down and forget the tracks.
    pub fn teardown(&self) {
        let sessions: Vec<_> = {
            let mut tracks = self.tracks.lock();
            std::mem::take(&mut *tracks).into_values().collect()
        };
        for session in sessions {
            session.teardown(&PlayRequest::new());
        }
        tracing::debug!(session_id = self.id, "RTSP session torn down");
    }

    /// The range currently playing, from the first track.
    pub fn play_range(&self) -> Result<PlayRequest> {
        let mut range: Option<PlayRequest> = None;
        for session in self.tracks() {
            let r = session.play_range();
            range = Some(match range {
                None => r,
                Some(prev) => merge_ranges(prev, r),
            });
        }
        range.ok_or_else(|| KgdError::InvalidState("range of a session with no tracks"))
    }

    /// The range of one track.
    pub fn track_play_range(&self, track: &str) -> Result<PlayRequest> {
        Ok(self.track(track)?.play_range())
    }

    /// Splice extra media into every running track at media time `at`
    /// (∞ = as soon as possible). Sessions must be paused.
    pub fn insert_media(&self, media: &Container, at: f64) -> Result<()> {
        for session in self.tracks() {
            let t = session.evaluate_medium_insertion(at)?;
            match media.medium_by_payload_type(session.medium().payload_type()) {
                Some(medium) => session.insert_medium(&medium, t)?,
                None => session.insert_time(media.duration(), t)?,
            }
        }
        Ok(())
    }
}

impl Drop for RtspSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Merge two effective ranges into the aggregate reply range.
fn merge_ranges(a: PlayRequest, b: PlayRequest) -> PlayRequest {
    let mut merged = a;
    merged.from = if a.speed < 0.0 {
        a.from.max(b.from)
    } else {
        a.from.min(b.from)
    };
    merged.to = a.to.max(b.to);
    merged
}
