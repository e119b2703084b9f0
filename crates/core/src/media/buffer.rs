//! Bounded lookahead in front of an RTP session's send cursor.
//!
//! The buffer owns the session's frame iterator (there is at most one
//! concurrent reader, the send thread) and keeps a small window of
//! already-indexed frames pre-fetched ahead of it. Seeks snap per payload
//! family: video to key frames, audio and application data to the first
//! frame at-or-after the target; with a negative speed the snap direction
//! reverses.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{KgdError, Result};

use super::frame::{Frame, MediaKind};
use super::medium::{Medium, SeekDirection};
use super::iterator::FrameIterator;

/// Frames of lookahead per payload family.
fn lookahead_for(kind: MediaKind) -> usize {
    match kind {
        MediaKind::Video => 16,
        MediaKind::Audio => 64,
        MediaKind::Application => 16,
    }
}

/// Lookahead frame window over one medium.
pub struct FrameBuffer {
    iter: FrameIterator,
    queue: VecDeque<Frame>,
    lookahead: usize,
    reverse: bool,
    stop: Arc<AtomicBool>,
}

impl FrameBuffer {
    pub fn new(medium: &Arc<Medium>) -> Self {
        let iter = medium.new_iterator();
        let stop = iter.stop_handle();
        FrameBuffer {
            iter,
            queue: VecDeque::new(),
            lookahead: lookahead_for(medium.kind()),
            reverse: false,
            stop,
        }
    }

    pub fn medium(&self) -> &Arc<Medium> {
        self.iter.medium()
    }

    /// Cancellation flag shared with the underlying iterator; setting it
    /// and interrupting the medium unblocks a waiting [`next`](Self::next).
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Position the cursor at the first valid frame for `pt` in the
    /// direction of `speed`, returning the snapped presentation time.
    pub fn seek(&mut self, pt: f64, speed: f64) -> Result<f64> {
        self.queue.clear();
        self.reverse = speed < 0.0;
        let dir = self.direction();
        let frame = self.iter.seek_time(pt, dir)?;
        let snapped = frame.time();
        if self.reverse {
            // prev() would step past it, so the snapped frame is queued.
            self.queue.push_back(frame);
        }
        tracing::trace!(track = %self.medium().track_name(), pt, snapped, "buffer seek");
        Ok(snapped)
    }

    /// The presentation time [`seek`](Self::seek) would snap to, without
    /// moving the cursor.
    pub fn dry_seek(&mut self, pt: f64, speed: f64) -> Result<f64> {
        let dir = if speed < 0.0 {
            SeekDirection::Backward
        } else {
            SeekDirection::Forward
        };
        let pos = self.iter.position_for_time(pt, dir)?;
        Ok(self.iter.at(pos)?.time())
    }

    /// Next frame in the current direction, blocking until one is indexed.
    /// Fails `Eof` past the last (or, in reverse, first) frame.
    pub fn next(&mut self) -> Result<Frame> {
        if let Some(frame) = self.queue.pop_front() {
            self.refill();
            return Ok(frame);
        }
        let fetched = if self.reverse {
            self.iter.prev()
        } else {
            self.iter.next()
        };
        match fetched {
            Ok(frame) => {
                self.refill();
                Ok(frame)
            }
            Err(KgdError::OutOfBounds { .. }) => Err(KgdError::Eof),
            Err(e) => Err(e),
        }
    }

    /// Splice another medium in at presentation time `t`.
    pub fn insert_medium(&mut self, other: &Arc<Medium>, t: f64) -> Result<()> {
        self.queue.clear();
        self.iter.insert_medium(other, t)
    }

    /// Open a silent gap of `duration` seconds at presentation time `t`.
    pub fn insert_time(&mut self, duration: f64, t: f64) -> Result<()> {
        self.queue.clear();
        self.iter.insert_time(duration, t)
    }

    /// Unblock any waiter with `Eof`.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        self.medium().interrupt();
    }

    fn direction(&self) -> SeekDirection {
        if self.reverse {
            SeekDirection::Backward
        } else {
            SeekDirection::Forward
        }
    }

    /// Pull already-indexed frames forward into the window; never blocks.
    fn refill(&mut self) {
        if self.reverse {
            return;
        }
        while self.queue.len() < self.lookahead && self.frame_ready() {
            match self.iter.next() {
                Ok(frame) => self.queue.push_back(frame),
                Err(_) => break,
            }
        }
    }

    fn frame_ready(&self) -> bool {
        let medium = self.iter.medium();
        if medium.frame_count_hint() >= 0 {
            return true;
        }
        self.iter.pos() < medium.loaded_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::frame::Frame;
    use crate::media::medium::MediumSpec;
    use crate::media::medium::tests::{fill_video, video_medium};

    fn audio_medium() -> Arc<Medium> {
        let medium = Medium::new(MediumSpec {
            kind: MediaKind::Audio,
            payload_type: 14,
            clock_rate: 44_100,
            index: 1,
            codec: "MPA".into(),
            ..MediumSpec::default()
        });
        medium.set_file_name("clip.mp4");
        for i in 0..20 {
            medium.add_frame(Frame::new(i as f64 / 20.0, true, vec![i as u8]));
        }
        medium.set_duration(1.0);
        medium.finalize_frame_count();
        medium
    }

    #[test]
    fn video_seek_snaps_to_key_frame() {
        let medium = video_medium();
        fill_video(&medium);
        let mut buf = FrameBuffer::new(&medium);
        // keys at 0.0 and 0.5
        assert_eq!(buf.seek(0.2, 1.0).unwrap(), 0.5);
        assert_eq!(buf.next().unwrap().time(), 0.5);
    }

    #[test]
    fn audio_seek_snaps_to_next_frame() {
        let medium = audio_medium();
        let mut buf = FrameBuffer::new(&medium);
        assert_eq!(buf.seek(0.12, 1.0).unwrap(), 0.15);
        assert_eq!(buf.next().unwrap().time(), 0.15);
    }

    #[test]
    fn dry_seek_does_not_move_cursor() {
        let medium = video_medium();
        fill_video(&medium);
        let mut buf = FrameBuffer::new(&medium);
        buf.seek(0.0, 1.0).unwrap();
        assert_eq!(buf.dry_seek(0.2, 1.0).unwrap(), 0.5);
        assert_eq!(buf.next().unwrap().time(), 0.0);
    }

    #[test]
    fn sequential_reads_end_with_eof() {
        let medium = audio_medium();
        let mut buf = FrameBuffer::new(&medium);
        buf.seek(0.0, 1.0).unwrap();
        for i in 0..20 {
            assert_eq!(buf.next().unwrap().time(), i as f64 / 20.0);
        }
        assert!(matches!(buf.next(), Err(KgdError::Eof)));
    }

    #[test]
    fn reverse_reads_walk_backward() {
        let medium = audio_medium();
        let mut buf = FrameBuffer::new(&medium);
        let snapped = buf.seek(0.5, -1.0).unwrap();
        assert_eq!(snapped, 0.5);
        assert_eq!(buf.next().unwrap().time(), 0.5);
        assert_eq!(buf.next().unwrap().time(), 0.45);
        assert_eq!(buf.next().unwrap().time(), 0.4);
    }

    #[test]
    fn reverse_reaches_start_then_eof() {
        let medium = audio_medium();
        let mut buf = FrameBuffer::new(&medium);
        buf.seek(0.05, -1.0).unwrap();
        assert_eq!(buf.next().unwrap().time(), 0.05);
        assert_eq!(buf.next().unwrap().time(), 0.0);
        assert!(matches!(buf.next(), Err(KgdError::Eof)));
    }

    #[test]
    fn stop_unblocks_waiting_fetch() {
        let medium = video_medium(); // loader never finishes
        let mut buf = FrameBuffer::new(&medium);
        let stopper = buf.stop.clone();
        let target = medium.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(50));
            stopper.store(true, Ordering::Relaxed);
            target.interrupt();
        });
        assert!(matches!(buf.next(), Err(KgdError::Eof)));
        handle.join().unwrap();
    }

    #[test]
    fn insert_during_pause_extends_stream() {
        let host = video_medium();
        fill_video(&host);
        let guest = video_medium();
        fill_video(&guest);

        let mut buf = FrameBuffer::new(&host);
        buf.seek(0.0, 1.0).unwrap();
        buf.insert_medium(&guest, 0.5).unwrap();
        assert_eq!(host.duration(), 2.0);
        // the splice lands where the cursor will pass
        let mut times = Vec::new();
        while let Ok(frame) = buf.next() {
            times.push(frame.time());
        }
        assert_eq!(times.len(), 20);
        assert!(times.windows(2).all(|w| w[0] <= w[1]));
    }
}
