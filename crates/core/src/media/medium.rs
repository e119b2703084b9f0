//! One elementary track: an append-only frame list fed by the container's
//! background loader, plus the iterator registry that governs frame release.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};

use crate::error::{KgdError, Result};

use super::frame::{Frame, MediaKind};
use super::iterator::{FrameIterator, IteratorModel};

static NO_CANCEL: AtomicBool = AtomicBool::new(false);

/// Direction a time-based seek snaps in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekDirection {
    Forward,
    Backward,
}

/// Static description of a track, as reported by the demuxer.
#[derive(Debug, Clone)]
pub struct MediumSpec {
    pub kind: MediaKind,
    pub payload_type: u8,
    pub clock_rate: u32,
    pub index: usize,
    /// `a=rtpmap` codec name, e.g. `MP4V-ES`.
    pub codec: String,
    pub extradata: Vec<u8>,
    /// Seconds per demuxer tick.
    pub time_base: f64,
    pub sample_rate: Option<u32>,
    pub channels: Option<u8>,
}

impl Default for MediumSpec {
    fn default() -> Self {
        MediumSpec {
            kind: MediaKind::Video,
            payload_type: 96,
            clock_rate: 90_000,
            index: 0,
            codec: String::new(),
            extradata: Vec::new(),
            time_base: 0.0,
            sample_rate: None,
            channels: None,
        }
    }
}

struct FrameSlot {
    frame: Option<Frame>,
    releases: usize,
}

struct FrameStore {
    slots: Vec<FrameSlot>,
    /// Negative while the background loader is still producing; once set it
    /// equals `slots.len()`.
    count: i64,
    duration: f64,
    /// Seconds added to incoming frame times by insertions so far.
    time_shift: f64,
}

struct IterState {
    model: IteratorModel,
    live: Vec<u64>,
    next_id: u64,
}

/// A single elementary track of a container.
pub struct Medium {
    spec: MediumSpec,
    file_name: RwLock<String>,
    live_cast: AtomicBool,
    store: Mutex<FrameStore>,
    frame_available: Condvar,
    iters: Mutex<IterState>,
    iters_released: Condvar,
}

impl Medium {
    pub fn new(spec: MediumSpec) -> Arc<Self> {
        Arc::new(Medium {
            spec,
            file_name: RwLock::new(String::new()),
            live_cast: AtomicBool::new(false),
            store: Mutex::new(FrameStore {
                slots: Vec::new(),
                count: -1,
                duration: 0.0,
                time_shift: 0.0,
            }),
            frame_available: Condvar::new(),
            iters: Mutex::new(IterState {
                model: IteratorModel::Linear,
                live: Vec::new(),
                next_id: 0,
            }),
            iters_released: Condvar::new(),
        })
    }

    pub fn kind(&self) -> MediaKind {
        self.spec.kind
    }

    pub fn payload_type(&self) -> u8 {
        self.spec.payload_type
    }

    pub fn rate(&self) -> u32 {
        self.spec.clock_rate
    }

    pub fn index(&self) -> usize {
        self.spec.index
    }

    pub fn codec(&self) -> &str {
        &self.spec.codec
    }

    pub fn extradata(&self) -> &[u8] {
        &self.spec.extradata
    }

    pub fn time_base(&self) -> f64 {
        self.spec.time_base
    }

    pub fn sample_rate(&self) -> Option<u32> {
        self.spec.sample_rate
    }

    pub fn channels(&self) -> Option<u8> {
        self.spec.channels
    }

    pub fn spec(&self) -> &MediumSpec {
        &self.spec
    }

    pub fn file_name(&self) -> String {
        self.file_name.read().clone()
    }

    pub fn set_file_name(&self, name: &str) {
        *self.file_name.write() = name.to_string();
    }

    /// `file[track]`, the name tracks are addressed by.
    pub fn track_name(&self) -> String {
        format!("{}[{}]", self.file_name.read(), self.spec.index)
    }

    pub fn is_live_cast(&self) -> bool {
        self.live_cast.load(Ordering::Relaxed)
    }

    pub(crate) fn set_live_cast(&self, live: bool) {
        self.live_cast.store(live, Ordering::Relaxed);
    }

    pub fn duration(&self) -> f64 {
        self.store.lock().duration
    }

    pub fn set_duration(&self, duration: f64) {
        self.store.lock().duration = duration;
    }

    pub fn time_shift(&self) -> f64 {
        self.store.lock().time_shift
    }

    /// Frames appended so far (whether or not the loader is done).
    pub fn loaded_len(&self) -> usize {
        self.store.lock().slots.len()
    }

    /// Final frame count, or a negative value while still loading.
    pub fn frame_count_hint(&self) -> i64 {
        self.store.lock().count
    }

    /// Final frame count, waiting for the loader to finish.
    pub fn frame_count(&self, cancel: &AtomicBool) -> Result<usize> {
        let mut store = self.store.lock();
        while store.count < 0 {
            if cancel.load(Ordering::Relaxed) {
                return Err(KgdError::Eof);
            }
            self.frame_available.wait(&mut store);
        }
        Ok(store.count as usize)
    }

    /// Append a frame from the loader: tag it with the payload type, apply
    /// the time-shift accumulator, and record its position.
    pub fn add_frame(&self, mut frame: Frame) {
        {
            let mut store = self.store.lock();
            frame.set_payload_type(self.spec.payload_type);
            frame.shift(store.time_shift);
            frame.set_medium_pos(store.slots.len());
            debug_assert!(
                store
                    .slots
                    .last()
                    .and_then(|s| s.frame.as_ref())
                    .is_none_or(|last| frame.time() >= last.time()),
                "frame times must be non-decreasing"
            );
            store.slots.push(FrameSlot {
                frame: Some(frame),
                releases: 0,
            });
        }
        self.frame_available.notify_all();
    }

    /// Commit the final frame count and wake every waiter.
    pub fn finalize_frame_count(&self) {
        {
            let mut store = self.store.lock();
            store.count = store.slots.len() as i64;
            tracing::debug!(track = %self.track_name(), frames = store.count, "frame index complete");
        }
        self.frame_available.notify_all();
    }

    /// Wake blocked frame waiters so they can observe their cancel flags.
    pub fn interrupt(&self) {
        self.frame_available.notify_all();
    }

    /// Fetch the frame at `pos`, waiting while the loader is still behind.
    pub fn get_frame(&self, pos: usize, cancel: &AtomicBool) -> Result<Frame> {
        let mut store = self.store.lock();
        loop {
            if cancel.load(Ordering::Relaxed) {
                return Err(KgdError::Eof);
            }
            if pos < store.slots.len() {
                return match &store.slots[pos].frame {
                    Some(frame) => Ok(frame.clone()),
                    None => Err(KgdError::NotFound(format!("frame {pos} already released"))),
                };
            }
            if store.count >= 0 {
                return Err(KgdError::OutOfBounds {
                    pos,
                    len: store.slots.len(),
                });
            }
            self.frame_available.wait(&mut store);
        }
    }

    /// Index of the first valid frame at-or-after `t` (forward) or the last
    /// at-or-before `t` (backward); video snaps to key frames.
    pub fn locate(&self, t: f64, dir: SeekDirection, cancel: &AtomicBool) -> Result<usize> {
        let mut store = self.store.lock();
        match dir {
            SeekDirection::Forward => self.locate_forward(&mut store, t, cancel),
            SeekDirection::Backward => {
                // Everything up to t must be indexed before walking back.
                let upper = match self.locate_forward(&mut store, t, cancel) {
                    Ok(pos) => pos,
                    Err(KgdError::OutOfBounds { len, .. }) if len > 0 => len - 1,
                    Err(e) => return Err(e),
                };
                let mut pos = upper.min(store.slots.len().saturating_sub(1));
                loop {
                    if let Some(frame) = &store.slots[pos].frame
                        && frame.time() <= t
                        && (self.spec.kind != MediaKind::Video || frame.is_key())
                    {
                        return Ok(pos);
                    }
                    if pos == 0 {
                        return Err(KgdError::OutOfBounds {
                            pos: 0,
                            len: store.slots.len(),
                        });
                    }
                    pos -= 1;
                }
            }
        }
    }

    fn locate_forward(
        &self,
        store: &mut MutexGuard<'_, FrameStore>,
        t: f64,
        cancel: &AtomicBool,
    ) -> Result<usize> {
        let mut pos = 0usize;
        loop {
            if cancel.load(Ordering::Relaxed) {
                return Err(KgdError::Eof);
            }
            if pos >= store.slots.len() {
                if store.count < 0 {
                    self.frame_available.wait(store);
                    continue;
                }
                return Err(KgdError::OutOfBounds {
                    pos,
                    len: store.slots.len(),
                });
            }
            if let Some(frame) = &store.slots[pos].frame
                && frame.time() >= t
                && (self.spec.kind != MediaKind::Video || frame.is_key())
            {
                return Ok(pos);
            }
            pos += 1;
        }
    }

    /// Splice another track's frames in at presentation time `start`,
    /// shifting everything at or after the insertion point forward by the
    /// inserted duration.
    pub fn insert_iterator(&self, other: &mut FrameIterator, start: f64) -> Result<()> {
        if std::ptr::eq(Arc::as_ptr(other.medium()), self) {
            return Err(KgdError::InvalidState("cannot insert a medium into itself"));
        }
        let other_duration = other.duration();
        if !other_duration.is_finite() {
            return Err(KgdError::InvalidState("cannot insert an unbounded medium"));
        }
        let incoming = drain_frames(other)?;

        let mut store = self.store.lock();
        let pos = self.locate_forward(&mut store, start, &NO_CANCEL)?;
        tracing::debug!(
            track = %self.track_name(),
            pos,
            start,
            shift = other_duration,
            "media insert"
        );
        for slot in store.slots[pos..].iter_mut() {
            if let Some(frame) = slot.frame.as_mut() {
                frame.shift(other_duration);
            }
        }
        let clones = incoming.into_iter().map(|f| {
            let mut f = f.shifted(start);
            f.set_payload_type(self.spec.payload_type);
            FrameSlot {
                frame: Some(f),
                releases: 0,
            }
        });
        let spliced: Vec<FrameSlot> = clones.collect();
        let n = spliced.len();
        store.slots.splice(pos..pos, spliced);
        retag_positions(&mut store, pos);
        if store.count >= 0 {
            store.count += n as i64;
        }
        store.duration += other_duration;
        store.time_shift += other_duration;
        drop(store);
        self.frame_available.notify_all();
        Ok(())
    }

    /// Open a silent gap of `duration` seconds at presentation time `start`:
    /// shift-and-extend only, no frames inserted.
    pub fn insert_silence(&self, duration: f64, start: f64) -> Result<()> {
        let mut store = self.store.lock();
        let pos = self.locate_forward(&mut store, start, &NO_CANCEL)?;
        for slot in store.slots[pos..].iter_mut() {
            if let Some(frame) = slot.frame.as_mut() {
                frame.shift(duration);
            }
        }
        store.duration += duration;
        store.time_shift += duration;
        drop(store);
        self.frame_available.notify_all();
        Ok(())
    }

    /// Append another track's frames after the current end. Waits for this
    /// medium's loader to finish; does not advance the time shift.
    pub fn append_iterator(&self, other: &mut FrameIterator) -> Result<()> {
        let other_duration = other.duration();
        if !other_duration.is_finite() {
            return Err(KgdError::InvalidState("cannot append an unbounded medium"));
        }
        let incoming = drain_frames(other)?;

        let mut store = self.store.lock();
        while store.count < 0 {
            self.frame_available.wait(&mut store);
        }
        let offset = store.duration;
        let base = store.slots.len();
        for (i, frame) in incoming.into_iter().enumerate() {
            let mut f = frame.shifted(offset);
            f.set_payload_type(self.spec.payload_type);
            f.set_medium_pos(base + i);
            store.slots.push(FrameSlot {
                frame: Some(f),
                releases: 0,
            });
        }
        store.count = store.slots.len() as i64;
        store.duration += other_duration;
        drop(store);
        self.frame_available.notify_all();
        Ok(())
    }

    /// Release a sent frame. Only live casts free frames (on-disk media may
    /// seek back), and only once every live iterator has released it.
    pub fn release_frame(&self, pos: usize) {
        if !self.is_live_cast() {
            return;
        }
        let iters = self.iters.lock();
        if matches!(iters.model, IteratorModel::Loop(_)) {
            return;
        }
        let live = iters.live.len();
        drop(iters);

        let mut store = self.store.lock();
        if let Some(slot) = store.slots.get_mut(pos)
            && slot.frame.is_some()
        {
            slot.releases += 1;
            if slot.releases >= live {
                slot.frame = None;
            }
        }
    }

    /// Wrap the iterator model in a loop of `times` iterations (0 = forever).
    pub fn loop_model(&self, times: u8) {
        self.iters.lock().model = IteratorModel::Loop(times);
    }

    pub fn iterator_model(&self) -> IteratorModel {
        self.iters.lock().model
    }

    /// Duration of a full iteration under the current model.
    pub fn iteration_duration(&self) -> f64 {
        let duration = self.duration();
        match self.iterator_model() {
            IteratorModel::Linear => duration,
            IteratorModel::Loop(0) => f64::INFINITY,
            IteratorModel::Loop(n) => duration * n as f64,
        }
    }

    /// Clone the iterator model into a live cursor.
    pub fn new_iterator(self: &Arc<Self>) -> FrameIterator {
        let (id, model) = {
            let mut iters = self.iters.lock();
            let id = iters.next_id;
            iters.next_id += 1;
            iters.live.push(id);
            (id, iters.model)
        };
        tracing::trace!(track = %self.track_name(), id, "new iterator");
        FrameIterator::new(self.clone(), id, model)
    }

    pub(crate) fn unregister_iterator(&self, id: u64) {
        let mut iters = self.iters.lock();
        iters.live.retain(|&live| live != id);
        if iters.live.is_empty() {
            drop(iters);
            self.iters_released.notify_all();
        }
    }

    pub fn live_iterator_count(&self) -> usize {
        self.iters.lock().live.len()
    }

    /// Block until every live iterator has been released.
    pub fn wait_iterators_released(&self) {
        let mut iters = self.iters.lock();
        while !iters.live.is_empty() {
            tracing::debug!(track = %self.track_name(), live = iters.live.len(), "waiting for iterators");
            self.iters_released.wait(&mut iters);
        }
    }

    /// Clone of the static description, for `Container::assign`. The clone
    /// starts complete and empty so frames can be appended to it.
    pub fn info_clone(&self) -> Arc<Medium> {
        let clone = Medium::new(self.spec.clone());
        clone.store.lock().count = 0;
        clone
    }
}

fn retag_positions(store: &mut FrameStore, from: usize) {
    for i in from..store.slots.len() {
        if let Some(frame) = store.slots[i].frame.as_mut() {
            frame.set_medium_pos(i);
        }
    }
}

/// Pull every remaining frame out of an iterator.
fn drain_frames(it: &mut FrameIterator) -> Result<Vec<Frame>> {
    let mut frames = Vec::new();
    loop {
        match it.next() {
            Ok(frame) => frames.push(frame),
            Err(KgdError::OutOfBounds { .. }) | Err(KgdError::Eof) => return Ok(frames),
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub fn video_medium() -> Arc<Medium> {
        let medium = Medium::new(MediumSpec {
            kind: MediaKind::Video,
            payload_type: 96,
            codec: "MP4V-ES".into(),
            ..MediumSpec::default()
        });
        medium.set_file_name("clip.mp4");
        medium
    }

    /// 10 frames at 0.1s spacing, key every 5th, 1.0s total.
    pub fn fill_video(medium: &Arc<Medium>) {
        for i in 0..10 {
            medium.add_frame(Frame::new(i as f64 / 10.0, i % 5 == 0, vec![i as u8]));
        }
        medium.set_duration(1.0);
        medium.finalize_frame_count();
    }

    #[test]
    fn add_frame_tags_and_counts() {
        let medium = video_medium();
        fill_video(&medium);
        assert_eq!(medium.frame_count(&NO_CANCEL).unwrap(), 10);
        let f = medium.get_frame(3, &NO_CANCEL).unwrap();
        assert_eq!(f.payload_type(), 96);
        assert_eq!(f.medium_pos(), 3);
        assert_eq!(f.time(), 0.3);
    }

    #[test]
    fn get_frame_past_end_is_out_of_bounds() {
        let medium = video_medium();
        fill_video(&medium);
        assert!(matches!(
            medium.get_frame(99, &NO_CANCEL),
            Err(KgdError::OutOfBounds { pos: 99, len: 10 })
        ));
    }

    #[test]
    fn get_frame_waits_for_loader() {
        let medium = video_medium();
        let loader = medium.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(50));
            loader.add_frame(Frame::new(0.0, true, vec![1]));
            loader.finalize_frame_count();
        });
        let frame = medium.get_frame(0, &NO_CANCEL).unwrap();
        assert_eq!(frame.data(), &[1]);
        handle.join().unwrap();
    }

    #[test]
    fn cancelled_wait_is_eof() {
        let medium = video_medium();
        let cancel = Arc::new(AtomicBool::new(false));
        let waiter_cancel = cancel.clone();
        let waiter = medium.clone();
        let handle =
            std::thread::spawn(move || waiter.get_frame(0, &waiter_cancel));
        std::thread::sleep(std::time::Duration::from_millis(50));
        cancel.store(true, Ordering::Relaxed);
        medium.interrupt();
        assert!(matches!(handle.join().unwrap(), Err(KgdError::Eof)));
    }

    #[test]
    fn locate_snaps_video_to_key_frames() {
        let medium = video_medium();
        fill_video(&medium);
        // first key at-or-after 0.15s is frame 5 (0.5s)
        let pos = medium
            .locate(0.15, SeekDirection::Forward, &NO_CANCEL)
            .unwrap();
        assert_eq!(pos, 5);
        // backward from 0.45s snaps to key frame 0
        let pos = medium
            .locate(0.45, SeekDirection::Backward, &NO_CANCEL)
            .unwrap();
        assert_eq!(pos, 0);
    }

    #[test]
    fn insert_silence_shifts_tail() {
        let medium = video_medium();
        fill_video(&medium);
        medium.insert_silence(2.0, 0.5).unwrap();
        assert_eq!(medium.duration(), 3.0);
        assert_eq!(medium.time_shift(), 2.0);
        // frame 4 (0.4s) untouched, frame 5 (0.5s) shifted to 2.5s
        assert_eq!(medium.get_frame(4, &NO_CANCEL).unwrap().time(), 0.4);
        assert_eq!(medium.get_frame(5, &NO_CANCEL).unwrap().time(), 2.5);
    }

    #[test]
    fn insert_iterator_splices_and_shifts() {
        let host = video_medium();
        fill_video(&host);
        let guest = video_medium();
        fill_video(&guest);

        let mut it = guest.new_iterator();
        host.insert_iterator(&mut it, 0.5).unwrap();

        assert_eq!(host.frame_count(&NO_CANCEL).unwrap(), 20);
        assert_eq!(host.duration(), 2.0);
        assert_eq!(host.time_shift(), 1.0);
        // guest frame 0 lands at 0.5s, at position 5
        let f = host.get_frame(5, &NO_CANCEL).unwrap();
        assert_eq!(f.time(), 0.5);
        assert_eq!(f.medium_pos(), 5);
        // former frame 5 (0.5s) now sits after the insert, shifted by 1.0
        let f = host.get_frame(15, &NO_CANCEL).unwrap();
        assert_eq!(f.time(), 1.5);
        // monotonic across the splice
        let mut last = f64::MIN;
        for i in 0..20 {
            let t = host.get_frame(i, &NO_CANCEL).unwrap().time();
            assert!(t >= last);
            last = t;
        }
    }

    #[test]
    fn append_offsets_by_duration_without_time_shift() {
        let host = video_medium();
        fill_video(&host);
        let guest = video_medium();
        fill_video(&guest);

        let mut it = guest.new_iterator();
        host.append_iterator(&mut it).unwrap();

        assert_eq!(host.frame_count(&NO_CANCEL).unwrap(), 20);
        assert_eq!(host.duration(), 2.0);
        assert_eq!(host.time_shift(), 0.0);
        assert_eq!(host.get_frame(10, &NO_CANCEL).unwrap().time(), 1.0);
    }

    #[test]
    fn release_frame_only_on_live_casts() {
        let medium = video_medium();
        fill_video(&medium);
        let _it = medium.new_iterator();

        medium.release_frame(2);
        assert!(medium.get_frame(2, &NO_CANCEL).is_ok());

        medium.set_live_cast(true);
        medium.release_frame(2);
        assert!(matches!(
            medium.get_frame(2, &NO_CANCEL),
            Err(KgdError::NotFound(_))
        ));
    }

    #[test]
    fn release_waits_for_every_iterator() {
        let medium = video_medium();
        fill_video(&medium);
        medium.set_live_cast(true);
        let _a = medium.new_iterator();
        let _b = medium.new_iterator();

        medium.release_frame(1);
        assert!(medium.get_frame(1, &NO_CANCEL).is_ok());
        medium.release_frame(1);
        assert!(medium.get_frame(1, &NO_CANCEL).is_err());
    }

    #[test]
    fn iterator_registry_notifies_when_drained() {
        let medium = video_medium();
        fill_video(&medium);
        let it = medium.new_iterator();
        assert_eq!(medium.live_iterator_count(), 1);
        drop(it);
        assert_eq!(medium.live_iterator_count(), 0);
        medium.wait_iterators_released();
    }

    #[test]
    fn iteration_duration_follows_model() {
        let medium = video_medium();
        fill_video(&medium);
        assert_eq!(medium.iteration_duration(), 1.0);
        medium.loop_model(3);
        assert_eq!(medium.iteration_duration(), 3.0);
        medium.loop_model(0);
        assert!(medium.iteration_duration().is_infinite());
    }
}
