//! Playback timeline accumulators.
//!
//! A session's clock is assembled from three segment accumulators plus a
//! seek counter: `life` spans first start to final stop, `play` is a
//! sequence of constant-speed intervals, `pause` a sequence of unit-speed
//! intervals disjoint from active play. Derived:
//!
//! - `presentation_time(t) = play.elapsed(t) + seek.relative`
//! - `play_time(t) = life.elapsed(t) - pause.elapsed(t)`
//! - `rtp_time(pt, t) = rtp_base + ticks(play_time(t) + (pt - presentation_time(t)) / speed)`
//!
//! VLC's LIVE555 builds expect RTP timestamps proportional to the
//! presentation time instead; the [`TimestampRule`] chosen from the
//! recognized user agent selects between the two.

use parking_lot::Mutex;
use rand::RngExt;

use crate::error::{KgdError, Result};
use crate::protocol::UserAgent;

/// Seconds → RTP ticks at the given clock rate, wrapping as the wire does.
pub fn sec_to_ticks(sec: f64, rate: u32) -> u32 {
    (sec * rate as f64) as i64 as u32
}

/// A portion of time elapsed between two points, running at a signed speed.
#[derive(Debug, Clone, Copy)]
pub struct Segment {
    start: f64,
    stop: f64,
    speed: f64,
}

impl Segment {
    pub fn new() -> Self {
        Segment {
            start: f64::INFINITY,
            stop: f64::INFINITY,
            speed: 1.0,
        }
    }

    /// Start at `t`; later starts have no effect, even after a stop.
    pub fn start(&mut self, t: f64, speed: Option<f64>) {
        if self.start.is_infinite() {
            self.start = t;
            if let Some(s) = speed {
                self.speed = s;
            }
        }
    }

    /// Stop at `t`; later stops have no effect.
    pub fn stop(&mut self, t: f64) {
        if self.start.is_finite() && self.stop.is_infinite() {
            self.stop = t;
        }
    }

    pub fn is_running(&self) -> bool {
        self.start.is_finite() && self.stop.is_infinite()
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    pub fn begin(&self) -> f64 {
        self.start
    }

    /// Seconds elapsed from start at this segment's speed; 0 before start.
    pub fn elapsed(&self, t: f64) -> f64 {
        if self.start.is_finite() {
            (self.stop.min(t) - self.start) * self.speed
        } else {
            0.0
        }
    }
}

impl Default for Segment {
    fn default() -> Self {
        Self::new()
    }
}

/// The accumulated result of successive segments at different speeds.
#[derive(Debug, Clone)]
pub struct MultiSegment {
    current: Option<Segment>,
    speed: f64,
    start: f64,
    total: f64,
    last: f64,
}

impl MultiSegment {
    pub fn new() -> Self {
        MultiSegment {
            current: None,
            speed: 1.0,
            start: f64::INFINITY,
            total: 0.0,
            last: 0.0,
        }
    }

    pub fn current_speed(&self) -> f64 {
        self.speed
    }

    pub fn begin(&self) -> f64 {
        self.start
    }

    pub fn is_running(&self) -> bool {
        self.current.as_ref().is_some_and(Segment::is_running)
    }

    /// Total elapsed: finished segments plus the current one.
    pub fn elapsed(&self, t: f64) -> f64 {
        if self.is_running() {
            self.total + self.current.as_ref().map_or(0.0, |c| c.elapsed(t))
        } else {
            self.total
        }
    }

    /// Elapsed of the running segment, or of the last finished one.
    pub fn last(&self, t: f64) -> f64 {
        if self.is_running() {
            self.current.as_ref().map_or(0.0, |c| c.elapsed(t))
        } else {
            self.last
        }
    }

    /// Begin the first segment. Starting twice is an invariant violation.
    pub fn start(&mut self, t: f64, speed: Option<f64>) -> Result<()> {
        if self.start.is_finite() {
            return Err(KgdError::InvalidState("multi-segment already started"));
        }
        self.start = t;
        if let Some(s) = speed {
            self.speed = s;
        }
        self.current = Some(running_segment(t, self.speed));
        Ok(())
    }

    /// Stop the current segment, folding its elapsed into the total.
    pub fn stop(&mut self, t: f64) {
        if self.is_running() {
            if let Some(current) = self.current.as_mut() {
                current.stop(t);
                self.last = current.elapsed(t);
                self.total += self.last;
            }
        }
    }

    /// Stop the current segment (if running) and begin a new one; also
    /// usable in place of [`start`](Self::start).
    pub fn next(&mut self, t: f64, speed: Option<f64>) {
        if self.is_running() {
            self.stop(t);
        } else if self.start.is_infinite() {
            self.start = t;
        }
        if let Some(s) = speed {
            self.speed = s;
        }
        self.current = Some(running_segment(t, self.speed));
    }
}

impl Default for MultiSegment {
    fn default() -> Self {
        Self::new()
    }
}

fn running_segment(t: f64, speed: f64) -> Segment {
    let mut seg = Segment::new();
    seg.start(t, Some(speed));
    seg
}

/// Seek offsets accumulated over a session's life, in seconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct Seek {
    /// Total distance seeked, unsigned.
    pub absolute: f64,
    /// Net shift applied to the presentation time.
    pub relative: f64,
    /// Total backward shift.
    pub left: f64,
    /// Total forward shift.
    pub right: f64,
}

impl Seek {
    pub fn add(&mut self, delta: f64) {
        self.absolute += delta.abs();
        self.relative += delta;
        if delta > 0.0 {
            self.right += delta;
        } else {
            self.left -= delta;
        }
    }
}

/// RTP timestamp derivation rule, dispatched on the recognized user agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampRule {
    /// Timestamps follow the play time; monotonic across seek and scale.
    Monotonic,
    /// Timestamps proportional to the presentation time (VLC/LIVE555).
    PresentationTime,
}

impl TimestampRule {
    pub fn for_user_agent(ua: UserAgent) -> Self {
        match ua {
            UserAgent::Generic => TimestampRule::Monotonic,
            UserAgent::Vlc102 | UserAgent::Vlc106 | UserAgent::Vlc114 | UserAgent::LibVlc114 => {
                TimestampRule::PresentationTime
            }
        }
    }
}

struct TimelineState {
    life: Segment,
    play: MultiSegment,
    pause: MultiSegment,
    seek: Seek,
    rtp_base: u32,
}

/// The combined per-session timeline. All transitions lock internally.
pub struct Timeline {
    state: Mutex<TimelineState>,
    rate: u32,
    rule: TimestampRule,
}

impl Timeline {
    pub fn new(rate: u32, rule: TimestampRule) -> Self {
        Timeline {
            state: Mutex::new(TimelineState {
                life: Segment::new(),
                play: MultiSegment::new(),
                pause: MultiSegment::new(),
                seek: Seek::default(),
                rtp_base: random_rtp_base(),
            }),
            rate,
            rule,
        }
    }

    pub fn for_user_agent(rate: u32, ua: UserAgent) -> Self {
        Self::new(rate, TimestampRule::for_user_agent(ua))
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    /// First start of life and play. No effect when already alive.
    pub fn start(&self, t: f64, speed: Option<f64>) {
        let mut st = self.state.lock();
        if !st.life.is_running() {
            st.life.start(t, None);
            let _ = st.play.start(t, speed);
        }
    }

    pub fn pause(&self, t: f64) {
        let mut st = self.state.lock();
        if st.play.is_running() {
            st.play.stop(t);
            st.pause.next(t, None);
        }
    }

    pub fn unpause(&self, t: f64, speed: Option<f64>) {
        let mut st = self.state.lock();
        if !st.life.is_running() {
            st.life.start(t, None);
            let _ = st.play.start(t, speed);
        } else if st.pause.is_running() {
            st.pause.stop(t);
            st.play.next(t, speed);
        }
    }

    /// Shift the presentation time to `pt` and continue playing at `speed`.
    pub fn seek(&self, t: f64, pt: f64, speed: Option<f64>) {
        let mut st = self.state.lock();
        let delta = pt - (st.play.elapsed(t) + st.seek.relative);
        st.seek.add(delta);
        if st.pause.is_running() {
            st.pause.stop(t);
        } else if !st.life.is_running() {
            st.life.start(t, None);
        }
        st.play.next(t, speed);
        tracing::trace!(delta, pt, "timeline seek");
    }

    pub fn stop(&self, t: f64) {
        let mut st = self.state.lock();
        if st.life.is_running() {
            st.play.stop(t);
            st.pause.stop(t);
            st.life.stop(t);
        }
    }

    /// Presentation time of the frame that should be on the wire at `t`.
    pub fn presentation_time(&self, t: f64) -> f64 {
        let st = self.state.lock();
        st.play.elapsed(t) + st.seek.relative
    }

    /// Seconds spent actually playing: life minus pauses.
    pub fn play_time(&self, t: f64) -> f64 {
        let st = self.state.lock();
        st.life.elapsed(t) - st.pause.elapsed(t)
    }

    pub fn life_time(&self, t: f64) -> f64 {
        self.state.lock().life.elapsed(t)
    }

    pub fn pause_time(&self, t: f64) -> f64 {
        self.state.lock().pause.elapsed(t)
    }

    /// Duration of the running pause, or of the last one.
    pub fn last_pause(&self, t: f64) -> f64 {
        self.state.lock().pause.last(t)
    }

    pub fn speed(&self) -> f64 {
        self.state.lock().play.current_speed()
    }

    pub fn seek_times(&self) -> Seek {
        self.state.lock().seek
    }

    pub fn rtp_base(&self) -> u32 {
        self.state.lock().rtp_base
    }

    /// Pick a fresh non-zero random RTP base.
    pub fn restart_rtp_base(&self) {
        self.state.lock().rtp_base = random_rtp_base();
    }

    /// RTP timestamp for presentation time `pt` evaluated at wall time `t`.
    /// An infinite `pt` means "whatever is current".
    pub fn rtp_time(&self, pt: f64, t: f64) -> u32 {
        let st = self.state.lock();
        match self.rule {
            TimestampRule::Monotonic => {
                let presentation = st.play.elapsed(t) + st.seek.relative;
                let delta = if pt.is_finite() {
                    (pt - presentation) / st.play.current_speed()
                } else {
                    0.0
                };
                let play_time = st.life.elapsed(t) - st.pause.elapsed(t);
                st.rtp_base
                    .wrapping_add(sec_to_ticks(play_time + delta, self.rate))
            }
            TimestampRule::PresentationTime => {
                let pt = if pt.is_finite() {
                    pt
                } else {
                    st.play.elapsed(t) + st.seek.relative
                };
                st.rtp_base.wrapping_add(sec_to_ticks(pt, self.rate))
            }
        }
    }
}

fn random_rtp_base() -> u32 {
    let mut rng = rand::rng();
    loop {
        let base: u32 = rng.random();
        if base != 0 {
            return base;
        }
    }
}

/// Real-time delivery rate estimator for one medium.
pub struct FrameRate {
    time: MultiSegment,
    count: u64,
}

impl FrameRate {
    pub fn new() -> Self {
        FrameRate {
            time: MultiSegment::new(),
            count: 0,
        }
    }

    /// Register a delivered frame.
    pub fn tick(&mut self) {
        self.count += 1;
    }

    /// Begin (or resume) sampling.
    pub fn start(&mut self, t: f64) {
        self.time.next(t, None);
    }

    pub fn stop(&mut self, t: f64) {
        self.time.stop(t);
    }

    /// Mean seconds between deliveries.
    pub fn interval(&self, t: f64) -> f64 {
        self.time.elapsed(t) / self.count as f64
    }

    /// Delivery frequency in Hertz.
    pub fn frequency(&self, t: f64) -> f64 {
        self.count as f64 / self.time.elapsed(t)
    }
}

impl Default for FrameRate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_elapsed_scales_with_speed() {
        let mut seg = Segment::new();
        assert_eq!(seg.elapsed(100.0), 0.0);
        seg.start(10.0, Some(2.0));
        assert_eq!(seg.elapsed(15.0), 10.0);
        seg.stop(20.0);
        assert_eq!(seg.elapsed(30.0), 20.0);
        // second start/stop are no-ops
        seg.start(40.0, Some(1.0));
        seg.stop(50.0);
        assert_eq!(seg.elapsed(60.0), 20.0);
    }

    #[test]
    fn multisegment_accumulates_across_speeds() {
        let mut ms = MultiSegment::new();
        ms.start(0.0, Some(1.0)).unwrap();
        assert!(ms.start(1.0, None).is_err());
        assert_eq!(ms.elapsed(4.0), 4.0);
        ms.next(4.0, Some(2.0));
        assert_eq!(ms.elapsed(6.0), 4.0 + 4.0);
        ms.stop(6.0);
        assert_eq!(ms.elapsed(100.0), 8.0);
        assert_eq!(ms.last(100.0), 4.0);
        assert_eq!(ms.current_speed(), 2.0);
    }

    #[test]
    fn seek_counters() {
        let mut seek = Seek::default();
        seek.add(5.0);
        seek.add(-2.0);
        assert_eq!(seek.absolute, 7.0);
        assert_eq!(seek.relative, 3.0);
        assert_eq!(seek.right, 5.0);
        assert_eq!(seek.left, 2.0);
    }

    #[test]
    fn pause_freezes_presentation_and_play_time() {
        let tl = Timeline::new(90_000, TimestampRule::Monotonic);
        tl.start(0.0, Some(1.0));
        assert_eq!(tl.presentation_time(2.0), 2.0);

        tl.pause(2.0);
        assert_eq!(tl.presentation_time(10.0), 2.0);
        assert_eq!(tl.play_time(10.0), 2.0);
        assert_eq!(tl.last_pause(10.0), 8.0);

        tl.unpause(10.0, None);
        assert_eq!(tl.presentation_time(11.0), 3.0);
        assert_eq!(tl.play_time(11.0), 3.0);
    }

    #[test]
    fn rtp_time_does_not_advance_during_pause() {
        let tl = Timeline::new(1000, TimestampRule::Monotonic);
        tl.start(0.0, Some(1.0));
        let before = tl.rtp_time(f64::INFINITY, 5.0);
        tl.pause(5.0);
        let during = tl.rtp_time(f64::INFINITY, 50.0);
        assert_eq!(before, during);
        tl.unpause(50.0, None);
        let after = tl.rtp_time(f64::INFINITY, 51.0);
        assert_eq!(after.wrapping_sub(before), 1000);
    }

    #[test]
    fn seek_shifts_presentation_but_keeps_play_time_continuous() {
        let tl = Timeline::new(1000, TimestampRule::Monotonic);
        tl.start(0.0, Some(1.0));
        tl.seek(4.0, 20.0, None);
        assert_eq!(tl.presentation_time(4.0), 20.0);
        assert_eq!(tl.presentation_time(6.0), 22.0);
        // play time is unaffected by the seek shift
        assert_eq!(tl.play_time(6.0), 6.0);
        let t0 = tl.rtp_time(f64::INFINITY, 6.0);
        let t1 = tl.rtp_time(f64::INFINITY, 7.0);
        assert_eq!(t1.wrapping_sub(t0), 1000);
    }

    #[test]
    fn seek_can_start_an_idle_timeline() {
        let tl = Timeline::new(1000, TimestampRule::Monotonic);
        tl.seek(1.0, 5.0, Some(1.0));
        assert_eq!(tl.presentation_time(3.0), 7.0);
        assert!(tl.life_time(3.0) > 0.0);
    }

    #[test]
    fn reverse_scale_decreases_presentation_time() {
        let tl = Timeline::new(1000, TimestampRule::Monotonic);
        tl.start(0.0, Some(-1.0));
        assert_eq!(tl.presentation_time(3.0), -3.0);
        assert_eq!(tl.speed(), -1.0);
    }

    #[test]
    fn vlc_rule_tracks_presentation_time() {
        let tl = Timeline::new(1000, TimestampRule::PresentationTime);
        tl.start(0.0, Some(1.0));
        let base = tl.rtp_base();
        assert_eq!(tl.rtp_time(2.5, 2.5), base.wrapping_add(2500));
        tl.seek(3.0, 10.0, None);
        assert_eq!(tl.rtp_time(10.0, 3.0), base.wrapping_add(10_000));
    }

    #[test]
    fn rule_dispatch_by_user_agent() {
        assert_eq!(
            TimestampRule::for_user_agent(UserAgent::Generic),
            TimestampRule::Monotonic
        );
        for ua in [
            UserAgent::Vlc102,
            UserAgent::Vlc106,
            UserAgent::Vlc114,
            UserAgent::LibVlc114,
        ] {
            assert_eq!(
                TimestampRule::for_user_agent(ua),
                TimestampRule::PresentationTime
            );
        }
    }

    #[test]
    fn rtp_base_restart_is_nonzero_and_fresh() {
        let tl = Timeline::new(90_000, TimestampRule::Monotonic);
        let first = tl.rtp_base();
        assert_ne!(first, 0);
        tl.restart_rtp_base();
        assert_ne!(tl.rtp_base(), 0);
    }

    #[test]
    fn frame_rate_estimator() {
        let mut rate = FrameRate::new();
        rate.start(0.0);
        for _ in 0..50 {
            rate.tick();
        }
        rate.stop(2.0);
        assert_eq!(rate.frequency(2.0), 25.0);
        assert_eq!(rate.interval(2.0), 0.04);
    }
}
