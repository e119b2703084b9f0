//! Per-track RTP session: the send loop and its play/pause/seek/teardown
//! control surface.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use rand::RngExt;

use crate::channel::{Channel, ChannelDesc};
use crate::clock;
use crate::config::Config;
use crate::error::{KgdError, Result};
use crate::media::{FrameBuffer, MediaKind, Medium};
use crate::protocol::{PlayRequest, RtspUrl, UserAgent};
use crate::rtcp;
use crate::sync::SyncPoint;
use crate::timeline::{FrameRate, Timeline};

use super::packetizer::{PacketizeContext, packetizer_for};

/// Frames closer than this to their due time go out immediately.
const PACE_EPSILON: f64 = 0.002;
/// Longest single pacing nap, so control changes are noticed promptly.
const MAX_PACE_SLICE: f64 = 0.5;

/// Configuration snapshot a session takes at SETUP.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub mtu: usize,
    pub sr_interval: f64,
    pub rtcp_poll_interval: f64,
    pub support_seek: bool,
    pub server_name: String,
}

impl From<&Config> for SessionSettings {
    fn from(config: &Config) -> Self {
        SessionSettings {
            mtu: config.mtu,
            sr_interval: config.sr_interval,
            rtcp_poll_interval: config.rtcp_poll_interval,
            support_seek: config.support_seek,
            server_name: config.server_name.clone(),
        }
    }
}

struct State {
    next_frame: Option<crate::media::Frame>,
    rate: FrameRate,
    time_end: f64,
    seq_start: u16,
    seq_cur: u16,
    stopped: bool,
    paused: bool,
    seeked: bool,
    pause_sync: bool,
    /// Bumped by every seek; the send loop drops frames fetched under an
    /// older epoch.
    epoch: u64,
    thread: Option<JoinHandle<()>>,
}

/// One track's RTP sender with its paired RTCP roles.
pub struct RtpSession {
    url: RtspUrl,
    medium: Arc<Medium>,
    rtp_out: Arc<dyn Channel>,
    rtcp_chan: Arc<dyn Channel>,
    rtcp_sender: Arc<rtcp::Sender>,
    rtcp_receiver: Arc<rtcp::Receiver>,
    timeline: Arc<Timeline>,
    ssrc: Arc<AtomicU32>,
    settings: SessionSettings,
    buffer: Mutex<FrameBuffer>,
    buffer_stop: Arc<AtomicBool>,
    state: Mutex<State>,
    wakeup: Condvar,
    asleep: SyncPoint,
}

impl RtpSession {
    /// Bind a session to its track, transport, and recognized user agent.
    /// The RTCP roles start immediately; media flows on the first PLAY.
    pub fn new(
        url: RtspUrl,
        medium: Arc<Medium>,
        rtp_out: Arc<dyn Channel>,
        rtcp_chan: Arc<dyn Channel>,
        user_agent: UserAgent,
        ssrc_hint: Option<u32>,
        settings: SessionSettings,
    ) -> Arc<Self> {
        let timeline = Arc::new(Timeline::for_user_agent(medium.rate(), user_agent));
        let ssrc = Arc::new(AtomicU32::new(ssrc_hint.unwrap_or_else(random_nonzero_u32)));
        let sender = rtcp::Sender::new(
            rtcp_chan.clone(),
            timeline.clone(),
            ssrc.clone(),
            url.host.clone(),
            settings.server_name.clone(),
            settings.sr_interval,
            rtcp::stats::shared(),
        );
        let receiver = rtcp::Receiver::new(
            rtcp_chan.clone(),
            settings.rtcp_poll_interval,
            rtcp::stats::shared(),
        );

        let buffer = FrameBuffer::new(&medium);
        let buffer_stop = buffer.stop_handle();
        let seq_start = random_nonzero_u16();

        let session = Arc::new(RtpSession {
            url,
            medium,
            rtp_out,
            rtcp_chan,
            rtcp_sender: sender,
            rtcp_receiver: receiver,
            timeline,
            ssrc,
            settings,
            buffer: Mutex::new(buffer),
            buffer_stop,
            state: Mutex::new(State {
                next_frame: None,
                rate: FrameRate::new(),
                time_end: f64::INFINITY,
                seq_start,
                seq_cur: seq_start.wrapping_sub(1),
                stopped: true,
                paused: false,
                seeked: false,
                pause_sync: false,
                epoch: 0,
                thread: None,
            }),
            wakeup: Condvar::new(),
            asleep: SyncPoint::new(),
        });
        session.rtcp_sender.start();
        session.rtcp_receiver.start();
        session
    }

    pub fn url(&self) -> &RtspUrl {
        &self.url
    }

    pub fn medium(&self) -> &Arc<Medium> {
        &self.medium
    }

    pub fn timeline(&self) -> &Arc<Timeline> {
        &self.timeline
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc.load(Ordering::Relaxed)
    }

    pub fn start_sequence(&self) -> u16 {
        self.state.lock().seq_start
    }

    pub fn is_playing(&self) -> bool {
        let st = self.state.lock();
        !st.stopped && !st.paused
    }

    /// True before the first play and after the send loop has ended.
    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    pub fn rtp_description(&self) -> ChannelDesc {
        self.rtp_out.description()
    }

    pub fn rtcp_description(&self) -> ChannelDesc {
        self.rtcp_chan.description()
    }

    /// The range currently playing, for PLAY replies that change nothing.
    pub fn play_range(&self) -> PlayRequest {
        let now = clock::now();
        PlayRequest {
            time: now,
            from: self.timeline.presentation_time(now),
            to: self.state.lock().time_end,
            speed: self.timeline.speed(),
            has_range: true,
            has_scale: true,
        }
    }

    /// Fill a play request's defaults and clamp its start to a reachable
    /// frame, without changing any state.
    pub fn eval(&self, rq: &PlayRequest) -> Result<PlayRequest> {
        let stopped = self.state.lock().stopped;
        let mut ret = *rq;
        if stopped {
            if !rq.has_scale {
                ret.has_scale = true;
                ret.speed = 1.0;
            }
            if rq.from.is_infinite() {
                ret.from = 0.0;
            }
        } else {
            if !rq.has_scale {
                ret.has_scale = true;
                ret.speed = self.timeline.speed();
            }
            if rq.from.is_infinite() {
                ret.from = self.timeline.presentation_time(rq.time);
            }
            ret.from = self.buffer.lock().dry_seek(ret.from, ret.speed)?;
        }
        ret.has_range = true;
        if self.settings.support_seek {
            ret.to = self.medium.iteration_duration();
        }
        Ok(ret)
    }

    /// Prepare playback per the request; media starts flowing once
    /// [`start`](Self::start) runs after the reply is on the wire.
    pub fn play(self: &Arc<Self>, rq: &PlayRequest) -> Result<PlayRequest> {
        let mut st = self.state.lock();
        let mut ret = if st.stopped {
            self.do_first_play(&mut st, rq)?
        } else {
            self.do_seek_scale(&mut st, rq)?
        };
        // forward play ends at the upper bound, reverse at the lower one
        st.time_end = if ret.speed < 0.0 {
            if rq.to.is_finite() { rq.to } else { 0.0 }
        } else {
            self.medium.iteration_duration().min(rq.to)
        };
        ret.has_range = true;
        ret.has_scale = true;
        drop(st);
        self.log_times();
        Ok(ret)
    }

    fn do_first_play(self: &Arc<Self>, st: &mut State, rq: &PlayRequest) -> Result<PlayRequest> {
        let mut ret = *rq;
        if !rq.has_scale {
            ret.speed = 1.0;
        }
        if rq.from.is_infinite() {
            ret.from = 0.0;
        }
        tracing::info!(track = %self.medium.track_name(), request = %ret, "first play");

        st.seq_start = st.seq_cur.wrapping_add(1);
        self.timeline.restart_rtp_base();
        st.stopped = false;
        st.paused = true;
        st.epoch += 1;

        self.timeline.seek(ret.time, ret.from, Some(ret.speed));
        ret.from = self.buffer.lock().seek(ret.from, ret.speed)?;

        let this = self.clone();
        st.thread = Some(
            std::thread::Builder::new()
                .name(format!("kgd-rtp {}", self.medium.track_name()))
                .spawn(move || this.run())
                .map_err(KgdError::from)?,
        );
        Ok(ret)
    }

    fn do_seek_scale(&self, st: &mut State, rq: &PlayRequest) -> Result<PlayRequest> {
        let mut ret = *rq;
        if !rq.has_scale {
            ret.speed = self.timeline.speed();
        }
        if rq.from.is_infinite() {
            ret.from = self.timeline.presentation_time(rq.time);
        }

        // audio above unit speed stays paused
        if self.medium.kind() == MediaKind::Video || ret.speed.abs() <= 1.0 {
            st.seeked = ret.has_range;
            if st.paused {
                tracing::info!(
                    track = %self.medium.track_name(),
                    paused_for = self.timeline.last_pause(rq.time),
                    "unpausing medium"
                );
            }
            if st.paused || ret.has_range || ret.has_scale {
                st.next_frame = None;
                st.epoch += 1;
                ret.from = self.buffer.lock().seek(ret.from, ret.speed)?;
                st.seq_start = st.seq_cur.wrapping_add(1);
                self.timeline.seek(rq.time, ret.from, Some(ret.speed));
            } else {
                tracing::warn!(track = %self.medium.track_name(), "play request changes nothing");
            }
        } else {
            tracing::warn!(
                track = %self.medium.track_name(),
                speed = ret.speed,
                "unsupported audio speed, staying paused"
            );
            self.timeline.seek(rq.time, ret.from, Some(ret.speed));
            st.paused = true;
        }
        Ok(ret)
    }

    /// Unpark the send loop after a prepared play. Waits for the RTCP
    /// sender so an SR precedes the first RTP packet.
    pub fn start(&self) {
        let speed = self.timeline.speed();
        if self.medium.kind() != MediaKind::Video && speed.abs() > 1.0 {
            return;
        }
        self.rtcp_sender.restart();
        {
            let mut st = self.state.lock();
            st.rate.start(clock::now());
        }
        tracing::debug!(track = %self.medium.track_name(), "waiting RTCP sender");
        self.rtcp_sender.wait_rtp();

        tracing::info!(track = %self.medium.track_name(), "start play");
        self.state.lock().paused = false;
        self.wakeup.notify_all();
    }

    /// Suspend delivery. When this returns, the send loop is parked.
    pub fn pause(&self, rq: &PlayRequest) {
        {
            let mut st = self.state.lock();
            if st.stopped {
                tracing::warn!(track = %self.medium.track_name(), "session stopped, cannot pause");
                return;
            }
            if st.paused {
                tracing::warn!(track = %self.medium.track_name(), "already paused");
                return;
            }
            st.paused = true;
            st.rate.stop(clock::now());
            self.timeline.pause(rq.time);
            tracing::info!(
                track = %self.medium.track_name(),
                at = self.timeline.presentation_time(rq.time),
                "pausing"
            );
            self.asleep.arm();
            st.pause_sync = true;
        }
        self.wakeup.notify_all();
        self.asleep.wait();
        tracing::debug!(track = %self.medium.track_name(), "effectively paused");
        self.log_times();
    }

    /// Resume after a pause, keeping the current speed.
    pub fn unpause(&self, rq: &PlayRequest) {
        let paused = self.state.lock().paused;
        if !paused {
            tracing::warn!(track = %self.medium.track_name(), "already playing");
            return;
        }
        let speed = self.timeline.speed();
        if self.medium.kind() == MediaKind::Video || speed.abs() <= 1.0 {
            self.rtcp_sender.restart();
            {
                let mut st = self.state.lock();
                st.rate.start(clock::now());
            }
            tracing::debug!(track = %self.medium.track_name(), "waiting RTCP sender");
            self.rtcp_sender.wait_rtp();

            tracing::info!(track = %self.medium.track_name(), "unpause");
            {
                let mut st = self.state.lock();
                st.paused = false;
                self.timeline.unpause(rq.time, Some(speed));
            }
            self.wakeup.notify_all();
        } else {
            self.timeline.unpause(rq.time, Some(speed));
        }
    }

    /// Stop delivery for good: joins the send loop, stops both RTCP roles
    /// (the sender emits BYE), and closes the transport.
    pub fn teardown(&self, rq: &PlayRequest) {
        let handle = {
            let mut st = self.state.lock();
            tracing::debug!(
                track = %self.medium.track_name(),
                was_seeked = st.seeked,
                "tearing down"
            );
            st.stopped = true;
            st.paused = false;
            st.thread.take()
        };
        self.wakeup.notify_all();
        self.buffer_stop.store(true, Ordering::Relaxed);
        self.medium.interrupt();
        if let Some(handle) = handle {
            let _ = handle.join();
        }

        tracing::debug!(track = %self.medium.track_name(), "stopping RTCP");
        self.rtcp_receiver.stop();
        self.rtcp_sender.stop();
        self.rtp_out.close();
        self.rtcp_chan.close();

        self.state.lock().rate.stop(clock::now());
        self.timeline.stop(rq.time);
        self.log_times();
        tracing::debug!(track = %self.medium.track_name(), "teardown completed");
    }

    /// Earliest time at or after `t` another medium can be spliced in.
    /// Only valid while paused.
    pub fn evaluate_medium_insertion(&self, t: f64) -> Result<f64> {
        if !self.state.lock().paused {
            return Err(KgdError::InvalidState("insertion requires a paused session"));
        }
        let seek_time = t.min(self.timeline.presentation_time(clock::now()) + 1.0);
        self.buffer.lock().dry_seek(seek_time, self.timeline.speed())
    }

    /// Splice another medium in at presentation time `t` (paused only).
    pub fn insert_medium(&self, other: &Arc<Medium>, t: f64) -> Result<()> {
        let mut st = self.state.lock();
        if !st.paused {
            return Err(KgdError::InvalidState("insertion requires a paused session"));
        }
        self.buffer.lock().insert_medium(other, t)?;
        st.time_end += other.iteration_duration();
        Ok(())
    }

    /// Open a silent gap of `duration` seconds at `t` (paused only).
    pub fn insert_time(&self, duration: f64, t: f64) -> Result<()> {
        let mut st = self.state.lock();
        if !st.paused {
            return Err(KgdError::InvalidState("insertion requires a paused session"));
        }
        self.buffer.lock().insert_time(duration, t)?;
        st.time_end += duration;
        Ok(())
    }

    fn run(self: Arc<Self>) {
        tracing::debug!(track = %self.medium.track_name(), "send loop started");
        loop {
            // pause/stop gate
            {
                let mut st = self.state.lock();
                loop {
                    if st.stopped {
                        drop(st);
                        self.finish();
                        return;
                    }
                    if !st.paused {
                        break;
                    }
                    if st.pause_sync {
                        st.pause_sync = false;
                        self.asleep.release();
                    }
                    self.wakeup.wait(&mut st);
                }
            }

            let (pending, epoch) = {
                let mut st = self.state.lock();
                (st.next_frame.take(), st.epoch)
            };
            let frame = match pending {
                Some(frame) => frame,
                None => match self.buffer.lock().next() {
                    Ok(frame) => frame,
                    Err(KgdError::Eof) => {
                        tracing::info!(track = %self.medium.track_name(), "end of medium");
                        self.state.lock().stopped = true;
                        continue;
                    }
                    Err(e) => {
                        tracing::error!(track = %self.medium.track_name(), error = %e, "frame fetch failed");
                        self.state.lock().stopped = true;
                        continue;
                    }
                },
            };
            // a seek slipped in while this frame was being fetched
            if self.state.lock().epoch != epoch {
                continue;
            }

            // pace against the timeline
            let now = clock::now();
            let speed = self.timeline.speed();
            let pt = frame.time();
            let lead = (pt - self.timeline.presentation_time(now)) / speed;
            if lead > PACE_EPSILON {
                let mut st = self.state.lock();
                st.next_frame = Some(frame);
                let _ = self.wakeup.wait_for(
                    &mut st,
                    Duration::from_secs_f64(lead.min(MAX_PACE_SLICE)),
                );
                continue;
            }

            let (start_sequence, ssrc) = {
                let st = self.state.lock();
                (st.seq_cur.wrapping_add(1), self.ssrc())
            };
            let ctx = PacketizeContext {
                rtp_time: self.timeline.rtp_time(pt, now),
                ssrc,
                start_sequence,
                mtu: self.settings.mtu,
            };
            let packets = packetizer_for(frame.payload_type()).packetize(&frame, &ctx);

            // transport writes happen without any session lock held
            let mut failed = false;
            for packet in &packets {
                let written = if packet.is_last_of_sequence {
                    self.rtp_out.write_last(&packet.data)
                } else {
                    self.rtp_out.write_some(&packet.data)
                };
                match written {
                    Ok(_) => self.rtcp_sender.register_packet_sent(packet.data.len()),
                    Err(e) if e.would_block() => {
                        tracing::warn!(track = %self.medium.track_name(), error = %e, "RTP packet lost");
                        self.rtcp_sender.register_packet_lost();
                    }
                    Err(e) => {
                        tracing::error!(track = %self.medium.track_name(), error = %e, "RTP write failed");
                        failed = true;
                        break;
                    }
                }
            }

            {
                let mut st = self.state.lock();
                st.seq_cur = st.seq_cur.wrapping_add(packets.len() as u16);
                st.rate.tick();
                let past_end = if speed >= 0.0 {
                    pt > st.time_end
                } else {
                    pt < st.time_end
                };
                if failed || past_end {
                    st.stopped = true;
                }
            }
            self.medium.release_frame(frame.medium_pos());
        }
    }

    /// Send-loop exit path: release anyone parked on the handshakes.
    fn finish(&self) {
        {
            let mut st = self.state.lock();
            st.pause_sync = false;
        }
        self.asleep.release();
        tracing::debug!(track = %self.medium.track_name(), "send loop terminated");
    }

    fn log_times(&self) {
        let now = clock::now();
        tracing::debug!(
            track = %self.medium.track_name(),
            media_time = self.timeline.presentation_time(now),
            life_time = self.timeline.life_time(now),
            play_time = self.timeline.play_time(now),
            paused_time = self.timeline.pause_time(now),
            seeked = self.timeline.seek_times().absolute,
            speed = self.timeline.speed(),
            "session times"
        );
    }
}

impl Drop for RtpSession {
    fn drop(&mut self) {
        // a dropped session must not leave its loops running; the RTCP
        // threads hold their own Arcs and outlive us otherwise
        let alive = self.state.lock().thread.is_some();
        if alive {
            self.teardown(&PlayRequest::new());
        } else {
            self.rtcp_receiver.stop();
            self.rtcp_sender.stop();
        }
    }
}

fn random_nonzero_u32() -> u32 {
    let mut rng = rand::rng();
    loop {
        let v: u32 = rng.random();
        if v != 0 {
            return v;
        }
    }
}

fn random_nonzero_u16() -> u16 {
    let mut rng = rand::rng();
    loop {
        let v: u16 = rng.random();
        if v != 0 {
            return v;
        }
    }
}
