//! The RTCP sender thread: periodic SR+SDES emission, BYE on exit, and the
//! synchronization gate that holds RTP back until a report is out.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::channel::Channel;
use crate::clock;
use crate::sync::SyncPoint;
use crate::timeline::Timeline;

use super::packets::{
    Bye, SdesChunk, SenderReport, SourceDescription, encode_bye, encode_sender_report,
    encode_source_description, sdes_item,
};
use super::stats::SharedStats;

const BYE_REASON: &str = "Stream terminated";

struct SenderState {
    running: bool,
    paused: bool,
    thread: Option<JoinHandle<()>>,
}

/// Emits an SR+SDES compound every `interval` seconds while unpaused, and
/// SR+BYE when stopped.
///
/// After every [`restart`](Self::restart), the owning RTP session parks on
/// [`wait_rtp`](Self::wait_rtp) until the next report has been written, so
/// receivers can always map RTP time before media arrives.
pub struct Sender {
    chan: Arc<dyn Channel>,
    timeline: Arc<Timeline>,
    ssrc: Arc<AtomicU32>,
    /// CNAME reported in SDES: the request URL's host.
    cname: String,
    /// TOOL reported in SDES: the daemon name.
    tool: String,
    interval: f64,
    stats: SharedStats,
    state: Mutex<SenderState>,
    tick: Condvar,
    rtp_sync: SyncPoint,
}

impl Sender {
    pub fn new(
        chan: Arc<dyn Channel>,
        timeline: Arc<Timeline>,
        ssrc: Arc<AtomicU32>,
        cname: String,
        tool: String,
        interval: f64,
        stats: SharedStats,
    ) -> Arc<Self> {
        Arc::new(Sender {
            chan,
            timeline,
            ssrc,
            cname,
            tool,
            interval,
            stats,
            state: Mutex::new(SenderState {
                running: false,
                paused: true,
                thread: None,
            }),
            tick: Condvar::new(),
            rtp_sync: SyncPoint::new(),
        })
    }

    /// Spawn the loop, parked until the first [`restart`](Self::restart).
    pub fn start(self: &Arc<Self>) {
        let mut st = self.state.lock();
        if st.running {
            return;
        }
        st.running = true;
        st.paused = true;
        let this = self.clone();
        st.thread = Some(
            std::thread::Builder::new()
                .name("kgd-rtcp-sender".into())
                .spawn(move || this.run())
                .expect("spawn RTCP sender"),
        );
    }

    /// Arm the RTP gate and make sure the loop is ticking; the next report
    /// goes out immediately.
    pub fn restart(&self) {
        tracing::debug!("RTCP sender restarting");
        self.rtp_sync.arm();
        let mut st = self.state.lock();
        st.paused = false;
        drop(st);
        self.tick.notify_all();
    }

    /// Block until the sender has emitted the report armed by
    /// [`restart`](Self::restart).
    pub fn wait_rtp(&self) {
        self.rtp_sync.wait();
    }

    /// Account one RTP packet handed to the transport.
    pub fn register_packet_sent(&self, octets: usize) {
        let mut stats = self.stats.lock();
        stats.packet_count = stats.packet_count.wrapping_add(1);
        stats.octet_count = stats.octet_count.wrapping_add(octets as u32);
    }

    /// Account one RTP packet dropped on a would-block write.
    pub fn register_packet_lost(&self) {
        self.stats.lock().packets_dropped += 1;
    }

    /// Stop the loop; the exit path emits SR+BYE and releases the RTP gate.
    pub fn stop(&self) {
        let handle = {
            let mut st = self.state.lock();
            st.running = false;
            st.thread.take()
        };
        self.tick.notify_all();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    fn run(self: Arc<Self>) {
        tracing::debug!("RTCP sender loop started");
        loop {
            {
                let mut st = self.state.lock();
                while st.running && st.paused {
                    self.tick.wait(&mut st);
                }
                if !st.running {
                    break;
                }
            }

            let mut report = self.build_sr();
            report.extend(self.build_sdes());
            match self.chan.write_some(&report) {
                Ok(_) => {}
                Err(e) if e.would_block() => {
                    tracing::warn!(error = %e, "RTCP packet lost");
                }
                Err(e) => {
                    tracing::error!(error = %e, "RTCP channel failed, closing");
                    self.chan.close();
                    self.state.lock().running = false;
                    break;
                }
            }
            self.rtp_sync.release();

            let mut st = self.state.lock();
            if !st.running {
                break;
            }
            self.tick
                .wait_for(&mut st, Duration::from_secs_f64(self.interval));
        }

        let mut goodbye = self.build_sr();
        goodbye.extend(encode_bye(&Bye {
            sources: vec![self.ssrc.load(Ordering::Relaxed)],
            reason: Some(BYE_REASON.into()),
        }));
        match self.chan.write_last(&goodbye) {
            Ok(_) => tracing::debug!("RTCP sent BYE"),
            Err(e) => tracing::warn!(error = %e, "RTCP BYE not sent"),
        }
        self.rtp_sync.release();
        self.stats.lock().log("sender");
        tracing::debug!("RTCP sender loop terminated");
    }

    fn build_sr(&self) -> Vec<u8> {
        let now = clock::now();
        let pt = self.timeline.presentation_time(now);
        let rtp_time = self.timeline.rtp_time(pt, now);
        let (ntp_high, ntp_low) = clock::ntp_words(now);

        let (packet_count, octet_count) = {
            let mut stats = self.stats.lock();
            stats.sr_count += 1;
            (stats.packet_count, stats.octet_count)
        };
        tracing::trace!(now, pt, rtp_time, "building SR");

        encode_sender_report(&SenderReport {
            ssrc: self.ssrc.load(Ordering::Relaxed),
            ntp_high,
            ntp_low,
            rtp_time,
            packet_count,
            octet_count,
            reports: Vec::new(),
        })
    }

    fn build_sdes(&self) -> Vec<u8> {
        encode_source_description(&SourceDescription {
            chunks: vec![SdesChunk {
                ssrc: self.ssrc.load(Ordering::Relaxed),
                items: vec![
                    (sdes_item::CNAME, self.cname.as_bytes().to_vec()),
                    (sdes_item::TOOL, self.tool.as_bytes().to_vec()),
                ],
            }],
        })
    }
}

impl Drop for Sender {
    fn drop(&mut self) {
        let running = self.state.lock().running;
        if running {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::UdpChannel;
    use crate::rtcp::packets::{RtcpPacket, parse_buffer};
    use crate::rtcp::stats;
    use crate::timeline::{Timeline, TimestampRule};
    use std::net::UdpSocket;

    fn sender_with_peer(interval: f64) -> (Arc<Sender>, UdpSocket) {
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let chan = UdpChannel::connect(peer.local_addr().unwrap()).unwrap();
        let timeline = Arc::new(Timeline::new(90_000, TimestampRule::Monotonic));
        timeline.start(clock::now(), Some(1.0));
        let sender = Sender::new(
            Arc::new(chan),
            timeline,
            Arc::new(AtomicU32::new(0x42424242)),
            "127.0.0.1".into(),
            "test-kgd/1".into(),
            interval,
            stats::shared(),
        );
        (sender, peer)
    }

    fn recv_packets(peer: &UdpSocket) -> Vec<RtcpPacket> {
        let mut buf = [0u8; 2048];
        let n = peer.recv(&mut buf).unwrap();
        let (packets, consumed) = parse_buffer(&buf[..n]);
        assert_eq!(consumed, n, "compound must parse completely");
        packets
    }

    #[test]
    fn restart_emits_sr_sdes_and_releases_gate() {
        let (sender, peer) = sender_with_peer(5.0);
        sender.start();
        sender.restart();
        sender.wait_rtp();

        let packets = recv_packets(&peer);
        assert_eq!(packets.len(), 2);
        let RtcpPacket::SenderReport(sr) = &packets[0] else {
            panic!("first packet must be SR");
        };
        assert_eq!(sr.ssrc, 0x42424242);
        assert!(sr.ntp_high > crate::clock::NTP_EPOCH_OFFSET);
        let RtcpPacket::SourceDescription(sdes) = &packets[1] else {
            panic!("second packet must be SDES");
        };
        assert_eq!(sdes.chunks[0].items[0], (sdes_item::CNAME, b"127.0.0.1".to_vec()));
        assert_eq!(sdes.chunks[0].items[1], (sdes_item::TOOL, b"test-kgd/1".to_vec()));

        sender.stop();
    }

    #[test]
    fn stop_emits_bye() {
        let (sender, peer) = sender_with_peer(5.0);
        sender.start();
        sender.restart();
        sender.wait_rtp();
        let _ = recv_packets(&peer);

        sender.stop();
        let packets = recv_packets(&peer);
        let bye = packets
            .iter()
            .find_map(|p| match p {
                RtcpPacket::Bye(b) => Some(b),
                _ => None,
            })
            .expect("BYE on stop");
        assert_eq!(bye.sources, vec![0x42424242]);
        assert_eq!(bye.reason.as_deref(), Some("Stream terminated"));
    }

    #[test]
    fn packet_accounting() {
        let (sender, _peer) = sender_with_peer(5.0);
        sender.register_packet_sent(100);
        sender.register_packet_sent(250);
        sender.register_packet_lost();
        let stats = sender.stats.lock();
        assert_eq!(stats.packet_count, 2);
        assert_eq!(stats.octet_count, 350);
        assert_eq!(stats.packets_dropped, 1);
    }
}
