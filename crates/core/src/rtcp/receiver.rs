//! The RTCP receiver thread: parses inbound SR/RR/SDES/BYE/APP and adapts
//! its poll timeout to the peer's pace.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::channel::Channel;

use super::packets::{RtcpPacket, parse_buffer, sdes_item};
use super::stats::SharedStats;

/// Backoff factor applied to the poll interval: grow on a silent poll,
/// shrink on a successful parse.
const POLL_BACKOFF: f64 = 1.2;

/// Socket-level read timeout. Reads wake this often so stop requests are
/// honored promptly; the adaptive poll interval is accounted on top.
const READ_SLICE: f64 = 0.25;

/// Consumes the inbound side of an RTCP channel and mirrors the peer's
/// reports into the shared statistics.
pub struct Receiver {
    chan: Arc<dyn Channel>,
    stats: SharedStats,
    poll_interval: f64,
    running: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Receiver {
    pub fn new(chan: Arc<dyn Channel>, poll_interval: f64, stats: SharedStats) -> Arc<Self> {
        Arc::new(Receiver {
            chan,
            stats,
            poll_interval,
            running: AtomicBool::new(false),
            thread: Mutex::new(None),
        })
    }

    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = self.clone();
        *self.thread.lock() = Some(
            std::thread::Builder::new()
                .name("kgd-rtcp-receiver".into())
                .spawn(move || this.run())
                .expect("spawn RTCP receiver"),
        );
    }

    /// Stop the loop and join it; reads wake within one slice.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }

    fn run(self: Arc<Self>) {
        tracing::debug!("RTCP receiver loop started");
        let mut poll = self.poll_interval;
        let mut idle = 0.0f64;
        let _ = self.chan.set_read_timeout(Some(READ_SLICE));
        let mut scratch = [0u8; 1024];
        let mut input: Vec<u8> = Vec::new();

        while self.running.load(Ordering::SeqCst) {
            match self.chan.read_some(&mut scratch) {
                Ok(0) => {
                    tracing::warn!("RTCP read returned no data");
                }
                Ok(n) => {
                    input.extend_from_slice(&scratch[..n]);
                    let (packets, consumed) = parse_buffer(&input);
                    input.drain(..consumed);
                    if !packets.is_empty() {
                        // the peer is talking, poll faster
                        poll /= POLL_BACKOFF;
                        idle = 0.0;
                    }
                    for packet in packets {
                        self.dispatch(packet);
                    }
                }
                Err(e) if e.would_block() => {
                    idle += READ_SLICE;
                    if idle >= poll {
                        poll *= POLL_BACKOFF;
                        idle = 0.0;
                        tracing::debug!(poll, "RTCP poll idle, backing off");
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "RTCP receiver stopping");
                    self.running.store(false, Ordering::SeqCst);
                }
            }
        }

        self.stats.lock().log("receiver");
        tracing::debug!("RTCP receiver loop terminated");
    }

    fn dispatch(&self, packet: RtcpPacket) {
        match packet {
            RtcpPacket::SenderReport(sr) => {
                tracing::debug!(ssrc = sr.ssrc, "RTCP SR");
                let mut stats = self.stats.lock();
                stats.sr_count += 1;
                stats.packet_count = sr.packet_count;
                stats.octet_count = sr.octet_count;
                drop(stats);
                for block in &sr.reports {
                    self.update_block(block);
                }
            }
            RtcpPacket::ReceiverReport(rr) => {
                tracing::debug!(ssrc = rr.ssrc, "RTCP RR");
                self.stats.lock().rr_count += 1;
                for block in &rr.reports {
                    self.update_block(block);
                }
            }
            RtcpPacket::SourceDescription(sdes) => {
                for chunk in &sdes.chunks {
                    tracing::debug!(ssrc = chunk.ssrc, "RTCP SDES");
                    for (item, value) in &chunk.items {
                        let text = String::from_utf8_lossy(value);
                        match *item {
                            sdes_item::CNAME => tracing::debug!(%text, "SDES CNAME"),
                            sdes_item::NAME => tracing::debug!(%text, "SDES NAME"),
                            sdes_item::EMAIL => tracing::debug!(%text, "SDES EMAIL"),
                            sdes_item::PHONE => tracing::debug!(%text, "SDES PHONE"),
                            sdes_item::LOC => tracing::debug!(%text, "SDES LOC"),
                            sdes_item::TOOL => tracing::debug!(%text, "SDES TOOL"),
                            sdes_item::NOTE => tracing::debug!(%text, "SDES NOTE"),
                            sdes_item::PRIV => tracing::debug!(%text, "SDES PRIV"),
                            other => {
                                tracing::warn!(item = other, %text, "unhandled SDES item")
                            }
                        }
                    }
                    self.stats.lock().peer_ssrc = chunk.ssrc;
                }
            }
            RtcpPacket::Bye(bye) => {
                tracing::info!(sources = ?bye.sources, reason = ?bye.reason, "RTCP BYE");
                self.running.store(false, Ordering::SeqCst);
            }
            RtcpPacket::Application => {
                tracing::warn!("RTCP APP received and ignored");
            }
        }
    }

    fn update_block(&self, block: &super::packets::ReportBlock) {
        let mut stats = self.stats.lock();
        stats.fraction_lost = block.fraction_lost;
        stats.packets_lost = block.packets_lost;
        stats.highest_sequence = block.highest_sequence;
        stats.jitter = block.jitter;
        stats.last_sr = block.last_sr;
        stats.delay_since_last_sr = block.delay_since_last_sr;
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        if self.running.load(Ordering::SeqCst) {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::UdpChannel;
    use crate::rtcp::packets::{
        Bye, ReceiverReport, ReportBlock, encode_bye, encode_receiver_report,
    };
    use crate::rtcp::stats;
    use std::net::UdpSocket;
    use std::time::Duration;

    fn receiver_with_peer() -> (Arc<Receiver>, UdpSocket, std::net::SocketAddr) {
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        let chan = UdpChannel::connect(peer.local_addr().unwrap()).unwrap();
        let local = ("127.0.0.1".parse().ok())
            .map(|ip| std::net::SocketAddr::new(ip, chan.local_port()))
            .unwrap();
        let receiver = Receiver::new(Arc::new(chan), 0.2, stats::shared());
        (receiver, peer, local)
    }

    #[test]
    fn rr_updates_stats() {
        let (receiver, peer, local) = receiver_with_peer();
        receiver.start();

        let rr = encode_receiver_report(&ReceiverReport {
            ssrc: 0x55,
            reports: vec![ReportBlock {
                ssrc: 0x99,
                fraction_lost: 7,
                packets_lost: 21,
                highest_sequence: 3000,
                jitter: 11,
                last_sr: 1,
                delay_since_last_sr: 2,
            }],
        });
        peer.send_to(&rr, local).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            {
                let stats = receiver.stats.lock();
                if stats.rr_count == 1 {
                    assert_eq!(stats.fraction_lost, 7);
                    assert_eq!(stats.packets_lost, 21);
                    assert_eq!(stats.highest_sequence, 3000);
                    assert_eq!(stats.jitter, 11);
                    break;
                }
            }
            assert!(std::time::Instant::now() < deadline, "RR never processed");
            std::thread::sleep(Duration::from_millis(10));
        }
        receiver.stop();
    }

    #[test]
    fn bye_stops_the_loop() {
        let (receiver, peer, local) = receiver_with_peer();
        receiver.start();

        let bye = encode_bye(&Bye {
            sources: vec![1],
            reason: Some("done".into()),
        });
        peer.send_to(&bye, local).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while receiver.running.load(Ordering::SeqCst) {
            assert!(std::time::Instant::now() < deadline, "BYE never processed");
            std::thread::sleep(Duration::from_millis(10));
        }
        receiver.stop();
    }
}
