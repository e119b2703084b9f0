//! Shared RTCP statistics.

use std::sync::Arc;

use parking_lot::Mutex;

/// Counters shared between an RTP session and its RTCP roles.
#[derive(Debug, Default, Clone)]
pub struct Stats {
    pub sr_count: u32,
    pub rr_count: u32,
    /// RTP packets sent.
    pub packet_count: u32,
    /// RTP payload octets sent.
    pub octet_count: u32,
    /// RTP packets dropped on a would-block write.
    pub packets_dropped: u32,
    /// Remote-reported loss and timing, from RR blocks.
    pub fraction_lost: u8,
    pub packets_lost: u32,
    pub highest_sequence: u32,
    pub jitter: u32,
    pub last_sr: u32,
    pub delay_since_last_sr: u32,
    pub peer_ssrc: u32,
}

impl Stats {
    pub fn log(&self, role: &str) {
        tracing::debug!(
            role,
            sr = self.sr_count,
            rr = self.rr_count,
            packets = self.packet_count,
            octets = self.octet_count,
            dropped = self.packets_dropped,
            lost = self.packets_lost,
            jitter = self.jitter,
            "RTCP stats"
        );
    }
}

/// Shared handle to one role's statistics.
pub type SharedStats = Arc<Mutex<Stats>>;

pub fn shared() -> SharedStats {
    Arc::new(Mutex::new(Stats::default()))
}
