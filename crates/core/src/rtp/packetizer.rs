//! Per-codec RTP packetization rules.
//!
//! The engine assumes one rule exists per supported payload type and
//! delegates to it through the [`Packetizer`] trait; rules register in a
//! process-wide table keyed by payload type. Payload types without a
//! registered rule fall back to plain MTU splitting, which suits
//! self-contained elementary streams.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::media::Frame;

use super::packet::{Packet, RTP_HEADER_LEN, RtpHeader};

/// Per-burst parameters handed to a packetization rule.
#[derive(Debug, Clone, Copy)]
pub struct PacketizeContext {
    /// Timestamp all packets of this frame carry.
    pub rtp_time: u32,
    pub ssrc: u32,
    /// Sequence number of the first packet of the burst.
    pub start_sequence: u16,
    /// Maximum packet size, header included.
    pub mtu: usize,
}

/// A codec-specific packetization rule.
///
/// Implementations must number packets consecutively from
/// `ctx.start_sequence` and mark the burst's last packet both in the RTP
/// marker bit and in [`Packet::is_last_of_sequence`].
pub trait Packetizer: Send + Sync {
    fn packetize(&self, frame: &Frame, ctx: &PacketizeContext) -> Vec<Packet>;
}

/// Fallback rule: split the frame payload at the MTU, marker on the last
/// packet.
pub struct SplitPacketizer;

impl Packetizer for SplitPacketizer {
    fn packetize(&self, frame: &Frame, ctx: &PacketizeContext) -> Vec<Packet> {
        let chunk = ctx.mtu.max(RTP_HEADER_LEN + 1) - RTP_HEADER_LEN;
        let data = frame.data();
        let count = data.chunks(chunk).count().max(1);
        let mut packets = Vec::with_capacity(count);

        let mut sequence = ctx.start_sequence;
        for (i, payload) in data.chunks(chunk).enumerate() {
            let last = i + 1 == count;
            let header = RtpHeader {
                marker: last,
                payload_type: frame.payload_type(),
                sequence,
                timestamp: ctx.rtp_time,
                ssrc: ctx.ssrc,
            };
            packets.push(Packet::new(header, payload, last));
            sequence = sequence.wrapping_add(1);
        }
        if packets.is_empty() {
            // zero-length frame still occupies one packet slot
            let header = RtpHeader {
                marker: true,
                payload_type: frame.payload_type(),
                sequence,
                timestamp: ctx.rtp_time,
                ssrc: ctx.ssrc,
            };
            packets.push(Packet::new(header, &[], true));
        }
        packets
    }
}

static REGISTRY: RwLock<BTreeMap<u8, Arc<dyn Packetizer>>> = RwLock::new(BTreeMap::new());

/// Register the rule for a payload type.
pub fn register_packetizer(payload_type: u8, rule: Arc<dyn Packetizer>) {
    REGISTRY.write().insert(payload_type, rule);
}

/// The rule for a payload type, or the MTU-splitting fallback.
pub fn packetizer_for(payload_type: u8) -> Arc<dyn Packetizer> {
    REGISTRY
        .read()
        .get(&payload_type)
        .cloned()
        .unwrap_or_else(|| Arc::new(SplitPacketizer))
}
