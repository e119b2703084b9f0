//! RTCP packet formats (RFC 3550 §6).
//!
//! Every packet starts with the common 4-byte header
//! `(version:2, padding:1, count:5, packet_type:u8, length:u16be)` where
//! the length field counts 32-bit words minus one.

/// RTCP packet type codes.
pub mod packet_type {
    pub const SENDER_REPORT: u8 = 200;
    pub const RECEIVER_REPORT: u8 = 201;
    pub const SOURCE_DESCRIPTION: u8 = 202;
    pub const BYE: u8 = 203;
    pub const APPLICATION: u8 = 204;
}

/// SDES item type codes.
pub mod sdes_item {
    pub const END: u8 = 0;
    pub const CNAME: u8 = 1;
    pub const NAME: u8 = 2;
    pub const EMAIL: u8 = 3;
    pub const PHONE: u8 = 4;
    pub const LOC: u8 = 5;
    pub const TOOL: u8 = 6;
    pub const NOTE: u8 = 7;
    pub const PRIV: u8 = 8;
}

/// One receiver-report block, 24 bytes on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportBlock {
    pub ssrc: u32,
    pub fraction_lost: u8,
    /// 24-bit cumulative packet loss.
    pub packets_lost: u32,
    pub highest_sequence: u32,
    pub jitter: u32,
    pub last_sr: u32,
    pub delay_since_last_sr: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderReport {
    pub ssrc: u32,
    pub ntp_high: u32,
    pub ntp_low: u32,
    pub rtp_time: u32,
    pub packet_count: u32,
    pub octet_count: u32,
    pub reports: Vec<ReportBlock>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverReport {
    pub ssrc: u32,
    pub reports: Vec<ReportBlock>,
}

/// One source's description items, excluding the END terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdesChunk {
    pub ssrc: u32,
    pub items: Vec<(u8, Vec<u8>)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDescription {
    pub chunks: Vec<SdesChunk>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bye {
    pub sources: Vec<u32>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcpPacket {
    SenderReport(SenderReport),
    ReceiverReport(ReceiverReport),
    SourceDescription(SourceDescription),
    Bye(Bye),
    /// APP packets are skipped without interpretation.
    Application,
}

fn push_header(out: &mut Vec<u8>, count: u8, pt: u8) {
    out.push((2 << 6) | (count & 0x1f));
    out.push(pt);
    // length filled in by finish_length once the body is known
    out.extend_from_slice(&[0, 0]);
}

fn finish_length(out: &mut Vec<u8>, start: usize) {
    let words = ((out.len() - start) / 4 - 1) as u16;
    out[start + 2..start + 4].copy_from_slice(&words.to_be_bytes());
}

fn push_block(out: &mut Vec<u8>, block: &ReportBlock) {
    out.extend_from_slice(&block.ssrc.to_be_bytes());
    out.push(block.fraction_lost);
    out.extend_from_slice(&block.packets_lost.to_be_bytes()[1..4]);
    out.extend_from_slice(&block.highest_sequence.to_be_bytes());
    out.extend_from_slice(&block.jitter.to_be_bytes());
    out.extend_from_slice(&block.last_sr.to_be_bytes());
    out.extend_from_slice(&block.delay_since_last_sr.to_be_bytes());
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

fn parse_block(data: &[u8]) -> ReportBlock {
    ReportBlock {
        ssrc: read_u32(data, 0),
        fraction_lost: data[4],
        packets_lost: u32::from_be_bytes([0, data[5], data[6], data[7]]),
        highest_sequence: read_u32(data, 8),
        jitter: read_u32(data, 12),
        last_sr: read_u32(data, 16),
        delay_since_last_sr: read_u32(data, 20),
    }
}

pub fn encode_sender_report(sr: &SenderReport) -> Vec<u8> {
    let mut out = Vec::with_capacity(28 + sr.reports.len() * 24);
    let start = out.len();
    push_header(&mut out, sr.reports.len() as u8, packet_type::SENDER_REPORT);
    out.extend_from_slice(&sr.ssrc.to_be_bytes());
    out.extend_from_slice(&sr.ntp_high.to_be_bytes());
    out.extend_from_slice(&sr.ntp_low.to_be_bytes());
    out.extend_from_slice(&sr.rtp_time.to_be_bytes());
    out.extend_from_slice(&sr.packet_count.to_be_bytes());
    out.extend_from_slice(&sr.octet_count.to_be_bytes());
    for block in &sr.reports {
        push_block(&mut out, block);
    }
    finish_length(&mut out, start);
    out
}

pub fn encode_receiver_report(rr: &ReceiverReport) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + rr.reports.len() * 24);
    let start = out.len();
    push_header(&mut out, rr.reports.len() as u8, packet_type::RECEIVER_REPORT);
    out.extend_from_slice(&rr.ssrc.to_be_bytes());
    for block in &rr.reports {
        push_block(&mut out, block);
    }
    finish_length(&mut out, start);
    out
}

pub fn encode_source_description(sdes: &SourceDescription) -> Vec<u8> {
    let mut out = Vec::new();
    let start = out.len();
    push_header(
        &mut out,
        sdes.chunks.len() as u8,
        packet_type::SOURCE_DESCRIPTION,
    );
    for chunk in &sdes.chunks {
        out.extend_from_slice(&chunk.ssrc.to_be_bytes());
        for (item, value) in &chunk.items {
            out.push(*item);
            out.push(value.len() as u8);
            out.extend_from_slice(value);
        }
        out.push(sdes_item::END);
        while (out.len() - start) % 4 != 0 {
            out.push(0);
        }
    }
    finish_length(&mut out, start);
    out
}

pub fn encode_bye(bye: &Bye) -> Vec<u8> {
    let mut out = Vec::new();
    let start = out.len();
    push_header(&mut out, bye.sources.len() as u8, packet_type::BYE);
    for ssrc in &bye.sources {
        out.extend_from_slice(&ssrc.to_be_bytes());
    }
    if let Some(reason) = &bye.reason {
        out.push(reason.len() as u8);
        out.extend_from_slice(reason.as_bytes());
        while (out.len() - start) % 4 != 0 {
            out.push(0);
        }
    }
    finish_length(&mut out, start);
    out
}

/// Reserialize any parsed packet.
pub fn encode(packet: &RtcpPacket) -> Vec<u8> {
    match packet {
        RtcpPacket::SenderReport(sr) => encode_sender_report(sr),
        RtcpPacket::ReceiverReport(rr) => encode_receiver_report(rr),
        RtcpPacket::SourceDescription(sdes) => encode_source_description(sdes),
        RtcpPacket::Bye(bye) => encode_bye(bye),
        RtcpPacket::Application => Vec::new(),
    }
}

/// Parse one whole packet of `size` bytes. `None` means malformed.
pub fn parse_packet(data: &[u8]) -> Option<RtcpPacket> {
    if data.len() < 4 {
        return None;
    }
    let count = (data[0] & 0x1f) as usize;
    let pt = data[1];
    match pt {
        packet_type::SENDER_REPORT => {
            if data.len() < 28 + count * 24 {
                return None;
            }
            let mut reports = Vec::with_capacity(count);
            for i in 0..count {
                reports.push(parse_block(&data[28 + i * 24..]));
            }
            Some(RtcpPacket::SenderReport(SenderReport {
                ssrc: read_u32(data, 4),
                ntp_high: read_u32(data, 8),
                ntp_low: read_u32(data, 12),
                rtp_time: read_u32(data, 16),
                packet_count: read_u32(data, 20),
                octet_count: read_u32(data, 24),
                reports,
            }))
        }
        packet_type::RECEIVER_REPORT => {
            if data.len() < 8 + count * 24 {
                return None;
            }
            let mut reports = Vec::with_capacity(count);
            for i in 0..count {
                reports.push(parse_block(&data[8 + i * 24..]));
            }
            Some(RtcpPacket::ReceiverReport(ReceiverReport {
                ssrc: read_u32(data, 4),
                reports,
            }))
        }
        packet_type::SOURCE_DESCRIPTION => {
            let mut chunks = Vec::with_capacity(count);
            let mut pos = 4usize;
            for _ in 0..count {
                if pos + 4 > data.len() {
                    return None;
                }
                let ssrc = read_u32(data, pos);
                pos += 4;
                let mut items = Vec::new();
                loop {
                    if pos >= data.len() {
                        return None;
                    }
                    let item = data[pos];
                    if item == sdes_item::END {
                        pos += 1;
                        // consume padding to the next word boundary
                        while pos % 4 != 0 {
                            if pos >= data.len() || data[pos] != 0 {
                                break;
                            }
                            pos += 1;
                        }
                        break;
                    }
                    if pos + 2 > data.len() {
                        return None;
                    }
                    let len = data[pos + 1] as usize;
                    if pos + 2 + len > data.len() {
                        return None;
                    }
                    items.push((item, data[pos + 2..pos + 2 + len].to_vec()));
                    pos += 2 + len;
                }
                chunks.push(SdesChunk { ssrc, items });
            }
            Some(RtcpPacket::SourceDescription(SourceDescription { chunks }))
        }
        packet_type::BYE => {
            if data.len() < 4 + count * 4 {
                return None;
            }
            let sources = (0..count).map(|i| read_u32(data, 4 + i * 4)).collect();
            let mut pos = 4 + count * 4;
            let reason = if pos < data.len() {
                let len = data[pos] as usize;
                pos += 1;
                if pos + len > data.len() {
                    return None;
                }
                Some(String::from_utf8_lossy(&data[pos..pos + len]).into_owned())
            } else {
                None
            };
            Some(RtcpPacket::Bye(Bye { sources, reason }))
        }
        packet_type::APPLICATION => Some(RtcpPacket::Application),
        _ => None,
    }
}

/// Parse as many whole packets as the buffer holds, returning them and the
/// number of bytes consumed.
///
/// Unknown packet types resync: when the embedded length is sane and fully
/// buffered the whole declared packet is skipped, otherwise the scan
/// advances one byte.
pub fn parse_buffer(data: &[u8]) -> (Vec<RtcpPacket>, usize) {
    let mut packets = Vec::new();
    let mut i = 0usize;
    while i + 4 <= data.len() {
        let version_ok = data[i] >> 6 == 2;
        let plausible = matches!(
            data[i + 1],
            packet_type::SENDER_REPORT..=packet_type::APPLICATION
        );
        if !version_ok || !plausible {
            i += 1;
            continue;
        }
        let size = (u16::from_be_bytes([data[i + 2], data[i + 3]]) as usize + 1) * 4;
        if i + size > data.len() {
            break;
        }
        match parse_packet(&data[i..i + size]) {
            Some(packet) => {
                packets.push(packet);
                i += size;
            }
            None => {
                tracing::warn!(pt = data[i + 1], size, "unparsable RTCP packet");
                i += size;
            }
        }
    }
    (packets, i)
}
