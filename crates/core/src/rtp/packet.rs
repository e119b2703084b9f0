//! RTP packets and the fixed header (RFC 3550 §5.1).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           Timestamp                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                             SSRC                              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

/// Fixed header length in bytes.
pub const RTP_HEADER_LEN: usize = 12;

/// Default maximum packet size, header included.
pub const DEFAULT_MTU: usize = 1440;

/// Field values of one RTP fixed header. Version is always 2; padding,
/// extension and CSRC count are always 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    /// Serialize the 12-byte header.
    pub fn write(&self) -> [u8; RTP_HEADER_LEN] {
        let mut header = [0u8; RTP_HEADER_LEN];
        header[0] = 2 << 6;
        header[1] = ((self.marker as u8) << 7) | (self.payload_type & 0x7f);
        header[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        header[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        header[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        header
    }

    /// Parse a header back out of packet bytes.
    pub fn parse(data: &[u8]) -> Option<RtpHeader> {
        if data.len() < RTP_HEADER_LEN || data[0] >> 6 != 2 {
            return None;
        }
        Some(RtpHeader {
            marker: data[1] & 0x80 != 0,
            payload_type: data[1] & 0x7f,
            sequence: u16::from_be_bytes([data[2], data[3]]),
            timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        })
    }
}

/// One RTP packet ready for the wire.
#[derive(Debug, Clone)]
pub struct Packet {
    pub data: Vec<u8>,
    /// Last packet of its frame's burst; marked end-of-record on
    /// transports that support it.
    pub is_last_of_sequence: bool,
}

impl Packet {
    pub fn new(header: RtpHeader, payload: &[u8], is_last_of_sequence: bool) -> Self {
        let mut data = Vec::with_capacity(RTP_HEADER_LEN + payload.len());
        data.extend_from_slice(&header.write());
        data.extend_from_slice(payload);
        Packet {
            data,
            is_last_of_sequence,
        }
    }

    pub fn header(&self) -> Option<RtpHeader> {
        RtpHeader::parse(&self.data)
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[RTP_HEADER_LEN.min(self.data.len())..]
    }
}
