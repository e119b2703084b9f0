//! The container-demuxing seam.
//!
//! Demuxing itself is external to the engine: whatever library the
//! embedding application links registers a [`DemuxerFactory`] here, and the
//! container loader consumes the produced timestamped elementary-stream
//! packets plus per-stream codec extradata. For capture devices the factory
//! is expected to hand back an already-encoded elementary stream (the
//! daemon does no transcoding of its own).

use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{KgdError, Result};

use super::medium::MediumSpec;

/// One demuxed elementary-stream packet.
#[derive(Debug, Clone)]
pub struct DemuxPacket {
    /// Stream index within the container.
    pub stream: usize,
    /// Presentation time in seconds.
    pub time: f64,
    pub is_key: bool,
    pub data: Vec<u8>,
}

/// A container being demuxed.
pub trait Demuxer: Send {
    /// Per-stream descriptions, in container order.
    fn streams(&mut self) -> Result<Vec<MediumSpec>>;

    /// Total duration in seconds; infinite for a live source.
    fn duration(&self) -> f64;

    /// Container bit rate in bits per second, 0 when unknown.
    fn bit_rate(&self) -> u64;

    /// Next packet, or `None` at end of input.
    fn read_packet(&mut self) -> Result<Option<DemuxPacket>>;
}

/// Opens containers by path.
pub trait DemuxerFactory: Send + Sync {
    /// Open `path`. `live` marks capture devices, whose streams are
    /// open-ended and must come back as an encoded elementary stream.
    fn open(&self, path: &str, live: bool) -> Result<Box<dyn Demuxer>>;
}

static FACTORY: RwLock<Option<Arc<dyn DemuxerFactory>>> = RwLock::new(None);

/// Install the process-wide demuxer factory.
pub fn set_demuxer_factory(factory: Arc<dyn DemuxerFactory>) {
    *FACTORY.write() = Some(factory);
}

/// Open a container through the registered factory.
pub fn open_demuxer(path: &str, live: bool) -> Result<Box<dyn Demuxer>> {
    match FACTORY.read().as_ref() {
        Some(factory) => factory.open(path, live),
        None => Err(KgdError::NotFound("demuxer factory".into())),
    }
}

/// A demuxer serving pre-built streams from memory.
///
/// Lets an embedding application publish synthesized content, and gives the
/// test suite deterministic media without touching a real container format.
pub struct MemoryDemuxer {
    streams: Vec<MediumSpec>,
    packets: std::vec::IntoIter<DemuxPacket>,
    duration: f64,
    bit_rate: u64,
}

impl MemoryDemuxer {
    pub fn new(
        streams: Vec<MediumSpec>,
        mut packets: Vec<DemuxPacket>,
        duration: f64,
        bit_rate: u64,
    ) -> Self {
        packets.sort_by(|a, b| a.time.total_cmp(&b.time));
        MemoryDemuxer {
            streams,
            packets: packets.into_iter(),
            duration,
            bit_rate,
        }
    }
}

impl Demuxer for MemoryDemuxer {
    fn streams(&mut self) -> Result<Vec<MediumSpec>> {
        Ok(self.streams.clone())
    }

    fn duration(&self) -> f64 {
        self.duration
    }

    fn bit_rate(&self) -> u64 {
        self.bit_rate
    }

    fn read_packet(&mut self) -> Result<Option<DemuxPacket>> {
        Ok(self.packets.next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::frame::MediaKind;

    #[test]
    fn memory_demuxer_orders_packets() {
        let mut demux = MemoryDemuxer::new(
            vec![MediumSpec {
                kind: MediaKind::Video,
                ..MediumSpec::default()
            }],
            vec![
                DemuxPacket {
                    stream: 0,
                    time: 0.2,
                    is_key: false,
                    data: vec![2],
                },
                DemuxPacket {
                    stream: 0,
                    time: 0.0,
                    is_key: true,
                    data: vec![1],
                },
            ],
            0.3,
            1000,
        );
        assert_eq!(demux.streams().unwrap().len(), 1);
        assert_eq!(demux.read_packet().unwrap().unwrap().time, 0.0);
        assert_eq!(demux.read_packet().unwrap().unwrap().time, 0.2);
        assert!(demux.read_packet().unwrap().is_none());
    }
}
