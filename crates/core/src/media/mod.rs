//! Media model: frames, tracks, containers, and the demuxer seam.

pub mod buffer;
pub mod cache;
pub mod container;
pub mod demux;
pub mod frame;
pub mod iterator;
pub mod medium;
pub mod playlist;

pub use buffer::FrameBuffer;
pub use cache::DescriptionCache;
pub use container::Container;
pub use demux::{DemuxPacket, Demuxer, DemuxerFactory, MemoryDemuxer, set_demuxer_factory};
pub use frame::{Frame, MediaKind};
pub use iterator::{FrameIterator, IteratorModel};
pub use medium::{Medium, MediumSpec, SeekDirection};
pub use playlist::Playlist;
