//! A container description: the media set for one file, playlist, or
//! capture device, fed by a background loader task.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{KgdError, Result};

use super::demux::{DemuxPacket, Demuxer, open_demuxer};
use super::frame::Frame;
use super::medium::Medium;
use super::playlist::Playlist;

/// Packets a live loader holds back to restore PTS monotonicity before
/// frames reach the media.
const LIVE_REORDER_WINDOW: usize = 16;

/// The description of one streamable resource.
///
/// Construction resolves the resource kind from the file name: `.kls` files
/// are playlists, `dev.video*` names are capture devices, anything else is
/// an on-disk container opened through the demuxer seam.
pub struct Container {
    file_name: String,
    description: RwLock<String>,
    duration: Mutex<f64>,
    bit_rate: Mutex<u64>,
    uuid: Uuid,
    live: bool,
    media: RwLock<BTreeMap<usize, Arc<Medium>>>,
    running: Arc<AtomicBool>,
    loader: Mutex<Option<JoinHandle<()>>>,
}

impl Container {
    /// Build the description for `file_name`, spawning the frame-index
    /// loader for on-disk and device resources.
    pub fn load(config: &Config, file_name: &str) -> Result<Arc<Self>> {
        let live = file_name.starts_with("dev.video");
        let container = Arc::new(Container {
            file_name: file_name.to_string(),
            description: RwLock::new(file_name.to_string()),
            duration: Mutex::new(0.0),
            bit_rate: Mutex::new(0),
            uuid: Uuid::new_v4(),
            live,
            media: RwLock::new(BTreeMap::new()),
            running: Arc::new(AtomicBool::new(true)),
            loader: Mutex::new(None),
        });
        tracing::debug!(file = file_name, live, "creating descriptor");

        if file_name.ends_with(".kls") {
            container.load_playlist(config)?;
        } else {
            container.load_media(config)?;
        }
        Ok(container)
    }

    fn load_playlist(&self, config: &Config) -> Result<()> {
        let playlist = Playlist::load(format!("{}{}", config.base_dir, self.file_name))?;
        if playlist.media().is_empty() {
            return Err(KgdError::managed(
                crate::status::Status::NOT_FOUND,
                format!("playlist {} lists no media", self.file_name),
            ));
        }
        let mut first = true;
        for file in playlist.media() {
            let sub = Container::load(config, file)?;
            if first {
                self.assign(&sub)?;
                first = false;
            } else {
                self.append(&sub)?;
            }
        }
        self.loop_media(playlist.loops());
        Ok(())
    }

    fn load_media(&self, config: &Config) -> Result<()> {
        let path = if self.live {
            device_path(&self.file_name)
        } else {
            format!("{}{}", config.base_dir, self.file_name)
        };
        let mut demuxer = open_demuxer(&path, self.live)?;

        let duration = if self.live {
            f64::INFINITY
        } else {
            demuxer.duration()
        };
        *self.duration.lock() = duration;
        *self.bit_rate.lock() = demuxer.bit_rate();

        {
            let mut media = self.media.write();
            for spec in demuxer.streams()? {
                let index = spec.index;
                let medium = Medium::new(spec);
                medium.set_file_name(&self.file_name);
                medium.set_duration(duration);
                medium.set_live_cast(self.live);
                media.insert(index, medium);
            }
        }

        let media: Vec<Arc<Medium>> = self.media.read().values().cloned().collect();
        let running = self.running.clone();
        let live = self.live;
        let file = self.file_name.clone();
        let handle = std::thread::Builder::new()
            .name(format!("kgd-loader {file}"))
            .spawn(move || run_loader(demuxer, media, running, live))?;
        *self.loader.lock() = Some(handle);
        Ok(())
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn description(&self) -> String {
        self.description.read().clone()
    }

    pub fn set_description(&self, text: &str) {
        *self.description.write() = text.to_string();
    }

    /// Stable identifier for this description instance.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn is_live_cast(&self) -> bool {
        self.live
    }

    pub fn duration(&self) -> f64 {
        *self.duration.lock()
    }

    pub fn bit_rate(&self) -> u64 {
        *self.bit_rate.lock()
    }

    pub fn media(&self) -> Vec<Arc<Medium>> {
        self.media.read().values().cloned().collect()
    }

    pub fn medium(&self, index: usize) -> Result<Arc<Medium>> {
        self.media
            .read()
            .get(&index)
            .cloned()
            .ok_or_else(|| KgdError::TrackNotFound(index.to_string()))
    }

    /// Replace this container's media with info clones of `other`'s,
    /// carrying over its frames.
    pub fn assign(&self, other: &Container) -> Result<()> {
        self.stop();
        {
            let mut media = self.media.write();
            media.clear();
            for theirs in other.media() {
                let mine = theirs.info_clone();
                mine.set_file_name(&self.file_name);
                let mut it = theirs.new_iterator();
                mine.append_iterator(&mut it)?;
                media.insert(mine.index(), mine);
            }
        }
        *self.duration.lock() = other.duration();
        *self.bit_rate.lock() = other.bit_rate();
        Ok(())
    }

    /// Append `other`'s frames after this container's end, matching tracks
    /// by payload type.
    pub fn append(&self, other: &Container) -> Result<()> {
        for mine in self.media() {
            if let Some(theirs) = other.medium_by_payload_type(mine.payload_type()) {
                let mut it = theirs.new_iterator();
                mine.append_iterator(&mut it)?;
            }
        }
        let mut duration = self.duration.lock();
        *duration += other.duration();
        Ok(())
    }

    /// Splice `other` in at presentation time `t`. Tracks without a
    /// payload-type match get a silent gap instead so all tracks stay the
    /// same length.
    pub fn insert(&self, other: &Container, t: f64) -> Result<()> {
        for mine in self.media() {
            match other.medium_by_payload_type(mine.payload_type()) {
                Some(theirs) => {
                    tracing::debug!(pt = mine.payload_type(), "media insert: matched track");
                    let mut it = theirs.new_iterator();
                    mine.insert_iterator(&mut it, t)?;
                }
                None => {
                    tracing::debug!(pt = mine.payload_type(), "media insert: silent gap");
                    mine.insert_silence(other.duration(), t)?;
                }
            }
        }
        let mut duration = self.duration.lock();
        *duration += other.duration();
        Ok(())
    }

    /// Wrap every track's iterator model in a loop (0 = forever).
    pub fn loop_media(&self, times: u16) {
        let times = if times > u8::MAX as u16 {
            tracing::warn!(times, "loop count capped at 255");
            u8::MAX
        } else {
            times as u8
        };
        if times == 1 {
            return;
        }
        for medium in self.media() {
            medium.loop_model(times);
        }
    }

    /// The first track carrying the given payload type.
    pub fn medium_by_payload_type(&self, pt: u8) -> Option<Arc<Medium>> {
        self.media
            .read()
            .values()
            .find(|m| m.payload_type() == pt)
            .cloned()
    }

    /// Stop the background loader and wait for it; media keep whatever
    /// frames were indexed, with their counts finalized by the loader.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.loader.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        self.stop();
        tracing::debug!(file = %self.file_name, "descriptor destroyed");
    }
}

/// `dev.video<N>[.<sub>]` → `/dev/video<N>[/<sub>]`.
pub fn device_path(name: &str) -> String {
    match name.strip_prefix("dev.") {
        Some(rest) => format!("/dev/{}", rest.replace('.', "/")),
        None => name.to_string(),
    }
}

fn run_loader(
    mut demuxer: Box<dyn Demuxer>,
    media: Vec<Arc<Medium>>,
    running: Arc<AtomicBool>,
    live: bool,
) {
    let by_index: BTreeMap<usize, &Arc<Medium>> =
        media.iter().map(|m| (m.index(), m)).collect();
    let mut reorder: Vec<DemuxPacket> = Vec::new();

    while running.load(Ordering::Relaxed) {
        match demuxer.read_packet() {
            Ok(Some(packet)) => {
                if packet.data.is_empty() || !by_index.contains_key(&packet.stream) {
                    tracing::warn!(
                        stream = packet.stream,
                        size = packet.data.len(),
                        "skipping frame"
                    );
                    continue;
                }
                if live {
                    // Encoded device streams may arrive out of presentation
                    // order; a small window restores monotonicity.
                    let at = reorder
                        .partition_point(|held| held.time <= packet.time);
                    reorder.insert(at, packet);
                    if reorder.len() > LIVE_REORDER_WINDOW {
                        deliver(&by_index, reorder.remove(0));
                    }
                } else {
                    deliver(&by_index, packet);
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "demuxer read failed");
                break;
            }
        }
    }

    for packet in reorder.drain(..) {
        deliver(&by_index, packet);
    }
    for medium in &media {
        medium.finalize_frame_count();
    }
    drop(demuxer);
}

fn deliver(by_index: &BTreeMap<usize, &Arc<Medium>>, packet: DemuxPacket) {
    if let Some(medium) = by_index.get(&packet.stream) {
        medium.add_frame(Frame::new(packet.time, packet.is_key, packet.data));
    }
}
