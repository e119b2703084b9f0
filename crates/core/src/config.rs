//! Server configuration.
//!
//! All tunables live in one [`Config`] structure, loaded once from an INI
//! file at bootstrap and shared read-only behind a `RwLock`; the reload
//! signal replaces the whole structure through [`SharedConfig::reload`].

use std::fs;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::Result;

/// Server-wide tunables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the RTSP listener binds to.
    pub host: String,
    /// RTSP listen port.
    pub port: u16,
    /// Name advertised in `Server:` headers, `a=tool:` and SDES TOOL items.
    pub server_name: String,
    /// Directory media file names are resolved against.
    pub base_dir: String,
    /// Maximum RTP packet size in bytes, header included.
    pub mtu: usize,
    /// Channel read timeout in seconds.
    pub read_timeout: f64,
    /// Channel write timeout in seconds.
    pub write_timeout: f64,
    /// Socket send-buffer size in bytes.
    pub write_buffer: usize,
    /// Seconds between RTCP sender reports.
    pub sr_interval: f64,
    /// Initial RTCP receiver poll timeout in seconds.
    pub rtcp_poll_interval: f64,
    /// Advertise `a=control:*` and accept aggregate PLAY/PAUSE/TEARDOWN.
    pub aggregate_control: bool,
    /// Share SDP containers between connections through the global cache.
    pub share_descriptors: bool,
    /// Advertise bounded ranges and honor seek requests.
    pub support_seek: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: "0.0.0.0".to_string(),
            port: 8554,
            server_name: concat!("kgd/", env!("CARGO_PKG_VERSION")).to_string(),
            base_dir: "./".to_string(),
            mtu: 1440,
            read_timeout: 1.0,
            write_timeout: 1.0,
            write_buffer: 65_536,
            sr_interval: 5.0,
            rtcp_poll_interval: 5.0,
            aggregate_control: true,
            share_descriptors: true,
            support_seek: true,
        }
    }
}

impl Config {
    /// Load from an INI file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        Ok(Self::from_ini(&text))
    }

    /// Parse INI text. Unknown sections and keys are logged and skipped;
    /// malformed values fall back to the default.
    pub fn from_ini(text: &str) -> Self {
        let mut cfg = Config::default();
        let mut section = String::new();

        for raw in text.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if line.starts_with('[') && line.ends_with(']') {
                section = line[1..line.len() - 1].trim().to_ascii_lowercase();
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                tracing::warn!(line, "ignoring malformed config line");
                continue;
            };
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();
            cfg.apply(&section, &key, value);
        }

        cfg
    }

    fn apply(&mut self, section: &str, key: &str, value: &str) {
        match (section, key) {
            ("server", "host") => self.host = value.to_string(),
            ("server", "port") => set_parsed(&mut self.port, key, value),
            ("server", "name") => self.server_name = value.to_string(),
            ("server", "aggregate-control") => set_parsed(&mut self.aggregate_control, key, value),
            ("server", "share-descriptors") => set_parsed(&mut self.share_descriptors, key, value),
            ("server", "support-seek") => set_parsed(&mut self.support_seek, key, value),
            ("media", "base-dir") => {
                self.base_dir = if value.ends_with('/') {
                    value.to_string()
                } else {
                    format!("{}/", value)
                }
            }
            ("rtp", "mtu") => set_parsed(&mut self.mtu, key, value),
            ("rtcp", "sr-interval") => set_parsed(&mut self.sr_interval, key, value),
            ("rtcp", "poll-interval") => set_parsed(&mut self.rtcp_poll_interval, key, value),
            ("socket", "read-timeout") => set_parsed(&mut self.read_timeout, key, value),
            ("socket", "write-timeout") => set_parsed(&mut self.write_timeout, key, value),
            ("socket", "write-buffer") => set_parsed(&mut self.write_buffer, key, value),
            _ => tracing::warn!(section, key, "unknown config key"),
        }
    }

    /// `host:port` the listener binds to.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn set_parsed<T: std::str::FromStr>(slot: &mut T, key: &str, value: &str) {
    match value.parse() {
        Ok(v) => *slot = v,
        Err(_) => tracing::warn!(key, value, "unparsable config value, keeping default"),
    }
}

/// Configuration handle shared across the server: read-mostly, replaced
/// wholesale on reload.
#[derive(Clone)]
pub struct SharedConfig {
    inner: Arc<RwLock<Config>>,
}

impl SharedConfig {
    pub fn new(config: Config) -> Self {
        SharedConfig {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    /// Snapshot of the current configuration.
    pub fn get(&self) -> Config {
        self.inner.read().clone()
    }

    /// Replace the configuration from the given INI file (SIGHUP path).
    pub fn reload(&self, path: impl AsRef<Path>) -> Result<()> {
        let fresh = Config::load(path)?;
        tracing::info!("configuration reloaded");
        *self.inner.write() = fresh;
        Ok(())
    }
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self::new(Config::default())
    }
}
