//! Process-wide description cache.
//!
//! Maps file name → (shared container, refcount). Connections participate
//! only when descriptor sharing is configured on; otherwise each loads its
//! own container.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::config::Config;
use crate::error::{KgdError, Result};

use super::container::Container;

struct Entry {
    container: Arc<Container>,
    refs: usize,
}

/// Refcounted pool of shared containers.
pub struct DescriptionCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl DescriptionCache {
    pub fn new() -> Self {
        DescriptionCache {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// The process-wide instance.
    pub fn global() -> &'static DescriptionCache {
        static CACHE: OnceLock<DescriptionCache> = OnceLock::new();
        CACHE.get_or_init(DescriptionCache::new)
    }

    /// Return the cached container for `file`, loading it on first use.
    pub fn load(&self, config: &Config, file: &str) -> Result<Arc<Container>> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(file) {
            entry.refs += 1;
            tracing::debug!(file, refs = entry.refs, "descriptor pool hit");
            return Ok(entry.container.clone());
        }
        tracing::debug!(file, "descriptor pool miss");
        let container = Container::load(config, file)?;
        entries.insert(
            file.to_string(),
            Entry {
                container: container.clone(),
                refs: 1,
            },
        );
        Ok(container)
    }

    /// Look up an already-loaded container without touching the refcount.
    pub fn get(&self, file: &str) -> Result<Arc<Container>> {
        self.entries
            .lock()
            .get(file)
            .map(|e| e.container.clone())
            .ok_or_else(|| KgdError::NotFound(format!("description for {file}")))
    }

    /// Drop one reference; at zero the container is removed from the pool.
    pub fn release(&self, file: &str) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(file) else {
            tracing::debug!(file, "releasing unmanaged description");
            return;
        };
        entry.refs -= 1;
        tracing::debug!(file, refs = entry.refs, "descriptor released");
        if entry.refs == 0 {
            entries.remove(file);
            tracing::debug!(file, "descriptor dropped from pool");
        }
    }
}

impl Default for DescriptionCache {
    fn default() -> Self {
        Self::new()
    }
}
