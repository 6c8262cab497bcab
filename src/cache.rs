//! Persistent skip-cache of remote change indicators.
//!
//! The cache is one JSON object keyed by `order:file` (or `trove:file`) and is
//! rewritten in full, atomically, after every mutation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Remote change indicators recorded for one downloaded file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploaded_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
    /// `Last-Modified` header of the last successful fetch, or the fetch time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_last_modified: Option<String>,
}

/// Mutex-guarded cache map shared by every download worker.
#[derive(Debug)]
pub struct SkipCache {
    path: PathBuf,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl SkipCache {
    /// Loads the cache from `path`.
    ///
    /// A missing file yields an empty cache; an unreadable one is logged and
    /// treated as empty.
    #[must_use]
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                log::warn!("Ignoring unreadable cache {}: {e}", path.display());
                HashMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                log::warn!("Could not read cache {}: {e}", path.display());
                HashMap::new()
            }
        };
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    /// Returns the file this cache persists to.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns a copy of the entry for `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        self.lock().get(key).cloned()
    }

    /// Returns true if an entry exists for `key`.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true if the cache has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Stores `entry` under `key` and persists the whole map.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache file cannot be written.
    pub fn record(&self, key: &str, entry: CacheEntry) -> Result<()> {
        let mut entries = self.lock();
        entries.insert(key.to_string(), entry);
        self.persist(&entries)
    }

    /// [`record`](Self::record) on the blocking pool, for use from download workers.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache file cannot be written.
    pub async fn record_async(self: &Arc<Self>, key: String, entry: CacheEntry) -> Result<()> {
        let cache = Arc::clone(self);
        tokio::task::spawn_blocking(move || cache.record(&key, entry)).await?
    }

    fn persist(&self, entries: &HashMap<String, CacheEntry>) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(entries)?;
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CacheEntry>> {
        // A poisoned map is still a valid map.
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
