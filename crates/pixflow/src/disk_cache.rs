//! Disk data cache.
//!
//! One file per key, named by the hex SHA-256 of the key. Writes are staged
//! in memory and flushed on the blocking pool, so storing never blocks the
//! caller; reads see staged changes immediately.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::SystemTime;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, trace, warn};

use crate::error::CacheError;

pub trait DataCaching: Send + Sync {
    fn cached_data(&self, key: &str) -> Option<Bytes>;

    fn contains_data(&self, key: &str) -> bool {
        self.cached_data(key).is_some()
    }

    fn store_data(&self, data: Bytes, key: &str);

    fn remove_data(&self, key: &str);

    fn remove_all(&self);
}

/// What the pipeline writes to the disk cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataCacheItem {
    /// Bytes exactly as downloaded.
    OriginalImageData,
    /// Processed images, re-encoded.
    FinalImage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataCacheOptions {
    pub stored_items: Vec<DataCacheItem>,
}

impl Default for DataCacheOptions {
    fn default() -> Self {
        Self {
            stored_items: vec![DataCacheItem::OriginalImageData],
        }
    }
}

impl DataCacheOptions {
    pub fn stores(&self, item: DataCacheItem) -> bool {
        self.stored_items.contains(&item)
    }
}

/// Disk cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataCacheConfig {
    /// Cache directory, created if missing
    pub path: PathBuf,

    /// Total size limit in bytes
    pub size_limit: u64,

    /// Maximum number of files
    pub count_limit: usize,

    /// Fraction of the limits a sweep trims down to
    pub trim_ratio: f64,
}

impl Default for DataCacheConfig {
    fn default() -> Self {
        Self {
            path: std::env::temp_dir().join("pixflow"),
            size_limit: 100 * 1024 * 1024,
            count_limit: 1000,
            trim_ratio: 0.7,
        }
    }
}

/// Writes between automatic sweeps.
const SWEEP_EVERY_WRITES: usize = 32;

#[derive(Debug, Clone)]
enum Change {
    Add(Bytes),
    Remove,
}

#[derive(Debug, Clone)]
struct Staged {
    id: u64,
    change: Change,
}

#[derive(Debug, Default)]
struct Staging {
    changes: HashMap<String, Staged>,
    /// Keys a flusher is currently writing. At most one per key.
    flushing: HashSet<String>,
    next_id: u64,
}

impl Staging {
    fn stage(&mut self, key: &str, change: Change) {
        let id = self.next_id;
        self.next_id += 1;
        self.changes.insert(key.to_owned(), Staged { id, change });
    }
}

struct Inner {
    config: DataCacheConfig,
    staging: Mutex<Staging>,
    flushed: Condvar,
    writes_since_sweep: AtomicUsize,
}

#[derive(Clone)]
pub struct DataCache {
    inner: Arc<Inner>,
}

impl DataCache {
    pub fn new(config: DataCacheConfig) -> Result<Self, CacheError> {
        fs::create_dir_all(&config.path)
            .map_err(|e| CacheError::io(config.path.display().to_string(), e))?;
        debug!(path = %config.path.display(), "Disk cache ready");
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                staging: Mutex::new(Staging::default()),
                flushed: Condvar::new(),
                writes_since_sweep: AtomicUsize::new(0),
            }),
        })
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Result<Self, CacheError> {
        Self::new(DataCacheConfig {
            path: path.into(),
            ..Default::default()
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.config.path
    }

    pub fn filename(key: &str) -> String {
        hex::encode(Sha256::digest(key.as_bytes()))
    }

    pub fn file_path(&self, key: &str) -> PathBuf {
        self.inner.config.path.join(Self::filename(key))
    }

    /// Write every staged change to disk now, waiting for flushes already
    /// running in the background.
    pub fn flush(&self) {
        let keys: Vec<String> = self.inner.staging.lock().changes.keys().cloned().collect();
        for key in &keys {
            self.inner.flush_key(key);
        }
        let mut staging = self.inner.staging.lock();
        while keys.iter().any(|key| staging.flushing.contains(key)) {
            self.inner.flushed.wait(&mut staging);
        }
    }

    /// Remove the least recently written files until both limits are under
    /// `trim_ratio` of their configured value. Returns the number removed.
    pub fn sweep(&self) -> Result<usize, CacheError> {
        self.inner.sweep()
    }

    pub fn total_count(&self) -> usize {
        self.inner.entries().map_or(0, |entries| entries.len())
    }

    pub fn total_size(&self) -> u64 {
        self.inner
            .entries()
            .map_or(0, |entries| entries.iter().map(|entry| entry.size).sum())
    }

    fn schedule_flush(&self, key: &str) {
        let inner = self.inner.clone();
        let key = key.to_owned();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || inner.flush_key(&key));
            }
            Err(_) => inner.flush_key(&key),
        }
    }
}

struct Entry {
    path: PathBuf,
    size: u64,
    modified: SystemTime,
}

impl Inner {
    fn file_path(&self, key: &str) -> PathBuf {
        self.config.path.join(DataCache::filename(key))
    }

    /// Write the newest staged change for `key`. If another flusher owns the
    /// key it picks up the change instead.
    fn flush_key(&self, key: &str) {
        if !self.staging.lock().flushing.insert(key.to_owned()) {
            return;
        }

        let path = self.file_path(key);
        loop {
            let staged = {
                let mut staging = self.staging.lock();
                match staging.changes.get(key).cloned() {
                    Some(staged) => staged,
                    None => {
                        staging.flushing.remove(key);
                        self.flushed.notify_all();
                        return;
                    }
                }
            };

            // Data goes to a unique temp file first; only the commit below
            // touches the cache file.
            let prepared = match &staged.change {
                Change::Add(data) => write_temp(&self.config.path, data).map(Some),
                Change::Remove => Ok(None),
            };

            let mut staging = self.staging.lock();
            let is_current = staging
                .changes
                .get(key)
                .is_some_and(|current| current.id == staged.id);
            if !is_current {
                // Superseded or cleared while writing; the temp file is
                // deleted on drop.
                continue;
            }

            let result = match prepared {
                Ok(Some(file)) => file.persist(&path).map(drop).map_err(|e| e.error),
                Ok(None) => match fs::remove_file(&path) {
                    Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
                    _ => Ok(()),
                },
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!(error = %CacheError::io(path.display().to_string(), e), "Disk cache write failed");
            }
            staging.changes.remove(key);
            staging.flushing.remove(key);
            self.flushed.notify_all();
            drop(staging);

            if matches!(staged.change, Change::Add(_)) {
                self.note_write();
            }
            return;
        }
    }

    fn note_write(&self) {
        if self.writes_since_sweep.fetch_add(1, Ordering::Relaxed) + 1 >= SWEEP_EVERY_WRITES {
            self.writes_since_sweep.store(0, Ordering::Relaxed);
            if let Err(e) = self.sweep() {
                warn!(error = %e, "Disk cache sweep failed");
            }
        }
    }

    fn entries(&self) -> Result<Vec<Entry>, CacheError> {
        let path = &self.config.path;
        let read_dir =
            fs::read_dir(path).map_err(|e| CacheError::io(path.display().to_string(), e))?;
        let entries = read_dir
            .filter_map(Result::ok)
            .filter(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| !name.starts_with('.'))
            })
            .filter_map(|entry| {
                let metadata = entry.metadata().ok()?;
                metadata.is_file().then(|| Entry {
                    path: entry.path(),
                    size: metadata.len(),
                    modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                })
            })
            .collect();
        Ok(entries)
    }

    fn sweep(&self) -> Result<usize, CacheError> {
        let mut entries = self.entries()?;
        let mut size: u64 = entries.iter().map(|entry| entry.size).sum();
        let mut count = entries.len();
        if size <= self.config.size_limit && count <= self.config.count_limit {
            return Ok(0);
        }

        let size_target = (self.config.size_limit as f64 * self.config.trim_ratio) as u64;
        let count_target = (self.config.count_limit as f64 * self.config.trim_ratio) as usize;

        // Newest first, so popping yields the oldest.
        entries.sort_by(|a, b| b.modified.cmp(&a.modified));
        let mut removed = 0;
        while size > size_target || count > count_target {
            let Some(entry) = entries.pop() else {
                break;
            };
            match fs::remove_file(&entry.path) {
                Ok(()) => {
                    size = size.saturating_sub(entry.size);
                    count -= 1;
                    removed += 1;
                }
                Err(e) => {
                    trace!(path = %entry.path.display(), error = %e, "Failed to remove cache file");
                }
            }
        }
        debug!(removed, size, count, "Disk cache swept");
        Ok(removed)
    }
}

fn write_temp(dir: &Path, data: &[u8]) -> io::Result<NamedTempFile> {
    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(data)?;
    Ok(file)
}

impl DataCaching for DataCache {
    fn cached_data(&self, key: &str) -> Option<Bytes> {
        if let Some(staged) = self.inner.staging.lock().changes.get(key) {
            return match &staged.change {
                Change::Add(data) => Some(data.clone()),
                Change::Remove => None,
            };
        }
        match fs::read(self.inner.file_path(key)) {
            Ok(data) => Some(Bytes::from(data)),
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(key, error = %e, "Disk cache read failed");
                }
                None
            }
        }
    }

    fn contains_data(&self, key: &str) -> bool {
        if let Some(staged) = self.inner.staging.lock().changes.get(key) {
            return matches!(staged.change, Change::Add(_));
        }
        self.inner.file_path(key).is_file()
    }

    fn store_data(&self, data: Bytes, key: &str) {
        trace!(key, len = data.len(), "Staging disk cache write");
        self.inner.staging.lock().stage(key, Change::Add(data));
        self.schedule_flush(key);
    }

    fn remove_data(&self, key: &str) {
        self.inner.staging.lock().stage(key, Change::Remove);
        self.schedule_flush(key);
    }

    fn remove_all(&self) {
        self.inner.staging.lock().changes.clear();
        let path = &self.inner.config.path;
        let result = fs::remove_dir_all(path).and_then(|()| fs::create_dir_all(path));
        if let Err(e) = result {
            warn!(error = %CacheError::io(path.display().to_string(), e), "Failed to clear disk cache");
        }
    }
}

impl std::fmt::Debug for DataCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataCache")
            .field("path", &self.inner.config.path)
            .field("size_limit", &self.inner.config.size_limit)
            .field("count_limit", &self.inner.config.count_limit)
            .finish()
    }
}
