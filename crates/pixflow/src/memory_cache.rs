//! In-memory cache of decoded images.

use std::time::Duration;

use moka::sync::Cache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::container::ImageContainer;
use crate::request::ImageCacheKey;

pub trait ImageCaching: Send + Sync {
    fn get(&self, key: &ImageCacheKey) -> Option<ImageContainer>;

    /// Store `container`. A final image is never replaced by a preview.
    fn insert(&self, key: ImageCacheKey, container: ImageContainer);

    fn remove(&self, key: &ImageCacheKey);

    fn remove_all(&self);
}

/// Memory cache configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageCacheConfig {
    /// Total decoded size limit in bytes
    pub cost_limit: u64,

    /// Entries expire this many seconds after insertion, if set
    pub ttl_secs: Option<u64>,
}

impl Default for ImageCacheConfig {
    fn default() -> Self {
        Self {
            cost_limit: 150 * 1024 * 1024,
            ttl_secs: None,
        }
    }
}

/// Cost-bounded image cache, weighted by decoded size.
pub struct ImageCache {
    cache: Cache<ImageCacheKey, ImageContainer>,
    // Serializes the preview/final check with the insert.
    write_lock: Mutex<()>,
}

impl ImageCache {
    pub fn new(config: &ImageCacheConfig) -> Self {
        let mut builder = Cache::builder()
            .weigher(|_key: &ImageCacheKey, value: &ImageContainer| {
                u32::try_from(value.cost()).unwrap_or(u32::MAX)
            })
            .max_capacity(config.cost_limit);
        if let Some(ttl) = config.ttl_secs {
            builder = builder.time_to_live(Duration::from_secs(ttl));
        }
        Self {
            cache: builder.build(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }

    pub fn total_cost(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.weighted_size()
    }
}

impl Default for ImageCache {
    fn default() -> Self {
        Self::new(&ImageCacheConfig::default())
    }
}

impl ImageCaching for ImageCache {
    fn get(&self, key: &ImageCacheKey) -> Option<ImageContainer> {
        self.cache.get(key)
    }

    fn insert(&self, key: ImageCacheKey, container: ImageContainer) {
        let _guard = self.write_lock.lock();
        if container.is_preview
            && self
                .cache
                .get(&key)
                .is_some_and(|existing| !existing.is_preview)
        {
            trace!(?key, "Keeping final image over preview");
            return;
        }
        self.cache.insert(key, container);
    }

    fn remove(&self, key: &ImageCacheKey) {
        self.cache.invalidate(key);
    }

    fn remove_all(&self) {
        self.cache.invalidate_all();
    }
}

impl std::fmt::Debug for ImageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageCache")
            .field("entry_count", &self.cache.entry_count())
            .field("weighted_size", &self.cache.weighted_size())
            .finish()
    }
}
