use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::decoding::{DecoderFactory, ImageDecoderRegistry, ImageDecodingContext, ImageDecoding};
use crate::decompression::{DefaultDecompressor, ImageDecompressing};
use crate::disk_cache::{DataCache, DataCacheConfig, DataCacheItem, DataCacheOptions, DataCaching};
use crate::encoding::{EncoderFactory, ImageEncoding, ImageEncodingContext, default_encoder_factory};
use crate::error::CacheError;
use crate::loader::{DataLoader, DataLoaderConfig, DataLoading};
use crate::memory_cache::{ImageCache, ImageCacheConfig, ImageCaching};
use crate::processing::ImageProcessing;
use crate::rate_limiter::RateLimiterConfig;

/// Maximum concurrency of each work queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub data_loading: usize,
    pub data_caching: usize,
    pub decoding: usize,
    pub encoding: usize,
    pub processing: usize,
    pub decompressing: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            data_loading: 6,
            data_caching: 2,
            decoding: 1,
            encoding: 1,
            processing: 2,
            decompressing: 2,
        }
    }
}

/// Plain-data pipeline settings, loadable from a config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Normalize decoded images off the caller's thread
    pub is_decompression_enabled: bool,

    /// Coalesce identical in-flight requests into one task
    pub is_deduplication_enabled: bool,

    /// Throttle outgoing loads with a token bucket
    pub is_rate_limiter_enabled: bool,

    /// Emit previews while progressive JPEGs download
    pub is_progressive_decoding_enabled: bool,

    /// Also keep previews in the memory cache
    pub is_storing_previews_in_memory_cache: bool,

    /// Resume interrupted downloads with range requests
    pub is_resumable_data_enabled: bool,

    /// Keep animated image data untouched by processors and decompression
    pub is_animated_image_data_enabled: bool,

    pub data_cache_options: DataCacheOptions,

    pub rate_limiter: RateLimiterConfig,

    pub queues: QueueConfig,

    pub loader: DataLoaderConfig,

    pub memory_cache: Option<ImageCacheConfig>,

    pub disk_cache: Option<DataCacheConfig>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            is_decompression_enabled: true,
            is_deduplication_enabled: true,
            is_rate_limiter_enabled: true,
            is_progressive_decoding_enabled: false,
            is_storing_previews_in_memory_cache: false,
            is_resumable_data_enabled: true,
            is_animated_image_data_enabled: false,
            data_cache_options: DataCacheOptions::default(),
            rate_limiter: RateLimiterConfig::default(),
            queues: QueueConfig::default(),
            loader: DataLoaderConfig::default(),
            memory_cache: Some(ImageCacheConfig::default()),
            disk_cache: None,
        }
    }
}

/// Everything a pipeline is built from: settings plus capability objects.
#[derive(Clone)]
pub struct PipelineConfig {
    pub settings: PipelineSettings,
    pub data_loader: Arc<dyn DataLoading>,
    pub data_cache: Option<Arc<dyn DataCaching>>,
    pub image_cache: Option<Arc<dyn ImageCaching>>,
    pub make_image_decoder: DecoderFactory,
    pub make_image_encoder: EncoderFactory,
    pub decompressor: Arc<dyn ImageDecompressing>,
    /// Applied to requests that carry no processors of their own.
    pub processors: Vec<Arc<dyn ImageProcessing>>,
}

impl PipelineConfig {
    /// Build the default capabilities described by `settings`.
    pub fn from_settings(settings: PipelineSettings) -> Result<Self, CacheError> {
        let data_cache = match &settings.disk_cache {
            Some(config) => Some(Arc::new(DataCache::new(config.clone())?) as Arc<dyn DataCaching>),
            None => None,
        };
        Ok(Self::build(settings, data_cache))
    }

    fn build(settings: PipelineSettings, data_cache: Option<Arc<dyn DataCaching>>) -> Self {
        let image_cache = settings
            .memory_cache
            .as_ref()
            .map(|config| Arc::new(ImageCache::new(config)) as Arc<dyn ImageCaching>);

        Self {
            data_loader: Arc::new(DataLoader::new(&settings.loader)),
            data_cache,
            image_cache,
            make_image_decoder: ImageDecoderRegistry::new().into_factory(),
            make_image_encoder: default_encoder_factory(),
            decompressor: Arc::new(DefaultDecompressor),
            processors: Vec::new(),
            settings,
        }
    }

    pub fn with_data_cache(mut self, data_cache: Arc<dyn DataCaching>) -> Self {
        self.data_cache = Some(data_cache);
        self
    }

    pub fn with_data_loader(mut self, data_loader: Arc<dyn DataLoading>) -> Self {
        self.data_loader = data_loader;
        self
    }

    pub fn make_image_decoder(&self, context: &ImageDecodingContext) -> Option<Arc<dyn ImageDecoding>> {
        (self.make_image_decoder)(context)
    }

    pub fn make_image_encoder(&self, context: &ImageEncodingContext) -> Arc<dyn ImageEncoding> {
        (self.make_image_encoder)(context)
    }

    /// The disk cache, if one is configured and it stores `item`.
    pub(crate) fn data_cache_for(&self, item: DataCacheItem) -> Option<&Arc<dyn DataCaching>> {
        self.data_cache
            .as_ref()
            .filter(|_| self.settings.data_cache_options.stores(item))
    }
}

impl Default for PipelineConfig {
    /// Same as [`PipelineConfig::from_settings`] with default settings, which
    /// configure no disk cache.
    fn default() -> Self {
        Self::build(PipelineSettings::default(), None)
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("settings", &self.settings)
            .field("has_data_cache", &self.data_cache.is_some())
            .field("has_image_cache", &self.image_cache.is_some())
            .field("processors", &self.processors)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let settings = PipelineSettings::default();
        assert!(settings.is_decompression_enabled);
        assert!(settings.is_deduplication_enabled);
        assert!(settings.is_rate_limiter_enabled);
        assert!(!settings.is_progressive_decoding_enabled);
        assert!(!settings.is_storing_previews_in_memory_cache);
        assert!(settings.is_resumable_data_enabled);
        assert!(!settings.is_animated_image_data_enabled);
        assert!(settings.data_cache_options.stores(DataCacheItem::OriginalImageData));
        assert!(!settings.data_cache_options.stores(DataCacheItem::FinalImage));
        assert_eq!(settings.queues.data_loading, 6);
        assert_eq!(settings.rate_limiter.rate, 80.0);
    }

    #[test]
    fn default_matches_default_settings() {
        let default = PipelineConfig::default();
        let built = PipelineConfig::from_settings(PipelineSettings::default()).unwrap();
        assert_eq!(default.settings, built.settings);
        assert_eq!(default.data_cache.is_some(), built.data_cache.is_some());
        assert_eq!(default.image_cache.is_some(), built.image_cache.is_some());
        assert!(default.processors.is_empty());
    }

    #[test]
    fn data_cache_gated_by_stored_items() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig::default()
            .with_data_cache(Arc::new(DataCache::with_path(dir.path()).unwrap()));
        assert!(config.data_cache_for(DataCacheItem::OriginalImageData).is_some());
        assert!(config.data_cache_for(DataCacheItem::FinalImage).is_none());
    }
}
