//! Image requests and the keys derived from them.
//!
//! Two requests with equal keys are interchangeable for the corresponding
//! cache or in-flight task, which is what makes deduplication work.

use std::fmt;
use std::sync::Arc;

use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::processing::ImageProcessing;
use crate::task::TaskPriority;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicy {
    #[default]
    Default,
    /// Skip every cache lookup; results are still stored.
    ReloadIgnoringCachedData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryCacheOptions {
    pub is_read_allowed: bool,
    pub is_write_allowed: bool,
}

impl Default for MemoryCacheOptions {
    fn default() -> Self {
        Self {
            is_read_allowed: true,
            is_write_allowed: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub memory_cache: MemoryCacheOptions,
    /// Used instead of the URL for cache keys, e.g. a URL with volatile
    /// query parameters stripped.
    pub filtered_url: Option<String>,
    /// Overrides the memory cache key entirely.
    pub cache_key: Option<String>,
    /// Overrides the key used to deduplicate network loads.
    pub load_key: Option<String>,
    pub skip_decompression: bool,
}

#[derive(Clone)]
pub struct ImageRequest {
    url: Url,
    headers: HeaderMap,
    processors: Vec<Arc<dyn ImageProcessing>>,
    cache_policy: CachePolicy,
    priority: TaskPriority,
    options: RequestOptions,
}

impl ImageRequest {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            headers: HeaderMap::new(),
            processors: Vec::new(),
            cache_policy: CachePolicy::Default,
            priority: TaskPriority::Normal,
            options: RequestOptions::default(),
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_processors(mut self, processors: Vec<Arc<dyn ImageProcessing>>) -> Self {
        self.processors = processors;
        self
    }

    pub fn with_processor(mut self, processor: impl ImageProcessing + 'static) -> Self {
        self.processors.push(Arc::new(processor));
        self
    }

    pub fn with_cache_policy(mut self, cache_policy: CachePolicy) -> Self {
        self.cache_policy = cache_policy;
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn processors(&self) -> &[Arc<dyn ImageProcessing>] {
        &self.processors
    }

    pub fn cache_policy(&self) -> CachePolicy {
        self.cache_policy
    }

    pub fn priority(&self) -> TaskPriority {
        self.priority
    }

    pub fn options(&self) -> &RequestOptions {
        &self.options
    }

    pub(crate) fn set_processors(&mut self, processors: Vec<Arc<dyn ImageProcessing>>) {
        self.processors = processors;
    }

    /// A copy of this request without its last processor.
    pub(crate) fn without_last_processor(&self) -> Self {
        let mut request = self.clone();
        request.processors.pop();
        request
    }

    pub fn preferred_url(&self) -> &str {
        self.options
            .filtered_url
            .as_deref()
            .unwrap_or_else(|| self.url.as_str())
    }

    pub fn is_cache_lookup_allowed(&self) -> bool {
        self.cache_policy != CachePolicy::ReloadIgnoringCachedData
    }

    fn processor_identifiers(&self) -> Vec<String> {
        self.processors
            .iter()
            .map(|processor| processor.identifier())
            .collect()
    }

    /// Disk cache key of the bytes as downloaded.
    pub fn cache_key_for_original_image_data(&self) -> String {
        self.preferred_url().to_owned()
    }

    /// Disk cache key of the encoded, processed image.
    pub fn cache_key_for_final_image_data(&self) -> String {
        let mut key = self.preferred_url().to_owned();
        for identifier in self.processor_identifiers() {
            key.push_str(&identifier);
        }
        key
    }

    /// Memory cache key of the final image.
    pub fn cache_key_for_final_image(&self) -> ImageCacheKey {
        match &self.options.cache_key {
            Some(custom) => ImageCacheKey::Custom(custom.clone()),
            None => ImageCacheKey::Default {
                url: self.preferred_url().to_owned(),
                processors: self.processor_identifiers(),
            },
        }
    }

    pub fn load_key_for_original_image(&self) -> OriginalLoadKey {
        match &self.options.load_key {
            Some(custom) => OriginalLoadKey::Custom(custom.clone()),
            None => {
                let mut headers: Vec<(String, Vec<u8>)> = self
                    .headers
                    .iter()
                    .map(|(name, value)| (name.as_str().to_owned(), value.as_bytes().to_vec()))
                    .collect();
                headers.sort();
                OriginalLoadKey::Default {
                    url: self.url.to_string(),
                    cache_policy: self.cache_policy,
                    headers,
                }
            }
        }
    }

    pub fn load_key_for_processed_image(&self) -> ProcessedLoadKey {
        ProcessedLoadKey {
            cache_key: self.cache_key_for_final_image(),
            load_key: self.load_key_for_original_image(),
        }
    }
}

impl fmt::Debug for ImageRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageRequest")
            .field("url", &self.url.as_str())
            .field("processors", &self.processor_identifiers())
            .field("cache_policy", &self.cache_policy)
            .field("priority", &self.priority)
            .field("options", &self.options)
            .finish()
    }
}

impl From<Url> for ImageRequest {
    fn from(url: Url) -> Self {
        Self::new(url)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ImageCacheKey {
    Custom(String),
    Default {
        url: String,
        processors: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OriginalLoadKey {
    Custom(String),
    Default {
        url: String,
        cache_policy: CachePolicy,
        headers: Vec<(String, Vec<u8>)>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessedLoadKey {
    pub cache_key: ImageCacheKey,
    pub load_key: OriginalLoadKey,
}
