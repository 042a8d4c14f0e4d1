//! # pixflow
//!
//! An image acquisition pipeline: fetch image bytes over HTTP, keep them in a
//! disk cache, decode them (with previews for progressive JPEGs), run them
//! through a chain of processors and keep the result in a memory cache.
//!
//! ## Features
//!
//! - Deduplication of identical in-flight requests at every stage
//! - Subscriber-driven priorities and cancellation
//! - Token bucket rate limiting of network loads
//! - Resumable downloads through HTTP range requests
//! - Two cache tiers: decoded images in memory, encoded bytes on disk
//! - Prefetching into either tier
//!
//! ```no_run
//! # async fn run() {
//! use pixflow::{ImageRequest, Pipeline, processing::Resize};
//!
//! let pipeline = Pipeline::with(|config| {
//!     config.settings.is_progressive_decoding_enabled = true;
//! });
//! let request = ImageRequest::new("https://example.com/a.jpg".parse().unwrap())
//!     .with_processor(Resize::new(320, 240));
//! let mut task = pipeline.load_image(request);
//! if let Some(Ok(response)) = task.response().await {
//!     println!("{}x{}", response.image().width(), response.image().height());
//! }
//! # }
//! ```

pub mod atomic;
pub mod config;
pub mod container;
pub mod decoding;
pub mod decompression;
pub mod disk_cache;
pub mod encoding;
pub mod error;
pub mod loader;
pub mod memory_cache;
pub mod operation;
pub mod pipeline;
pub mod prefetch;
pub mod processing;
pub mod queue;
pub mod rate_limiter;
pub mod request;
pub mod resumable;
pub mod task;

#[cfg(test)]
mod test_utils;

pub use config::{PipelineConfig, PipelineSettings};
pub use container::{ImageContainer, ImageData, ImageResponse, ImageType};
pub use disk_cache::{DataCache, DataCacheItem};
pub use error::{CacheError, LoadError, PipelineError};
pub use memory_cache::ImageCache;
pub use pipeline::{DataTask, DataTaskEvent, ImageTask, ImageTaskEvent, Pipeline, PipelineObserver};
pub use prefetch::{PrefetchDestination, Prefetcher};
pub use request::{CachePolicy, ImageRequest, RequestOptions};
pub use task::{TaskPriority, TaskProgress};
