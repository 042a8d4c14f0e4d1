//! Warming caches ahead of display.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use url::Url;

use crate::operation::{FinishHandle, Operation, WorkQueue};
use crate::pipeline::Pipeline;
use crate::request::{ImageRequest, ProcessedLoadKey};
use crate::task::TaskPriority;

/// Which cache a prefetch fills.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "snake_case")]
pub enum PrefetchDestination {
    /// Load, decode and process the image.
    #[default]
    MemoryCache,
    /// Only fetch the original bytes.
    DiskCache,
}

struct PrefetchTask {
    key: ProcessedLoadKey,
    request: ImageRequest,
    token: CancellationToken,
    operation: Mutex<Weak<Operation>>,
}

impl PrefetchTask {
    fn cancel(&self) {
        self.token.cancel();
        if let Some(operation) = self.operation.lock().upgrade() {
            operation.cancel();
        }
    }
}

struct PrefetcherInner {
    pipeline: Pipeline,
    destination: PrefetchDestination,
    queue: WorkQueue,
    tasks: Mutex<HashMap<ProcessedLoadKey, Arc<PrefetchTask>>>,
}

impl PrefetcherInner {
    fn start(self: &Arc<Self>, request: ImageRequest) {
        let key = request.load_key_for_processed_image();
        if self.tasks.lock().contains_key(&key) {
            return;
        }
        if self.pipeline.cached_image(&request).is_some() {
            trace!(url = %request.url(), "Already in memory cache, not prefetching");
            return;
        }

        let task = Arc::new(PrefetchTask {
            key: key.clone(),
            request,
            token: CancellationToken::new(),
            operation: Mutex::new(Weak::new()),
        });

        let mut tasks = self.tasks.lock();
        if tasks.contains_key(&key) {
            return;
        }
        let prefetcher = Arc::downgrade(self);
        let weak_task = Arc::downgrade(&task);
        let operation = Operation::starter(move |finish| {
            match (prefetcher.upgrade(), weak_task.upgrade()) {
                (Some(prefetcher), Some(task)) => prefetcher.load(task, finish),
                _ => finish.finish(),
            }
        });
        operation.set_queue_priority(task.request.priority());
        let operation = self.queue.add(operation);
        *task.operation.lock() = Arc::downgrade(&operation);
        tasks.insert(key, task);
    }

    fn load(self: Arc<Self>, task: Arc<PrefetchTask>, finish: FinishHandle) {
        if task.token.is_cancelled() {
            finish.finish();
            return;
        }

        let prefetcher = Arc::downgrade(&self);
        let pipeline = self.pipeline.clone();
        let destination = self.destination;
        tokio::spawn(async move {
            match destination {
                PrefetchDestination::MemoryCache => {
                    let mut image_task = pipeline.load_image(task.request.clone());
                    tokio::select! {
                        _ = task.token.cancelled() => image_task.cancel(),
                        _ = image_task.response() => {}
                    }
                }
                PrefetchDestination::DiskCache => {
                    let mut data_task = pipeline.load_data(task.request.clone());
                    tokio::select! {
                        _ = task.token.cancelled() => data_task.cancel(),
                        _ = data_task.response() => {}
                    }
                }
            }
            finish.finish();
            if let Some(prefetcher) = prefetcher.upgrade() {
                prefetcher.remove(&task);
            }
        });
    }

    fn remove(&self, task: &Arc<PrefetchTask>) {
        let mut tasks = self.tasks.lock();
        if tasks
            .get(&task.key)
            .is_some_and(|registered| Arc::ptr_eq(registered, task))
        {
            tasks.remove(&task.key);
        }
    }

    fn stop(&self, request: &ImageRequest) {
        let task = self
            .tasks
            .lock()
            .remove(&request.load_key_for_processed_image());
        if let Some(task) = task {
            task.cancel();
        }
    }

    fn stop_all(&self) {
        let tasks: Vec<_> = self.tasks.lock().drain().map(|(_, task)| task).collect();
        if !tasks.is_empty() {
            debug!(count = tasks.len(), "Stopping all prefetches");
        }
        for task in tasks {
            task.cancel();
        }
    }
}

impl Drop for PrefetcherInner {
    fn drop(&mut self) {
        self.stop_all();
    }
}

/// Loads images ahead of time, at most `max_concurrent` at once.
///
/// Dropping the prefetcher cancels everything it started.
pub struct Prefetcher {
    inner: Arc<PrefetcherInner>,
}

impl Prefetcher {
    pub fn new(pipeline: Pipeline, destination: PrefetchDestination, max_concurrent: usize) -> Self {
        Self {
            inner: Arc::new(PrefetcherInner {
                pipeline,
                destination,
                queue: WorkQueue::new("prefetch", max_concurrent),
                tasks: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn destination(&self) -> PrefetchDestination {
        self.inner.destination
    }

    /// Start loading `requests`. Requests already being prefetched or already
    /// in the memory cache are skipped.
    pub fn start_prefetching(&self, requests: impl IntoIterator<Item = ImageRequest>) {
        for request in requests {
            self.inner.start(request);
        }
    }

    /// Like [`start_prefetching`](Self::start_prefetching), at low priority.
    pub fn start_prefetching_urls(&self, urls: impl IntoIterator<Item = Url>) {
        self.start_prefetching(urls.into_iter().map(low_priority_request));
    }

    pub fn stop_prefetching(&self, requests: impl IntoIterator<Item = ImageRequest>) {
        for request in requests {
            self.inner.stop(&request);
        }
    }

    pub fn stop_prefetching_urls(&self, urls: impl IntoIterator<Item = Url>) {
        self.stop_prefetching(urls.into_iter().map(low_priority_request));
    }

    pub fn stop_all(&self) {
        self.inner.stop_all();
    }

    /// Number of prefetches queued or running.
    pub fn len(&self) -> usize {
        self.inner.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for Prefetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Prefetcher")
            .field("destination", &self.inner.destination)
            .field("in_flight", &self.len())
            .finish()
    }
}

fn low_priority_request(url: Url) -> ImageRequest {
    ImageRequest::new(url).with_priority(TaskPriority::Low)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::test_utils::{MockDataCache, MockDataLoader, MockResponse, png_bytes, test_url};
    use std::time::Duration;

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn memory_prefetch_fills_image_cache() {
        let loader = Arc::new(MockDataLoader::serving(MockResponse::ok(png_bytes(8, 8))));
        let pipeline = Pipeline::new(PipelineConfig::default().with_data_loader(loader.clone()));
        let prefetcher = Prefetcher::new(pipeline.clone(), PrefetchDestination::MemoryCache, 2);

        let request = ImageRequest::new(test_url("a.png"));
        prefetcher.start_prefetching([request.clone(), request.clone()]);
        assert_eq!(prefetcher.len(), 1);

        wait_until(|| prefetcher.is_empty()).await;
        assert!(pipeline.cached_image(&request).is_some());
        assert_eq!(loader.started(), 1);

        // Cached images are not prefetched again.
        prefetcher.start_prefetching([request]);
        assert!(prefetcher.is_empty());
    }

    #[tokio::test]
    async fn disk_prefetch_only_stores_data() {
        let loader = Arc::new(MockDataLoader::serving(MockResponse::ok(png_bytes(8, 8))));
        let cache = Arc::new(MockDataCache::default());
        let pipeline = Pipeline::new(
            PipelineConfig::default()
                .with_data_loader(loader.clone())
                .with_data_cache(cache.clone()),
        );
        let prefetcher = Prefetcher::new(pipeline.clone(), PrefetchDestination::DiskCache, 2);

        let url = test_url("b.png");
        prefetcher.start_prefetching_urls([url.clone()]);
        wait_until(|| prefetcher.is_empty()).await;

        let request = ImageRequest::new(url);
        assert_eq!(cache.keys(), vec![request.cache_key_for_original_image_data()]);
        assert!(pipeline.cached_image(&request).is_none());
    }

    #[tokio::test]
    async fn higher_priority_prefetches_start_first() {
        let loader = Arc::new(MockDataLoader::serving(MockResponse::ok(png_bytes(8, 8))));
        let pipeline = Pipeline::new(PipelineConfig::default().with_data_loader(loader.clone()));
        let prefetcher = Prefetcher::new(pipeline, PrefetchDestination::DiskCache, 1);
        prefetcher.inner.queue.set_suspended(true);

        let low = ImageRequest::new(test_url("low.png")).with_priority(TaskPriority::Low);
        let high = ImageRequest::new(test_url("high.png")).with_priority(TaskPriority::High);
        prefetcher.start_prefetching([low.clone(), high.clone()]);
        assert_eq!(prefetcher.inner.queue.pending_count(), 2);

        prefetcher.inner.queue.set_suspended(false);
        wait_until(|| prefetcher.is_empty()).await;
        let urls: Vec<_> = loader.requests().into_iter().map(|r| r.url).collect();
        assert_eq!(urls, vec![high.url().clone(), low.url().clone()]);
    }

    #[tokio::test]
    async fn stopping_cancels_the_load() {
        let loader = Arc::new(MockDataLoader::serving(
            MockResponse::ok(png_bytes(8, 8)).stalled(),
        ));
        let pipeline = Pipeline::new(PipelineConfig::default().with_data_loader(loader.clone()));
        let prefetcher = Prefetcher::new(pipeline, PrefetchDestination::MemoryCache, 2);

        let url = test_url("c.png");
        prefetcher.start_prefetching_urls([url.clone()]);
        wait_until(|| loader.started() == 1).await;

        prefetcher.stop_prefetching_urls([url]);
        assert!(prefetcher.is_empty());
        wait_until(|| loader.cancelled() == 1).await;
    }
}
