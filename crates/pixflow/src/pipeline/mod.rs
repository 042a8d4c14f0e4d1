//! The image pipeline.
//!
//! A [`Pipeline`] turns an [`ImageRequest`] into a graph of deduplicated tasks:
//!
//! ```text
//! LoadImage ─▶ ProcessImage ─▶ … ─▶ DecodeImage ─▶ LoadImageData
//! ```
//!
//! Each stage lives in [`stages`]. All stage logic and every task's
//! bookkeeping run on the pipeline's [`SerialQueue`]; heavy work (network,
//! disk, decoding, processing) runs on named [`WorkQueue`]s and reports back
//! to the serial queue.

mod handle;
mod stages;


use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::atomic::Atomic;
use crate::config::{PipelineConfig, QueueConfig};
use crate::container::{ImageContainer, ImageData, ImageResponse};
use crate::disk_cache::DataCacheItem;
use crate::error::PipelineError;
use crate::operation::WorkQueue;
use crate::queue::SerialQueue;
use crate::rate_limiter::RateLimiter;
use crate::request::{ImageRequest, OriginalLoadKey, ProcessedLoadKey};
use crate::resumable::ResumableDataStorage;
use crate::task::{Event, Subscription, Task, TaskPool, TaskPriority};

pub use handle::{DataTask, DataTaskEvent, ImageTask, ImageTaskEvent};
use handle::TaskShared;

/// Receives every event of every image task started by a pipeline.
///
/// Called on the pipeline's serial queue; implementations should return
/// quickly.
pub trait PipelineObserver: Send + Sync {
    fn on_image_task_event(&self, task_id: u64, request: &ImageRequest, event: &ImageTaskEvent);
}

pub(crate) type ImageResponseTask = Task<ImageResponse, PipelineError>;
pub(crate) type ImageDataTask = Task<ImageData, PipelineError>;

pub(crate) struct WorkQueues {
    pub(crate) data_loading: WorkQueue,
    pub(crate) data_caching: WorkQueue,
    pub(crate) decoding: WorkQueue,
    pub(crate) encoding: WorkQueue,
    pub(crate) processing: WorkQueue,
    pub(crate) decompressing: WorkQueue,
}

impl WorkQueues {
    fn new(config: &QueueConfig) -> Self {
        Self {
            data_loading: WorkQueue::new("data-loading", config.data_loading),
            data_caching: WorkQueue::new("data-caching", config.data_caching),
            decoding: WorkQueue::new("decoding", config.decoding),
            encoding: WorkQueue::new("encoding", config.encoding),
            processing: WorkQueue::new("processing", config.processing),
            decompressing: WorkQueue::new("decompressing", config.decompressing),
        }
    }
}

struct TaskPools {
    load_image: TaskPool<ProcessedLoadKey, ImageResponse, PipelineError>,
    process_image: TaskPool<ProcessedLoadKey, ImageResponse, PipelineError>,
    decode_image: TaskPool<OriginalLoadKey, ImageResponse, PipelineError>,
    load_image_data: TaskPool<OriginalLoadKey, ImageData, PipelineError>,
}

impl TaskPools {
    fn new(is_deduplication_enabled: bool) -> Self {
        Self {
            load_image: TaskPool::new(is_deduplication_enabled),
            process_image: TaskPool::new(is_deduplication_enabled),
            decode_image: TaskPool::new(is_deduplication_enabled),
            load_image_data: TaskPool::new(is_deduplication_enabled),
        }
    }
}

/// A caller task the pipeline is still serving.
enum ActiveTask {
    Image {
        subscription: Option<Subscription>,
        shared: Arc<TaskShared>,
        events: mpsc::UnboundedSender<ImageTaskEvent>,
    },
    Data {
        subscription: Option<Subscription>,
    },
}

impl ActiveTask {
    fn set_subscription(&mut self, value: Subscription) {
        match self {
            Self::Image { subscription, .. } | Self::Data { subscription } => {
                *subscription = Some(value)
            }
        }
    }

    fn subscription(&self) -> Option<&Subscription> {
        match self {
            Self::Image { subscription, .. } | Self::Data { subscription } => subscription.as_ref(),
        }
    }
}

pub(crate) struct PipelineInner {
    id: Uuid,
    pub(crate) config: PipelineConfig,
    pub(crate) serial: SerialQueue,
    pub(crate) queues: WorkQueues,
    pub(crate) rate_limiter: Option<RateLimiter>,
    pools: TaskPools,
    tasks: Mutex<HashMap<u64, ActiveTask>>,
    observer: RwLock<Option<Arc<dyn PipelineObserver>>>,
    next_task_id: Atomic<u64>,
    is_invalidated: AtomicBool,
}

impl PipelineInner {
    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    /// Requests without processors get the pipeline's default processors.
    fn inherit_options(&self, mut request: ImageRequest) -> ImageRequest {
        if request.processors().is_empty() && !self.config.processors.is_empty() {
            request.set_processors(self.config.processors.clone());
        }
        request
    }

    /// Memory cache lookup honouring the request's cache options.
    pub(crate) fn cached_image(&self, request: &ImageRequest) -> Option<ImageContainer> {
        if !request.options().memory_cache.is_read_allowed || !request.is_cache_lookup_allowed() {
            return None;
        }
        self.config
            .image_cache
            .as_ref()?
            .get(&request.cache_key_for_final_image())
    }

    pub(crate) fn store_response(&self, container: &ImageContainer, request: &ImageRequest) {
        if !request.options().memory_cache.is_write_allowed {
            return;
        }
        if container.is_preview && !self.config.settings.is_storing_previews_in_memory_cache {
            return;
        }
        if let Some(cache) = &self.config.image_cache {
            cache.insert(request.cache_key_for_final_image(), container.clone());
        }
    }

    pub(crate) fn is_decompression_needed(
        &self,
        request: &ImageRequest,
        response: &ImageResponse,
    ) -> bool {
        let settings = &self.config.settings;
        settings.is_decompression_enabled
            && !settings.is_animated_image_data_enabled
            && !request.options().skip_decompression
            && self
                .config
                .decompressor
                .is_decompression_needed(response.image())
    }

    pub(crate) fn make_task_load_image(self: &Arc<Self>, request: ImageRequest) -> ImageResponseTask {
        let key = request.load_key_for_processed_image();
        self.pools
            .load_image
            .publisher_for_key(key, || stages::LoadImage::task(self.clone(), request))
    }

    pub(crate) fn make_task_process_image(
        self: &Arc<Self>,
        request: ImageRequest,
    ) -> ImageResponseTask {
        if request.processors().is_empty() {
            return self.make_task_decode_image(request);
        }
        let key = request.load_key_for_processed_image();
        self.pools
            .process_image
            .publisher_for_key(key, || stages::ProcessImage::task(self.clone(), request))
    }

    pub(crate) fn make_task_decode_image(self: &Arc<Self>, request: ImageRequest) -> ImageResponseTask {
        let key = request.load_key_for_original_image();
        self.pools
            .decode_image
            .publisher_for_key(key, || stages::DecodeImage::task(self.clone(), request))
    }

    pub(crate) fn make_task_load_image_data(self: &Arc<Self>, request: ImageRequest) -> ImageDataTask {
        let key = request.load_key_for_original_image();
        self.pools
            .load_image_data
            .publisher_for_key(key, || stages::LoadImageData::task(self.clone(), request))
    }

    fn send_image_event(
        &self,
        shared: &TaskShared,
        events: &mpsc::UnboundedSender<ImageTaskEvent>,
        event: ImageTaskEvent,
    ) {
        let observer = self.observer.read().clone();
        if let Some(observer) = observer {
            observer.on_image_task_event(shared.id, &shared.request, &event);
        }
        let _ = events.send(event);
    }

    fn start_image_task(
        self: &Arc<Self>,
        shared: Arc<TaskShared>,
        events: mpsc::UnboundedSender<ImageTaskEvent>,
    ) {
        if self.is_invalidated.load(Ordering::SeqCst) {
            return;
        }
        let id = shared.id;
        debug!(task_id = id, url = %shared.request.url(), "Starting image task");

        self.tasks.lock().insert(
            id,
            ActiveTask::Image {
                subscription: None,
                shared: shared.clone(),
                events: events.clone(),
            },
        );
        self.send_image_event(&shared, &events, ImageTaskEvent::Started);

        let pipeline = self.clone();
        let priority = shared.priority();
        let task = self.make_task_load_image(shared.request.clone());
        let subscription = task.subscribe(priority, move |event| {
            let event = ImageTaskEvent::from(event);
            if let ImageTaskEvent::Progress(progress) = &event {
                shared.set_progress(*progress);
            }
            if event.is_terminal() {
                pipeline.tasks.lock().remove(&id);
            }
            pipeline.send_image_event(&shared, &events, event);
        });
        self.register_subscription(id, subscription);
    }

    fn start_data_task(
        self: &Arc<Self>,
        shared: Arc<TaskShared>,
        events: mpsc::UnboundedSender<DataTaskEvent>,
    ) {
        if self.is_invalidated.load(Ordering::SeqCst) {
            return;
        }
        let id = shared.id;
        debug!(task_id = id, url = %shared.request.url(), "Starting data task");

        self.tasks.lock().insert(id, ActiveTask::Data { subscription: None });

        let pipeline = self.clone();
        let priority = shared.priority();
        let task = self.make_task_load_image_data(shared.request.clone());
        let subscription = task.subscribe(priority, move |event| {
            let event = match event {
                Event::Progress(progress) => {
                    shared.set_progress(progress);
                    DataTaskEvent::Progress(progress)
                }
                Event::Value {
                    is_completed: false,
                    ..
                } => return,
                Event::Value { value, .. } => DataTaskEvent::Completed(Ok(value)),
                Event::Error(error) => DataTaskEvent::Completed(Err(error)),
            };
            if matches!(event, DataTaskEvent::Completed(_)) {
                pipeline.tasks.lock().remove(&id);
            }
            let _ = events.send(event);
        });
        self.register_subscription(id, subscription);
    }

    /// The task may have completed while subscribing, in which case it is
    /// no longer registered.
    fn register_subscription(&self, id: u64, subscription: Option<Subscription>) {
        let Some(subscription) = subscription else {
            return;
        };
        if let Some(task) = self.tasks.lock().get_mut(&id) {
            task.set_subscription(subscription);
        }
    }

    pub(crate) fn cancel_task(self: &Arc<Self>, id: u64) {
        let pipeline = self.clone();
        self.serial.dispatch(move || pipeline.cancel_now(id));
    }

    fn cancel_now(&self, id: u64) {
        let Some(task) = self.tasks.lock().remove(&id) else {
            return;
        };
        trace!(task_id = id, "Cancelling task");
        if let ActiveTask::Image { shared, events, .. } = &task {
            self.send_image_event(shared, events, ImageTaskEvent::Cancelled);
        }
        if let Some(subscription) = task.subscription() {
            subscription.unsubscribe();
        }
    }

    pub(crate) fn update_priority(self: &Arc<Self>, id: u64, priority: TaskPriority) {
        let pipeline = self.clone();
        self.serial.dispatch(move || {
            let (subscription, image) = {
                let tasks = pipeline.tasks.lock();
                let Some(task) = tasks.get(&id) else {
                    return;
                };
                let image = match task {
                    ActiveTask::Image { shared, events, .. } => Some((shared.clone(), events.clone())),
                    ActiveTask::Data { .. } => None,
                };
                (task.subscription().cloned(), image)
            };
            if let Some((shared, events)) = image {
                pipeline.send_image_event(&shared, &events, ImageTaskEvent::PriorityUpdated(priority));
            }
            if let Some(subscription) = subscription {
                subscription.set_priority(priority);
            }
        });
    }
}

impl Drop for PipelineInner {
    fn drop(&mut self) {
        ResumableDataStorage::shared().unregister(self.id);
    }
}

/// Loads, caches, decodes and processes images.
///
/// Cheap to clone; clones share everything. Must be created inside a Tokio
/// runtime.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        let id = Uuid::new_v4();
        let serial = SerialQueue::new(format!("pixflow.pipeline.{id}"));
        let settings = &config.settings;
        let rate_limiter = settings
            .is_rate_limiter_enabled
            .then(|| RateLimiter::new(serial.clone(), settings.rate_limiter));
        let queues = WorkQueues::new(&settings.queues);
        let pools = TaskPools::new(settings.is_deduplication_enabled);

        ResumableDataStorage::shared().register(id);
        debug!(pipeline_id = %id, "Pipeline created");

        Self {
            inner: Arc::new(PipelineInner {
                id,
                config,
                serial,
                queues,
                rate_limiter,
                pools,
                tasks: Mutex::new(HashMap::new()),
                observer: RwLock::new(None),
                next_task_id: Atomic::new(0),
                is_invalidated: AtomicBool::new(false),
            }),
        }
    }

    /// Build a pipeline from the default configuration adjusted by `configure`.
    pub fn with(configure: impl FnOnce(&mut PipelineConfig)) -> Self {
        let mut config = PipelineConfig::default();
        configure(&mut config);
        Self::new(config)
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    pub fn set_observer(&self, observer: Option<Arc<dyn PipelineObserver>>) {
        *self.inner.observer.write() = observer;
    }

    pub fn load_image(&self, request: impl Into<ImageRequest>) -> ImageTask {
        let request = self.inner.inherit_options(request.into());
        let shared = Arc::new(TaskShared::new(self.inner.next_task_id.increment(), request));
        let (tx, rx) = mpsc::unbounded_channel();

        let pipeline = self.inner.clone();
        let task_shared = shared.clone();
        self.inner
            .serial
            .dispatch(move || pipeline.start_image_task(task_shared, tx));

        ImageTask::new(shared, self.inner.clone(), rx)
    }

    /// Load the original bytes only; no decoding or processing.
    pub fn load_data(&self, request: impl Into<ImageRequest>) -> DataTask {
        let shared = Arc::new(TaskShared::new(
            self.inner.next_task_id.increment(),
            request.into(),
        ));
        let (tx, rx) = mpsc::unbounded_channel();

        let pipeline = self.inner.clone();
        let task_shared = shared.clone();
        self.inner
            .serial
            .dispatch(move || pipeline.start_data_task(task_shared, tx));

        DataTask::new(shared, self.inner.clone(), rx)
    }

    pub fn cached_image(&self, request: &ImageRequest) -> Option<ImageContainer> {
        let request = self.inner.inherit_options(request.clone());
        self.inner.cached_image(&request)
    }

    /// Drop `request` from the memory cache and both disk cache entries.
    pub fn remove_cached_image(&self, request: &ImageRequest) {
        let request = self.inner.inherit_options(request.clone());
        if let Some(cache) = &self.inner.config.image_cache {
            cache.remove(&request.cache_key_for_final_image());
        }
        if let Some(cache) = &self.inner.config.data_cache {
            cache.remove_data(&request.cache_key_for_original_image_data());
            cache.remove_data(&request.cache_key_for_final_image_data());
        }
    }

    /// Disk cache key under which `item` of `request` is stored.
    pub fn cache_key(&self, request: &ImageRequest, item: DataCacheItem) -> String {
        match item {
            DataCacheItem::OriginalImageData => request.cache_key_for_original_image_data(),
            DataCacheItem::FinalImage => request.cache_key_for_final_image_data(),
        }
    }

    /// Cancel every outstanding task and refuse new ones.
    pub fn invalidate(&self) {
        let pipeline = self.inner.clone();
        self.inner.serial.dispatch(move || {
            if pipeline.is_invalidated.swap(true, Ordering::SeqCst) {
                return;
            }
            let ids: Vec<u64> = pipeline.tasks.lock().keys().copied().collect();
            debug!(pipeline_id = %pipeline.id, tasks = ids.len(), "Invalidating pipeline");
            for id in ids {
                pipeline.cancel_now(id);
            }
        });
    }

    pub fn is_invalidated(&self) -> bool {
        self.inner.is_invalidated.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<PipelineInner> {
        &self.inner
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("id", &self.inner.id)
            .field("config", &self.inner.config)
            .field("active_tasks", &self.inner.tasks.lock().len())
            .finish()
    }
}
