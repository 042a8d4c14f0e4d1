//! Caller-facing handles of image and data loads.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use super::PipelineInner;
use crate::atomic::Atomic;
use crate::container::{ImageData, ImageResponse};
use crate::error::PipelineError;
use crate::request::ImageRequest;
use crate::task::{Event, TaskPriority, TaskProgress};

/// Lifecycle events of an image task, in the order they happen.
#[derive(Debug, Clone)]
pub enum ImageTaskEvent {
    Started,
    Cancelled,
    PriorityUpdated(TaskPriority),
    IntermediateResponse(ImageResponse),
    Progress(TaskProgress),
    Completed(Result<ImageResponse, PipelineError>),
}

impl ImageTaskEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Completed(_))
    }
}

impl From<Event<ImageResponse, PipelineError>> for ImageTaskEvent {
    fn from(event: Event<ImageResponse, PipelineError>) -> Self {
        match event {
            Event::Value {
                value,
                is_completed: false,
            } => Self::IntermediateResponse(value),
            Event::Value {
                value,
                is_completed: true,
            } => Self::Completed(Ok(value)),
            Event::Progress(progress) => Self::Progress(progress),
            Event::Error(error) => Self::Completed(Err(error)),
        }
    }
}

#[derive(Debug, Clone)]
pub enum DataTaskEvent {
    Progress(TaskProgress),
    Completed(Result<ImageData, PipelineError>),
}

/// State shared between a handle and the pipeline's bookkeeping.
#[derive(Debug)]
pub(crate) struct TaskShared {
    pub(crate) id: u64,
    pub(crate) request: ImageRequest,
    priority: Atomic<TaskPriority>,
    completed: AtomicU64,
    total: AtomicU64,
    is_cancelled: AtomicBool,
}

impl TaskShared {
    pub(crate) fn new(id: u64, request: ImageRequest) -> Self {
        Self {
            id,
            priority: Atomic::new(request.priority()),
            request,
            completed: AtomicU64::new(0),
            total: AtomicU64::new(0),
            is_cancelled: AtomicBool::new(false),
        }
    }

    pub(crate) fn priority(&self) -> TaskPriority {
        self.priority.get()
    }

    pub(crate) fn set_progress(&self, progress: TaskProgress) {
        self.completed.store(progress.completed, Ordering::Relaxed);
        self.total.store(progress.total, Ordering::Relaxed);
    }

    fn progress(&self) -> TaskProgress {
        TaskProgress::new(
            self.completed.load(Ordering::Relaxed),
            self.total.load(Ordering::Relaxed),
        )
    }

    /// Returns `false` if the task was already cancelled.
    fn mark_cancelled(&self) -> bool {
        !self.is_cancelled.swap(true, Ordering::SeqCst)
    }
}

/// A running image load.
///
/// Events are buffered until read. Dropping the handle does not cancel the
/// load; call [`cancel`](Self::cancel) for that.
pub struct ImageTask {
    shared: Arc<TaskShared>,
    pipeline: Arc<PipelineInner>,
    events: mpsc::UnboundedReceiver<ImageTaskEvent>,
}

impl ImageTask {
    pub(crate) fn new(
        shared: Arc<TaskShared>,
        pipeline: Arc<PipelineInner>,
        events: mpsc::UnboundedReceiver<ImageTaskEvent>,
    ) -> Self {
        Self {
            shared,
            pipeline,
            events,
        }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn request(&self) -> &ImageRequest {
        &self.shared.request
    }

    pub fn priority(&self) -> TaskPriority {
        self.shared.priority()
    }

    /// Latest progress reported by the download, in bytes.
    pub fn progress(&self) -> TaskProgress {
        self.shared.progress()
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.is_cancelled.load(Ordering::SeqCst)
    }

    pub fn set_priority(&self, priority: TaskPriority) {
        if self.shared.priority.get() == priority {
            return;
        }
        self.shared.priority.set(priority);
        self.pipeline.update_priority(self.shared.id, priority);
    }

    /// Cancel the load. No events follow [`ImageTaskEvent::Cancelled`].
    pub fn cancel(&self) {
        if self.shared.mark_cancelled() {
            self.pipeline.cancel_task(self.shared.id);
        }
    }

    /// Next event, or `None` once the task is over.
    pub async fn next_event(&mut self) -> Option<ImageTaskEvent> {
        self.events.recv().await
    }

    /// Wait for the final response, skipping intermediate events.
    ///
    /// `None` if the task was cancelled or the pipeline invalidated.
    pub async fn response(&mut self) -> Option<Result<ImageResponse, PipelineError>> {
        while let Some(event) = self.events.recv().await {
            match event {
                ImageTaskEvent::Completed(result) => return Some(result),
                ImageTaskEvent::Cancelled => return None,
                _ => {}
            }
        }
        None
    }
}

impl Stream for ImageTask {
    type Item = ImageTaskEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

impl std::fmt::Debug for ImageTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageTask")
            .field("id", &self.shared.id)
            .field("url", &self.shared.request.url().as_str())
            .field("priority", &self.priority())
            .field("is_cancelled", &self.is_cancelled())
            .finish()
    }
}

/// A running load of the original image bytes, without decoding.
pub struct DataTask {
    shared: Arc<TaskShared>,
    pipeline: Arc<PipelineInner>,
    events: mpsc::UnboundedReceiver<DataTaskEvent>,
}

impl DataTask {
    pub(crate) fn new(
        shared: Arc<TaskShared>,
        pipeline: Arc<PipelineInner>,
        events: mpsc::UnboundedReceiver<DataTaskEvent>,
    ) -> Self {
        Self {
            shared,
            pipeline,
            events,
        }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn request(&self) -> &ImageRequest {
        &self.shared.request
    }

    pub fn progress(&self) -> TaskProgress {
        self.shared.progress()
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.is_cancelled.load(Ordering::SeqCst)
    }

    pub fn set_priority(&self, priority: TaskPriority) {
        if self.shared.priority.get() == priority {
            return;
        }
        self.shared.priority.set(priority);
        self.pipeline.update_priority(self.shared.id, priority);
    }

    pub fn cancel(&self) {
        if self.shared.mark_cancelled() {
            self.pipeline.cancel_task(self.shared.id);
        }
    }

    pub async fn next_event(&mut self) -> Option<DataTaskEvent> {
        self.events.recv().await
    }

    pub async fn response(&mut self) -> Option<Result<ImageData, PipelineError>> {
        while let Some(event) = self.events.recv().await {
            if let DataTaskEvent::Completed(result) = event {
                return Some(result);
            }
        }
        None
    }
}

impl Stream for DataTask {
    type Item = DataTaskEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

impl std::fmt::Debug for DataTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataTask")
            .field("id", &self.shared.id)
            .field("url", &self.shared.request.url().as_str())
            .field("is_cancelled", &self.is_cancelled())
            .finish()
    }
}
