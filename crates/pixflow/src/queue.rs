//! Serial executor shared by every task of a pipeline.
//!
//! Stage logic and task bookkeeping are only ever touched from jobs dispatched
//! here, so observers of a single task are never invoked concurrently.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::trace;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Cloneable handle to a serial job queue drained by one Tokio task.
#[derive(Clone)]
pub struct SerialQueue {
    label: Arc<str>,
    tx: mpsc::UnboundedSender<Job>,
}

impl SerialQueue {
    /// Spawn the drain loop on the current Tokio runtime.
    pub fn new(label: impl Into<Arc<str>>) -> Self {
        let label = label.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();

        let drain_label = label.clone();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job();
            }
            trace!(queue = %drain_label, "Serial queue drained and closed");
        });

        Self { label, tx }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Enqueue `job` behind everything already dispatched.
    pub fn dispatch(&self, job: impl FnOnce() + Send + 'static) {
        if self.tx.send(Box::new(job)).is_err() {
            trace!(queue = %self.label, "Dropping job dispatched to a closed queue");
        }
    }

    /// Enqueue `job` once `delay` has elapsed.
    pub fn dispatch_after(&self, delay: Duration, job: impl FnOnce() + Send + 'static) {
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.dispatch(job);
        });
    }
}

impl std::fmt::Debug for SerialQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialQueue")
            .field("label", &self.label)
            .finish()
    }
}
