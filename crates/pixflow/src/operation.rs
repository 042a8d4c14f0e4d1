//! Cancellable units of work executed on named, bounded work queues.
//!
//! An [`Operation`] either wraps a blocking closure, which runs on Tokio's
//! blocking pool and finishes when the closure returns, or a starter closure
//! that receives a [`FinishHandle`] and decides itself when the work is done.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::atomic::Atomic;
use crate::queue::SerialQueue;
use crate::task::TaskPriority;

type BlockWork = Box<dyn FnOnce() + Send + 'static>;
type StarterWork = Box<dyn FnOnce(FinishHandle) + Send + 'static>;
type FinishedHook = Box<dyn FnOnce() + Send + 'static>;

enum Work {
    Block(BlockWork),
    Starter(StarterWork),
}

pub struct Operation {
    queue_priority: Atomic<TaskPriority>,
    token: CancellationToken,
    is_executing: Atomic<bool>,
    is_finished: Atomic<bool>,
    is_finish_called: Atomic<bool>,
    work: Mutex<Option<Work>>,
    on_finished: Mutex<Option<FinishedHook>>,
}

impl Operation {
    fn new(work: Work) -> Arc<Self> {
        Arc::new(Self {
            queue_priority: Atomic::new(TaskPriority::Normal),
            token: CancellationToken::new(),
            is_executing: Atomic::new(false),
            is_finished: Atomic::new(false),
            is_finish_called: Atomic::new(false),
            work: Mutex::new(Some(work)),
            on_finished: Mutex::new(None),
        })
    }

    /// Operation that finishes as soon as `work` returns.
    pub fn block(work: impl FnOnce() + Send + 'static) -> Arc<Self> {
        Self::new(Work::Block(Box::new(work)))
    }

    /// Operation that stays executing until the given [`FinishHandle`] is used.
    pub fn starter(work: impl FnOnce(FinishHandle) + Send + 'static) -> Arc<Self> {
        Self::new(Work::Starter(Box::new(work)))
    }

    pub fn queue_priority(&self) -> TaskPriority {
        self.queue_priority.get()
    }

    /// Takes effect on the next scheduling decision if the operation is pending.
    pub fn set_queue_priority(&self, priority: TaskPriority) {
        self.queue_priority.set(priority);
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_executing(&self) -> bool {
        self.is_executing.get() && !self.is_finished.get()
    }

    pub fn is_finished(&self) -> bool {
        self.is_finished.get()
    }

    fn mark_executing(&self) {
        if !self.is_executing.swap(true, &false) {
            panic!("invalid state, operation is already executing");
        }
    }

    fn mark_finished(&self) {
        if !self.is_finished.swap(true, &false) {
            panic!("invalid state, operation is already finished");
        }
    }

    fn start(self: &Arc<Self>, on_finished: FinishedHook) {
        *self.on_finished.lock() = Some(on_finished);

        if self.is_cancelled() {
            self.finish();
            return;
        }

        let Some(work) = self.work.lock().take() else {
            self.finish();
            return;
        };

        self.mark_executing();
        match work {
            Work::Block(work) => {
                let operation = self.clone();
                tokio::task::spawn_blocking(move || {
                    work();
                    operation.finish();
                });
            }
            Work::Starter(work) => {
                let handle = FinishHandle {
                    operation: self.clone(),
                };
                tokio::spawn(async move { work(handle) });
            }
        }
    }

    /// Finish at most once; later calls are no-ops.
    fn finish(&self) {
        if !self.is_finish_called.swap(true, &false) {
            return;
        }
        self.mark_finished();
        self.work.lock().take();
        let hook = self.on_finished.lock().take();
        if let Some(hook) = hook {
            hook();
        }
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("queue_priority", &self.queue_priority())
            .field("is_cancelled", &self.is_cancelled())
            .field("is_executing", &self.is_executing())
            .field("is_finished", &self.is_finished())
            .finish()
    }
}

/// Handed to starter operations; finishing is idempotent.
#[derive(Clone)]
pub struct FinishHandle {
    operation: Arc<Operation>,
}

impl FinishHandle {
    pub fn finish(&self) {
        self.operation.finish();
    }

    pub fn is_cancelled(&self) -> bool {
        self.operation.is_cancelled()
    }
}

impl fmt::Debug for FinishHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FinishHandle").field(&self.operation).finish()
    }
}

struct Pending {
    seq: u64,
    operation: Arc<Operation>,
}

#[derive(Default)]
struct QueueState {
    pending: Vec<Pending>,
    running: usize,
    next_seq: u64,
}

struct WorkQueueInner {
    name: String,
    max_concurrent: usize,
    is_suspended: AtomicBool,
    state: Mutex<QueueState>,
}

/// Named queue running at most `max_concurrent` operations at a time.
///
/// Pending operations are started highest priority first, in submission order
/// among equal priorities.
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<WorkQueueInner>,
}

impl WorkQueue {
    pub fn new(name: impl Into<String>, max_concurrent: usize) -> Self {
        Self {
            inner: Arc::new(WorkQueueInner {
                name: name.into(),
                max_concurrent: max_concurrent.max(1),
                is_suspended: AtomicBool::new(false),
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }

    /// Number of operations submitted but not yet started.
    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    pub fn running_count(&self) -> usize {
        self.inner.state.lock().running
    }

    /// Stop starting new operations. Running ones are unaffected.
    pub fn set_suspended(&self, suspended: bool) {
        self.inner.is_suspended.store(suspended, Ordering::SeqCst);
        if !suspended {
            self.pump();
        }
    }

    pub fn add(&self, operation: Arc<Operation>) -> Arc<Operation> {
        {
            let mut state = self.inner.state.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.pending.push(Pending {
                seq,
                operation: operation.clone(),
            });
        }
        self.pump();
        operation
    }

    pub fn add_block(&self, work: impl FnOnce() + Send + 'static) -> Arc<Operation> {
        self.add(Operation::block(work))
    }

    pub fn add_starter(&self, work: impl FnOnce(FinishHandle) + Send + 'static) -> Arc<Operation> {
        self.add(Operation::starter(work))
    }

    /// Run `work` on the blocking pool and hand its output to `then` on
    /// `serial`, unless the operation was cancelled before the output got
    /// there. The operation is finished by the time `then` runs.
    pub fn add_block_delivering<R: Send + 'static>(
        &self,
        serial: &SerialQueue,
        work: impl FnOnce() -> R + Send + 'static,
        then: impl FnOnce(R) + Send + 'static,
    ) -> Arc<Operation> {
        let serial = serial.clone();
        self.add(Operation::starter(move |finish| {
            tokio::task::spawn_blocking(move || {
                if finish.is_cancelled() {
                    finish.finish();
                    return;
                }
                let output = work();
                finish.finish();
                serial.dispatch(move || {
                    if !finish.is_cancelled() {
                        then(output);
                    }
                });
            });
        }))
    }

    fn pump(&self) {
        loop {
            if self.inner.is_suspended.load(Ordering::SeqCst) {
                return;
            }

            let operation = {
                let mut state = self.inner.state.lock();
                if state.running >= self.inner.max_concurrent {
                    return;
                }
                let Some(index) = next_index(&state.pending) else {
                    return;
                };
                let operation = state.pending.swap_remove(index).operation;
                if !operation.is_cancelled() {
                    state.running += 1;
                }
                operation
            };

            if operation.is_cancelled() {
                trace!(queue = %self.inner.name, "Skipping cancelled operation");
                operation.finish();
                continue;
            }

            let queue = self.clone();
            operation.start(Box::new(move || queue.operation_did_finish()));
        }
    }

    fn operation_did_finish(&self) {
        {
            let mut state = self.inner.state.lock();
            state.running = state.running.saturating_sub(1);
        }
        self.pump();
    }
}

fn next_index(pending: &[Pending]) -> Option<usize> {
    pending
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| {
            a.operation
                .queue_priority()
                .cmp(&b.operation.queue_priority())
                .then_with(|| b.seq.cmp(&a.seq))
        })
        .map(|(index, _)| index)
}

impl fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkQueue")
            .field("name", &self.inner.name)
            .field("max_concurrent", &self.inner.max_concurrent)
            .finish()
    }
}
