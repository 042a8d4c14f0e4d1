//! Observable, cancellable units of asynchronous work.
//!
//! A [`Task`] starts lazily on its first subscription and fans its events out
//! to every subscriber. It terminates exactly once: either *finished*, when it
//! sends a completed value or an error, or *cancelled*, when its last
//! subscriber goes away. Termination releases the hooks, the dependency and
//! the subscriber closures, so tasks wired to each other do not leak.
//!
//! The effective priority of a task is the highest priority among its
//! subscribers. Priority changes are forwarded to the controlled
//! [`Operation`] and to the upstream dependency.

pub mod pool;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::operation::Operation;

pub use pool::TaskPool;

/// Scheduling priority, ordered from least to most urgent.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    VeryLow,
    Low,
    #[default]
    Normal,
    High,
    VeryHigh,
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::VeryLow => "very_low",
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::VeryHigh => "very_high",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskProgress {
    pub completed: u64,
    pub total: u64,
}

impl TaskProgress {
    pub fn new(completed: u64, total: u64) -> Self {
        Self { completed, total }
    }

    /// Completed fraction in `0.0..=1.0`, zero while the total is unknown.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.completed as f64 / self.total as f64).min(1.0)
    }
}

#[derive(Debug, Clone)]
pub enum Event<V, E> {
    Progress(TaskProgress),
    Value { value: V, is_completed: bool },
    Error(E),
}

impl<V, E> Event<V, E> {
    pub fn is_completed(&self) -> bool {
        match self {
            Self::Progress(_) => false,
            Self::Value { is_completed, .. } => *is_completed,
            Self::Error(_) => true,
        }
    }
}

pub type Observer<V, E> = Arc<dyn Fn(Event<V, E>) + Send + Sync>;

type Starter<V, E> = Box<dyn FnOnce(Task<V, E>) + Send>;
type Hook = Box<dyn FnOnce() + Send>;

struct Subscriber<V, E> {
    observer: Observer<V, E>,
    priority: TaskPriority,
}

struct TaskState<V, E> {
    starter: Option<Starter<V, E>>,
    // Key 0 lives inline; most tasks never have a second subscriber.
    inline: Option<Subscriber<V, E>>,
    subscribers: BTreeMap<u64, Subscriber<V, E>>,
    next_key: u64,
    priority: TaskPriority,
    dependency: Option<Subscription>,
    operation: Option<Weak<Operation>>,
    is_disposed: bool,
    is_started: bool,
    on_disposed: Option<Hook>,
    on_cancelled: Option<Hook>,
}

impl<V, E> TaskState<V, E> {
    fn is_empty(&self) -> bool {
        self.inline.is_none() && self.subscribers.is_empty()
    }

    fn effective_priority(&self) -> TaskPriority {
        self.inline
            .iter()
            .chain(self.subscribers.values())
            .map(|subscriber| subscriber.priority)
            .max()
            .unwrap_or_default()
    }

    fn subscriber_mut(&mut self, key: u64) -> Option<&mut Subscriber<V, E>> {
        if key == 0 {
            self.inline.as_mut()
        } else {
            self.subscribers.get_mut(&key)
        }
    }

    fn live_operation(&self) -> Option<Arc<Operation>> {
        self.operation
            .as_ref()
            .and_then(Weak::upgrade)
            .filter(|operation| !operation.is_finished())
    }
}

/// Everything released when a task terminates.
struct Teardown {
    operation: Option<Arc<Operation>>,
    dependency: Option<Subscription>,
    on_cancelled: Option<Hook>,
    on_disposed: Option<Hook>,
}

struct TaskInner<V, E> {
    state: Mutex<TaskState<V, E>>,
}

impl<V, E> TaskInner<V, E> {
    fn take_teardown(state: &mut TaskState<V, E>) -> Teardown {
        state.is_disposed = true;
        state.starter = None;
        Teardown {
            operation: state.operation.take().and_then(|weak| weak.upgrade()),
            dependency: state.dependency.take(),
            on_cancelled: state.on_cancelled.take(),
            on_disposed: state.on_disposed.take(),
        }
    }

    /// Apply the recomputed priority to the operation and the dependency.
    fn refresh_priority(&self) {
        let (priority, operation, dependency) = {
            let mut state = self.state.lock();
            if state.is_disposed {
                return;
            }
            let priority = state.effective_priority();
            if priority == state.priority {
                return;
            }
            state.priority = priority;
            (priority, state.live_operation(), state.dependency.clone())
        };

        if let Some(operation) = operation {
            operation.set_queue_priority(priority);
        }
        if let Some(dependency) = dependency {
            dependency.set_priority(priority);
        }
    }
}

trait SubscriptionTarget: Send + Sync {
    fn unsubscribe(&self, key: u64);
    fn set_priority(&self, key: u64, priority: TaskPriority);
}

impl<V: Send + 'static, E: Send + 'static> SubscriptionTarget for TaskInner<V, E> {
    fn unsubscribe(&self, key: u64) {
        let teardown = {
            let mut state = self.state.lock();
            if state.is_disposed {
                return;
            }
            let removed = if key == 0 {
                state.inline.take().is_some()
            } else {
                state.subscribers.remove(&key).is_some()
            };
            if !removed {
                return;
            }
            if state.is_empty() {
                Some(Self::take_teardown(&mut state))
            } else {
                None
            }
        };

        match teardown {
            Some(teardown) => {
                if let Some(operation) = teardown.operation {
                    operation.cancel();
                }
                if let Some(dependency) = teardown.dependency {
                    dependency.unsubscribe();
                }
                if let Some(on_cancelled) = teardown.on_cancelled {
                    on_cancelled();
                }
                if let Some(on_disposed) = teardown.on_disposed {
                    on_disposed();
                }
            }
            None => self.refresh_priority(),
        }
    }

    fn set_priority(&self, key: u64, priority: TaskPriority) {
        {
            let mut state = self.state.lock();
            if state.is_disposed {
                return;
            }
            match state.subscriber_mut(key) {
                Some(subscriber) => subscriber.priority = priority,
                None => return,
            }
        }
        self.refresh_priority();
    }
}

/// Handle to one subscriber of a task.
///
/// Dropping the handle does not unsubscribe.
#[derive(Clone)]
pub struct Subscription {
    task: Arc<dyn SubscriptionTarget>,
    key: u64,
}

impl Subscription {
    /// Remove the subscriber; cancels the task when it was the last one.
    pub fn unsubscribe(&self) {
        self.task.unsubscribe(self.key);
    }

    pub fn set_priority(&self, priority: TaskPriority) {
        self.task.set_priority(self.key, priority);
    }

    pub fn key(&self) -> u64 {
        self.key
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("key", &self.key).finish()
    }
}

pub struct Task<V, E> {
    inner: Arc<TaskInner<V, E>>,
}

impl<V, E> Clone for Task<V, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V, E> Task<V, E>
where
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Create a task whose `starter` runs on the first subscription.
    pub fn new(starter: impl FnOnce(Task<V, E>) + Send + 'static) -> Self {
        Self {
            inner: Arc::new(TaskInner {
                state: Mutex::new(TaskState {
                    starter: Some(Box::new(starter)),
                    inline: None,
                    subscribers: BTreeMap::new(),
                    next_key: 0,
                    priority: TaskPriority::Normal,
                    dependency: None,
                    operation: None,
                    is_disposed: false,
                    is_started: false,
                    on_disposed: None,
                    on_cancelled: None,
                }),
            }),
        }
    }

    pub fn publisher(&self) -> Publisher<V, E> {
        Publisher { task: self.clone() }
    }

    /// Returns `None` when the task is already disposed, including when it
    /// completed synchronously while starting. The observer still receives
    /// the terminal event in that case.
    pub fn subscribe(
        &self,
        priority: TaskPriority,
        observer: impl Fn(Event<V, E>) + Send + Sync + 'static,
    ) -> Option<Subscription> {
        let observer: Observer<V, E> = Arc::new(observer);
        let (key, starter) = {
            let mut state = self.inner.state.lock();
            if state.is_disposed {
                return None;
            }
            let key = state.next_key;
            state.next_key += 1;
            let subscriber = Subscriber { observer, priority };
            if key == 0 {
                state.inline = Some(subscriber);
            } else {
                state.subscribers.insert(key, subscriber);
            }
            let starter = if state.is_started {
                None
            } else {
                state.is_started = true;
                state.starter.take()
            };
            (key, starter)
        };

        self.inner.refresh_priority();

        if let Some(starter) = starter {
            starter(self.clone());
        }

        if self.is_disposed() {
            return None;
        }
        Some(Subscription {
            task: self.inner.clone(),
            key,
        })
    }

    pub fn send_value(&self, value: V, is_completed: bool) {
        self.send(Event::Value {
            value,
            is_completed,
        });
    }

    pub fn send_error(&self, error: E) {
        self.send(Event::Error(error));
    }

    pub fn send_progress(&self, progress: TaskProgress) {
        self.send(Event::Progress(progress));
    }

    fn send(&self, event: Event<V, E>) {
        let is_terminal = event.is_completed();
        let (observers, teardown) = {
            let mut state = self.inner.state.lock();
            if state.is_disposed {
                return;
            }
            let observers: Vec<Observer<V, E>> = state
                .inline
                .iter()
                .chain(state.subscribers.values())
                .map(|subscriber| subscriber.observer.clone())
                .collect();
            let teardown = if is_terminal {
                let teardown = TaskInner::take_teardown(&mut state);
                state.inline = None;
                state.subscribers.clear();
                Some(teardown)
            } else {
                None
            };
            (observers, teardown)
        };

        if let Some(teardown) = teardown {
            if let Some(dependency) = teardown.dependency {
                dependency.unsubscribe();
            }
            if let Some(on_disposed) = teardown.on_disposed {
                on_disposed();
            }
        }

        for observer in observers {
            observer(event.clone());
        }
    }
}

impl<V, E> Task<V, E> {
    pub fn is_disposed(&self) -> bool {
        self.inner.state.lock().is_disposed
    }

    pub fn priority(&self) -> TaskPriority {
        self.inner.state.lock().priority
    }

    pub fn subscriber_count(&self) -> usize {
        let state = self.inner.state.lock();
        usize::from(state.inline.is_some()) + state.subscribers.len()
    }

    /// Upstream subscription carrying this task's priority and cancellation.
    ///
    /// Replacing the dependency does not unsubscribe the previous one.
    pub fn set_dependency(&self, dependency: Option<Subscription>) {
        let (dependency, priority, is_disposed) = {
            let mut state = self.inner.state.lock();
            if state.is_disposed {
                (dependency, state.priority, true)
            } else {
                state.dependency = dependency.clone();
                (dependency, state.priority, false)
            }
        };
        let Some(dependency) = dependency else {
            return;
        };
        if is_disposed {
            dependency.unsubscribe();
        } else {
            dependency.set_priority(priority);
        }
    }

    /// The controlled operation, while it is alive and not finished.
    pub fn operation(&self) -> Option<Arc<Operation>> {
        self.inner.state.lock().live_operation()
    }

    pub fn set_operation(&self, operation: &Arc<Operation>) {
        let priority = {
            let mut state = self.inner.state.lock();
            state.operation = Some(Arc::downgrade(operation));
            state.priority
        };
        operation.set_queue_priority(priority);
    }

    pub fn set_on_disposed(&self, hook: impl FnOnce() + Send + 'static) {
        let mut state = self.inner.state.lock();
        if !state.is_disposed {
            state.on_disposed = Some(Box::new(hook));
        }
    }

    pub fn set_on_cancelled(&self, hook: impl FnOnce() + Send + 'static) {
        let mut state = self.inner.state.lock();
        if !state.is_disposed {
            state.on_cancelled = Some(Box::new(hook));
        }
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<V, E> fmt::Debug for Task<V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Task")
            .field("priority", &state.priority)
            .field("is_started", &state.is_started)
            .field("is_disposed", &state.is_disposed)
            .finish()
    }
}

/// Read side of a task: what downstream stages subscribe to.
pub struct Publisher<V, E> {
    task: Task<V, E>,
}

impl<V, E> Clone for Publisher<V, E> {
    fn clone(&self) -> Self {
        Self {
            task: self.task.clone(),
        }
    }
}

impl<V, E> Publisher<V, E>
where
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    pub fn subscribe(
        &self,
        priority: TaskPriority,
        observer: impl Fn(Event<V, E>) + Send + Sync + 'static,
    ) -> Option<Subscription> {
        self.task.subscribe(priority, observer)
    }

    /// Subscribe on behalf of `downstream`, forwarding progress and errors to
    /// it and handing values to `on_value`.
    pub fn subscribe_task<W>(
        &self,
        downstream: &Task<W, E>,
        on_value: impl Fn(V, bool) + Send + Sync + 'static,
    ) -> Option<Subscription>
    where
        W: Clone + Send + 'static,
    {
        let target = downstream.clone();
        self.task
            .subscribe(downstream.priority(), move |event| match event {
                Event::Value {
                    value,
                    is_completed,
                } => on_value(value, is_completed),
                Event::Progress(progress) => target.send_progress(progress),
                Event::Error(error) => target.send_error(error),
            })
    }

    pub fn task(&self) -> &Task<V, E> {
        &self.task
    }
}
