//! Deduplication of identical in-flight tasks.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;

use super::Task;

/// Maps a key to the task currently serving it.
pub struct TaskPool<K, V, E> {
    is_coalescing_enabled: bool,
    tasks: Arc<Mutex<HashMap<K, Task<V, E>>>>,
}

impl<K, V, E> TaskPool<K, V, E>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    pub fn new(is_coalescing_enabled: bool) -> Self {
        Self {
            is_coalescing_enabled,
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Return the live task for `key`, or build and register one with `make`.
    ///
    /// The registration is dropped when that task disposes. A newer task
    /// registered under the same key is left alone.
    pub fn publisher_for_key(&self, key: K, make: impl FnOnce() -> Task<V, E>) -> Task<V, E> {
        if !self.is_coalescing_enabled {
            return make();
        }

        let mut tasks = self.tasks.lock();
        if let Some(task) = tasks.get(&key)
            && !task.is_disposed()
        {
            return task.clone();
        }

        let task = make();
        tasks.insert(key.clone(), task.clone());
        drop(tasks);

        let registry = Arc::downgrade(&self.tasks);
        let registered = task.clone();
        task.set_on_disposed(move || {
            let Some(registry) = registry.upgrade() else {
                return;
            };
            let mut tasks = registry.lock();
            if tasks.get(&key).is_some_and(|task| task.ptr_eq(&registered)) {
                tasks.remove(&key);
            }
        });
        task
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }
}

impl<K, V, E> std::fmt::Debug for TaskPool<K, V, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskPool")
            .field("is_coalescing_enabled", &self.is_coalescing_enabled)
            .field("in_flight", &self.tasks.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskPriority;

    type Pool = TaskPool<&'static str, u32, String>;

    #[test]
    fn identical_keys_share_a_task() {
        let pool = Pool::new(true);
        let a = pool.publisher_for_key("a", || Task::new(|_| {}));
        let b = pool.publisher_for_key("a", || Task::new(|_| {}));
        let c = pool.publisher_for_key("c", || Task::new(|_| {}));

        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&c));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn disabled_pool_always_builds() {
        let pool = Pool::new(false);
        let a = pool.publisher_for_key("a", || Task::new(|_| {}));
        let b = pool.publisher_for_key("a", || Task::new(|_| {}));
        assert!(!a.ptr_eq(&b));
        assert!(pool.is_empty());
    }

    #[test]
    fn registration_removed_on_dispose() {
        let pool = Pool::new(true);
        let task = pool.publisher_for_key("a", || Task::new(|_| {}));
        task.subscribe(TaskPriority::Normal, |_| {}).unwrap();
        task.send_value(1, true);

        assert!(pool.is_empty());
        let next = pool.publisher_for_key("a", || Task::new(|_| {}));
        assert!(!next.ptr_eq(&task));
    }

    #[test]
    fn stale_disposal_keeps_newer_registration() {
        let pool = Pool::new(true);
        let stale = pool.publisher_for_key("a", || Task::new(|_| {}));

        // Replace the registration directly, as if a lookup raced the disposal.
        let newer: Task<u32, String> = Task::new(|_| {});
        pool.tasks.lock().insert("a", newer.clone());

        let subscription = stale.subscribe(TaskPriority::Normal, |_| {}).unwrap();
        subscription.unsubscribe();

        let found = pool.publisher_for_key("a", || Task::new(|_| {}));
        assert!(found.ptr_eq(&newer));
    }
}
