//! A lock-guarded value cell.
//!
//! Used for flags and counters that are read and written from several threads
//! without belonging to any larger piece of locked state.

use parking_lot::Mutex;

/// Mutex-guarded single value with compare-and-swap and functional update.
#[derive(Debug, Default)]
pub struct Atomic<T> {
    value: Mutex<T>,
}

impl<T> Atomic<T> {
    pub fn new(value: T) -> Self {
        Self {
            value: Mutex::new(value),
        }
    }

    /// Replace the stored value.
    pub fn set(&self, value: T) {
        *self.value.lock() = value;
    }

    /// Apply `transform` under the lock and return a copy of the new value.
    pub fn map(&self, transform: impl FnOnce(&T) -> T) -> T
    where
        T: Clone,
    {
        let mut guard = self.value.lock();
        *guard = transform(&guard);
        guard.clone()
    }
}

impl<T: Clone> Atomic<T> {
    pub fn get(&self) -> T {
        self.value.lock().clone()
    }
}

impl<T: PartialEq> Atomic<T> {
    /// Store `new_value` only if the current value equals `expected`.
    ///
    /// Returns `true` when the swap happened.
    pub fn swap(&self, new_value: T, expected: &T) -> bool {
        let mut guard = self.value.lock();
        if *guard != *expected {
            return false;
        }
        *guard = new_value;
        true
    }
}

impl Atomic<u64> {
    pub fn increment(&self) -> u64 {
        self.map(|value| value + 1)
    }

    pub fn decrement(&self) -> u64 {
        self.map(|value| value.saturating_sub(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn swap_only_when_expected_matches() {
        let flag = Atomic::new(false);
        assert!(flag.swap(true, &false));
        assert!(!flag.swap(true, &false));
        assert!(flag.get());
    }

    #[test]
    fn increment_from_many_threads() {
        let counter = Arc::new(Atomic::new(0u64));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counter = counter.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        counter.increment();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.get(), 8000);
        assert_eq!(counter.decrement(), 7999);
    }
}
