//! Token bucket rate limiting for outgoing data loads.
//!
//! Work that cannot run right away is queued in FIFO order and drained from
//! the pipeline's serial queue once tokens become available again.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::queue::SerialQueue;

/// Configuration for a rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// Tokens added per second.
    pub rate: f64,
    /// Maximum tokens (burst capacity).
    pub burst: f64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            rate: 80.0,
            burst: 25.0,
        }
    }
}

impl RateLimiterConfig {
    /// Replace a rate that is not positive with the default one and raise the
    /// burst to at least one token.
    pub fn normalized(self) -> Self {
        let rate = if self.rate.is_finite() && self.rate > 0.0 {
            self.rate
        } else {
            Self::default().rate
        };
        let burst = if self.burst.is_finite() {
            self.burst.max(1.0)
        } else {
            Self::default().burst
        };
        if rate != self.rate || burst != self.burst {
            warn!(
                rate = self.rate,
                burst = self.burst,
                "Invalid rate limiter settings, using rate {rate} and burst {burst}"
            );
        }
        Self { rate, burst }
    }

    /// Delay between attempts to drain the backlog.
    pub fn drain_delay(&self) -> Duration {
        let millis = (2.1 * (1000.0 / self.rate.max(f64::EPSILON))) as u64;
        Duration::from_millis(millis.clamp(15, 100))
    }
}

/// Lazily refilled token bucket.
#[derive(Debug)]
pub struct TokenBucket {
    /// Tokens added per second.
    rate: f64,
    /// Maximum tokens (burst capacity).
    burst: f64,
    /// Current number of tokens.
    level: f64,
    /// Last refill time.
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(rate: f64, burst: f64) -> Self {
        Self {
            rate,
            burst,
            level: burst,
            last_refill: Instant::now(),
        }
    }

    /// Run `work` if a token is available.
    ///
    /// The token is only spent when `work` returns `true`. Returns whether
    /// `work` was run at all.
    pub fn execute(&mut self, work: &mut dyn FnMut() -> bool) -> bool {
        self.refill();
        if self.level < 1.0 {
            return false;
        }
        if work() {
            self.level -= 1.0;
        }
        true
    }

    /// Get the current number of available tokens.
    pub fn available_tokens(&mut self) -> f64 {
        self.refill();
        self.level
    }

    /// Refill tokens based on elapsed time.
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        self.level = (self.level + elapsed.as_secs_f64() * self.rate).min(self.burst);
        self.last_refill = now;
    }
}

type PendingWork = Box<dyn FnMut() -> bool + Send>;

struct LimiterState {
    bucket: TokenBucket,
    pending: VecDeque<PendingWork>,
    is_drain_scheduled: bool,
}

/// Token bucket limiter with a FIFO backlog drained on a serial queue.
///
/// Work closures run with the limiter locked and must not call back into it.
#[derive(Clone)]
pub struct RateLimiter {
    queue: SerialQueue,
    drain_delay: Duration,
    state: Arc<Mutex<LimiterState>>,
}

impl RateLimiter {
    pub fn new(queue: SerialQueue, config: RateLimiterConfig) -> Self {
        let config = config.normalized();
        Self {
            queue,
            drain_delay: config.drain_delay(),
            state: Arc::new(Mutex::new(LimiterState {
                bucket: TokenBucket::new(config.rate, config.burst),
                pending: VecDeque::new(),
                is_drain_scheduled: false,
            })),
        }
    }

    /// Run `work` now if nothing is queued and a token is available,
    /// otherwise queue it behind the existing backlog.
    ///
    /// `work` returns `false` when it turned out to have nothing to do (for
    /// example, its task was cancelled meanwhile), in which case no token is
    /// spent.
    pub fn execute(&self, work: impl FnMut() -> bool + Send + 'static) {
        let mut work: PendingWork = Box::new(work);
        let mut state = self.state.lock();
        if state.pending.is_empty() && state.bucket.execute(&mut *work) {
            return;
        }
        state.pending.push_back(work);
        trace!(backlog = state.pending.len(), "Rate limited, queued work");
        self.schedule_drain(&mut state);
    }

    pub fn backlog(&self) -> usize {
        self.state.lock().pending.len()
    }

    fn schedule_drain(&self, state: &mut LimiterState) {
        if state.is_drain_scheduled {
            return;
        }
        state.is_drain_scheduled = true;
        let limiter = self.clone();
        self.queue
            .dispatch_after(self.drain_delay, move || limiter.drain());
    }

    fn drain(&self) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut executed = 0usize;
        while let Some(work) = state.pending.front_mut() {
            if !state.bucket.execute(&mut **work) {
                break;
            }
            state.pending.pop_front();
            executed += 1;
        }
        state.is_drain_scheduled = false;
        if executed > 0 {
            debug!(
                executed,
                remaining = state.pending.len(),
                "Drained rate limiter backlog"
            );
        }
        if !state.pending.is_empty() {
            self.schedule_drain(state);
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("drain_delay", &self.drain_delay)
            .field("backlog", &self.backlog())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_delay_is_clamped() {
        let delay = |rate| RateLimiterConfig { rate, burst: 1.0 }.drain_delay();
        assert_eq!(delay(80.0), Duration::from_millis(26));
        assert_eq!(delay(1000.0), Duration::from_millis(15));
        assert_eq!(delay(1.0), Duration::from_millis(100));
    }

    #[test]
    fn invalid_settings_are_normalized() {
        let config = RateLimiterConfig {
            rate: 0.0,
            burst: 0.25,
        }
        .normalized();
        assert_eq!(config.rate, 80.0);
        assert_eq!(config.burst, 1.0);

        let config = RateLimiterConfig {
            rate: -3.0,
            burst: f64::NAN,
        }
        .normalized();
        assert_eq!(config, RateLimiterConfig::default());

        let valid = RateLimiterConfig {
            rate: 0.5,
            burst: 2.0,
        };
        assert_eq!(valid.normalized(), valid);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_rate_backlog_still_drains() {
        let limiter = RateLimiter::new(
            SerialQueue::new("limiter"),
            RateLimiterConfig {
                rate: 0.0,
                burst: 0.0,
            },
        );
        let executed = Arc::new(Mutex::new(0usize));
        for _ in 0..3 {
            let executed = executed.clone();
            limiter.execute(move || {
                *executed.lock() += 1;
                true
            });
        }
        assert_eq!(*executed.lock(), 1);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(*executed.lock(), 3);
        assert_eq!(limiter.backlog(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn token_is_spent_only_on_success() {
        let mut bucket = TokenBucket::new(1.0, 1.0);
        assert!(bucket.execute(&mut || false));
        assert_eq!(bucket.available_tokens(), 1.0);

        assert!(bucket.execute(&mut || true));
        assert!(!bucket.execute(&mut || true));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(bucket.execute(&mut || true));
    }

    #[tokio::test(start_paused = true)]
    async fn level_never_exceeds_burst() {
        let mut bucket = TokenBucket::new(80.0, 25.0);
        for _ in 0..25 {
            assert!(bucket.execute(&mut || true));
        }
        assert!(bucket.available_tokens() < 1.0);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(bucket.available_tokens(), 25.0);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_runs_immediately_and_backlog_drains_in_order() {
        let limiter = RateLimiter::new(SerialQueue::new("limiter"), RateLimiterConfig::default());
        let executed = Arc::new(Mutex::new(Vec::new()));

        for index in 0..100 {
            let executed = executed.clone();
            limiter.execute(move || {
                executed.lock().push(index);
                true
            });
        }
        assert_eq!(executed.lock().len(), 25);
        assert_eq!(limiter.backlog(), 75);

        tokio::time::sleep(Duration::from_millis(500)).await;
        let midway = executed.lock().len();
        assert!(midway > 25 && midway < 100, "executed {midway} after 500ms");

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(*executed.lock(), (0..100).collect::<Vec<_>>());
        assert_eq!(limiter.backlog(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_work_does_not_consume_tokens() {
        let limiter = RateLimiter::new(
            SerialQueue::new("limiter"),
            RateLimiterConfig {
                rate: 1.0,
                burst: 1.0,
            },
        );
        let runs = Arc::new(Mutex::new(0));

        limiter.execute(|| false);
        let counter = runs.clone();
        limiter.execute(move || {
            *counter.lock() += 1;
            true
        });

        assert_eq!(*runs.lock(), 1);
        assert_eq!(limiter.backlog(), 0);
    }
}
