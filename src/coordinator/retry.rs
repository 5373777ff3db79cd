// Backoff policy for lock-contention retries

use rand::Rng;
use std::time::Duration;

/// Linear backoff between lock acquisition attempts: `base_delay × attempt`,
/// capped at `max_delay`, optionally with up to 50% random jitter added.
///
/// Only lock acquisition is ever retried; domain and storage errors are
/// surfaced immediately.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, jitter: bool) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter,
        }
    }

    /// Delay to sleep after failed attempt number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let delay = self
            .base_delay
            .saturating_mul(attempt.max(1))
            .min(self.max_delay);

        if self.jitter && !delay.is_zero() {
            let spread = delay.as_millis() as u64 / 2;
            let extra = rand::rng().random_range(0..=spread);
            delay + Duration::from_millis(extra)
        } else {
            delay
        }
    }
}
