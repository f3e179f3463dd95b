//! Retry backoff for failed step invocations.

use rand::Rng;
use std::time::Duration;

/// Capped exponential backoff with full jitter.
///
/// Delays start at 100 ms, double per attempt, and cap at 10 s. Control
/// signals are never retried; the limit counts retries after the first
/// failure.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum retry attempts.
    pub limit: u32,
    base: Duration,
    cap: Duration,
}

impl RetryPolicy {
    /// Creates a policy with the step's retry limit.
    #[must_use]
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            base: Duration::from_millis(100),
            cap: Duration::from_secs(10),
        }
    }

    /// The backoff before retry `attempt` (1-based), before jitter.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// The jittered delay to sleep before retry `attempt`.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let millis = u64::try_from(self.backoff(attempt).as_millis()).unwrap_or(u64::MAX);
        let mut rng = rand::thread_rng();
        Duration::from_millis(rng.gen_range(0..=millis))
    }
}
