//! Retry backoff.

use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::config::RetryPolicy;

/// Shortest delay jitter may produce.
const MIN_DELAY: Duration = Duration::from_millis(10);

/// Exponential backoff with symmetric random jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    factor: f64,
    jitter: f64,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, factor: f64, jitter: f64) -> Self {
        Self {
            initial,
            max: max.max(initial),
            factor: factor.max(1.0),
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// Delay before retry number `attempt` (1-based).
    ///
    /// Doubles (by `factor`) from the initial delay up to the cap, then
    /// randomises by `±jitter` of the capped value.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial.as_secs_f64() * self.factor.powi(exp);
        let capped = secs.min(self.max.as_secs_f64());
        if self.jitter == 0.0 || capped == 0.0 {
            return Duration::from_secs_f64(capped);
        }
        let spread = capped * self.jitter;
        let offset: f64 = rand::thread_rng().gen_range(-1.0..=1.0);
        let with_jitter = (capped + spread * offset).max(MIN_DELAY.as_secs_f64());
        Duration::from_secs_f64(with_jitter)
    }
}

impl From<&RetryPolicy> for Backoff {
    fn from(policy: &RetryPolicy) -> Self {
        Self::new(
            policy.initial_delay(),
            policy.max_delay(),
            policy.backoff_factor,
            policy.jitter,
        )
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from(&RetryPolicy::default())
    }
}

/// Sleeps for `delay` unless `cancel` fires first.
///
/// Returns `false` if the sleep was cut short.
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => !cancel.is_cancelled(),
    }
}
