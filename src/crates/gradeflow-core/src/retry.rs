//! Retry policy with exponential backoff and jitter.
//!
//! Used by the runtime for timed-out nodes and by grading workers for
//! transient LLM failures. Delays grow as `initial * multiplier^attempt`,
//! capped at `max_delay`, with up to 25% random jitter so that a burst of
//! simultaneous failures does not retry in lockstep.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff configuration.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,

    /// Delay before the first retry.
    pub initial_delay_ms: u64,

    /// Upper bound on any single delay.
    pub max_delay_ms: u64,

    /// Growth factor per attempt.
    pub multiplier: f64,

    /// Whether to add random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay_ms: 1_000,
            max_delay_ms: 15_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Policy with a custom retry cap and default timing.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Whether another attempt is allowed after `attempts_so_far` failures.
    pub fn should_retry(&self, attempts_so_far: u32) -> bool {
        attempts_so_far <= self.max_retries
    }

    /// Backoff delay before retry number `attempt` (0-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let raw = self.initial_delay_ms as f64 * self.multiplier.powi(attempt as i32);
        let mut delay_ms = (raw as u64).min(self.max_delay_ms);
        if self.jitter {
            let jitter = (delay_ms as f64 * 0.25 * rand::thread_rng().gen::<f64>()) as u64;
            delay_ms = (delay_ms + jitter).min(self.max_delay_ms + self.max_delay_ms / 4);
        }
        Duration::from_millis(delay_ms)
    }
}
