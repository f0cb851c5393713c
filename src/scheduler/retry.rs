//! Retry backoff policy.
//!
//! A failed attempt that still has retries left is put back into the ready
//! set, but only becomes eligible for dequeue once the backoff delay computed
//! here has elapsed.

use std::time::Duration;

/// Default delay before the first retry.
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default upper bound for any single backoff delay.
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Default growth factor between consecutive retries.
const DEFAULT_MULTIPLIER: f64 = 2.0;

/// Capped exponential backoff.
///
/// The delay for the `n`-th retry (`n >= 1`) is
/// `min(base_delay * multiplier^(n - 1), max_delay)`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
    /// Growth factor applied per additional retry.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            multiplier: DEFAULT_MULTIPLIER,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with the given base and cap and the default multiplier.
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            multiplier: DEFAULT_MULTIPLIER,
        }
    }

    /// A policy that makes retried jobs eligible again immediately.
    pub fn immediate() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    /// Sets the growth factor.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Returns the backoff for a job whose `retry_count` has just become `retry_count`.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        if retry_count == 0 || self.base_delay.is_zero() {
            return Duration::ZERO;
        }

        let exponent = (retry_count - 1).min(63) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let millis = self.base_delay.as_millis() as f64 * factor;
        let cap = self.max_delay.as_millis() as f64;

        Duration::from_millis(millis.min(cap) as u64)
    }
}
