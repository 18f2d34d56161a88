//! Retry policy with exponential backoff
//!
//! The chunk worker asks a [`RetryPolicy`] how long to wait before each retry,
//! or whether to give up. The stock policy is [`RetryConfig`]: unbounded and
//! immediate by default, with optional attempt limits, exponential backoff and
//! jitter to prevent thundering herd.
//!
//! # Example
//!
//! ```
//! use depot_sync::config::RetryConfig;
//! use depot_sync::retry::RetryPolicy;
//! use std::time::Duration;
//!
//! let policy = RetryConfig {
//!     max_attempts: Some(2),
//!     initial_delay: Duration::from_millis(100),
//!     jitter: false,
//!     ..RetryConfig::default()
//! };
//!
//! assert_eq!(policy.delay_for(1), Some(Duration::from_millis(100)));
//! assert_eq!(policy.delay_for(2), Some(Duration::from_millis(200)));
//! assert_eq!(policy.delay_for(3), None);
//! ```

use crate::config::RetryConfig;
use rand::Rng;
use std::time::Duration;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (timeouts, resets, missing chunk on one endpoint) should return `true`.
/// Permanent failures (authorization, disk full, cancellation) should return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

/// Injectable strategy deciding whether and when a failed chunk is retried.
pub trait RetryPolicy: Send + Sync {
    /// Delay before retry number `retry` (1-based), or `None` to give up.
    fn delay_for(&self, retry: u32) -> Option<Duration>;
}

impl RetryPolicy for RetryConfig {
    fn delay_for(&self, retry: u32) -> Option<Duration> {
        if let Some(max) = self.max_attempts
            && retry > max
        {
            return None;
        }

        let delay = backoff_delay(
            self.initial_delay,
            self.max_delay,
            self.backoff_multiplier,
            retry,
        );
        Some(if self.jitter { add_jitter(delay) } else { delay })
    }
}

/// `initial * multiplier^(retry-1)`, capped at `max_delay`.
fn backoff_delay(initial: Duration, max_delay: Duration, multiplier: f64, retry: u32) -> Duration {
    if initial.is_zero() {
        return Duration::ZERO;
    }
    let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
    let secs = initial.as_secs_f64() * multiplier.powi(exponent);
    Duration::try_from_secs_f64(secs)
        .unwrap_or(max_delay)
        .min(max_delay)
}

/// Add random jitter to a delay to prevent thundering herd
///
/// Jitter is uniformly distributed between 0% and 100% of the delay, so the
/// actual delay lands between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    if delay.is_zero() {
        return delay;
    }
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    let jittered_secs = delay.as_secs_f64() * (1.0 + jitter_factor);
    Duration::from_secs_f64(jittered_secs)
}
