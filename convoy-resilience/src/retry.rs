//! Bounded retry with exponential backoff and jitter.
//!
//! A pure control-flow wrapper: the only side effect is invoking the
//! operation. Cancellation is checked before each attempt and raced against
//! the backoff sleep, so a cancelled wait resolves immediately and the
//! pending timer is dropped rather than left dangling.

use std::{future::Future, time::Duration};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::RetryError;

/// Retry policy configuration.
///
/// Not persisted; constructed per call site. Attempt 0 always runs
/// immediately, so `max_retries = 3` means up to four invocations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Number of retries beyond the initial attempt.
    ///
    /// Default: 3
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,

    /// Base delay before the first retry (in milliseconds).
    ///
    /// Default: 200
    #[serde(default = "defaults::base_delay_ms")]
    pub base_delay_ms: u64,

    /// Multiplier applied per attempt: `delay = base * factor^attempt`.
    ///
    /// Default: 2.0
    #[serde(default = "defaults::backoff_factor")]
    pub backoff_factor: f64,

    /// Symmetric jitter window (in milliseconds).
    ///
    /// A uniformly-distributed offset in `[-jitter, +jitter]` is added to
    /// each backoff delay to prevent thundering herds; the result is
    /// clamped to zero.
    ///
    /// Default: 50
    #[serde(default = "defaults::jitter_ms")]
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: defaults::max_retries(),
            base_delay_ms: defaults::base_delay_ms(),
            backoff_factor: defaults::backoff_factor(),
            jitter_ms: defaults::jitter_ms(),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether another retry should be attempted after `attempt` failed.
    #[must_use]
    pub const fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// Compute the backoff delay after a failed attempt (0-indexed).
    ///
    /// `base * factor^attempt` plus uniform jitter in `[-jitter, +jitter]`,
    /// clamped to ≥ 0.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_possible_wrap,
        reason = "Intentional precision loss and casting for randomized delays"
    )]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = (self.base_delay_ms as f64) * self.backoff_factor.powi(exponent);

        let jittered = if self.jitter_ms == 0 {
            base
        } else {
            let window = self.jitter_ms as f64;
            let mut rng = rand::rng();
            let jitter: f64 = rng.random_range(-window..=window);
            base + jitter
        };

        Duration::from_millis(jittered.max(0.0).min(u64::MAX as f64) as u64)
    }
}

mod defaults {
    pub const fn max_retries() -> u32 {
        3
    }

    pub const fn base_delay_ms() -> u64 {
        200
    }

    pub const fn backoff_factor() -> f64 {
        2.0
    }

    pub const fn jitter_ms() -> u64 {
        50
    }
}

/// Execute `operation` with bounded retry, backoff, and cancellation.
///
/// Attempt 0 runs immediately. On failure, if the current attempt equals
/// `max_retries` the last error is surfaced as
/// [`RetryError::Exhausted`]; otherwise the executor sleeps for the policy's
/// backoff delay and tries again. Cancellation is checked before each
/// attempt and during the backoff wait, surfacing [`RetryError::Cancelled`].
///
/// # Errors
/// - [`RetryError::Exhausted`] once `max_retries + 1` attempts have failed
/// - [`RetryError::Cancelled`] if the token fires before an attempt starts
///   or during a backoff wait
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(attempt, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) => {
                if !policy.should_retry(attempt) {
                    debug!(
                        attempts = attempt + 1,
                        error = %error,
                        "retries exhausted"
                    );
                    return Err(RetryError::Exhausted {
                        attempts: attempt + 1,
                        source: error,
                    });
                }

                let delay = policy.backoff_delay(attempt);
                trace!(
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %error,
                    "backing off before next attempt"
                );

                // Racing the sleep against the token drops the pending timer
                // on cancellation.
                tokio::select! {
                    () = cancel.cancelled() => return Err(RetryError::Cancelled),
                    () = tokio::time::sleep(delay) => {}
                }

                attempt += 1;
            }
        }
    }
}
