//! Typed error handling for resilience operations.
//!
//! The taxonomy distinguishes outcomes that callers must treat differently:
//! - exhausted retries still carry the dependency's last error
//! - a rejected call from an open circuit never reached the dependency and
//!   must not be counted as a dependency failure
//! - cancellation is a cooperative outcome, not a failure
//! - a failed template tier is fatal, since no further degradation exists

use std::time::Duration;

use thiserror::Error;

/// Error returned by the [`retry`](crate::retry::retry) executor.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Every attempt failed; carries the error from the final attempt.
    #[error("retries exhausted after {attempts} attempts: {source}")]
    Exhausted {
        /// Total number of invocations made (retries + the initial attempt).
        attempts: u32,
        /// The error from the last attempt, unchanged.
        source: E,
    },

    /// Cancellation fired before an attempt started or during a backoff wait.
    #[error("operation cancelled")]
    Cancelled,
}

impl<E> RetryError<E> {
    /// Returns `true` if the operation was cancelled rather than exhausted.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// The dependency error from the final attempt, if retries were exhausted.
    #[must_use]
    pub const fn last_error(&self) -> Option<&E> {
        match self {
            Self::Exhausted { source, .. } => Some(source),
            Self::Cancelled => None,
        }
    }
}

/// Error returned by [`CircuitBreaker::execute`](crate::breaker::CircuitBreaker::execute).
#[derive(Debug, Error)]
pub enum CircuitError<E> {
    /// The circuit is open; the wrapped operation was never invoked.
    #[error("circuit open, retry in {retry_after:?}")]
    Open {
        /// Time remaining until the breaker becomes eligible for a trial call.
        retry_after: Duration,
    },

    /// The operation was attempted and failed; propagated unchanged after
    /// the breaker recorded the failure.
    #[error("{0}")]
    Inner(E),
}

impl<E> CircuitError<E> {
    /// Returns `true` if the call was rejected without reaching the dependency.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    /// The underlying dependency error, if the call was attempted.
    #[must_use]
    pub const fn inner(&self) -> Option<&E> {
        match self {
            Self::Inner(error) => Some(error),
            Self::Open { .. } => None,
        }
    }
}

/// The deterministic template tier itself failed.
///
/// The template tier performs no external call and is expected to never
/// fail; when it does, no further degradation is possible and the condition
/// is surfaced to operators instead of retried.
#[derive(Debug, Clone, Error)]
#[error("template tier failed ({template_error}); last upstream error: {last_upstream_error}")]
pub struct FatalFallbackError {
    /// Message from the template tier's failure.
    pub template_error: String,
    /// Message from the last external tier that failed before the template
    /// was attempted, or a placeholder if every external tier was skipped.
    pub last_upstream_error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_error_exposes_last_error() {
        let error: RetryError<&str> = RetryError::Exhausted {
            attempts: 4,
            source: "connection refused",
        };
        assert!(!error.is_cancelled());
        assert_eq!(error.last_error(), Some(&"connection refused"));
        assert_eq!(
            error.to_string(),
            "retries exhausted after 4 attempts: connection refused"
        );
    }

    #[test]
    fn cancelled_has_no_last_error() {
        let error: RetryError<&str> = RetryError::Cancelled;
        assert!(error.is_cancelled());
        assert!(error.last_error().is_none());
    }

    #[test]
    fn circuit_error_open_is_not_inner() {
        let error: CircuitError<&str> = CircuitError::Open {
            retry_after: Duration::from_secs(30),
        };
        assert!(error.is_open());
        assert!(error.inner().is_none());

        let error: CircuitError<&str> = CircuitError::Inner("upstream 503");
        assert!(!error.is_open());
        assert_eq!(error.inner(), Some(&"upstream 503"));
        assert_eq!(error.to_string(), "upstream 503");
    }

    #[test]
    fn fatal_fallback_display_references_both_errors() {
        let error = FatalFallbackError {
            template_error: "template panicked".to_string(),
            last_upstream_error: "basic tier timed out".to_string(),
        };
        let rendered = error.to_string();
        assert!(rendered.contains("template panicked"));
        assert!(rendered.contains("basic tier timed out"));
    }
}
