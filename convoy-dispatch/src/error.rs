//! Typed error handling for dispatch operations.
//!
//! Two categories cross the ports:
//! - repository errors are system-level and abort a run's triage phase
//! - ingestion errors are transient dependency failures; they are accounted
//!   per partition in the run summary and never raised from `run()`
//!
//! Permanent rejection (a stale event, a retry ceiling exceeded) is not an
//! error type at all: it is a terminal state assigned in bulk.

use thiserror::Error;

/// Failure from the event repository port.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Underlying storage failed (connection, constraint, serialization).
    #[error("storage error: {0}")]
    Storage(String),
}

/// Failure from the external ingestion client.
///
/// Every variant is treated as transient by the dispatcher: the affected
/// partition's events have their retry counts incremented and are picked up
/// again on a later run.
#[derive(Debug, Error)]
pub enum IngestionError {
    /// Transport-level failure (connect, TLS, timeout).
    #[error("transport error: {0}")]
    Transport(String),

    /// The destination rejected the batch.
    #[error("destination rejected batch: {0}")]
    Rejected(String),

    /// The destination rate-limited the call.
    #[error("rate limited: {0}")]
    RateLimited(String),
}

/// Top-level dispatcher error.
///
/// `run()` only surfaces repository failures from its fetch/triage phase;
/// per-partition send failures are reported through the run summary
/// instead, since a batch job's contract is best effort across partitions.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// A repository operation failed.
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repository_error_wraps_into_dispatch_error() {
        let error: DispatchError = RepositoryError::Storage("connection reset".to_string()).into();
        assert_eq!(
            error.to_string(),
            "repository error: storage error: connection reset"
        );
    }

    #[test]
    fn ingestion_error_display() {
        let error = IngestionError::RateLimited("429 too many requests".to_string());
        assert_eq!(error.to_string(), "rate limited: 429 too many requests");
    }
}
