//! Resilience primitives for calls into flaky upstream dependencies
//!
//! This crate provides three sibling idioms applied at different call sites:
//! - Bounded retry with exponential backoff, jitter, and cooperative
//!   cancellation ([`retry`])
//! - A per-dependency circuit breaker ([`breaker`])
//! - A tiered fallback executor that degrades gracefully across three
//!   quality levels with self-healing health tracking ([`fallback`])
//!
//! None of the three call each other; feature code composes them around its
//! own upstream calls (AI copy generation, tracking ingestion, payments).

pub mod breaker;
pub mod error;
pub mod fallback;
pub mod retry;

pub use breaker::{BreakerConfig, BreakerStats, CircuitBreaker, CircuitBreakerRegistry, CircuitState};
pub use error::{CircuitError, FatalFallbackError, RetryError};
pub use fallback::{
    FallbackConfig, FallbackOutcome, HealthStatus, Tier, TierHealthSnapshot, TieredFallbackExecutor,
};
pub use retry::{RetryPolicy, retry};
// Re-exported so callers don't need a direct tokio-util dependency
pub use tokio_util::sync::CancellationToken;
