//! Per-dependency circuit breaker to prevent retry storms
//!
//! The circuit breaker has three states:
//! - **Closed**: normal operation, calls pass through and failures accumulate
//! - **Open**: circuit tripped, calls rejected immediately without reaching
//!   the dependency
//! - **Half-Open**: recovery probe, exactly one trial call admitted
//!
//! The OPEN → HALF_OPEN transition is evaluated lazily at call time once the
//! recovery timeout has elapsed; there is no background timer. Admission
//! into HALF_OPEN is single-entry: while a trial call is in flight, every
//! other caller fails fast as if the circuit were still open.

use std::{
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::CircuitError;

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Number of consecutive failures required to open the circuit
    ///
    /// Default: 5
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long the circuit stays open before admitting a trial call (seconds)
    ///
    /// Default: 30
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
        }
    }
}

const fn default_failure_threshold() -> u32 {
    5
}

const fn default_recovery_timeout_secs() -> u64 {
    30
}

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation; the only state that accumulates failures
    Closed,
    /// Circuit tripped; reject without invoking the wrapped operation
    Open,
    /// Recovery probe; a single trial call is in flight
    HalfOpen,
}

/// Mutable breaker state, guarded by a single mutex so that admission and
/// the trial flag are updated as one unit.
#[derive(Debug)]
struct BreakerData {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl BreakerData {
    const fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            opened_at: None,
            trial_in_flight: false,
        }
    }
}

/// Outcome of the admission check performed before invoking the operation.
#[derive(Debug, Clone, Copy)]
enum Admission {
    Allowed,
    Rejected { retry_after: Duration },
}

/// Point-in-time breaker statistics (for logging and operational tooling)
#[derive(Debug, Clone, Copy)]
pub struct BreakerStats {
    /// Current circuit state
    pub state: CircuitState,
    /// Consecutive failures accumulated while closed
    pub failure_count: u32,
}

/// Failure-tracking gate for one logical dependency.
///
/// One instance per dependency name (e.g. `"ai-provider"`,
/// `"payment-provider"`), constructed by whatever composes the service graph
/// and shared by every caller of that dependency. The breaker never swallows
/// errors: it only decides whether to *attempt* the call, and a failed
/// operation's error propagates to the caller after the state machine has
/// recorded it.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: BreakerConfig,
    data: Mutex<BreakerData>,
}

impl CircuitBreaker {
    /// Create a new breaker for the named dependency, starting closed.
    #[must_use]
    pub fn new(name: impl Into<Arc<str>>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            data: Mutex::new(BreakerData::new()),
        }
    }

    /// The dependency this breaker guards.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execute `operation` through the breaker.
    ///
    /// # Errors
    /// - [`CircuitError::Open`] if the circuit is open (or a trial call is
    ///   already probing); the operation is never invoked
    /// - [`CircuitError::Inner`] carrying the operation's own error after
    ///   the failure has been recorded
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match self.admit() {
            Admission::Rejected { retry_after } => Err(CircuitError::Open { retry_after }),
            Admission::Allowed => match operation().await {
                Ok(value) => {
                    self.record_success();
                    Ok(value)
                }
                Err(error) => {
                    self.record_failure();
                    Err(CircuitError::Inner(error))
                }
            },
        }
    }

    /// Current circuit state.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.data.lock().state
    }

    /// Current statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> BreakerStats {
        let data = self.data.lock();
        BreakerStats {
            state: data.state,
            failure_count: data.failure_count,
        }
    }

    fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.config.recovery_timeout_secs)
    }

    /// Decide whether a call may proceed, transitioning OPEN → HALF_OPEN
    /// when the recovery timeout has elapsed. Exactly one caller is admitted
    /// as the trial; concurrent callers are rejected as if still open.
    fn admit(&self) -> Admission {
        let mut data = self.data.lock();
        match data.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::HalfOpen => {
                // A trial is already probing the dependency.
                debug_assert!(data.trial_in_flight);
                Admission::Rejected {
                    retry_after: self.recovery_timeout(),
                }
            }
            CircuitState::Open => {
                let elapsed = data
                    .opened_at
                    .map_or(Duration::ZERO, |opened_at| opened_at.elapsed());
                let timeout = self.recovery_timeout();

                if elapsed >= timeout {
                    data.state = CircuitState::HalfOpen;
                    data.trial_in_flight = true;
                    info!(
                        dependency = %self.name,
                        "circuit entering half-open state, admitting trial call"
                    );
                    Admission::Allowed
                } else {
                    Admission::Rejected {
                        retry_after: timeout - elapsed,
                    }
                }
            }
        }
    }

    fn record_success(&self) {
        let mut data = self.data.lock();
        match data.state {
            CircuitState::Closed => {
                data.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                data.state = CircuitState::Closed;
                data.failure_count = 0;
                data.opened_at = None;
                data.trial_in_flight = false;
                info!(
                    dependency = %self.name,
                    "circuit closed, dependency recovered"
                );
            }
            CircuitState::Open => {
                // Calls are rejected while open; a success here means a call
                // raced the transition. Harmless, but worth noticing.
                warn!(
                    dependency = %self.name,
                    "unexpected success recorded while circuit open"
                );
            }
        }
    }

    fn record_failure(&self) {
        let mut data = self.data.lock();
        match data.state {
            CircuitState::Closed => {
                data.failure_count += 1;
                if data.failure_count >= self.config.failure_threshold {
                    data.state = CircuitState::Open;
                    data.opened_at = Some(Instant::now());
                    data.failure_count = 0;
                    warn!(
                        dependency = %self.name,
                        threshold = self.config.failure_threshold,
                        recovery_timeout_secs = self.config.recovery_timeout_secs,
                        "circuit opened, rejecting calls"
                    );
                }
            }
            CircuitState::HalfOpen => {
                data.state = CircuitState::Open;
                data.opened_at = Some(Instant::now());
                data.trial_in_flight = false;
                warn!(
                    dependency = %self.name,
                    "trial call failed, circuit reopened"
                );
            }
            CircuitState::Open => {}
        }
    }
}

/// Per-dependency breaker registry.
///
/// Owns one [`CircuitBreaker`] per dependency name, created on first use
/// with the registry's shared configuration. An explicit, injectable object:
/// tests and isolated process instances construct their own registries and
/// do not interfere with each other.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: BreakerConfig,
    breakers: DashMap<Arc<str>, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    /// Create a registry whose breakers all share `config`.
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// Get or create the breaker for a dependency name.
    #[must_use]
    pub fn get(&self, dependency: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(dependency) {
            return Arc::clone(breaker.value());
        }

        let name: Arc<str> = Arc::from(dependency);
        self.breakers
            .entry(Arc::clone(&name))
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.config.clone())))
            .clone()
    }

    /// Number of dependencies with a breaker instance.
    #[must_use]
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    /// Whether any breaker has been created yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use pretty_assertions::assert_eq;

    use super::*;

    fn config(failure_threshold: u32, recovery_timeout_secs: u64) -> BreakerConfig {
        BreakerConfig {
            failure_threshold,
            recovery_timeout_secs,
        }
    }

    async fn fail(breaker: &CircuitBreaker) {
        let _result: Result<(), CircuitError<&str>> =
            breaker.execute(|| async { Err("boom") }).await;
    }

    #[tokio::test]
    async fn closed_to_open_after_threshold() {
        let breaker = CircuitBreaker::new("payment-provider", config(3, 60));
        assert_eq!(breaker.state(), CircuitState::Closed);

        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.stats().failure_count, 2);

        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
        // Count resets on entering the open state.
        assert_eq!(breaker.stats().failure_count, 0);
    }

    #[tokio::test]
    async fn open_rejects_without_invoking_operation() {
        let breaker = CircuitBreaker::new("ai-provider", config(1, 60));
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        let calls = AtomicU32::new(0);
        let result: Result<(), CircuitError<&str>> = breaker
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        assert!(matches!(result, Err(CircuitError::Open { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn half_open_trial_success_closes_circuit() {
        // Zero timeout: the next call after opening is immediately a trial.
        let breaker = CircuitBreaker::new("ai-provider", config(2, 0));
        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        let result: Result<&str, CircuitError<&str>> =
            breaker.execute(|| async { Ok("recovered") }).await;
        assert_eq!(result.unwrap(), "recovered");
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_trial_failure_reopens_circuit() {
        let breaker = CircuitBreaker::new("ai-provider", config(2, 0));
        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        fail(&breaker).await; // admitted as trial, fails
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn success_resets_failure_count_while_closed() {
        let breaker = CircuitBreaker::new("ai-provider", config(3, 60));
        fail(&breaker).await;
        fail(&breaker).await;

        let _result: Result<(), CircuitError<&str>> =
            breaker.execute(|| async { Ok(()) }).await;
        assert_eq!(breaker.stats().failure_count, 0);

        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn only_one_concurrent_trial_is_admitted() {
        let breaker = Arc::new(CircuitBreaker::new("ai-provider", config(1, 0)));
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        // Hold the trial call open on a channel so a second caller arrives
        // while the probe is still in flight.
        let (release, gate) = tokio::sync::oneshot::channel::<()>();
        let trial_breaker = Arc::clone(&breaker);
        let trial = tokio::spawn(async move {
            trial_breaker
                .execute(|| async {
                    gate.await.ok();
                    Ok::<_, &str>("trial ok")
                })
                .await
        });

        // Wait until the trial has been admitted.
        while breaker.state() != CircuitState::HalfOpen {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let result: Result<(), CircuitError<&str>> =
            breaker.execute(|| async { Ok(()) }).await;
        assert!(matches!(result, Err(CircuitError::Open { .. })));

        release.send(()).unwrap();
        let trial_result = trial.await.unwrap();
        assert_eq!(trial_result.unwrap(), "trial ok");
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn error_propagates_unchanged_through_closed_circuit() {
        let breaker = CircuitBreaker::new("ai-provider", config(5, 60));
        let result: Result<(), CircuitError<&str>> =
            breaker.execute(|| async { Err("upstream 503") }).await;

        match result {
            Err(CircuitError::Inner(error)) => assert_eq!(error, "upstream 503"),
            other => panic!("expected Inner, got {other:?}"),
        }
    }

    #[test]
    fn registry_returns_same_breaker_per_dependency() {
        let registry = CircuitBreakerRegistry::new(BreakerConfig::default());
        assert!(registry.is_empty());

        let first = registry.get("ai-provider");
        let again = registry.get("ai-provider");
        let other = registry.get("payment-provider");

        assert!(Arc::ptr_eq(&first, &again));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(registry.len(), 2);
    }
}
