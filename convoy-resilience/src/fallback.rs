//! Tiered fallback execution across ordered quality levels
//!
//! Three tiers, in fixed order: `advanced` (primary, highest quality,
//! external call), `basic` (secondary external call, lower quality/cost),
//! and `template` (local deterministic computation, always expected to
//! succeed). External tiers carry a health record; a tier that fails
//! repeatedly is skipped until a cooldown window elapses. Recovery is
//! evaluated lazily at call time through an `unhealthy_until` deadline —
//! no scheduled callback, so there is no background task to manage and
//! tests stay deterministic.

use std::{
    fmt,
    future::Future,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::FatalFallbackError;

/// One of the three ordered quality/cost levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Primary tier: highest quality, external call
    Advanced,
    /// Secondary tier: external call, lower quality and cost
    Basic,
    /// Tertiary tier: local deterministic fallback, no external call
    Template,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Advanced => "advanced",
            Self::Basic => "basic",
            Self::Template => "template",
        })
    }
}

/// Configuration for tier attempts and health tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Retries per tier beyond its first attempt
    ///
    /// Default: 1
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Wall-clock timeout per attempt (milliseconds); a missed timeout is
    /// indistinguishable from any other failure
    ///
    /// Default: 5000
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Consecutive failures before a tier is marked unhealthy
    ///
    /// Default: 5
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,

    /// How long an unhealthy tier stays skipped before it becomes eligible
    /// again (seconds)
    ///
    /// Default: 60
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            timeout_ms: default_timeout_ms(),
            unhealthy_threshold: default_unhealthy_threshold(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

const fn default_max_retries() -> u32 {
    1
}

const fn default_timeout_ms() -> u64 {
    5000
}

const fn default_unhealthy_threshold() -> u32 {
    5
}

const fn default_cooldown_secs() -> u64 {
    60
}

/// Health record for one external tier.
///
/// `consecutive_failures` resets to zero exactly on a recorded success;
/// `healthy` flips to false exactly when the counter reaches the threshold,
/// and flips back automatically once the cooldown deadline passes. A manual
/// disable sets no deadline and therefore stays until manually enabled.
#[derive(Debug, Clone, Copy)]
struct TierHealth {
    healthy: bool,
    consecutive_failures: u32,
    last_checked_at: Option<Instant>,
    unhealthy_until: Option<Instant>,
}

impl TierHealth {
    const fn new() -> Self {
        Self {
            healthy: true,
            consecutive_failures: 0,
            last_checked_at: None,
            unhealthy_until: None,
        }
    }

    /// Lazily re-enable the tier once its cooldown deadline has passed.
    fn is_available(&mut self) -> bool {
        if !self.healthy
            && let Some(until) = self.unhealthy_until
            && Instant::now() >= until
        {
            self.healthy = true;
            self.consecutive_failures = 0;
            self.unhealthy_until = None;
        }
        self.healthy
    }
}

/// Point-in-time health of one tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierHealthSnapshot {
    /// Which tier this snapshot describes
    pub tier: Tier,
    /// Whether the tier is currently eligible for calls
    pub healthy: bool,
    /// Consecutive failures since the last success
    pub consecutive_failures: u32,
}

/// Health snapshot across the external tiers.
///
/// The `template` tier carries no record: it performs no external call and
/// is healthy by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthStatus {
    /// Health of the primary tier
    pub advanced: TierHealthSnapshot,
    /// Health of the secondary tier
    pub basic: TierHealthSnapshot,
}

/// Result of a fallback execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackOutcome<T> {
    /// The successful tier's output
    pub data: T,
    /// The tier that produced the output
    pub tier: Tier,
    /// Whether a tier below `advanced` produced the output
    pub was_downgraded: bool,
    /// Message of the last higher tier that failed during this call, if any
    pub original_error: Option<String>,
}

/// Orchestrates three ordered quality tiers with self-healing health
/// tracking.
///
/// One instance per degradable feature (e.g. AI copy generation), owned by
/// whatever composes the service graph and shared by its callers.
#[derive(Debug)]
pub struct TieredFallbackExecutor {
    config: FallbackConfig,
    advanced: Mutex<TierHealth>,
    basic: Mutex<TierHealth>,
}

impl TieredFallbackExecutor {
    /// Create an executor with both external tiers healthy.
    #[must_use]
    pub fn new(config: FallbackConfig) -> Self {
        Self {
            config,
            advanced: Mutex::new(TierHealth::new()),
            basic: Mutex::new(TierHealth::new()),
        }
    }

    /// Execute with graceful degradation across the three tiers.
    ///
    /// `advanced` then `basic` are each skipped if currently unhealthy, and
    /// otherwise invoked under bounded retry with a per-attempt timeout. The
    /// first success returns immediately with downgrade metadata; failures
    /// degrade to the next tier. `template` runs last and is expected to be
    /// infallible.
    ///
    /// # Errors
    /// [`FatalFallbackError`] if the template tier itself fails — no further
    /// degradation is possible.
    pub async fn execute_with_fallback<T, E, A, AFut, B, BFut, Tpl>(
        &self,
        mut advanced: A,
        mut basic: B,
        template: Tpl,
    ) -> Result<FallbackOutcome<T>, FatalFallbackError>
    where
        A: FnMut() -> AFut,
        AFut: Future<Output = Result<T, E>>,
        B: FnMut() -> BFut,
        BFut: Future<Output = Result<T, E>>,
        Tpl: FnOnce() -> Result<T, E>,
        E: fmt::Display,
    {
        let mut last_error: Option<String> = None;

        if self.tier_available(Tier::Advanced) {
            match self.try_tier(Tier::Advanced, &mut advanced).await {
                Ok(data) => {
                    self.record_success(Tier::Advanced);
                    return Ok(FallbackOutcome {
                        data,
                        tier: Tier::Advanced,
                        was_downgraded: false,
                        original_error: None,
                    });
                }
                Err(message) => {
                    self.record_failure(Tier::Advanced);
                    last_error = Some(message);
                }
            }
        } else {
            debug!(tier = %Tier::Advanced, "skipping unhealthy tier");
        }

        if self.tier_available(Tier::Basic) {
            match self.try_tier(Tier::Basic, &mut basic).await {
                Ok(data) => {
                    self.record_success(Tier::Basic);
                    return Ok(FallbackOutcome {
                        data,
                        tier: Tier::Basic,
                        was_downgraded: true,
                        original_error: last_error,
                    });
                }
                Err(message) => {
                    self.record_failure(Tier::Basic);
                    last_error = Some(message);
                }
            }
        } else {
            debug!(tier = %Tier::Basic, "skipping unhealthy tier");
        }

        match template() {
            Ok(data) => {
                debug!("degraded to template tier");
                Ok(FallbackOutcome {
                    data,
                    tier: Tier::Template,
                    was_downgraded: true,
                    original_error: last_error,
                })
            }
            Err(template_error) => {
                let fatal = FatalFallbackError {
                    template_error: template_error.to_string(),
                    last_upstream_error: last_error
                        .unwrap_or_else(|| "no upstream tier attempted".to_string()),
                };
                error!(error = %fatal, "template tier failed, no further degradation possible");
                Err(fatal)
            }
        }
    }

    /// Run one tier under bounded retry with a per-attempt timeout.
    ///
    /// Returns the last failure message; a timeout counts the same as any
    /// other failure for retry and health purposes.
    async fn try_tier<T, E, F, Fut>(&self, tier: Tier, operation: &mut F) -> Result<T, String>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let timeout = Duration::from_millis(self.config.timeout_ms);
        let mut last_error = String::new();

        for attempt in 0..=self.config.max_retries {
            match tokio::time::timeout(timeout, operation()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(failure)) => last_error = failure.to_string(),
                Err(_elapsed) => {
                    last_error = format!("timed out after {}ms", self.config.timeout_ms);
                }
            }
            debug!(%tier, attempt, error = %last_error, "tier attempt failed");
        }

        Err(last_error)
    }

    fn health(&self, tier: Tier) -> Option<&Mutex<TierHealth>> {
        match tier {
            Tier::Advanced => Some(&self.advanced),
            Tier::Basic => Some(&self.basic),
            Tier::Template => None,
        }
    }

    fn tier_available(&self, tier: Tier) -> bool {
        self.health(tier)
            .is_none_or(|health| health.lock().is_available())
    }

    fn record_success(&self, tier: Tier) {
        if let Some(health) = self.health(tier) {
            let mut health = health.lock();
            if !health.healthy {
                info!(%tier, "tier recovered");
            }
            health.healthy = true;
            health.consecutive_failures = 0;
            health.last_checked_at = Some(Instant::now());
            health.unhealthy_until = None;
        }
    }

    fn record_failure(&self, tier: Tier) {
        if let Some(health) = self.health(tier) {
            let mut health = health.lock();
            health.consecutive_failures += 1;
            health.last_checked_at = Some(Instant::now());

            if health.healthy && health.consecutive_failures >= self.config.unhealthy_threshold {
                health.healthy = false;
                health.unhealthy_until =
                    Some(Instant::now() + Duration::from_secs(self.config.cooldown_secs));
                warn!(
                    %tier,
                    consecutive_failures = health.consecutive_failures,
                    cooldown_secs = self.config.cooldown_secs,
                    "tier marked unhealthy"
                );
            }
        }
    }

    /// Current health snapshot of the external tiers.
    ///
    /// Evaluates cooldown deadlines, so a tier whose window has elapsed
    /// reports healthy here without needing a call to go through it.
    #[must_use]
    pub fn health_status(&self) -> HealthStatus {
        let snapshot = |tier: Tier, health: &Mutex<TierHealth>| {
            let mut health = health.lock();
            let healthy = health.is_available();
            TierHealthSnapshot {
                tier,
                healthy,
                consecutive_failures: health.consecutive_failures,
            }
        };

        HealthStatus {
            advanced: snapshot(Tier::Advanced, &self.advanced),
            basic: snapshot(Tier::Basic, &self.basic),
        }
    }

    /// Reset all health state to healthy with zero failures.
    ///
    /// Used to recover from a known-bad state without waiting for cooldown.
    pub fn reset_health(&self) {
        *self.advanced.lock() = TierHealth::new();
        *self.basic.lock() = TierHealth::new();
        info!("tier health reset");
    }

    /// Manually force-disable a tier (for maintenance).
    ///
    /// A manual disable sets no cooldown deadline: the tier stays skipped
    /// until [`enable_tier`](Self::enable_tier) or
    /// [`reset_health`](Self::reset_health). Disabling `template` is a
    /// no-op — it is always healthy by construction.
    pub fn disable_tier(&self, tier: Tier) {
        if let Some(health) = self.health(tier) {
            let mut health = health.lock();
            health.healthy = false;
            health.unhealthy_until = None;
            warn!(%tier, "tier manually disabled");
        }
    }

    /// Manually force-enable a tier, clearing its failure history.
    pub fn enable_tier(&self, tier: Tier) {
        if let Some(health) = self.health(tier) {
            let mut health = health.lock();
            health.healthy = true;
            health.consecutive_failures = 0;
            health.unhealthy_until = None;
            info!(%tier, "tier manually enabled");
        }
    }
}
