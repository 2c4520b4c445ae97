//! Failure classification and recovery policy.
//!
//! The manager is consulted by the load balancer for provider failures and by
//! the phase state machine for workflow-level failures. It holds only policy
//! and per-run state (revoked providers, counters); it never performs calls.

use crate::config::RecoveryConfig;
use cadence_abstraction::ProviderError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::warn;

/// Recovery category of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// Network errors and timeouts.
    Transient,
    /// Rate limit or quota exhaustion.
    RateLimited,
    /// Rejected credentials.
    Authentication,
    /// Provider down or unable to serve the request kind.
    ProviderDown,
    /// A gate phase rejected the work.
    ValidationFailure,
}

impl FailureCategory {
    /// Classifies a provider error.
    #[must_use]
    pub fn classify(error: &ProviderError) -> Self {
        match error {
            ProviderError::Timeout { .. }
            | ProviderError::Network { .. }
            | ProviderError::InvalidResponse { .. }
            | ProviderError::Other(_) => Self::Transient,
            ProviderError::RateLimited { .. } => Self::RateLimited,
            ProviderError::Authentication { .. } => Self::Authentication,
            ProviderError::Unavailable { .. } | ProviderError::Unsupported(_) => Self::ProviderDown,
        }
    }

    fn slot(self) -> usize {
        match self {
            Self::Transient => 0,
            Self::RateLimited => 1,
            Self::Authentication => 2,
            Self::ProviderDown => 3,
            Self::ValidationFailure => 4,
        }
    }
}

/// What the load balancer should do after a provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Call the same provider again after the delay.
    RetrySameProvider {
        /// Backoff before the next call.
        delay: Duration,
    },
    /// Move on to the next-best provider.
    Failover,
    /// Disable the provider for the rest of the run, then fail over.
    RevokeProvider,
    /// Mark the provider unhealthy, then fail over.
    MarkUnhealthy,
}

/// Per-category failure counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryStats {
    /// Transient failures seen.
    pub transient: u64,
    /// Rate-limit failures seen.
    pub rate_limited: u64,
    /// Authentication failures seen.
    pub authentication: u64,
    /// Provider-down failures seen.
    pub provider_down: u64,
    /// Gate validation failures seen.
    pub validation: u64,
}

/// Recovery policy plus per-run recovery state.
#[derive(Debug)]
pub struct ErrorRecoveryManager {
    config: RecoveryConfig,
    revoked: Mutex<HashSet<String>>,
    counts: [AtomicU64; 5],
}

impl ErrorRecoveryManager {
    /// Creates a manager with no revoked providers.
    #[must_use]
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            config,
            revoked: Mutex::new(HashSet::new()),
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// The policy settings.
    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Decides how to handle a provider error.
    ///
    /// `attempt` is the 1-based number of calls made to this provider for
    /// the current request.
    pub fn on_provider_error(&self, error: &ProviderError, attempt: u32) -> RecoveryAction {
        let category = FailureCategory::classify(error);
        self.record(category);
        match category {
            FailureCategory::Transient if attempt < self.config.max_transient_attempts => {
                RecoveryAction::RetrySameProvider { delay: self.backoff_delay(attempt) }
            }
            FailureCategory::Transient | FailureCategory::RateLimited => RecoveryAction::Failover,
            FailureCategory::Authentication => RecoveryAction::RevokeProvider,
            FailureCategory::ProviderDown => RecoveryAction::MarkUnhealthy,
            FailureCategory::ValidationFailure => RecoveryAction::Failover,
        }
    }

    /// Exponential backoff: `base * 2^(attempt-1)`, capped at the maximum.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let delay = self.config.backoff_base_ms.saturating_mul(1_u64 << exponent);
        Duration::from_millis(delay.min(self.config.backoff_max_ms))
    }

    /// Disables a provider for the rest of the run. Returns true if newly revoked.
    pub fn revoke(&self, provider: &str) -> bool {
        let newly = self
            .revoked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(provider.to_string());
        if newly {
            warn!(provider = %provider, "Provider revoked for the remainder of the run");
        }
        newly
    }

    /// Whether the provider was revoked.
    pub fn is_revoked(&self, provider: &str) -> bool {
        self.revoked.lock().unwrap_or_else(PoisonError::into_inner).contains(provider)
    }

    /// Records a gate failure seen by the phase state machine.
    pub fn record_validation_failure(&self) {
        self.record(FailureCategory::ValidationFailure);
    }

    /// Whether an infrastructure failure may be retried in place.
    ///
    /// `retries_done` counts in-place re-runs already performed for the phase.
    pub fn infrastructure_retry(&self, retries_done: u32) -> Option<Duration> {
        (retries_done < self.config.max_infrastructure_retries)
            .then(|| self.backoff_delay(retries_done + 1))
    }

    /// Failure counts by category.
    pub fn stats(&self) -> RecoveryStats {
        let load = |c: FailureCategory| self.counts[c.slot()].load(Ordering::Relaxed);
        RecoveryStats {
            transient: load(FailureCategory::Transient),
            rate_limited: load(FailureCategory::RateLimited),
            authentication: load(FailureCategory::Authentication),
            provider_down: load(FailureCategory::ProviderDown),
            validation: load(FailureCategory::ValidationFailure),
        }
    }

    fn record(&self, category: FailureCategory) {
        self.counts[category.slot()].fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for ErrorRecoveryManager {
    fn default() -> Self {
        Self::new(RecoveryConfig::default())
    }
}
