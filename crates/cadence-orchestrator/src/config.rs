//! Orchestrator configuration.
//!
//! The core receives an already-loaded `OrchestratorConfig`; reading files or
//! environment variables is left to the caller. Every section has serde
//! defaults so a config only needs to list its providers.

use crate::error::ConfigurationError;
use cadence_models::{CacheConfig, ProviderConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Providers in declaration order (order breaks scoring ties).
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,

    /// Adaptive scoring weights.
    #[serde(default)]
    pub scoring: ScoringWeights,

    /// Health tracking.
    #[serde(default)]
    pub health: HealthConfig,

    /// Response cache.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Error recovery policy.
    #[serde(default)]
    pub recovery: RecoveryConfig,

    /// Subtask scheduling.
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// Phase state machine.
    #[serde(default)]
    pub workflow: WorkflowConfig,
}

impl OrchestratorConfig {
    /// Creates a config with the given providers and default settings.
    #[must_use]
    pub fn with_providers(providers: Vec<ProviderConfig>) -> Self {
        Self {
            providers,
            scoring: ScoringWeights::default(),
            health: HealthConfig::default(),
            cache: CacheConfig::default(),
            recovery: RecoveryConfig::default(),
            coordinator: CoordinatorConfig::default(),
            workflow: WorkflowConfig::default(),
        }
    }

    /// Validates the whole configuration.
    ///
    /// # Errors
    /// Returns the first `ConfigurationError` found.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.providers.is_empty() {
            return Err(ConfigurationError::NoProviders);
        }

        let mut seen = HashSet::new();
        for provider in &self.providers {
            if provider.name.trim().is_empty() {
                return Err(ConfigurationError::InvalidProvider {
                    provider: provider.name.clone(),
                    reason: "name must not be empty".to_string(),
                });
            }
            if !seen.insert(provider.name.as_str()) {
                return Err(ConfigurationError::DuplicateProvider(provider.name.clone()));
            }
            if provider.max_concurrency == 0 {
                return Err(ConfigurationError::InvalidProvider {
                    provider: provider.name.clone(),
                    reason: "max_concurrency must be greater than 0".to_string(),
                });
            }
            if !provider.cost_weight.is_finite() || provider.cost_weight < 0.0 {
                return Err(ConfigurationError::InvalidProvider {
                    provider: provider.name.clone(),
                    reason: format!("cost_weight must be >= 0, got {}", provider.cost_weight),
                });
            }
            if provider.timeout_ms == 0 {
                return Err(ConfigurationError::InvalidProvider {
                    provider: provider.name.clone(),
                    reason: "timeout_ms must be greater than 0".to_string(),
                });
            }
            if provider.rate_limit_per_minute == Some(0) {
                return Err(ConfigurationError::InvalidProvider {
                    provider: provider.name.clone(),
                    reason: "rate_limit_per_minute must be greater than 0 when set".to_string(),
                });
            }
        }

        self.scoring.validate()?;
        self.health.validate()?;
        self.cache.validate()?;
        self.recovery.validate()?;
        self.coordinator.validate()?;
        self.workflow.validate()?;
        Ok(())
    }
}

/// Weights of the adaptive provider score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringWeights {
    /// Weight of the latency term.
    #[serde(default = "default_latency_weight")]
    pub latency: f64,
    /// Weight of the success-rate term.
    #[serde(default = "default_success_weight")]
    pub success: f64,
    /// Weight of the spare-capacity term.
    #[serde(default = "default_load_weight")]
    pub load: f64,
    /// Weight of the cost term.
    #[serde(default = "default_cost_weight")]
    pub cost: f64,
}

fn default_latency_weight() -> f64 {
    0.4
}

fn default_success_weight() -> f64 {
    0.3
}

fn default_load_weight() -> f64 {
    0.2
}

fn default_cost_weight() -> f64 {
    0.1
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            latency: default_latency_weight(),
            success: default_success_weight(),
            load: default_load_weight(),
            cost: default_cost_weight(),
        }
    }
}

impl ScoringWeights {
    fn validate(&self) -> Result<(), ConfigurationError> {
        let weights = [self.latency, self.success, self.load, self.cost];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(ConfigurationError::InvalidValue {
                field: "scoring",
                reason: "weights must be finite and >= 0".to_string(),
            });
        }
        if weights.iter().sum::<f64>() <= 0.0 {
            return Err(ConfigurationError::InvalidValue {
                field: "scoring",
                reason: "at least one weight must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// Provider health tracking.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Smoothing factor of the latency and success moving averages.
    #[serde(default = "default_ema_alpha")]
    pub ema_alpha: f64,
    /// Success rate below which a provider is marked unhealthy.
    #[serde(default = "default_success_floor")]
    pub success_floor: f64,
    /// Seconds between background probes of unhealthy providers.
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
}

fn default_ema_alpha() -> f64 {
    0.2
}

fn default_success_floor() -> f64 {
    0.5
}

fn default_probe_interval_secs() -> u64 {
    30
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            ema_alpha: default_ema_alpha(),
            success_floor: default_success_floor(),
            probe_interval_secs: default_probe_interval_secs(),
        }
    }
}

impl HealthConfig {
    /// Interval between health probes.
    #[must_use]
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        if !(self.ema_alpha > 0.0 && self.ema_alpha <= 1.0) {
            return Err(ConfigurationError::InvalidValue {
                field: "health.ema_alpha",
                reason: format!("must be in (0, 1], got {}", self.ema_alpha),
            });
        }
        if !(0.0..=1.0).contains(&self.success_floor) {
            return Err(ConfigurationError::InvalidValue {
                field: "health.success_floor",
                reason: format!("must be in [0, 1], got {}", self.success_floor),
            });
        }
        if self.probe_interval_secs == 0 {
            return Err(ConfigurationError::InvalidValue {
                field: "health.probe_interval_secs",
                reason: "must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

/// Error recovery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// First backoff delay for transient failures.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Calls against one provider for transient failures before failover.
    #[serde(default = "default_max_transient_attempts")]
    pub max_transient_attempts: u32,
    /// Upper bound of any backoff delay.
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// In-place re-runs of a phase whose subtasks found no provider.
    #[serde(default = "default_max_infrastructure_retries")]
    pub max_infrastructure_retries: u32,
}

fn default_backoff_base_ms() -> u64 {
    2000
}

fn default_max_transient_attempts() -> u32 {
    3
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_max_infrastructure_retries() -> u32 {
    3
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: default_backoff_base_ms(),
            max_transient_attempts: default_max_transient_attempts(),
            backoff_max_ms: default_backoff_max_ms(),
            max_infrastructure_retries: default_max_infrastructure_retries(),
        }
    }
}

impl RecoveryConfig {
    fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_transient_attempts == 0 {
            return Err(ConfigurationError::InvalidValue {
                field: "recovery.max_transient_attempts",
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.backoff_max_ms < self.backoff_base_ms {
            return Err(ConfigurationError::InvalidValue {
                field: "recovery.backoff_max_ms",
                reason: "must not be smaller than backoff_base_ms".to_string(),
            });
        }
        Ok(())
    }
}

/// Subtask scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Ceiling on concurrently executing agents.
    #[serde(default = "default_max_parallel_agents")]
    pub max_parallel_agents: usize,
    /// Fraction of subtasks that must succeed for a phase to succeed.
    #[serde(default = "default_min_success_ratio")]
    pub min_success_ratio: f64,
}

fn default_max_parallel_agents() -> usize {
    10
}

fn default_min_success_ratio() -> f64 {
    1.0
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_parallel_agents: default_max_parallel_agents(),
            min_success_ratio: default_min_success_ratio(),
        }
    }
}

impl CoordinatorConfig {
    fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_parallel_agents == 0 {
            return Err(ConfigurationError::InvalidValue {
                field: "coordinator.max_parallel_agents",
                reason: "must be greater than 0".to_string(),
            });
        }
        if !(self.min_success_ratio > 0.0 && self.min_success_ratio <= 1.0) {
            return Err(ConfigurationError::InvalidValue {
                field: "coordinator.min_success_ratio",
                reason: format!("must be in (0, 1], got {}", self.min_success_ratio),
            });
        }
        Ok(())
    }
}

/// Phase state machine settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Executions allowed for a failing gated phase in one run.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Capacity of the channel observer buffer.
    #[serde(default = "default_observer_buffer")]
    pub observer_buffer: usize,
}

fn default_max_iterations() -> u32 {
    3
}

fn default_observer_buffer() -> usize {
    256
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self { max_iterations: default_max_iterations(), observer_buffer: default_observer_buffer() }
    }
}

impl WorkflowConfig {
    fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_iterations == 0 {
            return Err(ConfigurationError::InvalidValue {
                field: "workflow.max_iterations",
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.observer_buffer == 0 {
            return Err(ConfigurationError::InvalidValue {
                field: "workflow.observer_buffer",
                reason: "must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

/// Per-run overrides passed to `Orchestrator::start_workflow`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowOptions {
    /// Restricts dispatch to these providers.
    #[serde(default)]
    pub provider_preference: Option<Vec<String>>,
    /// Overrides `coordinator.max_parallel_agents`.
    #[serde(default)]
    pub max_parallel_agents: Option<usize>,
    /// Overrides `workflow.max_iterations`.
    #[serde(default)]
    pub max_iterations: Option<u32>,
}

impl WorkflowOptions {
    /// Sets the provider preference.
    #[must_use]
    pub fn with_providers<I, S>(mut self, providers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.provider_preference = Some(providers.into_iter().map(Into::into).collect());
        self
    }

    /// Sets the parallelism ceiling.
    #[must_use]
    pub fn with_max_parallel_agents(mut self, max: usize) -> Self {
        self.max_parallel_agents = Some(max);
        self
    }

    /// Sets the iteration budget.
    #[must_use]
    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = Some(max);
        self
    }

    /// Validates the overrides.
    ///
    /// # Errors
    /// Returns `ConfigurationError` for zero limits or an empty preference list.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_parallel_agents == Some(0) {
            return Err(ConfigurationError::InvalidValue {
                field: "options.max_parallel_agents",
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.max_iterations == Some(0) {
            return Err(ConfigurationError::InvalidValue {
                field: "options.max_iterations",
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.provider_preference.as_ref().is_some_and(Vec::is_empty) {
            return Err(ConfigurationError::InvalidValue {
                field: "options.provider_preference",
                reason: "must name at least one provider when set".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_models::ProviderKind;

    fn mock(name: &str) -> ProviderConfig {
        ProviderConfig::new(name, ProviderKind::Mock)
    }

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::with_providers(vec![mock("a")]);
        assert!((config.scoring.latency - 0.4).abs() < f64::EPSILON);
        assert!((config.health.ema_alpha - 0.2).abs() < f64::EPSILON);
        assert_eq!(config.health.probe_interval(), Duration::from_secs(30));
        assert_eq!(config.recovery.backoff_base_ms, 2000);
        assert_eq!(config.coordinator.max_parallel_agents, 10);
        assert_eq!(config.workflow.max_iterations, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_providers_rejected() {
        let config = OrchestratorConfig::with_providers(Vec::new());
        assert_eq!(config.validate(), Err(ConfigurationError::NoProviders));
    }

    #[test]
    fn test_duplicate_provider_rejected() {
        let config = OrchestratorConfig::with_providers(vec![mock("a"), mock("a")]);
        assert_eq!(config.validate(), Err(ConfigurationError::DuplicateProvider("a".to_string())));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let config = OrchestratorConfig::with_providers(vec![mock("a").with_max_concurrency(0)]);
        assert!(matches!(config.validate(), Err(ConfigurationError::InvalidProvider { .. })));
    }

    #[test]
    fn test_negative_cost_rejected() {
        let config = OrchestratorConfig::with_providers(vec![mock("a").with_cost_weight(-1.0)]);
        assert!(matches!(config.validate(), Err(ConfigurationError::InvalidProvider { .. })));
    }

    #[test]
    fn test_out_of_range_values_rejected() {
        let mut config = OrchestratorConfig::with_providers(vec![mock("a")]);
        config.health.ema_alpha = 0.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::InvalidValue { field: "health.ema_alpha", .. })
        ));

        let mut config = OrchestratorConfig::with_providers(vec![mock("a")]);
        config.coordinator.min_success_ratio = 1.5;
        assert!(config.validate().is_err());

        let mut config = OrchestratorConfig::with_providers(vec![mock("a")]);
        config.scoring = ScoringWeights { latency: 0.0, success: 0.0, load: 0.0, cost: 0.0 };
        assert!(config.validate().is_err());

        let mut config = OrchestratorConfig::with_providers(vec![mock("a")]);
        config.cache.ttl_secs = 0;
        assert!(matches!(config.validate(), Err(ConfigurationError::Cache(_))));
    }

    #[test]
    fn test_deserialize_minimal_json() {
        let config: OrchestratorConfig = serde_json::from_str(
            r#"{"providers": [{"name": "a", "kind": "mock"}], "workflow": {"max_iterations": 5}}"#,
        )
        .unwrap();
        assert_eq!(config.providers.len(), 1);
        assert_eq!(config.workflow.max_iterations, 5);
        assert_eq!(config.workflow.observer_buffer, 256);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_options_validation() {
        assert!(WorkflowOptions::default().validate().is_ok());
        assert!(WorkflowOptions::default().with_max_parallel_agents(0).validate().is_err());
        assert!(WorkflowOptions::default().with_max_iterations(0).validate().is_err());
        let empty: Vec<String> = Vec::new();
        assert!(WorkflowOptions::default().with_providers(empty).validate().is_err());
        assert!(WorkflowOptions::default().with_providers(["a"]).validate().is_ok());
    }
}
