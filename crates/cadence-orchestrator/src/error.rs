// Error types for orchestration

use crate::workflow::PhaseId;
use cadence_abstraction::ProviderError;
use cadence_models::CacheConfigError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for orchestration operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

/// Invalid or missing configuration. Raised before any dispatch.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigurationError {
    /// No providers configured
    #[error("At least one provider must be configured")]
    NoProviders,

    /// Two providers share a name
    #[error("Duplicate provider name '{0}'")]
    DuplicateProvider(String),

    /// A provider entry is invalid
    #[error("Invalid configuration for provider '{provider}': {reason}")]
    InvalidProvider {
        /// Provider name
        provider: String,
        /// Reason
        reason: String,
    },

    /// A name referenced a provider that is not configured
    #[error("Unknown provider '{0}'")]
    UnknownProvider(String),

    /// A numeric setting is out of range
    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue {
        /// Dotted setting path
        field: &'static str,
        /// Reason
        reason: String,
    },

    /// Cache settings rejected
    #[error("Invalid cache configuration: {0}")]
    Cache(#[from] CacheConfigError),

    /// Workflow definition rejected
    #[error("Invalid workflow definition: {0}")]
    InvalidWorkflow(String),
}

/// Failure of `LoadBalancer::dispatch` after recovery was applied.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatchError {
    /// Every eligible provider was tried and failed
    #[error("All providers failed after {attempts} attempt(s){}", last_error.as_ref().map(|e| format!(": {e}")).unwrap_or_default())]
    AllProvidersFailed {
        /// Number of providers attempted
        attempts: usize,
        /// Error from the final attempt
        last_error: Option<ProviderError>,
    },

    /// No provider was healthy, permitted and under its rate limit
    #[error("No eligible providers available")]
    NoEligibleProviders,

    /// The run was cancelled while dispatching
    #[error("Dispatch cancelled")]
    Cancelled,
}

/// Failure contained to one subtask.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubtaskError {
    /// Provider dispatch failed
    #[error("Dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),

    /// A gate role returned a failing verdict
    #[error("Validation failed: {reason}")]
    ValidationFailed {
        /// Verdict detail
        reason: String,
    },

    /// The provider answered with something the role cannot use
    #[error("Invalid output: {0}")]
    InvalidOutput(String),

    /// A dependency failed so the subtask never ran
    #[error("Blocked by failed dependency '{0}'")]
    Blocked(String),

    /// No handler registered for the role
    #[error("No handler registered for role '{0}'")]
    NoHandler(String),

    /// The agent task panicked or was aborted
    #[error("Agent task aborted: {0}")]
    Aborted(String),

    /// The run was cancelled
    #[error("Subtask cancelled")]
    Cancelled,
}

impl SubtaskError {
    /// Returns true when no provider could serve the subtask.
    #[must_use]
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::Dispatch(DispatchError::AllProvidersFailed { .. } | DispatchError::NoEligibleProviders)
        )
    }

    /// Returns true for gate verdict failures.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::ValidationFailed { .. })
    }
}

/// Aggregate failure of a phase.
#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
pub enum PhaseError {
    /// Too few subtasks succeeded
    #[error("Phase {phase}: {succeeded}/{total} subtasks succeeded (required ratio {required_ratio})")]
    InsufficientSuccess {
        /// Phase id
        phase: PhaseId,
        /// Succeeded subtasks
        succeeded: usize,
        /// All subtasks
        total: usize,
        /// Configured minimum ratio
        required_ratio: f64,
    },

    /// The phase's subtask graph is invalid
    #[error("Phase {phase}: invalid subtask plan: {reason}")]
    InvalidPlan {
        /// Phase id
        phase: PhaseId,
        /// Reason
        reason: String,
    },

    /// The run was cancelled during the phase
    #[error("Phase {0} cancelled")]
    Cancelled(PhaseId),
}

/// Terminal failure of a workflow run. Stored on the run.
#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkflowError {
    /// A phase kept failing after its iteration budget was spent
    #[error("Phase {phase} ({name}) failed after {iterations} iteration(s)")]
    RetriesExhausted {
        /// Phase id
        phase: PhaseId,
        /// Phase name
        name: String,
        /// Iterations consumed
        iterations: u32,
    },

    /// A phase without a retry edge failed
    #[error("Phase {phase} ({name}) failed: {reason}")]
    PhaseFailed {
        /// Phase id
        phase: PhaseId,
        /// Phase name
        name: String,
        /// Failure detail
        reason: String,
    },

    /// Providers stayed unreachable after in-place retries
    #[error("Phase {phase} ({name}): providers unreachable after {attempts} attempt(s)")]
    InfrastructureUnavailable {
        /// Phase id
        phase: PhaseId,
        /// Phase name
        name: String,
        /// Executions of the phase including retries
        attempts: u32,
    },

    /// The run was cancelled
    #[error("Workflow cancelled")]
    Cancelled,
}

/// Errors returned by the `Orchestrator` facade.
///
/// Failures during a run are recorded on the returned `WorkflowRun` instead.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infrastructure_classification() {
        let all_failed = SubtaskError::Dispatch(DispatchError::AllProvidersFailed {
            attempts: 3,
            last_error: None,
        });
        assert!(all_failed.is_infrastructure());
        assert!(SubtaskError::Dispatch(DispatchError::NoEligibleProviders).is_infrastructure());
        assert!(!SubtaskError::Dispatch(DispatchError::Cancelled).is_infrastructure());
        assert!(!SubtaskError::ValidationFailed { reason: "x".to_string() }.is_infrastructure());
    }

    #[test]
    fn test_all_providers_failed_message_includes_last_error() {
        let err = DispatchError::AllProvidersFailed {
            attempts: 2,
            last_error: Some(ProviderError::Other("boom".to_string())),
        };
        let message = err.to_string();
        assert!(message.contains("2 attempt(s)"));
        assert!(message.contains("boom"));
    }

    #[test]
    fn test_workflow_error_serializes_with_tag() {
        let err = WorkflowError::RetriesExhausted { phase: 7, name: "Validation".to_string(), iterations: 2 };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "retries_exhausted");
        assert_eq!(json["phase"], 7);
        let back: WorkflowError = serde_json::from_value(json).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn test_configuration_error_converts() {
        let err: OrchestrationError = ConfigurationError::NoProviders.into();
        assert!(err.to_string().contains("At least one provider"));
    }
}
