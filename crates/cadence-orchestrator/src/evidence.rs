//! Audit evidence attached to subtask and phase results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What an evidence record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    /// A provider call succeeded.
    ProviderCall,
    /// A provider call failed.
    ProviderFailure,
    /// The same provider is retried after a backoff.
    Retry,
    /// Dispatch moved on to another provider.
    Failover,
    /// A response came from the cache.
    CacheHit,
    /// A provider was marked unhealthy.
    ProviderUnhealthy,
    /// A provider was disabled for the rest of the run.
    ProviderRevoked,
    /// A subtask finished successfully.
    SubtaskSucceeded,
    /// A subtask failed.
    SubtaskFailed,
    /// A subtask was not run because a dependency failed.
    SubtaskBlocked,
    /// A gate role returned a verdict.
    Verdict,
    /// The state machine returned to an earlier phase.
    PhaseRetry,
    /// A phase was re-run in place after an infrastructure failure.
    InfrastructureRetry,
    /// Cancellation was observed.
    Cancelled,
}

/// A structured audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evidence {
    /// When it was recorded.
    pub timestamp: DateTime<Utc>,
    /// What it describes.
    pub kind: EvidenceKind,
    /// Human-readable detail.
    pub detail: String,
    /// Provider involved, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Subtask involved, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtask: Option<String>,
}

impl Evidence {
    /// Creates a record stamped with the current time.
    pub fn new(kind: EvidenceKind, detail: impl Into<String>) -> Self {
        Self { timestamp: Utc::now(), kind, detail: detail.into(), provider: None, subtask: None }
    }

    /// Sets the provider.
    #[must_use]
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    /// Sets the subtask.
    #[must_use]
    pub fn with_subtask(mut self, subtask: impl Into<String>) -> Self {
        self.subtask = Some(subtask.into());
        self
    }
}

/// Counts records of one kind.
pub fn count_kind(evidence: &[Evidence], kind: EvidenceKind) -> usize {
    evidence.iter().filter(|e| e.kind == kind).count()
}
