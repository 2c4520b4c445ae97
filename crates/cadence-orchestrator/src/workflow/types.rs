//! Run and result types returned to callers.

use super::phases::PhaseId;
use crate::agents::{AgentRole, RoleOutput};
use crate::error::{PhaseError, SubtaskError, WorkflowError};
use crate::evidence::Evidence;
use crate::recovery::RecoveryStats;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Still executing.
    Running,
    /// Every phase completed.
    Succeeded,
    /// A phase failed for good.
    Failed,
    /// Cancelled by the caller.
    Cancelled,
}

impl RunStatus {
    /// Whether the run has finished.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Status of one phase execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    /// Not started.
    Pending,
    /// In progress.
    Running,
    /// Enough subtasks succeeded.
    Succeeded,
    /// Too many subtasks failed, or the run was cancelled.
    Failed,
    /// Nothing to do.
    Skipped,
}

/// Outcome of one subtask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    /// The agent finished successfully.
    Succeeded,
    /// The agent failed.
    Failed,
    /// Never ran because a dependency failed.
    Blocked,
    /// Never ran or was interrupted by cancellation.
    Cancelled,
}

/// Result of one subtask's agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamResult {
    /// Subtask key.
    pub subtask: String,
    /// Role that ran it.
    pub role: AgentRole,
    /// Agent instance id; absent when no agent ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<Uuid>,
    /// Outcome.
    pub status: SubtaskStatus,
    /// Output on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<RoleOutput>,
    /// Error on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SubtaskError>,
    /// Execution time in milliseconds.
    pub duration_ms: u64,
    /// When the result was recorded.
    pub completed_at: DateTime<Utc>,
}

impl StreamResult {
    /// Whether the subtask succeeded.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.status == SubtaskStatus::Succeeded
    }
}

/// Result of one execution of one phase.
///
/// A phase executed several times in a run gets one `PhaseResult` per
/// execution; earlier ones are kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseResult {
    /// Phase id.
    pub phase: PhaseId,
    /// Phase name.
    pub name: String,
    /// Execution number of this phase within the run, from 1.
    pub attempt: u32,
    /// Workflow iteration during which it ran, from 1.
    pub iteration: u32,
    /// Outcome.
    pub status: PhaseStatus,
    /// Subtask results in completion order.
    pub streams: Vec<StreamResult>,
    /// Aggregated evidence.
    pub evidence: Vec<Evidence>,
    /// Failure detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PhaseError>,
    /// When the phase started.
    pub started_at: DateTime<Utc>,
    /// Wall time in milliseconds.
    pub duration_ms: u64,
}

impl PhaseResult {
    /// A result for a phase that is about to start.
    pub fn pending(phase: PhaseId, name: impl Into<String>) -> Self {
        Self {
            phase,
            name: name.into(),
            attempt: 1,
            iteration: 1,
            status: PhaseStatus::Pending,
            streams: Vec::new(),
            evidence: Vec::new(),
            error: None,
            started_at: Utc::now(),
            duration_ms: 0,
        }
    }

    /// Number of successful subtasks.
    pub fn succeeded_count(&self) -> usize {
        self.streams.iter().filter(|s| s.succeeded()).count()
    }

    /// Errors of failed subtasks.
    pub fn failures(&self) -> impl Iterator<Item = &SubtaskError> {
        self.streams.iter().filter_map(|s| s.error.as_ref())
    }

    /// Successful outputs joined as "key: text" paragraphs, in subtask key order.
    pub fn merged_output(&self) -> String {
        let mut outputs: Vec<(&str, &str)> = self
            .streams
            .iter()
            .filter_map(|s| s.output.as_ref().map(|o| (s.subtask.as_str(), o.text.as_str())))
            .collect();
        outputs.sort_by(|a, b| a.0.cmp(b.0));
        outputs.iter().map(|(key, text)| format!("{key}: {text}")).collect::<Vec<_>>().join("\n\n")
    }

    /// Work items extracted by Decomposer subtasks.
    pub fn work_items(&self) -> Vec<String> {
        self.streams
            .iter()
            .filter_map(|s| s.output.as_ref())
            .flat_map(|o| o.work_items.iter().cloned())
            .collect()
    }
}

/// One workflow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// Run id.
    pub id: Uuid,
    /// The originating prompt.
    pub prompt: String,
    /// Phase results in execution order.
    pub phases: Vec<PhaseResult>,
    /// Overall status.
    pub status: RunStatus,
    /// Terminal error, when the run did not succeed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WorkflowError>,
    /// Iterations consumed (first pass is 1).
    pub iterations: u32,
    /// Most agents executing at once.
    pub peak_parallel_agents: usize,
    /// Failure counts by recovery category.
    pub recovery: RecoveryStats,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// End time, once terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowRun {
    /// Creates a running workflow.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            prompt: prompt.into(),
            phases: Vec::new(),
            status: RunStatus::Running,
            error: None,
            iterations: 1,
            peak_parallel_agents: 0,
            recovery: RecoveryStats::default(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Moves the run to a terminal state. Later calls are ignored.
    pub fn finish(&mut self, status: RunStatus, error: Option<WorkflowError>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
        self.error = error;
        self.finished_at = Some(Utc::now());
    }

    /// Every result recorded for a phase, oldest first.
    pub fn results_for(&self, phase: PhaseId) -> Vec<&PhaseResult> {
        self.phases.iter().filter(|p| p.phase == phase).collect()
    }

    /// Evidence of every phase in order.
    pub fn evidence(&self) -> impl Iterator<Item = &Evidence> {
        self.phases.iter().flat_map(|p| p.evidence.iter())
    }

    /// Output of the last successful phase that produced any.
    pub fn final_output(&self) -> Option<String> {
        self.phases
            .iter()
            .rev()
            .filter(|p| p.status == PhaseStatus::Succeeded)
            .map(PhaseResult::merged_output)
            .find(|s| !s.is_empty())
    }

    /// Total run time in milliseconds, once terminal.
    pub fn duration_ms(&self) -> Option<u64> {
        self.finished_at
            .map(|end| end.signed_duration_since(self.started_at).num_milliseconds().max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(key: &str, text: Option<&str>) -> StreamResult {
        StreamResult {
            subtask: key.to_string(),
            role: AgentRole::Implementer,
            agent_id: None,
            status: if text.is_some() { SubtaskStatus::Succeeded } else { SubtaskStatus::Failed },
            output: text.map(|t| RoleOutput {
                text: t.to_string(),
                provider: "a".to_string(),
                work_items: Vec::new(),
                verdict: None,
            }),
            error: text.is_none().then(|| SubtaskError::Cancelled),
            duration_ms: 0,
            completed_at: Utc::now(),
        }
    }

    #[test]
    fn test_finish_is_final() {
        let mut run = WorkflowRun::new("x");
        run.finish(RunStatus::Cancelled, Some(WorkflowError::Cancelled));
        run.finish(RunStatus::Succeeded, None);
        assert_eq!(run.status, RunStatus::Cancelled);
        assert!(run.finished_at.is_some());
        assert!(run.duration_ms().is_some());
    }

    #[test]
    fn test_merged_output_sorted_by_key() {
        let mut result = PhaseResult::pending(1, "Research");
        result.streams = vec![stream("b", Some("second")), stream("a", Some("first")), stream("c", None)];
        assert_eq!(result.merged_output(), "a: first\n\nb: second");
        assert_eq!(result.succeeded_count(), 2);
        assert_eq!(result.failures().count(), 1);
    }

    #[test]
    fn test_results_for_and_final_output() {
        let mut run = WorkflowRun::new("x");
        let mut first = PhaseResult::pending(7, "Validation");
        first.status = PhaseStatus::Failed;
        let mut second = PhaseResult::pending(7, "Validation");
        second.status = PhaseStatus::Succeeded;
        second.streams = vec![stream("validate", Some("ok"))];
        run.phases = vec![first, second];
        assert_eq!(run.results_for(7).len(), 2);
        assert_eq!(run.final_output().as_deref(), Some("validate: ok"));
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(serde_json::to_string(&RunStatus::Succeeded).unwrap(), "\"succeeded\"");
        assert_eq!(serde_json::to_string(&PhaseStatus::Skipped).unwrap(), "\"skipped\"");
    }
}
