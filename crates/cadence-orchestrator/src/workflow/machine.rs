//! The phase state machine.
//!
//! Phases are walked iteratively. A successful or skipped phase advances to
//! the next one; a failed phase with a retry edge returns to the edge target
//! while the run's iteration budget allows; every other failure is terminal.
//! Failures caused purely by unreachable providers are re-run in place first.

use super::observer::{PhaseTransition, WorkflowObserver};
use super::phases::{PhaseId, PhaseWork, WorkflowDefinition};
use super::types::{PhaseResult, PhaseStatus, RunStatus, SubtaskStatus, WorkflowRun};
use crate::coordinator::{PhaseContext, StreamCoordinator};
use crate::error::{PhaseError, WorkflowError};
use crate::evidence::{Evidence, EvidenceKind};
use crate::recovery::ErrorRecoveryManager;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const FEEDBACK_REASONS: usize = 3;

/// Drives a workflow definition to completion.
pub struct PhaseStateMachine {
    definition: Arc<WorkflowDefinition>,
    coordinator: StreamCoordinator,
    recovery: Arc<ErrorRecoveryManager>,
    observer: Arc<dyn WorkflowObserver>,
    max_iterations: u32,
}

impl std::fmt::Debug for PhaseStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhaseStateMachine")
            .field("phases", &self.definition.phases.len())
            .field("max_iterations", &self.max_iterations)
            .finish_non_exhaustive()
    }
}

/// What to do after a phase finished.
enum Next {
    Advance,
    RerunInPlace(std::time::Duration),
    ReturnTo(PhaseId),
    Finish(RunStatus, Option<WorkflowError>),
}

impl PhaseStateMachine {
    /// Creates a state machine.
    pub fn new(
        definition: Arc<WorkflowDefinition>,
        coordinator: StreamCoordinator,
        recovery: Arc<ErrorRecoveryManager>,
        observer: Arc<dyn WorkflowObserver>,
        max_iterations: u32,
    ) -> Self {
        Self { definition, coordinator, recovery, observer, max_iterations: max_iterations.max(1) }
    }

    /// The coordinator phases run on.
    pub fn coordinator(&self) -> &StreamCoordinator {
        &self.coordinator
    }

    /// Runs every phase for `prompt` and returns the terminal run.
    pub async fn run(&self, prompt: &str, cancel: &CancellationToken) -> WorkflowRun {
        let mut run = WorkflowRun::new(prompt);
        info!(
            run_id = %run.id,
            phases = self.definition.phases.len(),
            max_iterations = self.max_iterations,
            "Starting workflow run"
        );

        let mut position = 0;
        let mut attempts: HashMap<PhaseId, u32> = HashMap::new();
        let mut outputs: BTreeMap<PhaseId, (String, String)> = BTreeMap::new();
        let mut work_items: HashMap<PhaseId, Vec<String>> = HashMap::new();
        let mut feedback: Option<(PhaseId, String)> = None;
        let mut infrastructure_retries = 0;

        while let Some(phase) = self.definition.phases.get(position) {
            if cancel.is_cancelled() {
                run.finish(RunStatus::Cancelled, Some(WorkflowError::Cancelled));
                break;
            }

            let attempt = {
                let count = attempts.entry(phase.id).or_insert(0);
                *count += 1;
                *count
            };
            let mut started = PhaseResult::pending(phase.id, phase.name.clone());
            started.status = PhaseStatus::Running;
            started.attempt = attempt;
            started.iteration = run.iterations;
            self.notify(&run, &started);

            let context = PhaseContext {
                request: run.prompt.clone(),
                prior_phases: outputs
                    .range(..phase.id)
                    .map(|(_, (name, text))| (name.clone(), text.clone()))
                    .collect(),
                work_items: match &phase.work {
                    PhaseWork::FanOut { source, .. } => work_items.get(source).cloned().unwrap_or_default(),
                    PhaseWork::Static { .. } => Vec::new(),
                },
                feedback: feedback.as_ref().map(|(_, text)| text.clone()),
            };

            debug!(run_id = %run.id, phase = phase.id, attempt, iteration = run.iterations, "Entering phase");
            let mut result = self.coordinator.execute(phase, &context, cancel).await;
            result.attempt = attempt;
            result.iteration = run.iterations;

            let next = match result.status {
                PhaseStatus::Succeeded | PhaseStatus::Skipped => {
                    infrastructure_retries = 0;
                    if result.status == PhaseStatus::Succeeded {
                        outputs.insert(phase.id, (phase.name.clone(), result.merged_output()));
                        work_items.insert(phase.id, result.work_items());
                    }
                    if feedback.as_ref().is_some_and(|(origin, _)| *origin == phase.id) {
                        feedback = None;
                    }
                    Next::Advance
                }
                _ if cancel.is_cancelled() || matches!(result.error, Some(PhaseError::Cancelled(_))) => {
                    Next::Finish(RunStatus::Cancelled, Some(WorkflowError::Cancelled))
                }
                _ if is_infrastructure_failure(&result) => {
                    match self.recovery.infrastructure_retry(infrastructure_retries) {
                        Some(delay) => {
                            infrastructure_retries += 1;
                            warn!(
                                run_id = %run.id,
                                phase = phase.id,
                                retry = infrastructure_retries,
                                delay_ms = delay.as_millis() as u64,
                                "Providers unreachable, re-running phase"
                            );
                            result.evidence.push(Evidence::new(
                                EvidenceKind::InfrastructureRetry,
                                format!(
                                    "re-running phase {} in place ({infrastructure_retries}) after {}ms",
                                    phase.id,
                                    delay.as_millis()
                                ),
                            ));
                            Next::RerunInPlace(delay)
                        }
                        None => Next::Finish(
                            RunStatus::Failed,
                            Some(WorkflowError::InfrastructureUnavailable {
                                phase: phase.id,
                                name: phase.name.clone(),
                                attempts: infrastructure_retries + 1,
                            }),
                        ),
                    }
                }
                _ => {
                    infrastructure_retries = 0;
                    let validation_failures =
                        result.failures().filter(|e| e.is_validation()).count();
                    for _ in 0..validation_failures {
                        self.recovery.record_validation_failure();
                    }

                    match phase.retry_to {
                        Some(target) if run.iterations < self.max_iterations => {
                            let failed_iteration = run.iterations;
                            run.iterations += 1;
                            let reason = failure_summary(&result);
                            result.evidence.push(Evidence::new(
                                EvidenceKind::PhaseRetry,
                                format!(
                                    "phase {} failed, returning to phase {target} (iteration {}/{}): {reason}",
                                    phase.id, run.iterations, self.max_iterations
                                ),
                            ));
                            // Retry prompts must never repeat an earlier pass's prompts.
                            feedback = Some((
                                phase.id,
                                format!("{} failed on iteration {failed_iteration}: {reason}", phase.name),
                            ));
                            Next::ReturnTo(target)
                        }
                        Some(_) => Next::Finish(
                            RunStatus::Failed,
                            Some(WorkflowError::RetriesExhausted {
                                phase: phase.id,
                                name: phase.name.clone(),
                                iterations: run.iterations,
                            }),
                        ),
                        None => Next::Finish(
                            RunStatus::Failed,
                            Some(WorkflowError::PhaseFailed {
                                phase: phase.id,
                                name: phase.name.clone(),
                                reason: failure_summary(&result),
                            }),
                        ),
                    }
                }
            };

            self.notify(&run, &result);
            run.phases.push(result);

            match next {
                Next::Advance => position += 1,
                Next::RerunInPlace(delay) => {
                    tokio::select! {
                        () = cancel.cancelled() => {}
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Next::ReturnTo(target) => match self.definition.position(target) {
                    Some(index) => {
                        info!(run_id = %run.id, from = phase.id, to = target, iteration = run.iterations, "Returning to earlier phase");
                        position = index;
                    }
                    None => {
                        error!(run_id = %run.id, phase = target, "Retry target is not part of the workflow");
                        run.finish(
                            RunStatus::Failed,
                            Some(WorkflowError::PhaseFailed {
                                phase: phase.id,
                                name: phase.name.clone(),
                                reason: format!("unknown retry target {target}"),
                            }),
                        );
                        break;
                    }
                },
                Next::Finish(status, error) => {
                    run.finish(status, error);
                    break;
                }
            }
        }

        if !run.status.is_terminal() {
            if cancel.is_cancelled() {
                run.finish(RunStatus::Cancelled, Some(WorkflowError::Cancelled));
            } else {
                run.finish(RunStatus::Succeeded, None);
            }
        }
        run.peak_parallel_agents = self.coordinator.tracker().peak();
        run.recovery = self.recovery.stats();

        match &run.error {
            None => info!(run_id = %run.id, phases = run.phases.len(), iterations = run.iterations, "Workflow succeeded"),
            Some(e) => warn!(run_id = %run.id, status = ?run.status, error = %e, "Workflow did not succeed"),
        }
        run
    }

    fn notify(&self, run: &WorkflowRun, result: &PhaseResult) {
        self.observer.on_phase_transition(&PhaseTransition {
            run_id: run.id,
            phase: result.phase,
            name: result.name.clone(),
            status: result.status,
            attempt: result.attempt,
            iteration: result.iteration,
            evidence: result.evidence.clone(),
        });
    }
}

/// Every failed subtask failed because no provider could serve it.
fn is_infrastructure_failure(result: &PhaseResult) -> bool {
    let mut failed = result.streams.iter().filter(|s| s.status == SubtaskStatus::Failed).peekable();
    failed.peek().is_some()
        && failed.all(|s| s.error.as_ref().is_some_and(|e| e.is_infrastructure()))
}

fn failure_summary(result: &PhaseResult) -> String {
    let reasons: Vec<String> = result
        .streams
        .iter()
        .filter(|s| s.status == SubtaskStatus::Failed)
        .filter_map(|s| s.error.as_ref().map(|e| format!("{}: {e}", s.subtask)))
        .take(FEEDBACK_REASONS)
        .collect();
    if reasons.is_empty() {
        result.error.as_ref().map_or_else(|| "phase failed".to_string(), ToString::to_string)
    } else {
        reasons.join("; ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{AgentRole, RoleRegistry};
    use crate::config::{CoordinatorConfig, OrchestratorConfig, RecoveryConfig};
    use crate::dag::Subtask;
    use crate::providers::{LoadBalancer, ProviderRegistry};
    use crate::workflow::{ChannelObserver, NoopObserver, Phase};
    use cadence_abstraction::{ProviderAdapter, ProviderError};
    use cadence_models::{MockProvider, ProviderConfig, ProviderKind};

    fn machine(
        mock: Arc<MockProvider>,
        definition: WorkflowDefinition,
        max_iterations: u32,
        observer: Arc<dyn WorkflowObserver>,
    ) -> PhaseStateMachine {
        let mut config = OrchestratorConfig::with_providers(vec![ProviderConfig::new(
            mock.name(),
            ProviderKind::Mock,
        )]);
        config.recovery = RecoveryConfig { backoff_base_ms: 10, backoff_max_ms: 40, ..config.recovery };
        let adapters: Vec<Arc<dyn ProviderAdapter>> = vec![mock];
        let registry = Arc::new(ProviderRegistry::with_adapters(&config, adapters).unwrap());
        let recovery = Arc::new(ErrorRecoveryManager::new(config.recovery));
        let balancer = Arc::new(LoadBalancer::new(registry, Arc::clone(&recovery)));
        let coordinator =
            StreamCoordinator::new(Arc::new(RoleRegistry::standard()), balancer, CoordinatorConfig::default());
        PhaseStateMachine::new(Arc::new(definition), coordinator, recovery, observer, max_iterations)
    }

    fn two_phase_definition() -> WorkflowDefinition {
        WorkflowDefinition {
            phases: vec![
                Phase {
                    id: 0,
                    name: "Build".to_string(),
                    objective: "build".to_string(),
                    work: PhaseWork::Static {
                        subtasks: vec![Subtask::new("build", AgentRole::Implementer, "build it")],
                    },
                    retry_to: None,
                },
                Phase {
                    id: 1,
                    name: "Check".to_string(),
                    objective: "check".to_string(),
                    work: PhaseWork::Static {
                        subtasks: vec![Subtask::new("check", AgentRole::Validator, "check it")],
                    },
                    retry_to: Some(0),
                },
            ],
        }
    }

    #[tokio::test]
    async fn test_all_phases_succeed() {
        let mock = Arc::new(MockProvider::new("a"));
        let machine = machine(mock, two_phase_definition(), 3, Arc::new(NoopObserver));
        let run = machine.run("do it", &CancellationToken::new()).await;
        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.phases.len(), 2);
        assert_eq!(run.iterations, 1);
        assert!(run.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_failed_gate_returns_to_target_then_passes() {
        // Fails until the prompt carries feedback from the earlier rejection.
        let mock = Arc::new(MockProvider::new("a").with_responder(|req| {
            let first = req.prompt.lines().next().unwrap_or_default();
            if first.starts_with("Validator") && !req.prompt.contains("sent back") {
                Ok("VERDICT: FAIL".to_string())
            } else {
                Ok("VERDICT: PASS".to_string())
            }
        }));
        let machine = machine(mock, two_phase_definition(), 3, Arc::new(NoopObserver));
        let run = machine.run("do it", &CancellationToken::new()).await;

        assert_eq!(run.status, RunStatus::Succeeded);
        let ids: Vec<PhaseId> = run.phases.iter().map(|p| p.phase).collect();
        assert_eq!(ids, vec![0, 1, 0, 1]);
        assert_eq!(run.iterations, 2);
        assert_eq!(run.results_for(1)[1].attempt, 2);
        assert_eq!(run.recovery.validation, 1);
    }

    #[tokio::test]
    async fn test_iteration_budget_is_enforced() {
        let mock = Arc::new(MockProvider::new("a").with_rule("Validator", "VERDICT: FAIL"));
        let machine = machine(mock, two_phase_definition(), 2, Arc::new(NoopObserver));
        let run = machine.run("do it", &CancellationToken::new()).await;

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.results_for(1).len(), 2);
        assert_eq!(
            run.error,
            Some(WorkflowError::RetriesExhausted { phase: 1, name: "Check".to_string(), iterations: 2 })
        );
    }

    #[tokio::test]
    async fn test_phase_without_retry_edge_fails_run() {
        let mock = Arc::new(MockProvider::new("a").with_rule("Implementer", ""));
        let machine = machine(mock, two_phase_definition(), 3, Arc::new(NoopObserver));
        let run = machine.run("do it", &CancellationToken::new()).await;
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.phases.len(), 1);
        assert!(matches!(run.error, Some(WorkflowError::PhaseFailed { phase: 0, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_providers_rerun_in_place() {
        let mock = Arc::new(MockProvider::failing(
            "a",
            ProviderError::Unavailable { provider: "a".to_string(), message: "down".to_string() },
        ));
        let machine = machine(mock, two_phase_definition(), 3, Arc::new(NoopObserver));
        let run = machine.run("do it", &CancellationToken::new()).await;

        assert_eq!(run.status, RunStatus::Failed);
        let retries = RecoveryConfig::default().max_infrastructure_retries;
        assert_eq!(run.results_for(0).len(), retries as usize + 1);
        assert_eq!(run.iterations, 1);
        assert!(matches!(
            run.error,
            Some(WorkflowError::InfrastructureUnavailable { phase: 0, attempts, .. }) if attempts == retries + 1
        ));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let machine = machine(Arc::new(MockProvider::new("a")), two_phase_definition(), 3, Arc::new(NoopObserver));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let run = machine.run("do it", &cancel).await;
        assert_eq!(run.status, RunStatus::Cancelled);
        assert!(run.phases.is_empty());
        assert_eq!(run.error, Some(WorkflowError::Cancelled));
    }

    #[tokio::test]
    async fn test_observer_sees_running_and_final_status() {
        let (observer, mut rx) = ChannelObserver::channel(16);
        let machine = machine(Arc::new(MockProvider::new("a")), two_phase_definition(), 3, Arc::new(observer));
        machine.run("do it", &CancellationToken::new()).await;

        let mut seen = Vec::new();
        while let Ok(t) = rx.try_recv() {
            seen.push((t.phase, t.status));
        }
        assert_eq!(
            seen,
            vec![
                (0, PhaseStatus::Running),
                (0, PhaseStatus::Succeeded),
                (1, PhaseStatus::Running),
                (1, PhaseStatus::Succeeded),
            ]
        );
    }
}
