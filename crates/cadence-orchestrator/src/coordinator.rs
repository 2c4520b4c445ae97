//! Parallel subtask execution for one phase.
//!
//! The coordinator turns a phase's declared work into a subtask graph and
//! runs it as a dynamic DAG: every subtask whose dependencies have completed
//! is spawned at once, a semaphore caps how many agents execute, and
//! dependents are launched as their prerequisites finish. A failed subtask
//! blocks its dependents but never aborts its siblings.

use crate::agents::{Agent, AgentInput, AgentReport, AgentTracker, RoleRegistry};
use crate::config::CoordinatorConfig;
use crate::dag::{Subtask, SubtaskGraph};
use crate::error::{DispatchError, PhaseError, SubtaskError};
use crate::evidence::{Evidence, EvidenceKind};
use crate::providers::LoadBalancer;
use crate::workflow::{Phase, PhaseResult, PhaseStatus, PhaseWork, StreamResult, SubtaskStatus};
use chrono::Utc;
use futures::FutureExt;
use petgraph::graph::NodeIndex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Inputs a phase receives from the run so far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhaseContext {
    /// The prompt the workflow was started with.
    pub request: String,
    /// Merged outputs of earlier phases, as (phase name, text).
    pub prior_phases: Vec<(String, String)>,
    /// Work items for fan-out phases.
    pub work_items: Vec<String>,
    /// Why the run returned to an earlier phase, if it did.
    pub feedback: Option<String>,
}

impl PhaseContext {
    /// Context for the first phase of a run.
    pub fn new(request: impl Into<String>) -> Self {
        Self { request: request.into(), ..Self::default() }
    }
}

enum TaskOutcome {
    Finished(AgentReport),
    NotStarted,
    Panicked(String),
}

/// Runs a phase's subtasks with bounded parallelism.
#[derive(Debug, Clone)]
pub struct StreamCoordinator {
    roles: Arc<RoleRegistry>,
    balancer: Arc<LoadBalancer>,
    tracker: Arc<AgentTracker>,
    max_parallel_agents: usize,
    min_success_ratio: f64,
}

impl StreamCoordinator {
    /// Creates a coordinator.
    #[must_use]
    pub fn new(roles: Arc<RoleRegistry>, balancer: Arc<LoadBalancer>, config: CoordinatorConfig) -> Self {
        Self {
            roles,
            balancer,
            tracker: Arc::new(AgentTracker::new()),
            max_parallel_agents: config.max_parallel_agents.max(1),
            min_success_ratio: config.min_success_ratio,
        }
    }

    /// Overrides the parallelism ceiling.
    #[must_use]
    pub fn with_max_parallel_agents(mut self, max: usize) -> Self {
        self.max_parallel_agents = max.max(1);
        self
    }

    /// Counts of executing agents across every phase this coordinator ran.
    pub fn tracker(&self) -> &Arc<AgentTracker> {
        &self.tracker
    }

    /// The balancer agents dispatch through.
    pub fn balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }

    /// Produces the subtasks for a phase.
    pub fn plan(phase: &Phase, context: &PhaseContext) -> Vec<Subtask> {
        match &phase.work {
            PhaseWork::Static { subtasks } => subtasks.clone(),
            PhaseWork::FanOut { role, .. } => context
                .work_items
                .iter()
                .enumerate()
                .map(|(i, item)| Subtask::new(format!("item-{}", i + 1), *role, item.clone()))
                .collect(),
        }
    }

    /// Executes a phase.
    pub async fn execute(
        &self,
        phase: &Phase,
        context: &PhaseContext,
        cancel: &CancellationToken,
    ) -> PhaseResult {
        self.execute_subtasks(phase, Self::plan(phase, context), context, cancel).await
    }

    /// Executes an explicit set of subtasks on behalf of a phase.
    pub async fn execute_subtasks(
        &self,
        phase: &Phase,
        subtasks: Vec<Subtask>,
        context: &PhaseContext,
        cancel: &CancellationToken,
    ) -> PhaseResult {
        let started = Instant::now();
        let mut result = PhaseResult::pending(phase.id, phase.name.clone());
        result.status = PhaseStatus::Running;

        let graph = match SubtaskGraph::new(subtasks) {
            Ok(graph) => graph,
            Err(e) => {
                error!(phase = phase.id, error = %e, "Invalid subtask plan");
                result.status = PhaseStatus::Failed;
                result.error = Some(PhaseError::InvalidPlan { phase: phase.id, reason: e.to_string() });
                result.duration_ms = started.elapsed().as_millis() as u64;
                return result;
            }
        };

        if graph.is_empty() {
            debug!(phase = phase.id, "No subtasks, skipping phase");
            result.status = PhaseStatus::Skipped;
            return result;
        }

        info!(
            phase = phase.id,
            name = %phase.name,
            subtasks = graph.len(),
            max_parallel = self.max_parallel_agents,
            "Executing phase"
        );
        debug!(phase = phase.id, order = ?graph.topological_keys(), "Subtask dependency order");

        let semaphore = Arc::new(Semaphore::new(self.max_parallel_agents));
        let mut state = Schedule::new(&graph);
        let mut tasks: JoinSet<(NodeIndex, TaskOutcome)> = JoinSet::new();

        loop {
            while let Some(node) = state.ready.pop_front() {
                let subtask = graph.subtask(node).clone();
                if cancel.is_cancelled() {
                    state.record_unrun(node, SubtaskStatus::Cancelled, SubtaskError::Cancelled);
                    continue;
                }
                let Some(handler) = self.roles.get(subtask.role) else {
                    let error = SubtaskError::NoHandler(subtask.role.to_string());
                    state.record_failure(node, None, error, 0);
                    continue;
                };

                let input = AgentInput {
                    request: context.request.clone(),
                    phase: phase.id,
                    phase_name: phase.name.clone(),
                    objective: phase.objective.clone(),
                    dependency_outputs: state.dependency_outputs(node),
                    prior_phases: context.prior_phases.clone(),
                    feedback: context.feedback.clone(),
                    subtask,
                };

                debug!(phase = phase.id, subtask = %input.subtask.key, role = %input.subtask.role, "Launching subtask");
                let semaphore = Arc::clone(&semaphore);
                let balancer = Arc::clone(&self.balancer);
                let tracker = Arc::clone(&self.tracker);
                let cancel = cancel.clone();
                tasks.spawn(async move {
                    let permit = tokio::select! {
                        () = cancel.cancelled() => None,
                        permit = semaphore.acquire_owned() => permit.ok(),
                    };
                    let Some(_permit) = permit else {
                        return (node, TaskOutcome::NotStarted);
                    };

                    let agent = Agent::new(input.subtask.role);
                    let run = agent.execute(handler.as_ref(), &input, &balancer, &tracker, &cancel);
                    match AssertUnwindSafe(run).catch_unwind().await {
                        Ok(report) => (node, TaskOutcome::Finished(report)),
                        Err(panic) => {
                            let message = panic
                                .downcast_ref::<&str>()
                                .map(ToString::to_string)
                                .or_else(|| panic.downcast_ref::<String>().cloned())
                                .unwrap_or_else(|| "agent panicked".to_string());
                            (node, TaskOutcome::Panicked(message))
                        }
                    }
                });
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            match joined {
                Ok((node, TaskOutcome::Finished(report))) => state.record_report(node, report),
                Ok((node, TaskOutcome::NotStarted)) => {
                    state.record_unrun(node, SubtaskStatus::Cancelled, SubtaskError::Cancelled);
                }
                Ok((node, TaskOutcome::Panicked(message))) => {
                    state.record_failure(node, None, SubtaskError::Aborted(message), 0);
                }
                Err(e) => error!(phase = phase.id, error = %e, "Agent task failed to join"),
            }
        }

        state.settle_remaining(cancel.is_cancelled());

        let total = graph.len();
        let succeeded = state.streams.iter().filter(|s| s.succeeded()).count();
        result.streams = state.streams;
        result.evidence = state.evidence;
        result.duration_ms = started.elapsed().as_millis() as u64;

        if cancel.is_cancelled() && succeeded < total {
            result.status = PhaseStatus::Failed;
            result.error = Some(PhaseError::Cancelled(phase.id));
        } else if succeeded as f64 >= self.min_success_ratio.mul_add(total as f64, -1e-9) {
            result.status = PhaseStatus::Succeeded;
        } else {
            result.status = PhaseStatus::Failed;
            result.error = Some(PhaseError::InsufficientSuccess {
                phase: phase.id,
                succeeded,
                total,
                required_ratio: self.min_success_ratio,
            });
        }

        info!(
            phase = phase.id,
            status = ?result.status,
            succeeded,
            total,
            agents_started = self.tracker.started(),
            duration_ms = result.duration_ms,
            "Phase finished"
        );
        result
    }
}

/// Scheduling bookkeeping for one phase execution.
struct Schedule<'g> {
    graph: &'g SubtaskGraph,
    pending_deps: HashMap<NodeIndex, usize>,
    outputs: HashMap<NodeIndex, String>,
    settled: HashSet<NodeIndex>,
    ready: VecDeque<NodeIndex>,
    streams: Vec<StreamResult>,
    evidence: Vec<Evidence>,
}

impl<'g> Schedule<'g> {
    fn new(graph: &'g SubtaskGraph) -> Self {
        Self {
            graph,
            pending_deps: graph.nodes().map(|n| (n, graph.dependency_count(n))).collect(),
            outputs: HashMap::new(),
            settled: HashSet::new(),
            ready: graph.roots().into(),
            streams: Vec::with_capacity(graph.len()),
            evidence: Vec::new(),
        }
    }

    fn dependency_outputs(&self, node: NodeIndex) -> Vec<(String, String)> {
        let mut outputs: Vec<(String, String)> = self
            .graph
            .dependencies(node)
            .into_iter()
            .filter_map(|d| {
                self.outputs.get(&d).map(|text| (self.graph.subtask(d).key.clone(), text.clone()))
            })
            .collect();
        outputs.sort();
        outputs
    }

    fn record_report(&mut self, node: NodeIndex, report: AgentReport) {
        self.evidence.extend(report.evidence);
        let duration_ms = report.duration.as_millis() as u64;
        match report.result {
            Ok(output) => {
                let key = self.graph.subtask(node).key.clone();
                self.evidence.push(
                    Evidence::new(EvidenceKind::SubtaskSucceeded, format!("{} completed", report.role))
                        .with_provider(output.provider.clone())
                        .with_subtask(key.clone()),
                );
                if let Some(verdict) = output.verdict {
                    self.evidence.push(
                        Evidence::new(EvidenceKind::Verdict, format!("{verdict:?}")).with_subtask(key.clone()),
                    );
                }
                self.outputs.insert(node, output.text.clone());
                self.settled.insert(node);
                self.streams.push(StreamResult {
                    subtask: key,
                    role: report.role,
                    agent_id: Some(report.agent_id),
                    status: SubtaskStatus::Succeeded,
                    output: Some(output),
                    error: None,
                    duration_ms,
                    completed_at: Utc::now(),
                });

                for dependent in self.graph.dependents(node) {
                    if let Some(count) = self.pending_deps.get_mut(&dependent) {
                        *count = count.saturating_sub(1);
                        if *count == 0 && !self.settled.contains(&dependent) {
                            self.ready.push_back(dependent);
                        }
                    }
                }
            }
            Err(SubtaskError::Cancelled | SubtaskError::Dispatch(DispatchError::Cancelled)) => {
                self.record_unrun(node, SubtaskStatus::Cancelled, SubtaskError::Cancelled);
            }
            Err(error) => self.record_failure(node, Some(report.agent_id), error, duration_ms),
        }
    }

    fn record_failure(
        &mut self,
        node: NodeIndex,
        agent_id: Option<Uuid>,
        error: SubtaskError,
        duration_ms: u64,
    ) {
        let subtask = self.graph.subtask(node);
        warn!(subtask = %subtask.key, error = %error, "Subtask failed");
        self.evidence.push(
            Evidence::new(EvidenceKind::SubtaskFailed, error.to_string()).with_subtask(subtask.key.clone()),
        );
        self.settled.insert(node);
        self.streams.push(StreamResult {
            subtask: subtask.key.clone(),
            role: subtask.role,
            agent_id,
            status: SubtaskStatus::Failed,
            output: None,
            error: Some(error),
            duration_ms,
            completed_at: Utc::now(),
        });
        self.block_dependents(node);
    }

    fn record_unrun(&mut self, node: NodeIndex, status: SubtaskStatus, error: SubtaskError) {
        if !self.settled.insert(node) {
            return;
        }
        let subtask = self.graph.subtask(node);
        let kind = if status == SubtaskStatus::Blocked {
            EvidenceKind::SubtaskBlocked
        } else {
            EvidenceKind::Cancelled
        };
        self.evidence.push(Evidence::new(kind, error.to_string()).with_subtask(subtask.key.clone()));
        self.streams.push(StreamResult {
            subtask: subtask.key.clone(),
            role: subtask.role,
            agent_id: None,
            status,
            output: None,
            error: Some(error),
            duration_ms: 0,
            completed_at: Utc::now(),
        });
    }

    fn block_dependents(&mut self, node: NodeIndex) {
        let blocker = self.graph.subtask(node).key.clone();
        for dependent in self.graph.transitive_dependents(node) {
            self.record_unrun(dependent, SubtaskStatus::Blocked, SubtaskError::Blocked(blocker.clone()));
        }
    }

    fn settle_remaining(&mut self, cancelled: bool) {
        let unsettled: Vec<NodeIndex> =
            self.graph.nodes().filter(|n| !self.settled.contains(n)).collect();
        for node in unsettled {
            if cancelled {
                self.record_unrun(node, SubtaskStatus::Cancelled, SubtaskError::Cancelled);
            } else {
                self.record_failure(node, None, SubtaskError::Aborted("agent task lost".to_string()), 0);
            }
        }
    }
}
