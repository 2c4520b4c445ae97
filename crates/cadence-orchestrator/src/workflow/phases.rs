//! Phase catalogue and workflow definitions.

use crate::agents::AgentRole;
use crate::dag::{Subtask, SubtaskGraph};
use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Fixed phase identifier.
pub type PhaseId = u8;

/// How a phase obtains its subtasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PhaseWork {
    /// A fixed subtask graph.
    Static {
        /// The subtasks.
        subtasks: Vec<Subtask>,
    },
    /// One subtask per work item produced by an earlier phase.
    FanOut {
        /// Role of every generated subtask.
        role: AgentRole,
        /// Phase whose Decomposer output supplies the items.
        source: PhaseId,
    },
}

/// One stage of the workflow. Static configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    /// Identifier.
    pub id: PhaseId,
    /// Human name.
    pub name: String,
    /// What the phase is meant to achieve.
    pub objective: String,
    /// How subtasks are produced.
    pub work: PhaseWork,
    /// Earlier phase to return to when this phase fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_to: Option<PhaseId>,
}

impl Phase {
    fn fixed(id: PhaseId, name: &str, objective: &str, subtasks: Vec<Subtask>) -> Self {
        Self {
            id,
            name: name.to_string(),
            objective: objective.to_string(),
            work: PhaseWork::Static { subtasks },
            retry_to: None,
        }
    }

    fn retry_to(mut self, phase: PhaseId) -> Self {
        self.retry_to = Some(phase);
        self
    }
}

/// An ordered set of phases with retry edges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Phases in execution order.
    pub phases: Vec<Phase>,
}

impl WorkflowDefinition {
    /// The twelve-phase UnifiedWorkflow.
    #[must_use]
    pub fn unified() -> Self {
        use AgentRole::{
            Analyst, Decomposer, Documenter, Integrator, Reporter, Researcher, Reviewer,
            Strategist, Tester, Validator,
        };

        let phases = vec![
            Phase::fixed(
                0,
                "Request Analysis",
                "Understand the request: goals, constraints and acceptance criteria",
                vec![Subtask::new("analyze", Analyst, "Analyze the request and state acceptance criteria")],
            ),
            Phase::fixed(
                1,
                "Research",
                "Collect the knowledge the solution depends on",
                vec![
                    Subtask::new("domain", Researcher, "Research the problem domain"),
                    Subtask::new("prior_art", Researcher, "Survey existing solutions and prior art"),
                    Subtask::new("constraints", Analyst, "Identify technical and operational constraints"),
                ],
            ),
            Phase::fixed(
                2,
                "Strategic Planning",
                "Choose an approach",
                vec![Subtask::new("strategy", Strategist, "Propose the overall approach and trade-offs")],
            ),
            Phase::fixed(
                3,
                "Task Decomposition",
                "Split the approach into independent work items",
                vec![Subtask::new("breakdown", Decomposer, "List independent work items")],
            ),
            Phase {
                id: 4,
                name: "Parallel Execution".to_string(),
                objective: "Carry out every work item".to_string(),
                work: PhaseWork::FanOut { role: AgentRole::Implementer, source: 3 },
                retry_to: None,
            },
            Phase::fixed(
                5,
                "Integration",
                "Merge the work item results",
                vec![Subtask::new("integrate", Integrator, "Integrate the implemented work items")],
            )
            .retry_to(4),
            Phase::fixed(
                6,
                "Testing",
                "Exercise the integrated result",
                vec![
                    Subtask::new("unit", Tester, "Test individual components"),
                    Subtask::new("integration", Tester, "Test the components together"),
                    Subtask::new("report", Tester, "Summarize test results")
                        .after("unit")
                        .after("integration"),
                ],
            )
            .retry_to(1),
            Phase::fixed(
                7,
                "Validation",
                "Confirm the result satisfies the original request",
                vec![Subtask::new("validate", Validator, "Validate against the acceptance criteria")],
            )
            .retry_to(4),
            Phase::fixed(
                8,
                "Quality Review",
                "Review quality and security",
                vec![
                    Subtask::new("quality", Reviewer, "Review code quality and maintainability"),
                    Subtask::new("security", Reviewer, "Review security"),
                ],
            )
            .retry_to(4),
            Phase::fixed(
                9,
                "Documentation",
                "Document the result",
                vec![Subtask::new("docs", Documenter, "Write user and developer documentation")],
            ),
            Phase::fixed(
                10,
                "Delivery",
                "Package the result for hand-off",
                vec![Subtask::new("package", Integrator, "Assemble the final deliverable")],
            ),
            Phase::fixed(
                11,
                "Retrospective",
                "Summarize the run",
                vec![Subtask::new("summary", Reporter, "Summarize what was delivered and learned")],
            ),
        ];
        Self { phases }
    }

    /// Checks ordering, retry edges and subtask graphs.
    ///
    /// # Errors
    /// Returns `ConfigurationError::InvalidWorkflow` describing the first problem.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.phases.is_empty() {
            return Err(ConfigurationError::InvalidWorkflow("no phases".to_string()));
        }

        let mut seen = HashSet::new();
        let mut previous: Option<PhaseId> = None;
        for phase in &self.phases {
            if previous.is_some_and(|p| phase.id <= p) {
                return Err(ConfigurationError::InvalidWorkflow(format!(
                    "phase ids must be strictly increasing (phase {})",
                    phase.id
                )));
            }
            previous = Some(phase.id);

            if let Some(target) = phase.retry_to {
                if target >= phase.id || !seen.contains(&target) {
                    return Err(ConfigurationError::InvalidWorkflow(format!(
                        "phase {} retries to {target}, which is not an earlier phase",
                        phase.id
                    )));
                }
            }

            match &phase.work {
                PhaseWork::Static { subtasks } => {
                    SubtaskGraph::new(subtasks.clone()).map_err(|e| {
                        ConfigurationError::InvalidWorkflow(format!("phase {}: {e}", phase.id))
                    })?;
                }
                PhaseWork::FanOut { source, .. } => {
                    if !seen.contains(source) {
                        return Err(ConfigurationError::InvalidWorkflow(format!(
                            "phase {} fans out from {source}, which is not an earlier phase",
                            phase.id
                        )));
                    }
                }
            }
            seen.insert(phase.id);
        }
        Ok(())
    }

    /// Position of a phase in execution order.
    pub fn position(&self, id: PhaseId) -> Option<usize> {
        self.phases.iter().position(|p| p.id == id)
    }

    /// Looks up a phase.
    pub fn phase(&self, id: PhaseId) -> Option<&Phase> {
        self.phases.iter().find(|p| p.id == id)
    }
}

impl Default for WorkflowDefinition {
    fn default() -> Self {
        Self::unified()
    }
}
