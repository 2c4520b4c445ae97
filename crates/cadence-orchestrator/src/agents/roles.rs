//! Role handlers and the role registry.

use super::AgentRole;
use crate::dag::Subtask;
use crate::error::SubtaskError;
use crate::evidence::Evidence;
use crate::providers::LoadBalancer;
use crate::workflow::PhaseId;
use async_trait::async_trait;
use cadence_abstraction::{CompletionRequest, CompletionResponse};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const CONTEXT_EXCERPT_CHARS: usize = 600;

/// Everything an agent knows when it starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInput {
    /// The prompt the workflow was started with.
    pub request: String,
    /// Phase being executed.
    pub phase: PhaseId,
    /// Phase display name.
    pub phase_name: String,
    /// What the phase is meant to achieve.
    pub objective: String,
    /// The subtask to carry out.
    pub subtask: Subtask,
    /// Outputs of the subtask's dependencies, as (key, text).
    #[serde(default)]
    pub dependency_outputs: Vec<(String, String)>,
    /// Outputs of earlier phases, as (phase name, text).
    #[serde(default)]
    pub prior_phases: Vec<(String, String)>,
    /// Why the previous pass through this phase was sent back, if it was.
    #[serde(default)]
    pub feedback: Option<String>,
}

/// A gate verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// The work passed.
    Pass,
    /// The work failed.
    Fail,
}

/// Interpreted result of one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleOutput {
    /// The response text.
    pub text: String,
    /// Provider that produced it.
    pub provider: String,
    /// Items extracted by the Decomposer.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub work_items: Vec<String>,
    /// Verdict of a gate role.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
}

/// Serves one role: builds its requests and interprets responses.
#[async_trait]
pub trait RoleHandler: Send + Sync {
    /// The role served.
    fn role(&self) -> AgentRole;

    /// Builds the provider request for a subtask.
    fn build_request(&self, input: &AgentInput) -> CompletionRequest;

    /// Turns a provider response into a role output.
    ///
    /// # Errors
    /// Returns `SubtaskError` when the response is unusable or a gate fails.
    fn interpret(
        &self,
        input: &AgentInput,
        response: CompletionResponse,
    ) -> Result<RoleOutput, SubtaskError>;

    /// Executes the subtask. The default makes one dispatch.
    ///
    /// # Errors
    /// Returns `SubtaskError` on dispatch failure or from `interpret`.
    async fn handle(
        &self,
        input: &AgentInput,
        balancer: &LoadBalancer,
        cancel: &CancellationToken,
        evidence: &mut Vec<Evidence>,
    ) -> Result<RoleOutput, SubtaskError> {
        let request = self.build_request(input);
        let response = balancer.dispatch_with(&request, cancel, evidence).await?;
        self.interpret(input, response)
    }
}

/// The built-in handler, parameterized by role.
#[derive(Debug, Clone, Copy)]
pub struct StandardRoleHandler {
    role: AgentRole,
}

impl StandardRoleHandler {
    /// Creates a handler for `role`.
    #[must_use]
    pub fn new(role: AgentRole) -> Self {
        Self { role }
    }
}

#[async_trait]
impl RoleHandler for StandardRoleHandler {
    fn role(&self) -> AgentRole {
        self.role
    }

    fn build_request(&self, input: &AgentInput) -> CompletionRequest {
        // The first line identifies the subtask; scripted providers match on it.
        let mut prompt = format!(
            "{} | phase {} {} | {}\n\nOriginal request:\n{}\n\nObjective: {}\nTask: {}\n",
            self.role,
            input.phase,
            input.phase_name,
            input.subtask.key,
            input.request,
            input.objective,
            input.subtask.description,
        );

        if !input.dependency_outputs.is_empty() {
            prompt.push_str("\nResults from prerequisite tasks:\n");
            for (key, output) in &input.dependency_outputs {
                let _ = writeln!(prompt, "- {key}: {}", excerpt(output));
            }
        }
        if !input.prior_phases.is_empty() {
            prompt.push_str("\nContext from earlier phases:\n");
            for (phase, output) in &input.prior_phases {
                let _ = writeln!(prompt, "- {phase}: {}", excerpt(output));
            }
        }
        if let Some(feedback) = &input.feedback {
            let _ = write!(prompt, "\nThe previous attempt was sent back: {feedback}\n");
        }
        if self.role.is_gate() {
            prompt.push_str("\nEnd your answer with a line 'VERDICT: PASS' or 'VERDICT: FAIL'.\n");
        }
        if self.role == AgentRole::Decomposer {
            prompt.push_str("\nList each work item on its own line starting with '- '.\n");
        }

        let temperature = if self.role.is_gate() { 0.0 } else { 0.2 };
        CompletionRequest::new(prompt)
            .with_system(self.role.preamble())
            .with_temperature(temperature)
    }

    fn interpret(
        &self,
        input: &AgentInput,
        response: CompletionResponse,
    ) -> Result<RoleOutput, SubtaskError> {
        if response.text.trim().is_empty() {
            return Err(SubtaskError::InvalidOutput(format!(
                "empty response for subtask '{}'",
                input.subtask.key
            )));
        }

        let mut output = RoleOutput {
            text: response.text,
            provider: response.provider,
            work_items: Vec::new(),
            verdict: None,
        };

        if self.role.is_gate() {
            // A response without a verdict line is accepted.
            let verdict = parse_verdict(&output.text).unwrap_or(Verdict::Pass);
            if verdict == Verdict::Fail {
                return Err(SubtaskError::ValidationFailed {
                    reason: format!("{} '{}': {}", self.role, input.subtask.key, excerpt(&output.text)),
                });
            }
            output.verdict = Some(verdict);
        }
        if self.role == AgentRole::Decomposer {
            output.work_items = parse_work_items(&output.text);
        }
        Ok(output)
    }
}

/// Finds the last `VERDICT: PASS|FAIL` line.
pub fn parse_verdict(text: &str) -> Option<Verdict> {
    text.lines().rev().find_map(|line| {
        let line = line.trim().trim_start_matches(['*', '#', '>', ' ']);
        let upper = line.to_ascii_uppercase();
        let rest = upper.strip_prefix("VERDICT")?.trim_start_matches([':', ' ', '*']);
        if rest.starts_with("PASS") {
            Some(Verdict::Pass)
        } else if rest.starts_with("FAIL") {
            Some(Verdict::Fail)
        } else {
            None
        }
    })
}

/// Extracts bullet (`-`, `*`) and numbered (`1.`, `2)`) items.
pub fn parse_work_items(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| {
            let line = line.trim();
            let item = if let Some(rest) = line.strip_prefix("- ").or_else(|| line.strip_prefix("* ")) {
                rest
            } else {
                let digits = line.len() - line.trim_start_matches(|c: char| c.is_ascii_digit()).len();
                if digits == 0 {
                    return None;
                }
                line[digits..].strip_prefix(". ").or_else(|| line[digits..].strip_prefix(") "))?
            };
            let item = item.trim();
            (!item.is_empty()).then(|| item.to_string())
        })
        .collect()
}

fn excerpt(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= CONTEXT_EXCERPT_CHARS {
        flat
    } else {
        let cut: String = flat.chars().take(CONTEXT_EXCERPT_CHARS).collect();
        format!("{cut}...")
    }
}

/// Maps each role to its handler.
#[derive(Clone)]
pub struct RoleRegistry {
    handlers: HashMap<AgentRole, Arc<dyn RoleHandler>>,
}

impl std::fmt::Debug for RoleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut roles: Vec<&AgentRole> = self.handlers.keys().collect();
        roles.sort();
        f.debug_struct("RoleRegistry").field("roles", &roles).finish()
    }
}

impl RoleRegistry {
    /// An empty registry.
    #[must_use]
    pub fn empty() -> Self {
        Self { handlers: HashMap::new() }
    }

    /// A registry with a `StandardRoleHandler` for every role.
    #[must_use]
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        for role in AgentRole::ALL {
            registry.register(Arc::new(StandardRoleHandler::new(role)));
        }
        registry
    }

    /// Registers or replaces the handler for its role.
    pub fn register(&mut self, handler: Arc<dyn RoleHandler>) {
        self.handlers.insert(handler.role(), handler);
    }

    /// Looks up a handler.
    pub fn get(&self, role: AgentRole) -> Option<Arc<dyn RoleHandler>> {
        self.handlers.get(&role).cloned()
    }
}

impl Default for RoleRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(role: AgentRole) -> AgentInput {
        AgentInput {
            request: "Build a rate limiter".to_string(),
            phase: 7,
            phase_name: "Validation".to_string(),
            objective: "Check the result".to_string(),
            subtask: Subtask::new("validate", role, "validate it"),
            dependency_outputs: vec![("unit".to_string(), "all green".to_string())],
            prior_phases: Vec::new(),
            feedback: None,
        }
    }

    fn response(text: &str) -> CompletionResponse {
        CompletionResponse {
            text: text.to_string(),
            usage: None,
            provider: "a".to_string(),
            model: None,
            latency_ms: 1,
        }
    }

    #[test]
    fn test_parse_verdict() {
        assert_eq!(parse_verdict("looks good\nVERDICT: PASS"), Some(Verdict::Pass));
        assert_eq!(parse_verdict("**Verdict: fail** - missing tests"), Some(Verdict::Fail));
        assert_eq!(parse_verdict("no verdict here"), None);
        assert_eq!(parse_verdict("VERDICT: FAIL\nafter review\nVERDICT: PASS"), Some(Verdict::Pass));
    }

    #[test]
    fn test_parse_work_items() {
        let text = "Plan:\n- parser\n* lexer\n1. codegen\n2) tests\n-not an item\n10. docs";
        assert_eq!(parse_work_items(text), vec!["parser", "lexer", "codegen", "tests", "docs"]);
        assert!(parse_work_items("nothing to do").is_empty());
    }

    #[test]
    fn test_prompt_first_line_identifies_subtask() {
        let handler = StandardRoleHandler::new(AgentRole::Validator);
        let request = handler.build_request(&input(AgentRole::Validator));
        assert_eq!(request.prompt.lines().next(), Some("Validator | phase 7 Validation | validate"));
        assert!(request.prompt.contains("- unit: all green"));
        assert!(request.prompt.contains("VERDICT"));
        assert!(request.temperature.abs() < f32::EPSILON);
    }

    #[test]
    fn test_feedback_changes_fingerprint() {
        let handler = StandardRoleHandler::new(AgentRole::Implementer);
        let first = handler.build_request(&input(AgentRole::Implementer));
        let mut retry_input = input(AgentRole::Implementer);
        retry_input.feedback = Some("validation failed".to_string());
        let retry = handler.build_request(&retry_input);
        assert_ne!(first.fingerprint(), retry.fingerprint());
    }

    #[test]
    fn test_gate_fail_is_validation_error() {
        let handler = StandardRoleHandler::new(AgentRole::Validator);
        let err = handler
            .interpret(&input(AgentRole::Validator), response("broken\nVERDICT: FAIL"))
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_gate_without_verdict_passes() {
        let handler = StandardRoleHandler::new(AgentRole::Tester);
        let output = handler.interpret(&input(AgentRole::Tester), response("ran the suite")).unwrap();
        assert_eq!(output.verdict, Some(Verdict::Pass));
    }

    #[test]
    fn test_decomposer_extracts_items() {
        let handler = StandardRoleHandler::new(AgentRole::Decomposer);
        let output =
            handler.interpret(&input(AgentRole::Decomposer), response("- one\n- two")).unwrap();
        assert_eq!(output.work_items, vec!["one", "two"]);
    }

    #[test]
    fn test_empty_response_rejected() {
        let handler = StandardRoleHandler::new(AgentRole::Analyst);
        let err = handler.interpret(&input(AgentRole::Analyst), response("  ")).unwrap_err();
        assert!(matches!(err, SubtaskError::InvalidOutput(_)));
    }

    #[test]
    fn test_standard_registry_covers_every_role() {
        let registry = RoleRegistry::standard();
        for role in AgentRole::ALL {
            assert_eq!(registry.get(role).unwrap().role(), role);
        }
        assert!(RoleRegistry::empty().get(AgentRole::Analyst).is_none());
    }
}
