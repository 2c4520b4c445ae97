//! Agent roles and execution.
//!
//! Roles form a closed set. Each role is served by a `RoleHandler` looked up
//! in a `RoleRegistry`; one `Agent` instance is created per subtask and never
//! reused, so several agents of the same role can run side by side.

pub mod lifecycle;
pub mod roles;

pub use lifecycle::{Agent, AgentReport, AgentState, AgentTracker, ExecutingGuard};
pub use roles::{
    AgentInput, RoleHandler, RoleOutput, RoleRegistry, StandardRoleHandler, Verdict, parse_verdict,
    parse_work_items,
};

use serde::{Deserialize, Serialize};
use std::fmt;

/// The closed set of agent roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    /// Clarifies the request and its acceptance criteria.
    Analyst,
    /// Gathers domain knowledge and prior art.
    Researcher,
    /// Chooses an approach.
    Strategist,
    /// Splits the work into independent items.
    Decomposer,
    /// Carries out one work item.
    Implementer,
    /// Merges implementation outputs.
    Integrator,
    /// Tests the integrated result.
    Tester,
    /// Checks the result against the request.
    Validator,
    /// Reviews quality and security.
    Reviewer,
    /// Writes documentation.
    Documenter,
    /// Summarizes the run.
    Reporter,
}

impl AgentRole {
    /// Every role, in pipeline order.
    pub const ALL: [Self; 11] = [
        Self::Analyst,
        Self::Researcher,
        Self::Strategist,
        Self::Decomposer,
        Self::Implementer,
        Self::Integrator,
        Self::Tester,
        Self::Validator,
        Self::Reviewer,
        Self::Documenter,
        Self::Reporter,
    ];

    /// Roles whose output carries a pass/fail verdict.
    #[must_use]
    pub fn is_gate(self) -> bool {
        matches!(self, Self::Tester | Self::Validator | Self::Reviewer)
    }

    /// Display name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Analyst => "Analyst",
            Self::Researcher => "Researcher",
            Self::Strategist => "Strategist",
            Self::Decomposer => "Decomposer",
            Self::Implementer => "Implementer",
            Self::Integrator => "Integrator",
            Self::Tester => "Tester",
            Self::Validator => "Validator",
            Self::Reviewer => "Reviewer",
            Self::Documenter => "Documenter",
            Self::Reporter => "Reporter",
        }
    }

    /// System prompt for the role.
    #[must_use]
    pub fn preamble(self) -> &'static str {
        match self {
            Self::Analyst => {
                "You are a requirements analyst. Identify goals, constraints and acceptance criteria."
            }
            Self::Researcher => "You are a researcher. Gather the facts and prior art the task depends on.",
            Self::Strategist => "You are a technical strategist. Choose an approach and justify trade-offs.",
            Self::Decomposer => {
                "You are a planner. Break the work into independent items, one per line starting with '- '."
            }
            Self::Implementer => "You are an implementer. Complete the assigned work item precisely.",
            Self::Integrator => "You are an integrator. Merge the partial results into one coherent whole.",
            Self::Tester => "You are a tester. Exercise the result and report defects.",
            Self::Validator => "You are a validator. Check the result against the original request.",
            Self::Reviewer => "You are a reviewer. Assess quality, maintainability and security.",
            Self::Documenter => "You are a technical writer. Document the delivered result.",
            Self::Reporter => "You are a reporter. Summarize what was done and what was learned.",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_roles() {
        let gates: Vec<AgentRole> = AgentRole::ALL.into_iter().filter(|r| r.is_gate()).collect();
        assert_eq!(gates, vec![AgentRole::Tester, AgentRole::Validator, AgentRole::Reviewer]);
    }

    #[test]
    fn test_serde_names() {
        assert_eq!(serde_json::to_string(&AgentRole::Implementer).unwrap(), "\"implementer\"");
        let role: AgentRole = serde_json::from_str("\"reviewer\"").unwrap();
        assert_eq!(role, AgentRole::Reviewer);
    }

    #[test]
    fn test_display() {
        assert_eq!(AgentRole::Decomposer.to_string(), "Decomposer");
    }
}
