//! Agent lifecycle management.
//!
//! This module provides the per-subtask `Agent`, its execution states, and
//! the shared tracker that counts agents currently executing.

use super::AgentRole;
use super::roles::{AgentInput, RoleHandler, RoleOutput};
use crate::error::SubtaskError;
use crate::evidence::Evidence;
use crate::providers::LoadBalancer;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Agent execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// Created, not started.
    Idle,
    /// Running its subtask.
    Executing,
    /// Finished successfully.
    Done,
    /// Finished with an error.
    Failed,
}

impl AgentState {
    /// Checks if the agent can transition to the given state.
    #[must_use]
    pub fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Idle, Self::Executing | Self::Failed) | (Self::Executing, Self::Done | Self::Failed)
        )
    }

    /// Whether the agent has finished.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// Counts agents in the `Executing` state across a run.
#[derive(Debug, Default)]
pub struct AgentTracker {
    executing: AtomicUsize,
    peak: AtomicUsize,
    started: AtomicUsize,
}

impl AgentTracker {
    /// Creates a tracker with zero counts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks an agent as executing until the guard drops.
    pub fn enter(&self) -> ExecutingGuard<'_> {
        let now = self.executing.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.started.fetch_add(1, Ordering::SeqCst);
        ExecutingGuard(self)
    }

    /// Agents executing right now.
    pub fn executing(&self) -> usize {
        self.executing.load(Ordering::SeqCst)
    }

    /// Most agents ever executing at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Agents that have started executing.
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }
}

/// Leaves the executing count on drop.
pub struct ExecutingGuard<'a>(&'a AgentTracker);

impl Drop for ExecutingGuard<'_> {
    fn drop(&mut self) {
        self.0.executing.fetch_sub(1, Ordering::SeqCst);
    }
}

/// What an agent reports when it finishes.
#[derive(Debug, Clone)]
pub struct AgentReport {
    /// Agent id.
    pub agent_id: Uuid,
    /// Role that ran.
    pub role: AgentRole,
    /// Final state.
    pub state: AgentState,
    /// Output or error.
    pub result: Result<RoleOutput, SubtaskError>,
    /// Audit trail of the agent's provider calls.
    pub evidence: Vec<Evidence>,
    /// Wall time spent executing.
    pub duration: Duration,
}

/// One execution of one subtask.
#[derive(Debug)]
pub struct Agent {
    id: Uuid,
    role: AgentRole,
    state: AgentState,
}

impl Agent {
    /// Creates an idle agent.
    #[must_use]
    pub fn new(role: AgentRole) -> Self {
        Self { id: Uuid::new_v4(), role, state: AgentState::Idle }
    }

    /// Agent id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Current state.
    pub fn state(&self) -> AgentState {
        self.state
    }

    fn transition(&mut self, to: AgentState) {
        if self.state.can_transition_to(to) {
            self.state = to;
        } else {
            warn!(agent_id = %self.id, from = ?self.state, to = ?to, "Invalid agent state transition");
        }
    }

    /// Runs the subtask through `handler`, consuming the agent.
    pub async fn execute(
        mut self,
        handler: &dyn RoleHandler,
        input: &AgentInput,
        balancer: &LoadBalancer,
        tracker: &AgentTracker,
        cancel: &CancellationToken,
    ) -> AgentReport {
        let mut evidence = Vec::new();
        let started = Instant::now();

        let result = {
            let _executing = tracker.enter();
            self.transition(AgentState::Executing);
            debug!(agent_id = %self.id, role = %self.role, subtask = %input.subtask.key, "Agent executing");
            handler.handle(input, balancer, cancel, &mut evidence).await
        };

        self.transition(if result.is_ok() { AgentState::Done } else { AgentState::Failed });
        for record in &mut evidence {
            if record.subtask.is_none() {
                record.subtask = Some(input.subtask.key.clone());
            }
        }

        AgentReport {
            agent_id: self.id,
            role: self.role,
            state: self.state,
            result,
            evidence,
            duration: started.elapsed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        assert!(AgentState::Idle.can_transition_to(AgentState::Executing));
        assert!(AgentState::Executing.can_transition_to(AgentState::Done));
        assert!(AgentState::Executing.can_transition_to(AgentState::Failed));
        assert!(!AgentState::Done.can_transition_to(AgentState::Executing));
        assert!(!AgentState::Idle.can_transition_to(AgentState::Done));
        assert!(AgentState::Failed.is_terminal());
    }

    #[test]
    fn test_tracker_counts_peak() {
        let tracker = AgentTracker::new();
        let a = tracker.enter();
        let b = tracker.enter();
        assert_eq!(tracker.executing(), 2);
        drop(a);
        let c = tracker.enter();
        assert_eq!(tracker.peak(), 2);
        drop(b);
        drop(c);
        assert_eq!(tracker.executing(), 0);
        assert_eq!(tracker.started(), 3);
    }

    #[test]
    fn test_agents_get_distinct_ids() {
        let a = Agent::new(AgentRole::Implementer);
        let b = Agent::new(AgentRole::Implementer);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.state(), AgentState::Idle);
    }
}
