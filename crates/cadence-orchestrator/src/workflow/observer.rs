//! Phase transition events for UI and logging layers.
//!
//! The state machine calls observers synchronously but observers must never
//! block: they log, or hand the event to a bounded channel and drop it when
//! the consumer falls behind.

use super::phases::PhaseId;
use super::types::PhaseStatus;
use crate::evidence::Evidence;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// A phase changed status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseTransition {
    /// Run the phase belongs to.
    pub run_id: Uuid,
    /// Phase id.
    pub phase: PhaseId,
    /// Phase name.
    pub name: String,
    /// New status.
    pub status: PhaseStatus,
    /// Execution number of the phase in the run.
    pub attempt: u32,
    /// Workflow iteration.
    pub iteration: u32,
    /// Evidence gathered by the phase (empty when it starts).
    pub evidence: Vec<Evidence>,
}

/// Receives phase transitions.
pub trait WorkflowObserver: Send + Sync {
    /// Called on every transition. Must return promptly.
    fn on_phase_transition(&self, transition: &PhaseTransition);
}

/// Ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl WorkflowObserver for NoopObserver {
    fn on_phase_transition(&self, _transition: &PhaseTransition) {}
}

/// Logs transitions through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl WorkflowObserver for TracingObserver {
    fn on_phase_transition(&self, t: &PhaseTransition) {
        info!(
            run_id = %t.run_id,
            phase = t.phase,
            name = %t.name,
            status = ?t.status,
            attempt = t.attempt,
            iteration = t.iteration,
            evidence = t.evidence.len(),
            "Phase transition"
        );
    }
}

/// Forwards transitions to a bounded channel.
#[derive(Debug)]
pub struct ChannelObserver {
    sender: mpsc::Sender<PhaseTransition>,
    dropped: AtomicU64,
}

impl ChannelObserver {
    /// Creates the observer and the receiving end.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<PhaseTransition>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender, dropped: AtomicU64::new(0) }, receiver)
    }

    /// Events dropped because the channel was full or closed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl WorkflowObserver for ChannelObserver {
    fn on_phase_transition(&self, transition: &PhaseTransition) {
        if let Err(e) = self.sender.try_send(transition.clone()) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(phase = transition.phase, error = %e, "Dropping phase transition event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transition(phase: PhaseId) -> PhaseTransition {
        PhaseTransition {
            run_id: Uuid::new_v4(),
            phase,
            name: "Test".to_string(),
            status: PhaseStatus::Running,
            attempt: 1,
            iteration: 1,
            evidence: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_channel_observer_delivers() {
        let (observer, mut rx) = ChannelObserver::channel(4);
        observer.on_phase_transition(&transition(3));
        assert_eq!(rx.recv().await.unwrap().phase, 3);
    }

    #[test]
    fn test_channel_observer_drops_when_full() {
        let (observer, _rx) = ChannelObserver::channel(1);
        observer.on_phase_transition(&transition(0));
        observer.on_phase_transition(&transition(1));
        assert_eq!(observer.dropped(), 1);
    }

    #[test]
    fn test_channel_observer_drops_when_closed() {
        let (observer, rx) = ChannelObserver::channel(1);
        drop(rx);
        observer.on_phase_transition(&transition(0));
        assert_eq!(observer.dropped(), 1);
    }
}
