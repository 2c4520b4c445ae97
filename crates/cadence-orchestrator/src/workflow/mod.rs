//! Workflow definitions, run results and the phase state machine.

pub mod machine;
pub mod observer;
pub mod phases;
pub mod types;

pub use machine::PhaseStateMachine;
pub use observer::{ChannelObserver, NoopObserver, PhaseTransition, TracingObserver, WorkflowObserver};
pub use phases::{Phase, PhaseId, PhaseWork, WorkflowDefinition};
pub use types::{
    PhaseResult, PhaseStatus, RunStatus, StreamResult, SubtaskStatus, WorkflowRun,
};
