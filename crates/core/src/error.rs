//! Error taxonomy for the execution core.

use crate::types::{StepId, StepRecord, WorkflowId};

/// Result type for execution core operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors raised by the registry, executor, queue and worker.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Malformed workflow graph, raised at registration.
    #[error("Invalid workflow definition: {0}")]
    Definition(String),

    /// Unknown workflow, step target or job.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Malformed caller input.
    #[error("Invalid input: {0}")]
    Validation(String),

    /// A step's collaborator failed; carries the trace up to and including that step.
    #[error("Step {step_id} failed: {message}")]
    Handler {
        step_id: StepId,
        message: String,
        trace: Vec<StepRecord>,
    },

    /// A step names a target that is not registered; carries the trace up to
    /// and including that step.
    #[error("Step {step_id} failed: {kind} not found: {target}")]
    TargetNotFound {
        step_id: StepId,
        kind: &'static str,
        target: String,
        trace: Vec<StepRecord>,
    },

    /// Job type has no registered handler.
    #[error("No handler registered for job type: {0}")]
    NoHandler(String),

    /// Traversal budget of a workflow was exceeded.
    #[error("Cycle detected in workflow {workflow_id}: step {step_id} would exceed {budget} visits")]
    CycleDetected {
        workflow_id: WorkflowId,
        step_id: StepId,
        budget: usize,
        trace: Vec<StepRecord>,
    },

    /// Lifecycle move not present in the adjacency table.
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// Backend failure (database, filesystem, serialization).
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        Self::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Step trace attached to executor failures
    pub fn trace(&self) -> Option<&[StepRecord]> {
        match self {
            Self::Handler { trace, .. }
            | Self::TargetNotFound { trace, .. }
            | Self::CycleDetected { trace, .. } => Some(trace),
            _ => None,
        }
    }

    /// Step the failure is attributed to, if any
    pub fn failed_step(&self) -> Option<&StepId> {
        match self {
            Self::Handler { step_id, .. }
            | Self::TargetNotFound { step_id, .. }
            | Self::CycleDetected { step_id, .. } => Some(step_id),
            _ => None,
        }
    }
}
