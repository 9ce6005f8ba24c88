use super::registry::WorkflowRegistry;
use super::target::{TargetOutcome, TargetRegistry};
use crate::error::{EngineError, EngineResult};
use crate::types::{ExecutionReport, Payload, Step, StepRecord, StepStatus, WorkflowId};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

/// Walks a workflow's step chain, one step at a time, in the caller's task
pub struct WorkflowExecutor {
    registry: Arc<WorkflowRegistry>,
    targets: Arc<TargetRegistry>,
}

impl WorkflowExecutor {
    pub fn new(registry: Arc<WorkflowRegistry>, targets: Arc<TargetRegistry>) -> Self {
        Self { registry, targets }
    }

    pub fn registry(&self) -> &Arc<WorkflowRegistry> {
        &self.registry
    }

    /// Execute a registered workflow from its first step.
    ///
    /// Each step receives its declared input merged over the payload carried
    /// from earlier steps. The chain follows `on_success` links until a step
    /// has none, and returns that step's output. A workflow may visit at most
    /// `steps + 1` steps.
    pub async fn execute(&self, workflow_id: &WorkflowId, input: Payload) -> EngineResult<ExecutionReport> {
        let workflow = self.registry.get(workflow_id)?;

        let Some(first) = workflow.steps.first() else {
            tracing::info!("Workflow {} has no steps", workflow_id);
            return Ok(ExecutionReport {
                workflow_id: workflow_id.clone(),
                output: Value::Object(Payload::new()),
                trace: Vec::new(),
            });
        };

        tracing::info!("Starting workflow execution: workflow_id={}", workflow_id);
        let run_start = Instant::now();

        let budget = workflow.steps.len() + 1;
        let mut carried = input;
        let mut trace: Vec<StepRecord> = Vec::new();
        let mut current: &Step = first;

        loop {
            if trace.len() >= budget {
                tracing::error!(
                    "Workflow {} exceeded {} step visits at step {}",
                    workflow_id,
                    budget,
                    current.id
                );
                return Err(EngineError::CycleDetected {
                    workflow_id: workflow_id.clone(),
                    step_id: current.id.clone(),
                    budget,
                    trace,
                });
            }

            let target = match self.targets.resolve(current.kind, &current.target) {
                Ok(target) => target,
                Err(EngineError::NotFound { kind, id }) => {
                    tracing::error!(
                        "Step {} of workflow {} names unknown {} {}",
                        current.id,
                        workflow_id,
                        kind,
                        id
                    );
                    trace.push(StepRecord {
                        step_id: current.id.clone(),
                        kind: current.kind,
                        target: current.target.clone(),
                        status: StepStatus::Failed,
                        started_at: chrono::Utc::now(),
                        duration_ms: 0,
                        output: None,
                        error: Some(format!("{} not found: {}", kind, id)),
                    });
                    return Err(EngineError::TargetNotFound {
                        step_id: current.id.clone(),
                        kind,
                        target: id,
                        trace,
                    });
                }
                Err(e) => return Err(e),
            };

            let mut step_input = carried.clone();
            for (key, value) in &current.input {
                step_input.insert(key.clone(), value.clone());
            }

            tracing::debug!(
                "Executing step {} ({} {}) of workflow {}",
                current.id,
                current.kind,
                current.target,
                workflow_id
            );
            let started_at = chrono::Utc::now();
            let step_start = Instant::now();

            let outcome = match target.invoke(step_input).await {
                Ok(outcome) => outcome,
                Err(e) => TargetOutcome::failure(format!("{:#}", e)),
            };
            let duration_ms = step_start.elapsed().as_millis() as u64;

            match outcome {
                TargetOutcome::Success { output } => {
                    tracing::info!(
                        "Step {} completed in {}ms (workflow {})",
                        current.id,
                        duration_ms,
                        workflow_id
                    );

                    trace.push(StepRecord {
                        step_id: current.id.clone(),
                        kind: current.kind,
                        target: current.target.clone(),
                        status: StepStatus::Completed,
                        started_at,
                        duration_ms,
                        output: Some(output.clone()),
                        error: None,
                    });

                    let next = match &current.on_success {
                        Some(next_id) => Some(workflow.step(next_id).ok_or_else(|| {
                            EngineError::Definition(format!(
                                "step {} links to unknown step {}",
                                current.id, next_id
                            ))
                        })?),
                        None => None,
                    };

                    match next {
                        Some(next) => {
                            carry(&mut carried, output);
                            current = next;
                        }
                        None => {
                            tracing::info!(
                                "Workflow {} completed: {} steps in {}ms",
                                workflow_id,
                                trace.len(),
                                run_start.elapsed().as_millis()
                            );
                            return Ok(ExecutionReport {
                                workflow_id: workflow_id.clone(),
                                output,
                                trace,
                            });
                        }
                    }
                }
                TargetOutcome::Failure { error } => {
                    tracing::error!(
                        "Step {} failed after {}ms (workflow {}): {}",
                        current.id,
                        duration_ms,
                        workflow_id,
                        error
                    );

                    trace.push(StepRecord {
                        step_id: current.id.clone(),
                        kind: current.kind,
                        target: current.target.clone(),
                        status: StepStatus::Failed,
                        started_at,
                        duration_ms,
                        output: None,
                        error: Some(error.clone()),
                    });

                    return Err(EngineError::Handler {
                        step_id: current.id.clone(),
                        message: error,
                        trace,
                    });
                }
            }
        }
    }
}

/// Merge a step's output into the carried payload. Object outputs are merged
/// key by key; anything else is stored under `output`.
fn carry(carried: &mut Payload, output: Value) {
    match output {
        Value::Object(fields) => {
            for (key, value) in fields {
                carried.insert(key, value);
            }
        }
        other => {
            carried.insert("output".to_string(), other);
        }
    }
}
