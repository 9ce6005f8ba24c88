use super::executor::WorkflowExecutor;
use crate::error::EngineError;
use crate::types::{Job, JobResult, Payload, WorkflowId};
use crate::worker::{JobContext, JobHandler};
use serde_json::Value;
use std::sync::Arc;

/// Job type conventionally handled by [`WorkflowJobHandler`]
pub const WORKFLOW_JOB_TYPE: &str = "workflow_run";

/// Runs a workflow as a queued job.
///
/// Reads `workflow_id` and an optional object `input` from the job config and
/// returns `{"output": ..., "steps": [...]}`.
pub struct WorkflowJobHandler {
    executor: Arc<WorkflowExecutor>,
}

impl WorkflowJobHandler {
    pub fn new(executor: Arc<WorkflowExecutor>) -> Self {
        Self { executor }
    }

    /// Job config for running `workflow_id` on `input`
    pub fn job_config(workflow_id: &WorkflowId, input: Payload) -> Payload {
        let mut config = Payload::new();
        config.insert("workflow_id".to_string(), Value::String(workflow_id.0.clone()));
        config.insert("input".to_string(), Value::Object(input));
        config
    }
}

#[async_trait::async_trait]
impl JobHandler for WorkflowJobHandler {
    async fn handle(&self, job: Job, ctx: JobContext) -> anyhow::Result<JobResult> {
        let workflow_id = job
            .config
            .get("workflow_id")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::Validation("job config has no workflow_id".to_string()))?;

        let input = match job.config.get("input") {
            None | Some(Value::Null) => Payload::new(),
            Some(Value::Object(input)) => input.clone(),
            Some(_) => {
                return Err(EngineError::Validation("job input must be an object".to_string()).into())
            }
        };

        let report = self
            .executor
            .execute(&WorkflowId::new(workflow_id), input)
            .await?;
        ctx.report_progress(100).await?;

        let mut result = JobResult::new();
        result.insert("output".to_string(), report.output);
        result.insert("steps".to_string(), serde_json::to_value(&report.trace)?);
        Ok(result)
    }
}
