use crate::config::{AppState, DocketConfig};
use anyhow::{Context, Result};
use docket_core::workflow::{
    TargetRegistry, WorkflowExecutor, WorkflowJobHandler, WorkflowRegistry, WORKFLOW_JOB_TYPE,
};
use docket_core::JobWorker;
use std::sync::Arc;

/// Load the configured workflows and start `count` polling workers that run
/// `workflow_run` jobs.
///
/// Step targets are provided by the embedding application, so the binary
/// starts with an empty target registry.
pub fn start_workers(state: &AppState, config: &DocketConfig, count: usize) -> Result<Vec<JobWorker>> {
    let registry = Arc::new(WorkflowRegistry::new());
    let workflows_dir = config.workflows_path();
    if workflows_dir.is_dir() {
        registry
            .load_dir(&workflows_dir)
            .context("Failed to load workflow definitions")?;
    } else {
        tracing::warn!(
            "Workflow directory {} not found, no workflows loaded",
            workflows_dir.display()
        );
    }

    let executor = Arc::new(WorkflowExecutor::new(registry, Arc::new(TargetRegistry::new())));

    let workers: Vec<JobWorker> = (1..=count.max(1))
        .map(|n| {
            let worker = JobWorker::with_id(format!("docket-worker-{}", n), state.queue.clone());
            worker.register_handler(WORKFLOW_JOB_TYPE, WorkflowJobHandler::new(executor.clone()));
            worker.start(config.queue.poll_interval());
            worker
        })
        .collect();

    tracing::info!(
        "Started {} workers polling every {}ms",
        workers.len(),
        config.queue.poll_interval_ms
    );
    Ok(workers)
}

/// Run workers until Ctrl-C, then let in-flight jobs finish
pub async fn run_until_interrupted(state: &AppState, config: &DocketConfig, count: usize) -> Result<()> {
    let workers = start_workers(state, config, count)?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received, waiting for in-flight jobs");

    for worker in &workers {
        worker.shutdown().await;
    }
    Ok(())
}
