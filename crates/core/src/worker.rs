//! Polling job worker.
//!
//! A worker claims one job at a time from the queue, runs the handler
//! registered for its type and reports the outcome back to the queue.

use crate::error::{EngineError, EngineResult};
use crate::queue::JobQueue;
use crate::types::{Job, JobError, JobId, JobResult, JobStatus};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Handle given to a running handler
#[derive(Clone)]
pub struct JobContext {
    job_id: JobId,
    queue: Arc<JobQueue>,
}

impl JobContext {
    pub fn new(job_id: JobId, queue: Arc<JobQueue>) -> Self {
        Self { job_id, queue }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Record progress (clamped to 0..=100)
    pub async fn report_progress(&self, progress: i64) -> EngineResult<()> {
        self.queue.update_job_progress(&self.job_id, progress).await
    }

    /// Whether the job was cancelled while running. Long handlers should
    /// check this and return early; their result is discarded either way.
    pub async fn is_cancelled(&self) -> EngineResult<bool> {
        let job = self.queue.get_job(&self.job_id).await?;
        Ok(job.is_some_and(|j| j.status == JobStatus::Cancelled))
    }
}

/// Processes jobs of one type
#[async_trait::async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: Job, ctx: JobContext) -> anyhow::Result<JobResult>;
}

#[async_trait::async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(Job, JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<JobResult>> + Send + 'static,
{
    async fn handle(&self, job: Job, ctx: JobContext) -> anyhow::Result<JobResult> {
        (self)(job, ctx).await
    }
}

/// What a single call to [`JobWorker::process_next_job`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// No job was queued
    Idle,
    Completed(JobId),
    /// The handler failed and the job was requeued
    Retrying(JobId),
    /// The handler failed on the last allowed attempt
    Failed(JobId),
    /// No handler is registered for the job type; the job failed without retry
    NoHandler(JobId),
    /// The job was cancelled while its handler ran; the result was dropped
    Cancelled(JobId),
    /// The job was reclaimed while its handler ran; the result was dropped
    Abandoned(JobId),
}

struct RunningLoop {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Job worker bound to one queue
#[derive(Clone)]
pub struct JobWorker {
    id: Arc<str>,
    queue: Arc<JobQueue>,
    handlers: Arc<RwLock<HashMap<String, Arc<dyn JobHandler>>>>,
    running: Arc<Mutex<Option<RunningLoop>>>,
}

impl JobWorker {
    pub fn new(queue: Arc<JobQueue>) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self::with_id(format!("worker-{}", &suffix[..8]), queue)
    }

    pub fn with_id(id: impl Into<String>, queue: Arc<JobQueue>) -> Self {
        Self {
            id: Arc::from(id.into()),
            queue,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            running: Arc::new(Mutex::new(None)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// Register the handler for `job_type`, replacing any previous one
    pub fn register_handler(&self, job_type: impl Into<String>, handler: impl JobHandler + 'static) {
        let job_type = job_type.into();
        let previous = self
            .handlers
            .write()
            .insert(job_type.clone(), Arc::new(handler));

        if previous.is_some() {
            tracing::warn!("Worker {} replaced handler for job type {}", self.id, job_type);
        } else {
            tracing::debug!("Worker {} registered handler for job type {}", self.id, job_type);
        }
    }

    pub fn handled_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.read().keys().cloned().collect();
        types.sort();
        types
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Start the polling loop. Returns `false` if it is already running.
    pub fn start(&self, poll_interval: Duration) -> bool {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            tracing::warn!("Worker {} already running", self.id);
            return false;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let worker = self.clone();
        let handle = tokio::spawn(async move { worker.run(poll_interval, stop_rx).await });

        *running = Some(RunningLoop { stop_tx, handle });
        tracing::info!(
            "Worker {} started (poll interval {}ms)",
            self.id,
            poll_interval.as_millis()
        );
        true
    }

    /// Signal the polling loop to stop. A job already being processed runs to
    /// completion and no further job is claimed.
    pub fn stop(&self) {
        if let Some(running) = self.running.lock().take() {
            let _ = running.stop_tx.send(true);
            tracing::info!("Worker {} stopping", self.id);
        }
    }

    /// Stop the polling loop and wait for it to exit
    pub async fn shutdown(&self) {
        let running = self.running.lock().take();
        if let Some(running) = running {
            let _ = running.stop_tx.send(true);
            if let Err(e) = running.handle.await {
                tracing::error!("Worker {} loop ended abnormally: {}", self.id, e);
            }
            tracing::info!("Worker {} stopped", self.id);
        }
    }

    async fn run(&self, poll_interval: Duration, mut stop_rx: watch::Receiver<bool>) {
        loop {
            if *stop_rx.borrow() {
                break;
            }

            let idle = match self.process_next_job().await {
                Ok(ProcessOutcome::Idle) => true,
                Ok(_) => false,
                Err(e) => {
                    tracing::error!("Worker {} failed to process job: {}", self.id, e);
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = stop_rx.changed() => {}
                }
            } else {
                tokio::task::yield_now().await;
            }
        }
    }

    /// Claim and process at most one job
    pub async fn process_next_job(&self) -> EngineResult<ProcessOutcome> {
        let Some(job) = self.queue.get_next_job().await? else {
            return Ok(ProcessOutcome::Idle);
        };
        let job_id = job.id;

        let handler = self.handlers.read().get(&job.job_type).cloned();
        let Some(handler) = handler else {
            let error = JobError::new(
                JobError::NO_HANDLER,
                EngineError::NoHandler(job.job_type.clone()).to_string(),
            );
            self.queue.fail_job_permanently(&job_id, error).await?;
            return Ok(ProcessOutcome::NoHandler(job_id));
        };

        tracing::info!(
            "Worker {} processing job {} (type={}, attempt {}/{})",
            self.id,
            job_id,
            job.job_type,
            job.attempts + 1,
            job.max_attempts
        );

        let ctx = JobContext::new(job_id, self.queue.clone());
        let task = tokio::spawn(async move { handler.handle(job, ctx).await });

        let outcome = match task.await {
            Ok(Ok(result)) => self
                .queue
                .complete_job(&job_id, result)
                .await
                .map(|_| ProcessOutcome::Completed(job_id)),
            Ok(Err(e)) => {
                let chain: Vec<String> = e.chain().map(|cause| cause.to_string()).collect();
                let error = JobError::new(JobError::HANDLER_ERROR, e.to_string())
                    .with_details(serde_json::json!({ "chain": chain }));
                self.report_failure(&job_id, error).await
            }
            Err(join_error) => {
                let message = if join_error.is_panic() {
                    panic_message(join_error.into_panic())
                } else {
                    join_error.to_string()
                };
                let error = JobError::new(JobError::HANDLER_ERROR, message)
                    .with_details(serde_json::json!({ "panic": true }));
                self.report_failure(&job_id, error).await
            }
        };

        match outcome {
            Err(EngineError::InvalidTransition { .. }) => self.superseded(&job_id).await,
            other => other,
        }
    }

    async fn report_failure(&self, job_id: &JobId, error: JobError) -> EngineResult<ProcessOutcome> {
        match self.queue.fail_job(job_id, error).await? {
            JobStatus::Queued => Ok(ProcessOutcome::Retrying(*job_id)),
            _ => Ok(ProcessOutcome::Failed(*job_id)),
        }
    }

    /// The job left processing while its handler ran
    async fn superseded(&self, job_id: &JobId) -> EngineResult<ProcessOutcome> {
        let status = self.queue.get_job(job_id).await?.map(|j| j.status);
        tracing::warn!(
            "Worker {} dropped result of job {}: job is now {}",
            self.id,
            job_id,
            status.map_or("deleted", |s| s.as_str())
        );

        Ok(match status {
            Some(JobStatus::Cancelled) => ProcessOutcome::Cancelled(*job_id),
            _ => ProcessOutcome::Abandoned(*job_id),
        })
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("handler panicked: {}", message)
    } else {
        "handler panicked".to_string()
    }
}
