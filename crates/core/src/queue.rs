//! Durable job queue.
//!
//! All job status changes go through this type. The store provides atomic
//! single-row updates and the atomic claim; the queue enforces the job status
//! graph and the retry bookkeeping on top of them.

use crate::error::{EngineError, EngineResult};
use crate::lifecycle::{create_transition, Lifecycle, TransitionLog};
use crate::storage::JobStore;
use crate::types::{Job, JobError, JobId, JobResult, JobStats, JobStatus, NewJob};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Queue and worker timing settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// How long a job may stay processing before it is reclaimed
    #[serde(default = "default_processing_timeout_ms")]
    pub processing_timeout_ms: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Used when a job is created without an explicit limit
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,
}

fn default_processing_timeout_ms() -> u64 {
    300_000
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            processing_timeout_ms: default_processing_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            default_max_attempts: default_max_attempts(),
        }
    }
}

impl QueueConfig {
    pub fn processing_timeout(&self) -> Duration {
        Duration::from_millis(self.processing_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Clamp a caller supplied progress value to 0..=100
pub fn clamp_progress(progress: i64) -> u8 {
    progress.clamp(0, 100) as u8
}

struct Updated {
    job: Job,
    previous: Option<JobStatus>,
}

/// Job queue over a durable [`JobStore`]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    config: QueueConfig,
    transitions: Option<Arc<dyn TransitionLog<JobStatus>>>,
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>, config: QueueConfig) -> Self {
        Self {
            store,
            config,
            transitions: None,
        }
    }

    /// Record every job status change in `log`
    pub fn with_transition_log(mut self, log: Arc<dyn TransitionLog<JobStatus>>) -> Self {
        self.transitions = Some(log);
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Enqueue a job; it starts queued with no progress and no attempts
    pub async fn create_job(&self, new_job: NewJob) -> EngineResult<JobId> {
        let job_type = new_job.job_type.trim();
        if job_type.is_empty() {
            return Err(EngineError::Validation("job type must not be empty".to_string()));
        }

        let max_attempts = new_job
            .max_attempts
            .unwrap_or(self.config.default_max_attempts);
        if max_attempts == 0 {
            return Err(EngineError::Validation(
                "max_attempts must be at least 1".to_string(),
            ));
        }

        let job = Job {
            id: JobId::new(),
            file_id: new_job.file_id,
            job_type: job_type.to_string(),
            status: JobStatus::Queued,
            progress: 0,
            config: new_job.config,
            result: None,
            error: None,
            attempts: 0,
            max_attempts,
            created_at: Utc::now(),
            started_at: None,
            last_attempt_at: None,
            completed_at: None,
        };

        self.store.insert(&job)?;
        tracing::info!("Created job {} (type={})", job.id, job.job_type);

        Ok(job.id)
    }

    pub async fn get_job(&self, job_id: &JobId) -> EngineResult<Option<Job>> {
        Ok(self.store.get(job_id)?)
    }

    /// List jobs oldest first, optionally only those in `status`
    pub async fn list_jobs(&self, status: Option<JobStatus>) -> EngineResult<Vec<Job>> {
        let jobs = self.store.list()?;
        Ok(match status {
            Some(status) => jobs.into_iter().filter(|j| j.status == status).collect(),
            None => jobs,
        })
    }

    /// Reclaim stale processing jobs, then atomically claim the oldest queued job.
    ///
    /// The returned job is already processing; no other caller can receive it
    /// until it is requeued.
    pub async fn get_next_job(&self) -> EngineResult<Option<Job>> {
        let now = Utc::now();
        let timeout_ms = i64::try_from(self.config.processing_timeout_ms).unwrap_or(i64::MAX);
        let stale_before = now - chrono::Duration::milliseconds(timeout_ms);

        let outcome = self.store.claim_next(now, stale_before)?;

        for job_id in &outcome.reclaimed {
            tracing::warn!(
                "Reclaimed job {} after {}ms in processing",
                job_id,
                self.config.processing_timeout_ms
            );
            self.record(
                job_id,
                JobStatus::Processing,
                JobStatus::Queued,
                "processing timeout exceeded",
            )
            .await;
        }

        if let Some(job) = &outcome.claimed {
            tracing::debug!("Claimed job {} (type={})", job.id, job.job_type);
            self.record(&job.id, JobStatus::Queued, JobStatus::Processing, "claimed")
                .await;
        }

        Ok(outcome.claimed)
    }

    /// Set a job's status directly, following the job status graph
    pub async fn update_job_status(
        &self,
        job_id: &JobId,
        status: JobStatus,
        progress: Option<i64>,
    ) -> EngineResult<()> {
        let updated = self
            .update(job_id, |job| {
                if job.status != status && !job.status.can_transition_to(status) {
                    return Err(EngineError::invalid_transition(job.status, status));
                }

                let now = Utc::now();
                if job.status != status {
                    match status {
                        JobStatus::Processing => {
                            job.started_at = Some(now);
                            job.last_attempt_at = Some(now);
                        }
                        JobStatus::Completed => {
                            job.progress = 100;
                            job.completed_at = Some(now);
                        }
                        JobStatus::Failed | JobStatus::Cancelled => {
                            job.completed_at = Some(now);
                        }
                        JobStatus::Queued => {}
                    }
                    job.status = status;
                }

                if let Some(progress) = progress {
                    job.progress = clamp_progress(progress);
                }
                Ok(true)
            })
            .await?;

        if let Some(from) = updated.previous {
            self.record(&updated.job.id, from, updated.job.status, "status updated")
                .await;
        }
        Ok(())
    }

    /// Report progress of a queued or processing job
    pub async fn update_job_progress(&self, job_id: &JobId, progress: i64) -> EngineResult<()> {
        self.update(job_id, |job| {
            if job.status.is_terminal() {
                return Err(EngineError::Validation(format!(
                    "cannot update progress of {} job {}",
                    job.status, job.id
                )));
            }
            job.progress = clamp_progress(progress);
            Ok(true)
        })
        .await?;
        Ok(())
    }

    /// Complete a processing job. Completing an already completed job is a
    /// no-op and returns `false`.
    pub async fn complete_job(&self, job_id: &JobId, result: JobResult) -> EngineResult<bool> {
        let updated = self
            .update(job_id, |job| {
                if job.status == JobStatus::Completed {
                    return Ok(false);
                }
                if !job.status.can_transition_to(JobStatus::Completed) {
                    return Err(EngineError::invalid_transition(
                        job.status,
                        JobStatus::Completed,
                    ));
                }

                job.status = JobStatus::Completed;
                job.progress = 100;
                job.result = Some(result.clone());
                job.error = None;
                job.completed_at = Some(Utc::now());
                Ok(true)
            })
            .await?;

        match updated.previous {
            Some(from) => {
                tracing::info!("Job {} completed", updated.job.id);
                self.record(&updated.job.id, from, JobStatus::Completed, "completed")
                    .await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Record a failed attempt. The job is requeued while attempts remain and
    /// fails for good once `attempts` reaches `max_attempts`.
    pub async fn fail_job(&self, job_id: &JobId, error: JobError) -> EngineResult<JobStatus> {
        let updated = self
            .update(job_id, |job| {
                if job.status != JobStatus::Processing {
                    return Err(EngineError::invalid_transition(job.status, JobStatus::Failed));
                }

                let now = Utc::now();
                job.attempts += 1;
                job.last_attempt_at = Some(now);
                job.error = Some(error.clone());

                if job.attempts < job.max_attempts {
                    job.status = JobStatus::Queued;
                    job.completed_at = None;
                } else {
                    job.status = JobStatus::Failed;
                    job.completed_at = Some(now);
                }
                Ok(true)
            })
            .await?;

        let job = &updated.job;
        let reason = if job.status == JobStatus::Queued {
            tracing::warn!(
                "Job {} failed attempt {}/{}, requeued: {}",
                job.id,
                job.attempts,
                job.max_attempts,
                error.message
            );
            format!("retry after attempt {}/{}", job.attempts, job.max_attempts)
        } else {
            tracing::error!(
                "Job {} failed after {} attempts: {}",
                job.id,
                job.attempts,
                error.message
            );
            format!("failed after {} attempts", job.attempts)
        };
        self.record(&job.id, JobStatus::Processing, job.status, &reason)
            .await;

        Ok(job.status)
    }

    /// Fail a processing job without retrying, exhausting its attempt budget
    pub async fn fail_job_permanently(&self, job_id: &JobId, error: JobError) -> EngineResult<()> {
        let updated = self
            .update(job_id, |job| {
                if job.status != JobStatus::Processing {
                    return Err(EngineError::invalid_transition(job.status, JobStatus::Failed));
                }

                let now = Utc::now();
                job.attempts = (job.attempts + 1).max(job.max_attempts);
                job.last_attempt_at = Some(now);
                job.error = Some(error.clone());
                job.status = JobStatus::Failed;
                job.completed_at = Some(now);
                Ok(true)
            })
            .await?;

        tracing::error!(
            "Job {} failed permanently: [{}] {}",
            updated.job.id,
            error.code,
            error.message
        );
        self.record(
            &updated.job.id,
            JobStatus::Processing,
            JobStatus::Failed,
            &format!("failed without retry: {}", error.code),
        )
        .await;
        Ok(())
    }

    /// Cancel a queued or processing job. Returns `false` for terminal jobs.
    pub async fn cancel_job(&self, job_id: &JobId) -> EngineResult<bool> {
        let updated = self
            .update(job_id, |job| {
                if !job.status.can_transition_to(JobStatus::Cancelled) {
                    return Ok(false);
                }
                job.status = JobStatus::Cancelled;
                job.completed_at = Some(Utc::now());
                Ok(true)
            })
            .await?;

        match updated.previous {
            Some(from) => {
                tracing::info!("Job {} cancelled (was {})", updated.job.id, from);
                self.record(&updated.job.id, from, JobStatus::Cancelled, "cancelled")
                    .await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Enqueue a fresh copy of a failed job. The failed row itself stays
    /// untouched. Returns `None` if the job is not failed.
    pub async fn retry_job(&self, job_id: &JobId) -> EngineResult<Option<JobId>> {
        let job = self
            .store
            .get(job_id)?
            .ok_or_else(|| EngineError::not_found("job", job_id))?;

        if job.status != JobStatus::Failed {
            return Ok(None);
        }

        let mut new_job = NewJob::new(job.job_type)
            .config(job.config)
            .max_attempts(job.max_attempts);
        new_job.file_id = job.file_id;

        let retry_id = self.create_job(new_job).await?;
        tracing::info!("Job {} resubmitted as {}", job_id, retry_id);
        Ok(Some(retry_id))
    }

    /// Delete terminal jobs finished more than `older_than_days` ago.
    /// Queued and processing jobs are never deleted.
    pub async fn cleanup_old_jobs(&self, older_than_days: u32) -> EngineResult<usize> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(older_than_days));
        let deleted = self.store.delete_finished_before(cutoff)?;
        tracing::info!(
            "Cleaned up {} jobs finished before {}",
            deleted,
            cutoff.to_rfc3339()
        );
        Ok(deleted)
    }

    pub async fn stats(&self) -> EngineResult<JobStats> {
        let mut stats = JobStats::default();
        for job in self.store.list()? {
            stats.record(job.status);
        }
        Ok(stats)
    }

    /// Apply a change to one job atomically. `change` must validate before
    /// mutating and return whether it changed the job.
    async fn update(
        &self,
        job_id: &JobId,
        mut change: impl FnMut(&mut Job) -> EngineResult<bool>,
    ) -> EngineResult<Updated> {
        let mut failure = None;
        let mut previous = None;

        let job = self.store.modify(job_id, &mut |job| {
            let before = job.status;
            match change(job) {
                Ok(changed) => {
                    if changed && job.status != before {
                        previous = Some(before);
                    }
                    changed
                }
                Err(e) => {
                    failure = Some(e);
                    false
                }
            }
        })?;

        if let Some(e) = failure {
            return Err(e);
        }

        let job = job.ok_or_else(|| EngineError::not_found("job", job_id))?;
        Ok(Updated { job, previous })
    }

    async fn record(&self, job_id: &JobId, from: JobStatus, to: JobStatus, reason: &str) {
        let Some(log) = &self.transitions else {
            return;
        };

        match create_transition(job_id.to_string(), from, to, "queue", reason) {
            Ok(transition) => {
                if let Err(e) = log.append(transition).await {
                    tracing::warn!("Failed to record transition for job {}: {:#}", job_id, e);
                }
            }
            Err(e) => {
                tracing::warn!("Unrecorded transition for job {}: {}", job_id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::InMemoryTransitionLog;
    use crate::storage::RedbJobStore;
    use tempfile::NamedTempFile;

    fn test_queue() -> (JobQueue, NamedTempFile) {
        let temp_file = NamedTempFile::new().unwrap();
        let store = RedbJobStore::new(temp_file.path().to_path_buf()).unwrap();
        (JobQueue::new(Arc::new(store), QueueConfig::default()), temp_file)
    }

    #[test]
    fn test_clamp_progress() {
        assert_eq!(clamp_progress(-5), 0);
        assert_eq!(clamp_progress(42), 42);
        assert_eq!(clamp_progress(250), 100);
    }

    #[test]
    fn test_config_defaults() {
        let config: QueueConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, QueueConfig::default());
        assert_eq!(config.processing_timeout(), Duration::from_secs(300));
        assert_eq!(config.poll_interval(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_create_job_rejects_bad_input() {
        let (queue, _file) = test_queue();

        let empty = queue.create_job(NewJob::new("  ")).await;
        assert!(matches!(empty, Err(EngineError::Validation(_))));

        let zero = queue
            .create_job(NewJob::new("file_extraction").max_attempts(0))
            .await;
        assert!(matches!(zero, Err(EngineError::Validation(_))));
    }

    #[tokio::test]
    async fn test_status_update_stamps_processing_times() {
        let (queue, _file) = test_queue();
        let job_id = queue.create_job(NewJob::new("integrity_test")).await.unwrap();

        queue
            .update_job_status(&job_id, JobStatus::Processing, Some(150))
            .await
            .unwrap();

        let job = queue.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.progress, 100);
        assert!(job.started_at.is_some());
        assert!(job.last_attempt_at.is_some());

        // Same status only updates progress
        queue
            .update_job_status(&job_id, JobStatus::Processing, Some(30))
            .await
            .unwrap();
        assert_eq!(queue.get_job(&job_id).await.unwrap().unwrap().progress, 30);

        queue.cancel_job(&job_id).await.unwrap();
        let reopen = queue
            .update_job_status(&job_id, JobStatus::Queued, None)
            .await;
        assert!(matches!(reopen, Err(EngineError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn test_progress_rejected_for_terminal_job() {
        let (queue, _file) = test_queue();
        let job_id = queue.create_job(NewJob::new("file_cleanup")).await.unwrap();

        queue.update_job_progress(&job_id, -10).await.unwrap();
        assert_eq!(queue.get_job(&job_id).await.unwrap().unwrap().progress, 0);

        queue.cancel_job(&job_id).await.unwrap();
        assert!(matches!(
            queue.update_job_progress(&job_id, 50).await,
            Err(EngineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let (queue, _file) = test_queue();
        let missing = JobId::new();

        assert!(queue.get_job(&missing).await.unwrap().is_none());
        assert!(matches!(
            queue.cancel_job(&missing).await,
            Err(EngineError::NotFound { kind: "job", .. })
        ));
        assert!(matches!(
            queue.retry_job(&missing).await,
            Err(EngineError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_transitions_are_recorded() {
        let temp_file = NamedTempFile::new().unwrap();
        let store = RedbJobStore::new(temp_file.path().to_path_buf()).unwrap();
        let log = Arc::new(InMemoryTransitionLog::<JobStatus>::new());
        let queue =
            JobQueue::new(Arc::new(store), QueueConfig::default()).with_transition_log(log.clone());

        let job_id = queue.create_job(NewJob::new("file_extraction")).await.unwrap();
        queue.get_next_job().await.unwrap().unwrap();
        queue
            .fail_job(&job_id, JobError::new(JobError::HANDLER_ERROR, "timeout"))
            .await
            .unwrap();
        queue.get_next_job().await.unwrap().unwrap();
        queue.complete_job(&job_id, JobResult::new()).await.unwrap();

        let history = log.history(&job_id.to_string()).await.unwrap();
        let moves: Vec<(JobStatus, JobStatus)> = history.iter().map(|t| (t.from, t.to)).collect();
        assert_eq!(
            moves,
            vec![
                (JobStatus::Queued, JobStatus::Processing),
                (JobStatus::Processing, JobStatus::Queued),
                (JobStatus::Queued, JobStatus::Processing),
                (JobStatus::Processing, JobStatus::Completed),
            ]
        );
    }
}
