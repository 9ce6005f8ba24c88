use crate::types::{Job, JobId};
use anyhow::Result;
use chrono::{DateTime, Utc};

/// Result of one atomic claim pass
#[derive(Debug, Clone, Default)]
pub struct ClaimOutcome {
    /// Jobs moved from processing back to queued because their claim went stale
    pub reclaimed: Vec<JobId>,
    /// The job moved from queued to processing, if any was waiting
    pub claimed: Option<Job>,
}

/// Durable storage for job rows.
///
/// Every method is a single transaction. Status rules live in the queue; the
/// store only guarantees that `modify` and `claim_next` are atomic with
/// respect to every other caller of the same store.
pub trait JobStore: Send + Sync {
    /// Insert a new job row
    fn insert(&self, job: &Job) -> Result<()>;

    /// Get a job by ID
    fn get(&self, id: &JobId) -> Result<Option<Job>>;

    /// List all jobs, oldest first
    fn list(&self) -> Result<Vec<Job>>;

    /// Read-modify-write one job. `apply` returns whether it changed the job;
    /// unchanged jobs are not written back. Returns the job as it is after the
    /// call, or `None` if it does not exist.
    fn modify(&self, id: &JobId, apply: &mut dyn FnMut(&mut Job) -> bool) -> Result<Option<Job>>;

    /// Reclaim processing jobs started before `stale_before`, then claim the
    /// oldest queued job by conditionally moving it to processing.
    fn claim_next(&self, now: DateTime<Utc>, stale_before: DateTime<Utc>) -> Result<ClaimOutcome>;

    /// Delete completed, failed and cancelled jobs whose `completed_at` is
    /// before `cutoff`. Returns the number of rows deleted.
    fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

/// Whether a processing job's claim has expired
pub(crate) fn is_stale(job: &Job, stale_before: DateTime<Utc>) -> bool {
    job.started_at.map_or(true, |started| started < stale_before)
}

/// FIFO ordering key among queued jobs
pub(crate) fn fifo_key(job: &Job) -> (DateTime<Utc>, JobId) {
    (job.created_at, job.id)
}
