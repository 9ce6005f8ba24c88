use super::job_store::{fifo_key, is_stale, ClaimOutcome, JobStore};
use crate::types::{Job, JobId, JobStatus};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use std::path::PathBuf;
use std::sync::Arc;

const JOBS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("jobs");

/// Job store backed by an embedded redb database.
///
/// redb admits one write transaction at a time, so every claim and
/// read-modify-write is exclusive among all handles sharing the `Database`.
#[derive(Clone)]
pub struct RedbJobStore {
    db: Arc<Database>,
}

impl RedbJobStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create job store directory")?;
        }

        let db = Database::create(&path).context("Failed to create redb database")?;
        Self::from_database(Arc::new(db))
    }

    /// Open a store on an already opened database, e.g. to give several
    /// workers in one process their own handle
    pub fn from_database(db: Arc<Database>) -> Result<Self> {
        let write_txn = db.begin_write().context("Failed to begin write transaction")?;
        {
            let _jobs_table = write_txn
                .open_table(JOBS_TABLE)
                .context("Failed to open jobs table")?;
        }
        write_txn.commit().context("Failed to commit transaction")?;

        Ok(Self { db })
    }

    pub fn database(&self) -> Arc<Database> {
        self.db.clone()
    }

    fn decode(bytes: &[u8]) -> Result<Job> {
        serde_json::from_slice(bytes).context("Failed to deserialize job")
    }

    fn encode(job: &Job) -> Result<(String, Vec<u8>)> {
        let value = serde_json::to_vec(job).context("Failed to serialize job")?;
        Ok((job.id.to_string(), value))
    }
}

impl JobStore for RedbJobStore {
    fn insert(&self, job: &Job) -> Result<()> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(JOBS_TABLE)
                .context("Failed to open table")?;

            let (key, value) = Self::encode(job)?;
            table
                .insert(key.as_str(), value.as_slice())
                .context("Failed to insert job")?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    fn get(&self, id: &JobId) -> Result<Option<Job>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn.open_table(JOBS_TABLE).context("Failed to open table")?;

        let key = id.to_string();
        let value = table.get(key.as_str()).context("Failed to get job")?;

        match value {
            Some(guard) => Ok(Some(Self::decode(guard.value())?)),
            None => Ok(None),
        }
    }

    fn list(&self) -> Result<Vec<Job>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn.open_table(JOBS_TABLE).context("Failed to open table")?;

        let mut jobs = Vec::new();
        for item in table.iter().context("Failed to iterate jobs")? {
            let (_key, value) = item.context("Failed to read item")?;
            jobs.push(Self::decode(value.value())?);
        }

        jobs.sort_by_key(fifo_key);
        Ok(jobs)
    }

    fn modify(&self, id: &JobId, apply: &mut dyn FnMut(&mut Job) -> bool) -> Result<Option<Job>> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        let job = {
            let mut table = write_txn
                .open_table(JOBS_TABLE)
                .context("Failed to open table")?;

            let key = id.to_string();
            let existing = match table.get(key.as_str()).context("Failed to get job")? {
                Some(guard) => Some(Self::decode(guard.value())?),
                None => None,
            };

            match existing {
                Some(mut job) => {
                    if apply(&mut job) {
                        let (key, value) = Self::encode(&job)?;
                        table
                            .insert(key.as_str(), value.as_slice())
                            .context("Failed to update job")?;
                    }
                    Some(job)
                }
                None => None,
            }
        };
        write_txn.commit().context("Failed to commit")?;
        Ok(job)
    }

    fn claim_next(&self, now: DateTime<Utc>, stale_before: DateTime<Utc>) -> Result<ClaimOutcome> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        let outcome = {
            let mut table = write_txn
                .open_table(JOBS_TABLE)
                .context("Failed to open table")?;

            let mut active = Vec::new();
            for item in table.iter().context("Failed to iterate jobs")? {
                let (_key, value) = item.context("Failed to read item")?;
                let job = Self::decode(value.value())?;
                if matches!(job.status, JobStatus::Queued | JobStatus::Processing) {
                    active.push(job);
                }
            }

            let mut outcome = ClaimOutcome::default();

            for job in active
                .iter_mut()
                .filter(|j| j.status == JobStatus::Processing && is_stale(j, stale_before))
            {
                job.status = JobStatus::Queued;
                let (key, value) = Self::encode(job)?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .context("Failed to reclaim job")?;
                outcome.reclaimed.push(job.id);
            }

            if let Some(job) = active
                .iter_mut()
                .filter(|j| j.status == JobStatus::Queued)
                .min_by_key(|j| fifo_key(j))
            {
                job.status = JobStatus::Processing;
                job.started_at = Some(now);
                job.last_attempt_at = Some(now);
                let (key, value) = Self::encode(job)?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .context("Failed to claim job")?;
                outcome.claimed = Some(job.clone());
            }

            outcome
        };
        write_txn.commit().context("Failed to commit")?;
        Ok(outcome)
    }

    fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        let deleted = {
            let mut table = write_txn
                .open_table(JOBS_TABLE)
                .context("Failed to open table")?;

            let mut expired = Vec::new();
            for item in table.iter().context("Failed to iterate jobs")? {
                let (key, value) = item.context("Failed to read item")?;
                let job = Self::decode(value.value())?;
                let finished_long_ago = job.completed_at.is_some_and(|at| at < cutoff);
                if job.status.is_terminal() && finished_long_ago {
                    expired.push(key.value().to_string());
                }
            }

            for key in &expired {
                table
                    .remove(key.as_str())
                    .context("Failed to delete job")?;
            }

            expired.len()
        };
        write_txn.commit().context("Failed to commit")?;
        Ok(deleted)
    }
}
