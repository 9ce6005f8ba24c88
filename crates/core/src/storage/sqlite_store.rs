//! `SQLite` backend for the job queue.
//!
//! Rows follow the relational `jobs` table shape: JSON columns for config,
//! result and error, RFC 3339 text timestamps with fixed microsecond precision
//! so that text ordering matches time ordering.
//!
//! Every operation runs in a `BEGIN IMMEDIATE` transaction. The claim is a
//! single conditional `UPDATE ... WHERE status = 'queued'`, so workers in
//! separate processes sharing the database file can never claim the same row.

use super::job_store::{ClaimOutcome, JobStore};
use crate::types::{Job, JobId, JobStatus};
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::time::Duration;

const JOB_COLUMNS: &str = "id, file_id, type, status, progress, config, result, error, \
     attempts, max_attempts, created_at, started_at, last_attempt_at, completed_at";

/// Job store backed by `SQLite`.
pub struct SqliteJobStore {
    conn: Mutex<Connection>,
}

impl SqliteJobStore {
    /// Open (or create) a database file and migrate the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create job store directory")?;
        }

        let conn = Connection::open(path).context("Failed to open job database")?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_row| Ok(()))
            .context("Failed to enable WAL mode")?;
        Self::from_connection(conn)
    }

    /// Private in-memory database, mainly for tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))
            .context("Failed to set busy timeout")?;

        conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                file_id TEXT,
                type TEXT NOT NULL,
                status TEXT NOT NULL,
                progress INTEGER NOT NULL DEFAULT 0,
                config TEXT NOT NULL,
                result TEXT,
                error TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL DEFAULT 3,
                created_at TEXT NOT NULL,
                started_at TEXT,
                last_attempt_at TEXT,
                completed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_status_created
                ON jobs(status, created_at);
            ",
        )
        .context("Failed to create jobs table")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn optional_timestamp(at: Option<DateTime<Utc>>) -> Option<String> {
    at.map(timestamp)
}

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn parse_timestamp(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|at| at.with_timezone(&Utc))
            .map_err(|e| conversion_error(idx, e))
    })
    .transpose()
}

fn parse_json<T: serde::de::DeserializeOwned>(
    idx: usize,
    raw: Option<String>,
) -> rusqlite::Result<Option<T>> {
    raw.map(|s| serde_json::from_str(&s).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<Job> {
    let id: String = row.get(0)?;
    let file_id: Option<String> = row.get(1)?;
    let status: String = row.get(3)?;
    let progress: i64 = row.get(4)?;
    let attempts: i64 = row.get(8)?;
    let max_attempts: i64 = row.get(9)?;

    Ok(Job {
        id: id.parse().map_err(|e| conversion_error(0, e))?,
        file_id: file_id
            .map(|f| uuid::Uuid::parse_str(&f).map_err(|e| conversion_error(1, e)))
            .transpose()?,
        job_type: row.get(2)?,
        status: status.parse().map_err(|e: String| {
            conversion_error(3, std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?,
        progress: progress.clamp(0, 100) as u8,
        config: parse_json(5, row.get(5)?)?.unwrap_or_default(),
        result: parse_json(6, row.get(6)?)?,
        error: parse_json(7, row.get(7)?)?,
        attempts: attempts.max(0) as u32,
        max_attempts: max_attempts.max(0) as u32,
        created_at: parse_timestamp(10, row.get(10)?)?.unwrap_or_else(Utc::now),
        started_at: parse_timestamp(11, row.get(11)?)?,
        last_attempt_at: parse_timestamp(12, row.get(12)?)?,
        completed_at: parse_timestamp(13, row.get(13)?)?,
    })
}

fn write_job(conn: &Connection, job: &Job, insert: bool) -> Result<()> {
    let config = serde_json::to_string(&job.config).context("Failed to serialize config")?;
    let result = job
        .result
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .context("Failed to serialize result")?;
    let error = job
        .error
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .context("Failed to serialize error")?;

    let sql = if insert {
        "INSERT INTO jobs (id, file_id, type, status, progress, config, result, error, \
         attempts, max_attempts, created_at, started_at, last_attempt_at, completed_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
    } else {
        "UPDATE jobs SET file_id = ?2, type = ?3, status = ?4, progress = ?5, config = ?6, \
         result = ?7, error = ?8, attempts = ?9, max_attempts = ?10, created_at = ?11, \
         started_at = ?12, last_attempt_at = ?13, completed_at = ?14 WHERE id = ?1"
    };

    conn.execute(
        sql,
        params![
            job.id.to_string(),
            job.file_id.map(|f| f.to_string()),
            job.job_type,
            job.status.as_str(),
            i64::from(job.progress),
            config,
            result,
            error,
            i64::from(job.attempts),
            i64::from(job.max_attempts),
            timestamp(job.created_at),
            optional_timestamp(job.started_at),
            optional_timestamp(job.last_attempt_at),
            optional_timestamp(job.completed_at),
        ],
    )
    .context("Failed to write job")?;
    Ok(())
}

fn select_job(conn: &Connection, id: &JobId) -> Result<Option<Job>> {
    conn.query_row(
        &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
        params![id.to_string()],
        row_to_job,
    )
    .optional()
    .context("Failed to get job")
}

impl JobStore for SqliteJobStore {
    fn insert(&self, job: &Job) -> Result<()> {
        let conn = self.conn.lock();
        write_job(&conn, job, true)
    }

    fn get(&self, id: &JobId) -> Result<Option<Job>> {
        let conn = self.conn.lock();
        select_job(&conn, id)
    }

    fn list(&self) -> Result<Vec<Job>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM jobs ORDER BY created_at, id",
                JOB_COLUMNS
            ))
            .context("Failed to prepare job listing")?;
        let jobs = stmt
            .query_map([], row_to_job)
            .context("Failed to list jobs")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read job row")?;
        Ok(jobs)
    }

    fn modify(&self, id: &JobId, apply: &mut dyn FnMut(&mut Job) -> bool) -> Result<Option<Job>> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("Failed to begin transaction")?;

        let job = match select_job(&tx, id)? {
            Some(mut job) => {
                if apply(&mut job) {
                    write_job(&tx, &job, false)?;
                }
                Some(job)
            }
            None => None,
        };

        tx.commit().context("Failed to commit")?;
        Ok(job)
    }

    fn claim_next(&self, now: DateTime<Utc>, stale_before: DateTime<Utc>) -> Result<ClaimOutcome> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("Failed to begin transaction")?;

        let reclaimed = {
            let mut stmt = tx
                .prepare(
                    "UPDATE jobs SET status = 'queued' \
                     WHERE status = 'processing' AND (started_at IS NULL OR started_at < ?1) \
                     RETURNING id",
                )
                .context("Failed to prepare stale reclaim")?;
            let ids = stmt
                .query_map(params![timestamp(stale_before)], |row| row.get::<_, String>(0))
                .context("Failed to reclaim stale jobs")?
                .collect::<rusqlite::Result<Vec<_>>>()
                .context("Failed to read reclaimed job id")?;
            ids.iter()
                .map(|id| id.parse::<JobId>().context("Invalid job id in store"))
                .collect::<Result<Vec<_>>>()?
        };

        let claimed = tx
            .query_row(
                &format!(
                    "UPDATE jobs SET status = 'processing', started_at = ?1, last_attempt_at = ?1 \
                     WHERE id = (SELECT id FROM jobs WHERE status = 'queued' \
                                 ORDER BY created_at, id LIMIT 1) \
                       AND status = 'queued' \
                     RETURNING {}",
                    JOB_COLUMNS
                ),
                params![timestamp(now)],
                row_to_job,
            )
            .optional()
            .context("Failed to claim next job")?;

        tx.commit().context("Failed to commit")?;
        Ok(ClaimOutcome { reclaimed, claimed })
    }

    fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock();
        let deleted = conn
            .execute(
                "DELETE FROM jobs \
                 WHERE status IN (?1, ?2, ?3) \
                   AND completed_at IS NOT NULL AND completed_at < ?4",
                params![
                    JobStatus::Completed.as_str(),
                    JobStatus::Failed.as_str(),
                    JobStatus::Cancelled.as_str(),
                    timestamp(cutoff),
                ],
            )
            .context("Failed to delete old jobs")?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JobError, Payload};
    use tempfile::TempDir;

    fn queued_job(created_at: DateTime<Utc>) -> Job {
        let mut config = Payload::new();
        config.insert("extractionType".to_string(), serde_json::json!("full"));
        Job {
            id: JobId::new(),
            file_id: Some(uuid::Uuid::new_v4()),
            job_type: "file_extraction".to_string(),
            status: JobStatus::Queued,
            progress: 0,
            config,
            result: None,
            error: None,
            attempts: 0,
            max_attempts: 3,
            created_at,
            started_at: None,
            last_attempt_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn test_row_round_trip_preserves_fields() {
        let store = SqliteJobStore::in_memory().unwrap();
        let mut job = queued_job(Utc::now());
        job.error = Some(JobError::new(JobError::HANDLER_ERROR, "boom"));
        store.insert(&job).unwrap();

        let loaded = store.get(&job.id).unwrap().unwrap();
        assert_eq!(loaded.id, job.id);
        assert_eq!(loaded.file_id, job.file_id);
        assert_eq!(loaded.config, job.config);
        assert_eq!(loaded.error, job.error);
        assert_eq!(loaded.created_at.timestamp_micros(), job.created_at.timestamp_micros());
    }

    #[test]
    fn test_claim_reclaims_stale_processing_job() {
        let store = SqliteJobStore::in_memory().unwrap();
        let now = Utc::now();
        let mut job = queued_job(now - chrono::Duration::minutes(20));
        job.status = JobStatus::Processing;
        job.started_at = Some(now - chrono::Duration::minutes(10));
        store.insert(&job).unwrap();

        let outcome = store
            .claim_next(now, now - chrono::Duration::minutes(5))
            .unwrap();
        assert_eq!(outcome.reclaimed, vec![job.id]);
        let claimed = outcome.claimed.unwrap();
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.status, JobStatus::Processing);
        assert_eq!(
            claimed.started_at.unwrap().timestamp_micros(),
            now.timestamp_micros()
        );
    }

    #[test]
    fn test_two_connections_share_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("jobs.db");
        let first = SqliteJobStore::open(&path).unwrap();
        let second = SqliteJobStore::open(&path).unwrap();

        let job = queued_job(Utc::now());
        first.insert(&job).unwrap();

        let now = Utc::now();
        let stale_before = now - chrono::Duration::minutes(5);
        let claimed = second.claim_next(now, stale_before).unwrap().claimed;
        assert_eq!(claimed.map(|j| j.id), Some(job.id));
        assert!(first.claim_next(now, stale_before).unwrap().claimed.is_none());
    }
}
