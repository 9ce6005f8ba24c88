pub mod job_store;
pub mod redb_store;
pub mod sqlite_store;
pub mod transition_log;

pub use job_store::{ClaimOutcome, JobStore};
pub use redb_store::RedbJobStore;
pub use sqlite_store::SqliteJobStore;
pub use transition_log::JsonlTransitionLog;
