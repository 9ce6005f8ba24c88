// Execution core for Docket: workflow step chains, durable job queue and lifecycle audit log

pub mod error;
pub mod lifecycle;
pub mod queue;
pub mod storage;
pub mod types;
pub mod worker;
pub mod workflow;

pub use error::{EngineError, EngineResult};
pub use queue::{JobQueue, QueueConfig};
pub use types::*;
pub use worker::{JobContext, JobHandler, JobWorker, ProcessOutcome};
