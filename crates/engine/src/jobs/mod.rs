//! Jobs and the async executor
//!
//! Async service tasks and timer events park their execution and leave a
//! [`Job`] behind. The [`AsyncExecutor`] acquires due jobs under a lock,
//! runs them and records failures with retries.

mod executor;
mod job;

pub use executor::{AsyncExecutor, AsyncExecutorConfig, AsyncExecutorHandle};
pub(crate) use executor::run_job;
pub use job::{Job, JobFilter, JobKind};

use uuid::Uuid;

/// Errors from job management
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum JobError {
    #[error("job not found: {0}")]
    NotFound(Uuid),

    #[error("job {0} is a dead letter; set its retries before executing it")]
    DeadLetter(Uuid),

    #[error("job {job_id} is locked by {owner}")]
    Locked { job_id: Uuid, owner: String },
}
