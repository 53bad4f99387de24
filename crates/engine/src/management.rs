//! Management service: jobs, table counts and engine information

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::engine::EngineContext;
use crate::error::Result;
use crate::history::HistoryLevel;
use crate::jobs::{run_job, Job, JobError, JobFilter, JobKind};
use crate::runtime::Changeset;

/// Snapshot of engine settings and state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineInfo {
    pub schema_version: Option<String>,
    pub database_type: String,
    pub history_level: HistoryLevel,
    pub definition_cache_limit: i32,
    pub cached_definitions: usize,
    pub async_executor_active: bool,
}

/// Administrative operations
#[derive(Clone)]
pub struct ManagementService {
    ctx: Arc<EngineContext>,
}

impl ManagementService {
    pub(crate) fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        Ok(self.ctx.store.list_jobs(filter).await?)
    }

    pub async fn list_timer_jobs(&self) -> Result<Vec<Job>> {
        self.list_jobs(&JobFilter {
            kind: Some(JobKind::Timer),
            dead_letter: Some(false),
            ..JobFilter::default()
        })
        .await
    }

    pub async fn list_dead_letter_jobs(&self) -> Result<Vec<Job>> {
        self.list_jobs(&JobFilter {
            dead_letter: Some(true),
            ..JobFilter::default()
        })
        .await
    }

    async fn load(&self, job_id: Uuid) -> Result<Job> {
        Ok(self
            .ctx
            .store
            .find_job(job_id)
            .await?
            .ok_or(JobError::NotFound(job_id))?)
    }

    /// Run a job now, regardless of its due date
    ///
    /// A failure is recorded on the job (retries, exception) and returned.
    #[instrument(skip(self))]
    pub async fn execute_job(&self, job_id: Uuid) -> Result<()> {
        let job = self.load(job_id).await?;
        if job.dead_letter {
            return Err(JobError::DeadLetter(job_id).into());
        }
        let now = self.ctx.now();
        if let (Some(owner), Some(expires)) = (&job.lock_owner, job.lock_expires_at) {
            if expires > now {
                return Err(JobError::Locked {
                    job_id,
                    owner: owner.clone(),
                }
                .into());
            }
        }
        run_job(&self.ctx, job).await
    }

    /// Set the remaining retries; a dead letter with retries left becomes due now
    #[instrument(skip(self))]
    pub async fn set_job_retries(&self, job_id: Uuid, retries: u32) -> Result<()> {
        let mut job = self.load(job_id).await?;
        job.retries = retries;
        if retries > 0 && job.dead_letter {
            job.dead_letter = false;
            job.due_at = self.ctx.now();
            info!(%job_id, retries, "dead letter job revived");
        }
        self.ctx
            .store
            .commit(Changeset {
                jobs_updated: vec![job],
                ..Changeset::default()
            })
            .await?;
        Ok(())
    }

    pub async fn delete_job(&self, job_id: Uuid) -> Result<()> {
        self.load(job_id).await?;
        self.ctx
            .store
            .commit(Changeset {
                jobs_deleted: vec![job_id],
                ..Changeset::default()
            })
            .await?;
        Ok(())
    }

    /// Row count per engine table
    pub async fn table_count(&self) -> Result<BTreeMap<String, u64>> {
        Ok(self.ctx.store.table_counts().await?)
    }

    pub async fn engine_info(&self) -> Result<EngineInfo> {
        Ok(EngineInfo {
            schema_version: self.ctx.store.schema_version().await?,
            database_type: self.ctx.database_type.clone(),
            history_level: self.ctx.history_level,
            definition_cache_limit: self.ctx.cache.limit(),
            cached_definitions: self.ctx.cache.len(),
            async_executor_active: self.ctx.executor_running.load(Ordering::Acquire),
        })
    }
}
