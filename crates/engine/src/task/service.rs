//! Task service

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{info, instrument};
use uuid::Uuid;

use super::{Task, TaskQuery};
use crate::engine::EngineContext;
use crate::error::{EngineError, Result};
use crate::history::HistoryRecord;
use crate::runtime::{Changeset, CommandExtras};

/// Query, claim and complete user tasks
#[derive(Clone)]
pub struct TaskService {
    ctx: Arc<EngineContext>,
}

impl TaskService {
    pub(crate) fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Tasks matching the query, highest priority first
    ///
    /// A candidate user also matches tasks offered to any of their groups.
    pub async fn list(&self, mut query: TaskQuery) -> Result<Vec<Task>> {
        if let Some(user) = &query.candidate_user {
            let groups = self.ctx.store.groups_of_user(user).await?;
            query
                .candidate_groups
                .extend(groups.into_iter().map(|g| g.id));
        }
        Ok(self.ctx.store.list_tasks(&query).await?)
    }

    pub async fn get(&self, task_id: Uuid) -> Result<Option<Task>> {
        Ok(self.ctx.store.find_task(task_id).await?)
    }

    async fn load(&self, task_id: Uuid) -> Result<Task> {
        self.get(task_id)
            .await?
            .ok_or(EngineError::TaskNotFound(task_id))
    }

    async fn update(&self, task: Task) -> Result<()> {
        let mut changeset = Changeset::new();
        changeset.record(
            self.ctx.history_level,
            HistoryRecord::TaskInstance(task.to_history(None, None)),
        );
        changeset.tasks_updated.push(task);
        self.ctx.store.commit(changeset).await?;
        Ok(())
    }

    /// Take the task; fails if someone else already holds it
    #[instrument(skip(self))]
    pub async fn claim(&self, task_id: Uuid, user_id: &str) -> Result<()> {
        let mut task = self.load(task_id).await?;
        match &task.assignee {
            Some(current) if current == user_id => return Ok(()),
            Some(current) => {
                return Err(EngineError::TaskAlreadyClaimed {
                    task_id,
                    assignee: current.clone(),
                })
            }
            None => {}
        }
        task.assignee = Some(user_id.to_string());
        task.claimed_at = Some(self.ctx.now());
        self.update(task).await?;
        info!(%task_id, user_id, "task claimed");
        Ok(())
    }

    /// Give the task back to its candidates
    pub async fn unclaim(&self, task_id: Uuid) -> Result<()> {
        let mut task = self.load(task_id).await?;
        if task.assignee.is_none() {
            return Ok(());
        }
        task.assignee = None;
        task.claimed_at = None;
        self.update(task).await
    }

    /// Assign without the claim check; `None` clears the assignee
    pub async fn set_assignee(&self, task_id: Uuid, user_id: Option<&str>) -> Result<()> {
        let mut task = self.load(task_id).await?;
        task.assignee = user_id.map(str::to_string);
        task.claimed_at = user_id.map(|_| self.ctx.now());
        self.update(task).await
    }

    /// Complete the task and continue the process
    pub async fn complete(&self, task_id: Uuid, variables: Map<String, Value>) -> Result<()> {
        crate::runtime::complete_task(&self.ctx, task_id, variables, CommandExtras::default()).await
    }
}
