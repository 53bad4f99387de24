//! User tasks

mod service;

pub use service::TaskService;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::history::HistoricTaskInstance;

/// A unit of human work created by a user task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub execution_id: Uuid,
    pub definition_id: Uuid,
    pub definition_key: String,
    /// Id of the user task element
    pub task_definition_key: String,
    pub name: Option<String>,
    pub assignee: Option<String>,
    pub candidate_users: Vec<String>,
    pub candidate_groups: Vec<String>,
    pub form_key: Option<String>,
    pub priority: i32,
    pub due_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub revision: i64,
}

/// Default task priority
pub const DEFAULT_PRIORITY: i32 = 50;

impl Task {
    /// History view of the task, ended when `ended_at` is set
    pub(crate) fn to_history(
        &self,
        ended_at: Option<DateTime<Utc>>,
        delete_reason: Option<String>,
    ) -> HistoricTaskInstance {
        HistoricTaskInstance {
            id: self.id,
            instance_id: self.instance_id,
            definition_id: self.definition_id,
            task_definition_key: self.task_definition_key.clone(),
            name: self.name.clone(),
            assignee: self.assignee.clone(),
            claimed_at: self.claimed_at,
            created_at: self.created_at,
            ended_at,
            duration_ms: ended_at.map(|end| (end - self.created_at).num_milliseconds()),
            delete_reason,
        }
    }
}

/// Task filter
///
/// `candidate_user` matches unassigned tasks that name the user directly or
/// one of `candidate_groups`; the task service fills the groups from the
/// user's memberships.
#[derive(Debug, Clone, Default)]
pub struct TaskQuery {
    pub instance_id: Option<Uuid>,
    pub assignee: Option<String>,
    pub candidate_user: Option<String>,
    pub candidate_group: Option<String>,
    pub candidate_groups: Vec<String>,
    pub definition_key: Option<String>,
    pub task_definition_key: Option<String>,
    pub unassigned: bool,
}

impl TaskQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn instance(mut self, instance_id: Uuid) -> Self {
        self.instance_id = Some(instance_id);
        self
    }

    pub fn assignee(mut self, user_id: impl Into<String>) -> Self {
        self.assignee = Some(user_id.into());
        self
    }

    pub fn candidate_user(mut self, user_id: impl Into<String>) -> Self {
        self.candidate_user = Some(user_id.into());
        self
    }

    pub fn candidate_group(mut self, group_id: impl Into<String>) -> Self {
        self.candidate_group = Some(group_id.into());
        self
    }

    pub fn definition_key(mut self, key: impl Into<String>) -> Self {
        self.definition_key = Some(key.into());
        self
    }

    pub fn task_definition_key(mut self, key: impl Into<String>) -> Self {
        self.task_definition_key = Some(key.into());
        self
    }

    pub fn unassigned(mut self) -> Self {
        self.unassigned = true;
        self
    }

    pub fn matches(&self, task: &Task) -> bool {
        if self.instance_id.is_some_and(|id| task.instance_id != id) {
            return false;
        }
        if let Some(assignee) = &self.assignee {
            if task.assignee.as_ref() != Some(assignee) {
                return false;
            }
        }
        if self.unassigned && task.assignee.is_some() {
            return false;
        }
        if let Some(key) = &self.definition_key {
            if &task.definition_key != key {
                return false;
            }
        }
        if let Some(key) = &self.task_definition_key {
            if &task.task_definition_key != key {
                return false;
            }
        }
        if let Some(group) = &self.candidate_group {
            if task.assignee.is_some() || !task.candidate_groups.contains(group) {
                return false;
            }
        }
        if let Some(user) = &self.candidate_user {
            let named = task.candidate_users.contains(user);
            let via_group = task
                .candidate_groups
                .iter()
                .any(|g| self.candidate_groups.contains(g));
            if task.assignee.is_some() || !(named || via_group) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        let now = Utc::now();
        Task {
            id: Uuid::now_v7(),
            instance_id: Uuid::now_v7(),
            execution_id: Uuid::now_v7(),
            definition_id: Uuid::now_v7(),
            definition_key: "shipment".into(),
            task_definition_key: "inspect".into(),
            name: Some("Inspect wagon".into()),
            assignee: None,
            candidate_users: vec!["kim".into()],
            candidate_groups: vec!["inspectors".into()],
            form_key: None,
            priority: DEFAULT_PRIORITY,
            due_date: None,
            created_at: now,
            claimed_at: None,
            revision: 1,
        }
    }

    #[test]
    fn test_candidate_user_direct_and_via_group() {
        let t = task();
        assert!(TaskQuery::new().candidate_user("kim").matches(&t));

        let mut via_group = TaskQuery::new().candidate_user("lee");
        assert!(!via_group.matches(&t));
        via_group.candidate_groups = vec!["inspectors".into()];
        assert!(via_group.matches(&t));
    }

    #[test]
    fn test_assigned_tasks_are_not_candidates() {
        let mut t = task();
        t.assignee = Some("kim".into());
        assert!(!TaskQuery::new().candidate_user("kim").matches(&t));
        assert!(!TaskQuery::new().candidate_group("inspectors").matches(&t));
        assert!(!TaskQuery::new().unassigned().matches(&t));
        assert!(TaskQuery::new().assignee("kim").matches(&t));
    }

    #[test]
    fn test_key_filters() {
        let t = task();
        assert!(TaskQuery::new()
            .definition_key("shipment")
            .task_definition_key("inspect")
            .matches(&t));
        assert!(!TaskQuery::new().definition_key("billing").matches(&t));
        assert!(!TaskQuery::new().instance(Uuid::now_v7()).matches(&t));
    }
}
