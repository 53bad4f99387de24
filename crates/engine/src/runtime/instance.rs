//! Runtime entities

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Lifecycle of a process instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Active,
    Completed,
    Cancelled,
}

impl InstanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_ended(self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    /// Moving through the graph
    Active,
    /// Parked in a wait state (user task, receive task, timer, async job)
    Waiting,
    /// Arrived at a parallel join, waiting for its siblings
    Joined,
}

/// A token positioned on one activity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub activity_id: String,
    pub state: ExecutionState,
    /// History id of the current activity visit
    #[serde(default)]
    pub activity_instance_id: Option<Uuid>,
    #[serde(default)]
    pub activity_started_at: Option<DateTime<Utc>>,
    /// User task created for the current activity visit
    #[serde(default)]
    pub task_id: Option<Uuid>,
}

impl Execution {
    pub(crate) fn new(activity_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            activity_id: activity_id.into(),
            state: ExecutionState::Active,
            activity_instance_id: None,
            activity_started_at: None,
            task_id: None,
        }
    }
}

/// A running or ended process instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInstance {
    pub id: Uuid,
    pub definition_id: Uuid,
    pub definition_key: String,
    pub business_key: Option<String>,
    pub status: InstanceStatus,
    pub variables: Map<String, Value>,
    pub executions: Vec<Execution>,
    pub start_user: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<String>,
    /// Optimistic lock; bumped by every committed change
    pub revision: i64,
}

impl ProcessInstance {
    pub fn is_active(&self) -> bool {
        self.status == InstanceStatus::Active
    }

    pub fn execution(&self, id: Uuid) -> Option<&Execution> {
        self.executions.iter().find(|e| e.id == id)
    }

    pub(crate) fn execution_mut(&mut self, id: Uuid) -> Option<&mut Execution> {
        self.executions.iter_mut().find(|e| e.id == id)
    }

    /// Activities currently holding a token
    pub fn active_activity_ids(&self) -> Vec<&str> {
        self.executions.iter().map(|e| e.activity_id.as_str()).collect()
    }
}

/// Filter for listing process instances
#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    pub definition_id: Option<Uuid>,
    pub definition_key: Option<String>,
    pub business_key: Option<String>,
    pub status: Option<InstanceStatus>,
}

impl InstanceFilter {
    pub fn active() -> Self {
        Self {
            status: Some(InstanceStatus::Active),
            ..Default::default()
        }
    }

    pub fn by_key(key: impl Into<String>) -> Self {
        Self {
            definition_key: Some(key.into()),
            ..Default::default()
        }
    }

    pub fn matches(&self, instance: &ProcessInstance) -> bool {
        self.definition_id.map_or(true, |id| instance.definition_id == id)
            && self
                .definition_key
                .as_ref()
                .map_or(true, |k| &instance.definition_key == k)
            && self
                .business_key
                .as_ref()
                .map_or(true, |k| instance.business_key.as_ref() == Some(k))
            && self.status.map_or(true, |s| instance.status == s)
    }
}
