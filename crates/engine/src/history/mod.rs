//! History: what happened to process instances, activities, tasks and variables

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::config::ConfigError;
use crate::engine::EngineContext;
use crate::error::Result;

/// How much history is recorded
///
/// Levels are cumulative: `Audit` records everything `Activity` does.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum HistoryLevel {
    None,
    /// Process instances, activity instances, latest variable values
    Activity,
    /// Plus task instances and submitted form properties
    #[default]
    Audit,
    /// Plus every variable update
    Full,
}

impl HistoryLevel {
    /// Whether records that need `required` are kept at this level
    pub fn is_at_least(self, required: HistoryLevel) -> bool {
        self >= required
    }

    pub fn key(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Activity => "activity",
            Self::Audit => "audit",
            Self::Full => "full",
        }
    }
}

impl std::fmt::Display for HistoryLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for HistoryLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "activity" => Ok(Self::Activity),
            "audit" => Ok(Self::Audit),
            "full" => Ok(Self::Full),
            other => Err(ConfigError::InvalidValue {
                key: "history".into(),
                value: other.to_string(),
                message: "expected one of none, activity, audit, full".into(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricProcessInstance {
    pub id: Uuid,
    pub definition_id: Uuid,
    pub definition_key: String,
    pub business_key: Option<String>,
    pub start_user: Option<String>,
    pub start_activity_id: String,
    pub end_activity_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub delete_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricActivityInstance {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub execution_id: Uuid,
    pub activity_id: String,
    pub activity_name: Option<String>,
    pub activity_type: String,
    pub task_id: Option<Uuid>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricTaskInstance {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub definition_id: Uuid,
    pub task_definition_key: String,
    pub name: Option<String>,
    pub assignee: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub delete_reason: Option<String>,
}

/// Latest value of a process variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricVariable {
    pub instance_id: Uuid,
    pub name: String,
    pub value: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetailKind {
    VariableUpdate,
    FormProperty,
}

impl DetailKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::VariableUpdate => "variable_update",
            Self::FormProperty => "form_property",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "variable_update" => Some(Self::VariableUpdate),
            "form_property" => Some(Self::FormProperty),
            _ => None,
        }
    }
}

/// Individual variable update or submitted form property
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricDetail {
    pub id: Uuid,
    pub kind: DetailKind,
    pub instance_id: Uuid,
    pub task_id: Option<Uuid>,
    pub name: String,
    pub value: Value,
    pub time: DateTime<Utc>,
}

/// A history write, applied as an upsert keyed by the record's identity
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryRecord {
    ProcessInstance(HistoricProcessInstance),
    ActivityInstance(HistoricActivityInstance),
    TaskInstance(HistoricTaskInstance),
    Variable(HistoricVariable),
    Detail(HistoricDetail),
}

impl HistoryRecord {
    /// Lowest level at which the record is kept
    pub fn required_level(&self) -> HistoryLevel {
        match self {
            Self::ProcessInstance(_) | Self::ActivityInstance(_) | Self::Variable(_) => {
                HistoryLevel::Activity
            }
            Self::TaskInstance(_) => HistoryLevel::Audit,
            Self::Detail(detail) => match detail.kind {
                DetailKind::FormProperty => HistoryLevel::Audit,
                DetailKind::VariableUpdate => HistoryLevel::Full,
            },
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HistoricInstanceQuery {
    pub instance_id: Option<Uuid>,
    pub definition_key: Option<String>,
    pub business_key: Option<String>,
    /// `Some(true)` only ended, `Some(false)` only running
    pub finished: Option<bool>,
}

impl HistoricInstanceQuery {
    pub fn matches(&self, record: &HistoricProcessInstance) -> bool {
        self.instance_id.map_or(true, |id| record.id == id)
            && self
                .definition_key
                .as_ref()
                .map_or(true, |k| &record.definition_key == k)
            && self
                .business_key
                .as_ref()
                .map_or(true, |k| record.business_key.as_ref() == Some(k))
            && self
                .finished
                .map_or(true, |finished| record.ended_at.is_some() == finished)
    }
}

/// Read access to recorded history
#[derive(Clone)]
pub struct HistoryService {
    ctx: Arc<EngineContext>,
}

impl HistoryService {
    pub(crate) fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    pub async fn list_process_instances(
        &self,
        query: &HistoricInstanceQuery,
    ) -> Result<Vec<HistoricProcessInstance>> {
        Ok(self.ctx.store.list_historic_instances(query).await?)
    }

    pub async fn get_process_instance(&self, id: Uuid) -> Result<Option<HistoricProcessInstance>> {
        let query = HistoricInstanceQuery {
            instance_id: Some(id),
            ..Default::default()
        };
        Ok(self
            .ctx
            .store
            .list_historic_instances(&query)
            .await?
            .into_iter()
            .next())
    }

    /// Activity instances of one process instance, in start order
    pub async fn list_activity_instances(
        &self,
        instance_id: Uuid,
    ) -> Result<Vec<HistoricActivityInstance>> {
        Ok(self.ctx.store.list_historic_activities(instance_id).await?)
    }

    /// Task instances, optionally restricted to one process instance
    pub async fn list_task_instances(
        &self,
        instance_id: Option<Uuid>,
    ) -> Result<Vec<HistoricTaskInstance>> {
        Ok(self.ctx.store.list_historic_tasks(instance_id).await?)
    }

    pub async fn list_variables(&self, instance_id: Uuid) -> Result<Vec<HistoricVariable>> {
        Ok(self.ctx.store.list_historic_variables(instance_id).await?)
    }

    pub async fn list_details(&self, instance_id: Uuid) -> Result<Vec<HistoricDetail>> {
        Ok(self.ctx.store.list_historic_details(instance_id).await?)
    }

    pub fn level(&self) -> HistoryLevel {
        self.ctx.history_level
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_are_cumulative() {
        assert!(HistoryLevel::Full.is_at_least(HistoryLevel::Audit));
        assert!(HistoryLevel::Audit.is_at_least(HistoryLevel::Activity));
        assert!(!HistoryLevel::Activity.is_at_least(HistoryLevel::Audit));
        assert!(!HistoryLevel::None.is_at_least(HistoryLevel::Activity));
    }

    #[test]
    fn test_parse_level_keys() {
        assert_eq!("audit".parse::<HistoryLevel>().unwrap(), HistoryLevel::Audit);
        assert_eq!(" FULL ".parse::<HistoryLevel>().unwrap(), HistoryLevel::Full);
        assert!("verbose".parse::<HistoryLevel>().is_err());
    }

    #[test]
    fn test_detail_levels() {
        let detail = |kind| {
            HistoryRecord::Detail(HistoricDetail {
                id: Uuid::now_v7(),
                kind,
                instance_id: Uuid::now_v7(),
                task_id: None,
                name: "x".into(),
                value: Value::Null,
                time: Utc::now(),
            })
        };
        assert_eq!(
            detail(DetailKind::FormProperty).required_level(),
            HistoryLevel::Audit
        );
        assert_eq!(
            detail(DetailKind::VariableUpdate).required_level(),
            HistoryLevel::Full
        );
    }
}
