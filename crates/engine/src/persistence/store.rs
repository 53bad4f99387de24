//! ProcessStore trait definition

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::form::{FormDefinition, FormInstance, FormInstanceQuery};
use crate::history::{
    HistoricActivityInstance, HistoricDetail, HistoricInstanceQuery, HistoricProcessInstance,
    HistoricTaskInstance, HistoricVariable,
};
use crate::identity::{Group, User};
use crate::jobs::{Job, JobFilter, JobKind};
use crate::repository::{Deployment, ProcessDefinition};
use crate::runtime::{Changeset, InstanceFilter, ProcessInstance};
use crate::task::{Task, TaskQuery};

/// Error type for store operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    /// Row does not exist
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Optimistic locking failed
    #[error("concurrency conflict on {entity} {id}: expected revision {expected}, found {actual}")]
    ConcurrencyConflict {
        entity: &'static str,
        id: String,
        expected: i64,
        actual: i64,
    },

    /// Unique key already taken
    #[error("{entity} already exists: {id}")]
    Duplicate { entity: &'static str, id: String },

    /// Required tables are missing
    #[error("database schema is missing tables: {}", .0.join(", "))]
    SchemaMissing(Vec<String>),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub(crate) fn conflict(entity: &'static str, id: impl ToString, expected: i64, actual: i64) -> Self {
        Self::ConcurrencyConflict {
            entity,
            id: id.to_string(),
            expected,
            actual,
        }
    }
}

/// Tables of the process engine
pub const ENGINE_TABLES: &[&str] = &[
    "conveyor_property",
    "conveyor_deployments",
    "conveyor_process_definitions",
    "conveyor_process_instances",
    "conveyor_tasks",
    "conveyor_jobs",
    "conveyor_hi_process_instances",
    "conveyor_hi_activity_instances",
    "conveyor_hi_task_instances",
    "conveyor_hi_variables",
    "conveyor_hi_details",
    "conveyor_id_users",
    "conveyor_id_groups",
    "conveyor_id_memberships",
];

/// Tables of the form engine
pub const FORM_TABLES: &[&str] = &["conveyor_form_definitions", "conveyor_form_instances"];

/// Schema version the engine expects in `conveyor_property`
pub const SCHEMA_VERSION: &str = "1";

/// Persistence for all engine state
///
/// Implementations must be thread-safe. [`ProcessStore::commit`] applies a
/// [`Changeset`] atomically: either every write lands or none does.
#[async_trait]
pub trait ProcessStore: Send + Sync + 'static {
    // =========================================================================
    // Schema
    // =========================================================================

    /// Fail with [`StoreError::SchemaMissing`] if required tables are absent
    async fn verify_schema(&self, include_form_tables: bool) -> Result<(), StoreError>;

    async fn schema_version(&self) -> Result<Option<String>, StoreError>;

    /// Row count per table
    async fn table_counts(&self) -> Result<BTreeMap<String, u64>, StoreError>;

    // =========================================================================
    // Deployments and definitions
    // =========================================================================

    async fn insert_deployment(
        &self,
        deployment: &Deployment,
        definitions: &[ProcessDefinition],
    ) -> Result<(), StoreError>;

    async fn list_deployments(&self) -> Result<Vec<Deployment>, StoreError>;

    async fn find_definition(&self, id: Uuid) -> Result<Option<ProcessDefinition>, StoreError>;

    async fn find_latest_definition(
        &self,
        key: &str,
    ) -> Result<Option<ProcessDefinition>, StoreError>;

    /// Ordered by key, then version
    async fn list_definitions(&self, key: Option<&str>)
        -> Result<Vec<ProcessDefinition>, StoreError>;

    async fn set_definition_suspended(&self, id: Uuid, suspended: bool) -> Result<(), StoreError>;

    // =========================================================================
    // Runtime
    // =========================================================================

    async fn find_instance(&self, id: Uuid) -> Result<Option<ProcessInstance>, StoreError>;

    /// Ordered by start time
    async fn list_instances(&self, filter: &InstanceFilter)
        -> Result<Vec<ProcessInstance>, StoreError>;

    /// Apply a changeset atomically with revision checks
    async fn commit(&self, changeset: Changeset) -> Result<(), StoreError>;

    // =========================================================================
    // Tasks
    // =========================================================================

    async fn find_task(&self, id: Uuid) -> Result<Option<Task>, StoreError>;

    /// Ordered by priority (highest first), then creation time
    async fn list_tasks(&self, query: &TaskQuery) -> Result<Vec<Task>, StoreError>;

    // =========================================================================
    // Jobs
    // =========================================================================

    /// Lock up to `max` acquirable jobs of `kind` for `owner`
    async fn acquire_jobs(
        &self,
        kind: JobKind,
        now: DateTime<Utc>,
        owner: &str,
        lock_until: DateTime<Utc>,
        max: usize,
    ) -> Result<Vec<Job>, StoreError>;

    async fn find_job(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Ordered by due time
    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError>;

    // =========================================================================
    // History
    // =========================================================================

    async fn list_historic_instances(
        &self,
        query: &HistoricInstanceQuery,
    ) -> Result<Vec<HistoricProcessInstance>, StoreError>;

    async fn list_historic_activities(
        &self,
        instance_id: Uuid,
    ) -> Result<Vec<HistoricActivityInstance>, StoreError>;

    async fn list_historic_tasks(
        &self,
        instance_id: Option<Uuid>,
    ) -> Result<Vec<HistoricTaskInstance>, StoreError>;

    async fn list_historic_variables(
        &self,
        instance_id: Uuid,
    ) -> Result<Vec<HistoricVariable>, StoreError>;

    async fn list_historic_details(
        &self,
        instance_id: Uuid,
    ) -> Result<Vec<HistoricDetail>, StoreError>;

    // =========================================================================
    // Identity
    // =========================================================================

    async fn save_user(&self, user: &User) -> Result<(), StoreError>;

    async fn find_user(&self, id: &str) -> Result<Option<User>, StoreError>;

    async fn list_users(&self) -> Result<Vec<User>, StoreError>;

    async fn delete_user(&self, id: &str) -> Result<(), StoreError>;

    async fn save_group(&self, group: &Group) -> Result<(), StoreError>;

    async fn find_group(&self, id: &str) -> Result<Option<Group>, StoreError>;

    async fn list_groups(&self) -> Result<Vec<Group>, StoreError>;

    async fn delete_group(&self, id: &str) -> Result<(), StoreError>;

    async fn create_membership(&self, user_id: &str, group_id: &str) -> Result<(), StoreError>;

    async fn delete_membership(&self, user_id: &str, group_id: &str) -> Result<(), StoreError>;

    async fn groups_of_user(&self, user_id: &str) -> Result<Vec<Group>, StoreError>;

    async fn users_of_group(&self, group_id: &str) -> Result<Vec<User>, StoreError>;

    // =========================================================================
    // Form engine
    // =========================================================================

    async fn insert_form_definition(&self, definition: &FormDefinition) -> Result<(), StoreError>;

    async fn find_form_definition(&self, id: Uuid) -> Result<Option<FormDefinition>, StoreError>;

    async fn find_latest_form_definition(
        &self,
        key: &str,
    ) -> Result<Option<FormDefinition>, StoreError>;

    async fn list_form_definitions(
        &self,
        key: Option<&str>,
    ) -> Result<Vec<FormDefinition>, StoreError>;

    async fn list_form_instances(
        &self,
        query: &FormInstanceQuery,
    ) -> Result<Vec<FormInstance>, StoreError>;
}
