//! MySQL implementation of ProcessStore
//!
//! Production persistence using MySQL with:
//! - Transactional changesets with optimistic revision checks
//! - Job acquisition with `SELECT ... FOR UPDATE SKIP LOCKED`
//! - JSON columns for variables, executions and form values
//!
//! The schema is managed externally (`schema/mysql.sql`); this store only
//! verifies that the tables exist.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::mysql::{MySql, MySqlPool, MySqlRow};
use sqlx::types::Json;
use sqlx::{Row, Transaction};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;
use crate::form::{FormDefinition, FormDefinitionModel, FormInstance, FormInstanceQuery};
use crate::history::{
    DetailKind, HistoricActivityInstance, HistoricDetail, HistoricInstanceQuery,
    HistoricProcessInstance, HistoricTaskInstance, HistoricVariable, HistoryRecord,
};
use crate::identity::{Group, User};
use crate::jobs::{Job, JobFilter, JobKind};
use crate::repository::{Deployment, ProcessDefinition};
use crate::runtime::{Changeset, Execution, InstanceFilter, InstanceStatus, ProcessInstance};
use crate::task::{Task, TaskQuery};

fn db_err(e: sqlx::Error) -> StoreError {
    error!("database error: {}", e);
    StoreError::Database(e.to_string())
}

fn col<'r, T>(row: &'r MySqlRow, name: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, MySql> + sqlx::Type<MySql>,
{
    row.try_get(name).map_err(db_err)
}

fn parse_uuid(text: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(text).map_err(|e| StoreError::Serialization(format!("bad uuid '{text}': {e}")))
}

fn uuid_col(row: &MySqlRow, name: &str) -> Result<Uuid, StoreError> {
    parse_uuid(&col::<String>(row, name)?)
}

fn opt_uuid_col(row: &MySqlRow, name: &str) -> Result<Option<Uuid>, StoreError> {
    col::<Option<String>>(row, name)?
        .as_deref()
        .map(parse_uuid)
        .transpose()
}

fn opt_uuid(id: Option<Uuid>) -> Option<String> {
    id.map(|id| id.to_string())
}

fn definition_from_row(row: &MySqlRow) -> Result<ProcessDefinition, StoreError> {
    Ok(ProcessDefinition {
        id: uuid_col(row, "id")?,
        key: col(row, "definition_key")?,
        name: col(row, "name")?,
        version: col(row, "version")?,
        deployment_id: uuid_col(row, "deployment_id")?,
        resource_name: col(row, "resource_name")?,
        source: col(row, "source")?,
        suspended: col(row, "suspended")?,
        has_start_form: col(row, "has_start_form")?,
        deployed_at: col(row, "deployed_at")?,
    })
}

fn instance_from_row(row: &MySqlRow) -> Result<ProcessInstance, StoreError> {
    let status: String = col(row, "status")?;
    Ok(ProcessInstance {
        id: uuid_col(row, "id")?,
        definition_id: uuid_col(row, "definition_id")?,
        definition_key: col(row, "definition_key")?,
        business_key: col(row, "business_key")?,
        status: InstanceStatus::parse(&status)
            .ok_or_else(|| StoreError::Serialization(format!("unknown status '{status}'")))?,
        variables: col::<Json<Map<String, Value>>>(row, "variables")?.0,
        executions: col::<Json<Vec<Execution>>>(row, "executions")?.0,
        start_user: col(row, "start_user")?,
        started_at: col(row, "started_at")?,
        ended_at: col(row, "ended_at")?,
        end_reason: col(row, "end_reason")?,
        revision: col(row, "revision")?,
    })
}

fn task_from_row(row: &MySqlRow) -> Result<Task, StoreError> {
    Ok(Task {
        id: uuid_col(row, "id")?,
        instance_id: uuid_col(row, "instance_id")?,
        execution_id: uuid_col(row, "execution_id")?,
        definition_id: uuid_col(row, "definition_id")?,
        definition_key: col(row, "definition_key")?,
        task_definition_key: col(row, "task_definition_key")?,
        name: col(row, "name")?,
        assignee: col(row, "assignee")?,
        candidate_users: col::<Json<Vec<String>>>(row, "candidate_users")?.0,
        candidate_groups: col::<Json<Vec<String>>>(row, "candidate_groups")?.0,
        form_key: col(row, "form_key")?,
        priority: col(row, "priority")?,
        due_date: col(row, "due_date")?,
        created_at: col(row, "created_at")?,
        claimed_at: col(row, "claimed_at")?,
        revision: col(row, "revision")?,
    })
}

fn job_from_row(row: &MySqlRow) -> Result<Job, StoreError> {
    let kind: String = col(row, "kind")?;
    Ok(Job {
        id: uuid_col(row, "id")?,
        kind: JobKind::parse(&kind)
            .ok_or_else(|| StoreError::Serialization(format!("unknown job kind '{kind}'")))?,
        instance_id: uuid_col(row, "instance_id")?,
        execution_id: uuid_col(row, "execution_id")?,
        activity_id: col(row, "activity_id")?,
        due_at: col(row, "due_at")?,
        retries: col::<i32>(row, "retries")?.max(0) as u32,
        exception_message: col(row, "exception_message")?,
        lock_owner: col(row, "lock_owner")?,
        lock_expires_at: col(row, "lock_expires_at")?,
        dead_letter: col(row, "dead_letter")?,
        created_at: col(row, "created_at")?,
        revision: col(row, "revision")?,
    })
}

fn form_definition_from_row(row: &MySqlRow) -> Result<FormDefinition, StoreError> {
    Ok(FormDefinition {
        id: uuid_col(row, "id")?,
        key: col(row, "form_key")?,
        name: col(row, "name")?,
        version: col(row, "version")?,
        deployed_at: col(row, "deployed_at")?,
        model: col::<Json<FormDefinitionModel>>(row, "model")?.0,
    })
}

fn form_instance_from_row(row: &MySqlRow) -> Result<FormInstance, StoreError> {
    Ok(FormInstance {
        id: uuid_col(row, "id")?,
        form_definition_id: uuid_col(row, "form_definition_id")?,
        form_key: col(row, "form_key")?,
        task_id: opt_uuid_col(row, "task_id")?,
        instance_id: opt_uuid_col(row, "instance_id")?,
        submitted_by: col(row, "submitted_by")?,
        submitted_at: col(row, "submitted_at")?,
        values: col::<Json<Map<String, Value>>>(row, "field_values")?.0,
        outcome: col(row, "outcome")?,
    })
}

fn user_from_row(row: &MySqlRow) -> Result<User, StoreError> {
    Ok(User {
        id: col(row, "id")?,
        first_name: col(row, "first_name")?,
        last_name: col(row, "last_name")?,
        email: col(row, "email")?,
    })
}

fn group_from_row(row: &MySqlRow) -> Result<Group, StoreError> {
    Ok(Group {
        id: col(row, "id")?,
        name: col(row, "name")?,
        group_type: col(row, "group_type")?,
    })
}

const INSTANCE_COLUMNS: &str = "id, definition_id, definition_key, business_key, status, \
    variables, executions, start_user, started_at, ended_at, end_reason, revision";

const TASK_COLUMNS: &str = "id, instance_id, execution_id, definition_id, definition_key, \
    task_definition_key, name, assignee, candidate_users, candidate_groups, form_key, priority, \
    due_date, created_at, claimed_at, revision";

const JOB_COLUMNS: &str = "id, kind, instance_id, execution_id, activity_id, due_at, retries, \
    exception_message, lock_owner, lock_expires_at, dead_letter, created_at, revision";

const DEFINITION_COLUMNS: &str = "id, definition_key, name, version, deployment_id, \
    resource_name, source, suspended, has_start_form, deployed_at";

/// MySQL implementation of ProcessStore
///
/// # Example
///
/// ```ignore
/// use conveyor_engine::persistence::MySqlProcessStore;
/// use sqlx::MySqlPool;
///
/// let pool = MySqlPool::connect("mysql://localhost/conveyor").await?;
/// let store = MySqlProcessStore::new(pool);
/// ```
#[derive(Clone)]
pub struct MySqlProcessStore {
    pool: MySqlPool,
}

impl MySqlProcessStore {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }

    async fn locked_revision(
        tx: &mut Transaction<'_, MySql>,
        table: &str,
        id: Uuid,
    ) -> Result<i64, StoreError> {
        let row = sqlx::query(&format!("SELECT revision FROM {table} WHERE id = ? FOR UPDATE"))
            .bind(id.to_string())
            .fetch_optional(&mut **tx)
            .await
            .map_err(db_err)?;
        row.map(|r| col::<i64>(&r, "revision"))
            .transpose()
            .map(|r| r.unwrap_or(0))
    }

    async fn write_instance(
        tx: &mut Transaction<'_, MySql>,
        instance: &ProcessInstance,
    ) -> Result<(), StoreError> {
        let actual = Self::locked_revision(tx, "conveyor_process_instances", instance.id).await?;
        if actual != instance.revision {
            return Err(StoreError::conflict(
                "process instance",
                instance.id,
                instance.revision,
                actual,
            ));
        }

        let sql = if actual == 0 {
            r#"
            INSERT INTO conveyor_process_instances
                (definition_id, definition_key, business_key, status, variables, executions,
                 start_user, started_at, ended_at, end_reason, revision, id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#
        } else {
            r#"
            UPDATE conveyor_process_instances
            SET definition_id = ?, definition_key = ?, business_key = ?, status = ?,
                variables = ?, executions = ?, start_user = ?, started_at = ?, ended_at = ?,
                end_reason = ?, revision = ?
            WHERE id = ?
            "#
        };
        sqlx::query(sql)
            .bind(instance.definition_id.to_string())
            .bind(&instance.definition_key)
            .bind(&instance.business_key)
            .bind(instance.status.as_str())
            .bind(Json(&instance.variables))
            .bind(Json(&instance.executions))
            .bind(&instance.start_user)
            .bind(instance.started_at)
            .bind(instance.ended_at)
            .bind(&instance.end_reason)
            .bind(instance.revision + 1)
            .bind(instance.id.to_string())
            .execute(&mut **tx)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn write_task(
        tx: &mut Transaction<'_, MySql>,
        task: &Task,
        insert: bool,
    ) -> Result<(), StoreError> {
        if !insert {
            let actual = Self::locked_revision(tx, "conveyor_tasks", task.id).await?;
            if actual != task.revision {
                return Err(StoreError::conflict("task", task.id, task.revision, actual));
            }
        }
        let sql = if insert {
            r#"
            INSERT INTO conveyor_tasks
                (instance_id, execution_id, definition_id, definition_key, task_definition_key,
                 name, assignee, candidate_users, candidate_groups, form_key, priority, due_date,
                 created_at, claimed_at, revision, id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#
        } else {
            r#"
            UPDATE conveyor_tasks
            SET instance_id = ?, execution_id = ?, definition_id = ?, definition_key = ?,
                task_definition_key = ?, name = ?, assignee = ?, candidate_users = ?,
                candidate_groups = ?, form_key = ?, priority = ?, due_date = ?, created_at = ?,
                claimed_at = ?, revision = ?
            WHERE id = ?
            "#
        };
        sqlx::query(sql)
            .bind(task.instance_id.to_string())
            .bind(task.execution_id.to_string())
            .bind(task.definition_id.to_string())
            .bind(&task.definition_key)
            .bind(&task.task_definition_key)
            .bind(&task.name)
            .bind(&task.assignee)
            .bind(Json(&task.candidate_users))
            .bind(Json(&task.candidate_groups))
            .bind(&task.form_key)
            .bind(task.priority)
            .bind(task.due_date)
            .bind(task.created_at)
            .bind(task.claimed_at)
            .bind(task.revision + 1)
            .bind(task.id.to_string())
            .execute(&mut **tx)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn write_job(
        tx: &mut Transaction<'_, MySql>,
        job: &Job,
        insert: bool,
    ) -> Result<(), StoreError> {
        if !insert {
            let actual = Self::locked_revision(tx, "conveyor_jobs", job.id).await?;
            if actual != job.revision {
                return Err(StoreError::conflict("job", job.id, job.revision, actual));
            }
        }
        let sql = if insert {
            r#"
            INSERT INTO conveyor_jobs
                (kind, instance_id, execution_id, activity_id, due_at, retries, exception_message,
                 lock_owner, lock_expires_at, dead_letter, created_at, revision, id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#
        } else {
            r#"
            UPDATE conveyor_jobs
            SET kind = ?, instance_id = ?, execution_id = ?, activity_id = ?, due_at = ?,
                retries = ?, exception_message = ?, lock_owner = ?, lock_expires_at = ?,
                dead_letter = ?, created_at = ?, revision = ?
            WHERE id = ?
            "#
        };
        sqlx::query(sql)
            .bind(job.kind.as_str())
            .bind(job.instance_id.to_string())
            .bind(job.execution_id.to_string())
            .bind(&job.activity_id)
            .bind(job.due_at)
            .bind(job.retries as i32)
            .bind(&job.exception_message)
            .bind(&job.lock_owner)
            .bind(job.lock_expires_at)
            .bind(job.dead_letter)
            .bind(job.created_at)
            .bind(job.revision + 1)
            .bind(job.id.to_string())
            .execute(&mut **tx)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn delete_row(
        tx: &mut Transaction<'_, MySql>,
        table: &str,
        entity: &'static str,
        id: Uuid,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(&format!("DELETE FROM {table} WHERE id = ?"))
            .bind(id.to_string())
            .execute(&mut **tx)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::conflict(entity, id, 1, 0));
        }
        Ok(())
    }

    async fn write_history(
        tx: &mut Transaction<'_, MySql>,
        record: &HistoryRecord,
    ) -> Result<(), StoreError> {
        let query = match record {
            HistoryRecord::ProcessInstance(r) => sqlx::query(
                r#"
                INSERT INTO conveyor_hi_process_instances
                    (id, definition_id, definition_key, business_key, start_user,
                     start_activity_id, end_activity_id, started_at, ended_at, duration_ms,
                     delete_reason)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON DUPLICATE KEY UPDATE
                    end_activity_id = VALUES(end_activity_id), ended_at = VALUES(ended_at),
                    duration_ms = VALUES(duration_ms), delete_reason = VALUES(delete_reason)
                "#,
            )
            .bind(r.id.to_string())
            .bind(r.definition_id.to_string())
            .bind(&r.definition_key)
            .bind(&r.business_key)
            .bind(&r.start_user)
            .bind(&r.start_activity_id)
            .bind(&r.end_activity_id)
            .bind(r.started_at)
            .bind(r.ended_at)
            .bind(r.duration_ms)
            .bind(&r.delete_reason),
            HistoryRecord::ActivityInstance(r) => sqlx::query(
                r#"
                INSERT INTO conveyor_hi_activity_instances
                    (id, instance_id, execution_id, activity_id, activity_name, activity_type,
                     task_id, started_at, ended_at, duration_ms)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON DUPLICATE KEY UPDATE
                    task_id = VALUES(task_id), ended_at = VALUES(ended_at),
                    duration_ms = VALUES(duration_ms)
                "#,
            )
            .bind(r.id.to_string())
            .bind(r.instance_id.to_string())
            .bind(r.execution_id.to_string())
            .bind(&r.activity_id)
            .bind(&r.activity_name)
            .bind(&r.activity_type)
            .bind(opt_uuid(r.task_id))
            .bind(r.started_at)
            .bind(r.ended_at)
            .bind(r.duration_ms),
            HistoryRecord::TaskInstance(r) => sqlx::query(
                r#"
                INSERT INTO conveyor_hi_task_instances
                    (id, instance_id, definition_id, task_definition_key, name, assignee,
                     claimed_at, created_at, ended_at, duration_ms, delete_reason)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON DUPLICATE KEY UPDATE
                    assignee = VALUES(assignee), claimed_at = VALUES(claimed_at),
                    ended_at = VALUES(ended_at), duration_ms = VALUES(duration_ms),
                    delete_reason = VALUES(delete_reason)
                "#,
            )
            .bind(r.id.to_string())
            .bind(r.instance_id.to_string())
            .bind(r.definition_id.to_string())
            .bind(&r.task_definition_key)
            .bind(&r.name)
            .bind(&r.assignee)
            .bind(r.claimed_at)
            .bind(r.created_at)
            .bind(r.ended_at)
            .bind(r.duration_ms)
            .bind(&r.delete_reason),
            HistoryRecord::Variable(r) => sqlx::query(
                r#"
                INSERT INTO conveyor_hi_variables (instance_id, name, value, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?)
                ON DUPLICATE KEY UPDATE value = VALUES(value), updated_at = VALUES(updated_at)
                "#,
            )
            .bind(r.instance_id.to_string())
            .bind(&r.name)
            .bind(Json(&r.value))
            .bind(r.created_at)
            .bind(r.updated_at),
            HistoryRecord::Detail(r) => sqlx::query(
                r#"
                INSERT INTO conveyor_hi_details (id, kind, instance_id, task_id, name, value, time)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(r.id.to_string())
            .bind(r.kind.as_str())
            .bind(r.instance_id.to_string())
            .bind(opt_uuid(r.task_id))
            .bind(&r.name)
            .bind(Json(&r.value))
            .bind(r.time),
        };
        query.execute(&mut **tx).await.map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl ProcessStore for MySqlProcessStore {
    #[instrument(skip(self))]
    async fn verify_schema(&self, include_form_tables: bool) -> Result<(), StoreError> {
        let rows = sqlx::query(
            "SELECT table_name AS name FROM information_schema.tables WHERE table_schema = DATABASE()",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let present: HashSet<String> = rows
            .iter()
            .map(|r| col::<String>(r, "name").map(|n| n.to_ascii_lowercase()))
            .collect::<Result<_, _>>()?;

        let mut required: Vec<&str> = ENGINE_TABLES.to_vec();
        if include_form_tables {
            required.extend_from_slice(FORM_TABLES);
        }
        let missing: Vec<String> = required
            .into_iter()
            .filter(|t| !present.contains(*t))
            .map(str::to_string)
            .collect();

        if missing.is_empty() {
            debug!(include_form_tables, "database schema verified");
            Ok(())
        } else {
            Err(StoreError::SchemaMissing(missing))
        }
    }

    async fn schema_version(&self) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT value FROM conveyor_property WHERE name = 'schema.version'")
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|r| col::<String>(&r, "value")).transpose()
    }

    async fn table_counts(&self) -> Result<BTreeMap<String, u64>, StoreError> {
        let mut counts = BTreeMap::new();
        for table in ENGINE_TABLES.iter().chain(FORM_TABLES) {
            let row = sqlx::query(&format!("SELECT COUNT(*) AS n FROM {table}"))
                .fetch_one(&self.pool)
                .await
                .map_err(db_err)?;
            counts.insert(table.to_string(), col::<i64>(&row, "n")?.max(0) as u64);
        }
        Ok(counts)
    }

    #[instrument(skip(self, deployment, definitions), fields(deployment_id = %deployment.id))]
    async fn insert_deployment(
        &self,
        deployment: &Deployment,
        definitions: &[ProcessDefinition],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query(
            "INSERT INTO conveyor_deployments (id, name, deployed_at, resource_names) VALUES (?, ?, ?, ?)",
        )
        .bind(deployment.id.to_string())
        .bind(&deployment.name)
        .bind(deployment.deployed_at)
        .bind(Json(&deployment.resource_names))
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        for definition in definitions {
            sqlx::query(
                r#"
                INSERT INTO conveyor_process_definitions
                    (id, definition_key, name, version, deployment_id, resource_name, source,
                     suspended, has_start_form, deployed_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(definition.id.to_string())
            .bind(&definition.key)
            .bind(&definition.name)
            .bind(definition.version)
            .bind(definition.deployment_id.to_string())
            .bind(&definition.resource_name)
            .bind(&definition.source)
            .bind(definition.suspended)
            .bind(definition.has_start_form)
            .bind(definition.deployed_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(d) if d.is_unique_violation() => StoreError::Duplicate {
                    entity: "process definition",
                    id: format!("{}:{}", definition.key, definition.version),
                },
                _ => db_err(e),
            })?;
        }

        tx.commit().await.map_err(db_err)?;
        debug!(definitions = definitions.len(), "stored deployment");
        Ok(())
    }

    async fn list_deployments(&self) -> Result<Vec<Deployment>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, name, deployed_at, resource_names FROM conveyor_deployments ORDER BY deployed_at, id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter()
            .map(|row| {
                Ok(Deployment {
                    id: uuid_col(row, "id")?,
                    name: col(row, "name")?,
                    deployed_at: col(row, "deployed_at")?,
                    resource_names: col::<Json<Vec<String>>>(row, "resource_names")?.0,
                })
            })
            .collect()
    }

    async fn find_definition(&self, id: Uuid) -> Result<Option<ProcessDefinition>, StoreError> {
        let sql = format!("SELECT {DEFINITION_COLUMNS} FROM conveyor_process_definitions WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(definition_from_row).transpose()
    }

    async fn find_latest_definition(
        &self,
        key: &str,
    ) -> Result<Option<ProcessDefinition>, StoreError> {
        let sql = format!(
            "SELECT {DEFINITION_COLUMNS} FROM conveyor_process_definitions \
             WHERE definition_key = ? ORDER BY version DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(definition_from_row).transpose()
    }

    async fn list_definitions(
        &self,
        key: Option<&str>,
    ) -> Result<Vec<ProcessDefinition>, StoreError> {
        let sql = format!(
            "SELECT {DEFINITION_COLUMNS} FROM conveyor_process_definitions \
             WHERE (? IS NULL OR definition_key = ?) ORDER BY definition_key, version"
        );
        let rows = sqlx::query(&sql)
            .bind(key)
            .bind(key)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(definition_from_row).collect()
    }

    async fn set_definition_suspended(&self, id: Uuid, suspended: bool) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE conveyor_process_definitions SET suspended = ? WHERE id = ?")
            .bind(suspended)
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 && self.find_definition(id).await?.is_none() {
            return Err(StoreError::not_found("process definition", id));
        }
        Ok(())
    }

    async fn find_instance(&self, id: Uuid) -> Result<Option<ProcessInstance>, StoreError> {
        let sql = format!("SELECT {INSTANCE_COLUMNS} FROM conveyor_process_instances WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(instance_from_row).transpose()
    }

    async fn list_instances(
        &self,
        filter: &InstanceFilter,
    ) -> Result<Vec<ProcessInstance>, StoreError> {
        let sql = format!(
            "SELECT {INSTANCE_COLUMNS} FROM conveyor_process_instances \
             WHERE (? IS NULL OR definition_id = ?) \
               AND (? IS NULL OR definition_key = ?) \
               AND (? IS NULL OR business_key = ?) \
               AND (? IS NULL OR status = ?) \
             ORDER BY started_at, id"
        );
        let definition_id = opt_uuid(filter.definition_id);
        let status = filter.status.map(InstanceStatus::as_str);
        let rows = sqlx::query(&sql)
            .bind(&definition_id)
            .bind(&definition_id)
            .bind(&filter.definition_key)
            .bind(&filter.definition_key)
            .bind(&filter.business_key)
            .bind(&filter.business_key)
            .bind(status)
            .bind(status)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(instance_from_row).collect()
    }

    #[instrument(skip(self, changeset), fields(instance_id = ?changeset.instance.as_ref().map(|i| i.id)))]
    async fn commit(&self, changeset: Changeset) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        if let Some(instance) = &changeset.instance {
            Self::write_instance(&mut tx, instance).await?;
        }
        for id in &changeset.tasks_deleted {
            Self::delete_row(&mut tx, "conveyor_tasks", "task", *id).await?;
        }
        for task in &changeset.tasks_updated {
            Self::write_task(&mut tx, task, false).await?;
        }
        for task in &changeset.tasks_inserted {
            Self::write_task(&mut tx, task, true).await?;
        }
        for id in &changeset.jobs_deleted {
            Self::delete_row(&mut tx, "conveyor_jobs", "job", *id).await?;
        }
        for job in &changeset.jobs_updated {
            Self::write_job(&mut tx, job, false).await?;
        }
        for job in &changeset.jobs_inserted {
            Self::write_job(&mut tx, job, true).await?;
        }
        for form in &changeset.form_instances {
            sqlx::query(
                r#"
                INSERT INTO conveyor_form_instances
                    (id, form_definition_id, form_key, task_id, instance_id, submitted_by,
                     submitted_at, field_values, outcome)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(form.id.to_string())
            .bind(form.form_definition_id.to_string())
            .bind(&form.form_key)
            .bind(opt_uuid(form.task_id))
            .bind(opt_uuid(form.instance_id))
            .bind(&form.submitted_by)
            .bind(form.submitted_at)
            .bind(Json(&form.values))
            .bind(&form.outcome)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        for record in &changeset.history {
            Self::write_history(&mut tx, record).await?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn find_task(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM conveyor_tasks WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn list_tasks(&self, query: &TaskQuery) -> Result<Vec<Task>, StoreError> {
        // Narrow in SQL, candidate matching happens on the decoded rows
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM conveyor_tasks \
             WHERE (? IS NULL OR instance_id = ?) \
               AND (? IS NULL OR assignee = ?) \
               AND (? IS NULL OR definition_key = ?) \
             ORDER BY priority DESC, created_at, id"
        );
        let instance_id = opt_uuid(query.instance_id);
        let rows = sqlx::query(&sql)
            .bind(&instance_id)
            .bind(&instance_id)
            .bind(&query.assignee)
            .bind(&query.assignee)
            .bind(&query.definition_key)
            .bind(&query.definition_key)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in &rows {
            let task = task_from_row(row)?;
            if query.matches(&task) {
                tasks.push(task);
            }
        }
        Ok(tasks)
    }

    #[instrument(skip(self))]
    async fn acquire_jobs(
        &self,
        kind: JobKind,
        now: DateTime<Utc>,
        owner: &str,
        lock_until: DateTime<Utc>,
        max: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM conveyor_jobs \
             WHERE kind = ? AND dead_letter = FALSE AND due_at <= ? \
               AND (lock_expires_at IS NULL OR lock_expires_at <= ?) \
             ORDER BY due_at, id \
             LIMIT ? \
             FOR UPDATE SKIP LOCKED"
        );
        let rows = sqlx::query(&sql)
            .bind(kind.as_str())
            .bind(now)
            .bind(now)
            .bind(max as i64)
            .fetch_all(&mut *tx)
            .await
            .map_err(db_err)?;

        let mut acquired = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut job = job_from_row(row)?;
            sqlx::query(
                "UPDATE conveyor_jobs SET lock_owner = ?, lock_expires_at = ?, revision = revision + 1 WHERE id = ?",
            )
            .bind(owner)
            .bind(lock_until)
            .bind(job.id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
            job.lock_owner = Some(owner.to_string());
            job.lock_expires_at = Some(lock_until);
            job.revision += 1;
            acquired.push(job);
        }

        tx.commit().await.map_err(db_err)?;
        if !acquired.is_empty() {
            debug!(owner, count = acquired.len(), "acquired jobs");
        }
        Ok(acquired)
    }

    async fn find_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM conveyor_jobs WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM conveyor_jobs \
             WHERE (? IS NULL OR kind = ?) \
               AND (? IS NULL OR instance_id = ?) \
               AND (? IS NULL OR dead_letter = ?) \
             ORDER BY due_at, id"
        );
        let kind = filter.kind.map(JobKind::as_str);
        let instance_id = opt_uuid(filter.instance_id);
        let rows = sqlx::query(&sql)
            .bind(kind)
            .bind(kind)
            .bind(&instance_id)
            .bind(&instance_id)
            .bind(filter.dead_letter)
            .bind(filter.dead_letter)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(job_from_row).collect()
    }

    async fn list_historic_instances(
        &self,
        query: &HistoricInstanceQuery,
    ) -> Result<Vec<HistoricProcessInstance>, StoreError> {
        let instance_id = opt_uuid(query.instance_id);
        let rows = sqlx::query(
            r#"
            SELECT id, definition_id, definition_key, business_key, start_user, start_activity_id,
                   end_activity_id, started_at, ended_at, duration_ms, delete_reason
            FROM conveyor_hi_process_instances
            WHERE (? IS NULL OR id = ?)
              AND (? IS NULL OR definition_key = ?)
              AND (? IS NULL OR business_key = ?)
              AND (? IS NULL OR (ended_at IS NOT NULL) = ?)
            ORDER BY started_at, id
            "#,
        )
        .bind(&instance_id)
        .bind(&instance_id)
        .bind(&query.definition_key)
        .bind(&query.definition_key)
        .bind(&query.business_key)
        .bind(&query.business_key)
        .bind(query.finished)
        .bind(query.finished)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| {
                Ok(HistoricProcessInstance {
                    id: uuid_col(row, "id")?,
                    definition_id: uuid_col(row, "definition_id")?,
                    definition_key: col(row, "definition_key")?,
                    business_key: col(row, "business_key")?,
                    start_user: col(row, "start_user")?,
                    start_activity_id: col(row, "start_activity_id")?,
                    end_activity_id: col(row, "end_activity_id")?,
                    started_at: col(row, "started_at")?,
                    ended_at: col(row, "ended_at")?,
                    duration_ms: col(row, "duration_ms")?,
                    delete_reason: col(row, "delete_reason")?,
                })
            })
            .collect()
    }

    async fn list_historic_activities(
        &self,
        instance_id: Uuid,
    ) -> Result<Vec<HistoricActivityInstance>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, instance_id, execution_id, activity_id, activity_name, activity_type,
                   task_id, started_at, ended_at, duration_ms
            FROM conveyor_hi_activity_instances
            WHERE instance_id = ?
            ORDER BY started_at, id
            "#,
        )
        .bind(instance_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| {
                Ok(HistoricActivityInstance {
                    id: uuid_col(row, "id")?,
                    instance_id: uuid_col(row, "instance_id")?,
                    execution_id: uuid_col(row, "execution_id")?,
                    activity_id: col(row, "activity_id")?,
                    activity_name: col(row, "activity_name")?,
                    activity_type: col(row, "activity_type")?,
                    task_id: opt_uuid_col(row, "task_id")?,
                    started_at: col(row, "started_at")?,
                    ended_at: col(row, "ended_at")?,
                    duration_ms: col(row, "duration_ms")?,
                })
            })
            .collect()
    }

    async fn list_historic_tasks(
        &self,
        instance_id: Option<Uuid>,
    ) -> Result<Vec<HistoricTaskInstance>, StoreError> {
        let instance_id = opt_uuid(instance_id);
        let rows = sqlx::query(
            r#"
            SELECT id, instance_id, definition_id, task_definition_key, name, assignee,
                   claimed_at, created_at, ended_at, duration_ms, delete_reason
            FROM conveyor_hi_task_instances
            WHERE (? IS NULL OR instance_id = ?)
            ORDER BY created_at, id
            "#,
        )
        .bind(&instance_id)
        .bind(&instance_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| {
                Ok(HistoricTaskInstance {
                    id: uuid_col(row, "id")?,
                    instance_id: uuid_col(row, "instance_id")?,
                    definition_id: uuid_col(row, "definition_id")?,
                    task_definition_key: col(row, "task_definition_key")?,
                    name: col(row, "name")?,
                    assignee: col(row, "assignee")?,
                    claimed_at: col(row, "claimed_at")?,
                    created_at: col(row, "created_at")?,
                    ended_at: col(row, "ended_at")?,
                    duration_ms: col(row, "duration_ms")?,
                    delete_reason: col(row, "delete_reason")?,
                })
            })
            .collect()
    }

    async fn list_historic_variables(
        &self,
        instance_id: Uuid,
    ) -> Result<Vec<HistoricVariable>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT instance_id, name, value, created_at, updated_at
            FROM conveyor_hi_variables
            WHERE instance_id = ?
            ORDER BY name
            "#,
        )
        .bind(instance_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| {
                Ok(HistoricVariable {
                    instance_id: uuid_col(row, "instance_id")?,
                    name: col(row, "name")?,
                    value: col::<Json<Value>>(row, "value")?.0,
                    created_at: col(row, "created_at")?,
                    updated_at: col(row, "updated_at")?,
                })
            })
            .collect()
    }

    async fn list_historic_details(
        &self,
        instance_id: Uuid,
    ) -> Result<Vec<HistoricDetail>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, kind, instance_id, task_id, name, value, time
            FROM conveyor_hi_details
            WHERE instance_id = ?
            ORDER BY time, id
            "#,
        )
        .bind(instance_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| {
                let kind: String = col(row, "kind")?;
                Ok(HistoricDetail {
                    id: uuid_col(row, "id")?,
                    kind: DetailKind::parse(&kind).ok_or_else(|| {
                        StoreError::Serialization(format!("unknown detail kind '{kind}'"))
                    })?,
                    instance_id: uuid_col(row, "instance_id")?,
                    task_id: opt_uuid_col(row, "task_id")?,
                    name: col(row, "name")?,
                    value: col::<Json<Value>>(row, "value")?.0,
                    time: col(row, "time")?,
                })
            })
            .collect()
    }

    async fn save_user(&self, user: &User) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO conveyor_id_users (id, first_name, last_name, email)
            VALUES (?, ?, ?, ?)
            ON DUPLICATE KEY UPDATE
                first_name = VALUES(first_name), last_name = VALUES(last_name), email = VALUES(email)
            "#,
        )
        .bind(&user.id)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(&user.email)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn find_user(&self, id: &str) -> Result<Option<User>, StoreError> {
        let row = sqlx::query("SELECT id, first_name, last_name, email FROM conveyor_id_users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn list_users(&self) -> Result<Vec<User>, StoreError> {
        let rows = sqlx::query("SELECT id, first_name, last_name, email FROM conveyor_id_users ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(user_from_row).collect()
    }

    async fn delete_user(&self, id: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query("DELETE FROM conveyor_id_memberships WHERE user_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("DELETE FROM conveyor_id_users WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)
    }

    async fn save_group(&self, group: &Group) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO conveyor_id_groups (id, name, group_type)
            VALUES (?, ?, ?)
            ON DUPLICATE KEY UPDATE name = VALUES(name), group_type = VALUES(group_type)
            "#,
        )
        .bind(&group.id)
        .bind(&group.name)
        .bind(&group.group_type)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn find_group(&self, id: &str) -> Result<Option<Group>, StoreError> {
        let row = sqlx::query("SELECT id, name, group_type FROM conveyor_id_groups WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(group_from_row).transpose()
    }

    async fn list_groups(&self) -> Result<Vec<Group>, StoreError> {
        let rows = sqlx::query("SELECT id, name, group_type FROM conveyor_id_groups ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(group_from_row).collect()
    }

    async fn delete_group(&self, id: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query("DELETE FROM conveyor_id_memberships WHERE group_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("DELETE FROM conveyor_id_groups WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)
    }

    async fn create_membership(&self, user_id: &str, group_id: &str) -> Result<(), StoreError> {
        if self.find_user(user_id).await?.is_none() {
            return Err(StoreError::not_found("user", user_id));
        }
        if self.find_group(group_id).await?.is_none() {
            return Err(StoreError::not_found("group", group_id));
        }
        sqlx::query("INSERT IGNORE INTO conveyor_id_memberships (user_id, group_id) VALUES (?, ?)")
            .bind(user_id)
            .bind(group_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn delete_membership(&self, user_id: &str, group_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM conveyor_id_memberships WHERE user_id = ? AND group_id = ?")
            .bind(user_id)
            .bind(group_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn groups_of_user(&self, user_id: &str) -> Result<Vec<Group>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT g.id, g.name, g.group_type
            FROM conveyor_id_groups g
            JOIN conveyor_id_memberships m ON m.group_id = g.id
            WHERE m.user_id = ?
            ORDER BY g.id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(group_from_row).collect()
    }

    async fn users_of_group(&self, group_id: &str) -> Result<Vec<User>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT u.id, u.first_name, u.last_name, u.email
            FROM conveyor_id_users u
            JOIN conveyor_id_memberships m ON m.user_id = u.id
            WHERE m.group_id = ?
            ORDER BY u.id
            "#,
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(user_from_row).collect()
    }

    async fn insert_form_definition(&self, definition: &FormDefinition) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO conveyor_form_definitions (id, form_key, name, version, deployed_at, model)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(definition.id.to_string())
        .bind(&definition.key)
        .bind(&definition.name)
        .bind(definition.version)
        .bind(definition.deployed_at)
        .bind(Json(&definition.model))
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(d) if d.is_unique_violation() => StoreError::Duplicate {
                entity: "form definition",
                id: format!("{}:{}", definition.key, definition.version),
            },
            _ => db_err(e),
        })?;
        Ok(())
    }

    async fn find_form_definition(&self, id: Uuid) -> Result<Option<FormDefinition>, StoreError> {
        let row = sqlx::query(
            "SELECT id, form_key, name, version, deployed_at, model FROM conveyor_form_definitions WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(form_definition_from_row).transpose()
    }

    async fn find_latest_form_definition(
        &self,
        key: &str,
    ) -> Result<Option<FormDefinition>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, form_key, name, version, deployed_at, model
            FROM conveyor_form_definitions
            WHERE form_key = ?
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(form_definition_from_row).transpose()
    }

    async fn list_form_definitions(
        &self,
        key: Option<&str>,
    ) -> Result<Vec<FormDefinition>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, form_key, name, version, deployed_at, model
            FROM conveyor_form_definitions
            WHERE (? IS NULL OR form_key = ?)
            ORDER BY form_key, version
            "#,
        )
        .bind(key)
        .bind(key)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(form_definition_from_row).collect()
    }

    async fn list_form_instances(
        &self,
        query: &FormInstanceQuery,
    ) -> Result<Vec<FormInstance>, StoreError> {
        let task_id = opt_uuid(query.task_id);
        let instance_id = opt_uuid(query.instance_id);
        let rows = sqlx::query(
            r#"
            SELECT id, form_definition_id, form_key, task_id, instance_id, submitted_by,
                   submitted_at, field_values, outcome
            FROM conveyor_form_instances
            WHERE (? IS NULL OR form_key = ?)
              AND (? IS NULL OR task_id = ?)
              AND (? IS NULL OR instance_id = ?)
            ORDER BY submitted_at, id
            "#,
        )
        .bind(&query.form_key)
        .bind(&query.form_key)
        .bind(&task_id)
        .bind(&task_id)
        .bind(&instance_id)
        .bind(&instance_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(form_instance_from_row).collect()
    }
}
