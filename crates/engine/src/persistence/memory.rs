//! In-memory implementation of ProcessStore for testing

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;
use crate::form::{FormDefinition, FormInstance, FormInstanceQuery};
use crate::history::{
    HistoricActivityInstance, HistoricDetail, HistoricInstanceQuery, HistoricProcessInstance,
    HistoricTaskInstance, HistoricVariable, HistoryRecord,
};
use crate::identity::{Group, User};
use crate::jobs::{Job, JobFilter, JobKind};
use crate::repository::{Deployment, ProcessDefinition};
use crate::runtime::{Changeset, InstanceFilter, ProcessInstance};
use crate::task::{Task, TaskQuery};

#[derive(Default)]
struct MemoryState {
    deployments: Vec<Deployment>,
    definitions: HashMap<Uuid, ProcessDefinition>,
    instances: HashMap<Uuid, ProcessInstance>,
    tasks: HashMap<Uuid, Task>,
    jobs: HashMap<Uuid, Job>,
    hi_instances: HashMap<Uuid, HistoricProcessInstance>,
    hi_activities: HashMap<Uuid, HistoricActivityInstance>,
    hi_tasks: HashMap<Uuid, HistoricTaskInstance>,
    hi_variables: HashMap<(Uuid, String), HistoricVariable>,
    hi_details: Vec<HistoricDetail>,
    users: HashMap<String, User>,
    groups: HashMap<String, Group>,
    memberships: HashSet<(String, String)>,
    form_definitions: HashMap<Uuid, FormDefinition>,
    form_instances: Vec<FormInstance>,
}

impl MemoryState {
    /// Reject the changeset if any revision is stale
    fn check_revisions(&self, changeset: &Changeset) -> Result<(), StoreError> {
        if let Some(instance) = &changeset.instance {
            let actual = self
                .instances
                .get(&instance.id)
                .map_or(0, |stored| stored.revision);
            if actual != instance.revision {
                return Err(StoreError::conflict(
                    "process instance",
                    instance.id,
                    instance.revision,
                    actual,
                ));
            }
        }
        for task in &changeset.tasks_updated {
            let actual = self.tasks.get(&task.id).map_or(0, |t| t.revision);
            if actual != task.revision {
                return Err(StoreError::conflict("task", task.id, task.revision, actual));
            }
        }
        for id in &changeset.tasks_deleted {
            if !self.tasks.contains_key(id) {
                return Err(StoreError::conflict("task", id, 1, 0));
            }
        }
        for job in &changeset.jobs_updated {
            let actual = self.jobs.get(&job.id).map_or(0, |j| j.revision);
            if actual != job.revision {
                return Err(StoreError::conflict("job", job.id, job.revision, actual));
            }
        }
        for id in &changeset.jobs_deleted {
            if !self.jobs.contains_key(id) {
                return Err(StoreError::conflict("job", id, 1, 0));
            }
        }
        Ok(())
    }

    fn apply_history(&mut self, record: HistoryRecord) {
        match record {
            HistoryRecord::ProcessInstance(r) => {
                self.hi_instances.insert(r.id, r);
            }
            HistoryRecord::ActivityInstance(r) => {
                self.hi_activities.insert(r.id, r);
            }
            HistoryRecord::TaskInstance(r) => {
                self.hi_tasks.insert(r.id, r);
            }
            HistoryRecord::Variable(mut r) => {
                let key = (r.instance_id, r.name.clone());
                if let Some(existing) = self.hi_variables.get(&key) {
                    r.created_at = existing.created_at;
                }
                self.hi_variables.insert(key, r);
            }
            HistoryRecord::Detail(r) => self.hi_details.push(r),
        }
    }
}

/// In-memory implementation of ProcessStore
///
/// Provides the same semantics as the MySQL implementation, including
/// revision checks, so engine behaviour can be tested without a database.
///
/// # Example
///
/// ```
/// use conveyor_engine::persistence::InMemoryProcessStore;
///
/// let store = InMemoryProcessStore::new();
/// assert_eq!(store.instance_count(), 0);
/// ```
pub struct InMemoryProcessStore {
    state: RwLock<MemoryState>,
}

impl InMemoryProcessStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
        }
    }

    pub fn instance_count(&self) -> usize {
        self.state.read().instances.len()
    }

    pub fn job_count(&self) -> usize {
        self.state.read().jobs.len()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        *self.state.write() = MemoryState::default();
    }
}

impl Default for InMemoryProcessStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessStore for InMemoryProcessStore {
    async fn verify_schema(&self, _include_form_tables: bool) -> Result<(), StoreError> {
        Ok(())
    }

    async fn schema_version(&self) -> Result<Option<String>, StoreError> {
        Ok(Some(SCHEMA_VERSION.to_string()))
    }

    async fn table_counts(&self) -> Result<BTreeMap<String, u64>, StoreError> {
        let state = self.state.read();
        let counts = [
            ("conveyor_deployments", state.deployments.len()),
            ("conveyor_process_definitions", state.definitions.len()),
            ("conveyor_process_instances", state.instances.len()),
            ("conveyor_tasks", state.tasks.len()),
            ("conveyor_jobs", state.jobs.len()),
            ("conveyor_hi_process_instances", state.hi_instances.len()),
            ("conveyor_hi_activity_instances", state.hi_activities.len()),
            ("conveyor_hi_task_instances", state.hi_tasks.len()),
            ("conveyor_hi_variables", state.hi_variables.len()),
            ("conveyor_hi_details", state.hi_details.len()),
            ("conveyor_id_users", state.users.len()),
            ("conveyor_id_groups", state.groups.len()),
            ("conveyor_id_memberships", state.memberships.len()),
            ("conveyor_form_definitions", state.form_definitions.len()),
            ("conveyor_form_instances", state.form_instances.len()),
        ];
        Ok(counts
            .into_iter()
            .map(|(table, count)| (table.to_string(), count as u64))
            .collect())
    }

    async fn insert_deployment(
        &self,
        deployment: &Deployment,
        definitions: &[ProcessDefinition],
    ) -> Result<(), StoreError> {
        let mut state = self.state.write();
        for definition in definitions {
            let taken = state
                .definitions
                .values()
                .any(|d| d.key == definition.key && d.version == definition.version);
            if taken {
                return Err(StoreError::Duplicate {
                    entity: "process definition",
                    id: format!("{}:{}", definition.key, definition.version),
                });
            }
        }
        state.deployments.push(deployment.clone());
        for definition in definitions {
            state.definitions.insert(definition.id, definition.clone());
        }
        Ok(())
    }

    async fn list_deployments(&self) -> Result<Vec<Deployment>, StoreError> {
        Ok(self.state.read().deployments.clone())
    }

    async fn find_definition(&self, id: Uuid) -> Result<Option<ProcessDefinition>, StoreError> {
        Ok(self.state.read().definitions.get(&id).cloned())
    }

    async fn find_latest_definition(
        &self,
        key: &str,
    ) -> Result<Option<ProcessDefinition>, StoreError> {
        Ok(self
            .state
            .read()
            .definitions
            .values()
            .filter(|d| d.key == key)
            .max_by_key(|d| d.version)
            .cloned())
    }

    async fn list_definitions(
        &self,
        key: Option<&str>,
    ) -> Result<Vec<ProcessDefinition>, StoreError> {
        let mut definitions: Vec<ProcessDefinition> = self
            .state
            .read()
            .definitions
            .values()
            .filter(|d| key.map_or(true, |k| d.key == k))
            .cloned()
            .collect();
        definitions.sort_by(|a, b| a.key.cmp(&b.key).then(a.version.cmp(&b.version)));
        Ok(definitions)
    }

    async fn set_definition_suspended(&self, id: Uuid, suspended: bool) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let definition = state
            .definitions
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("process definition", id))?;
        definition.suspended = suspended;
        Ok(())
    }

    async fn find_instance(&self, id: Uuid) -> Result<Option<ProcessInstance>, StoreError> {
        Ok(self.state.read().instances.get(&id).cloned())
    }

    async fn list_instances(
        &self,
        filter: &InstanceFilter,
    ) -> Result<Vec<ProcessInstance>, StoreError> {
        let mut instances: Vec<ProcessInstance> = self
            .state
            .read()
            .instances
            .values()
            .filter(|i| filter.matches(i))
            .cloned()
            .collect();
        instances.sort_by_key(|i| (i.started_at, i.id));
        Ok(instances)
    }

    async fn commit(&self, changeset: Changeset) -> Result<(), StoreError> {
        let mut state = self.state.write();
        state.check_revisions(&changeset)?;

        let Changeset {
            instance,
            tasks_inserted,
            tasks_updated,
            tasks_deleted,
            jobs_inserted,
            jobs_updated,
            jobs_deleted,
            form_instances,
            history,
        } = changeset;

        if let Some(mut instance) = instance {
            instance.revision += 1;
            state.instances.insert(instance.id, instance);
        }
        for id in tasks_deleted {
            state.tasks.remove(&id);
        }
        for mut task in tasks_inserted.into_iter().chain(tasks_updated) {
            task.revision += 1;
            state.tasks.insert(task.id, task);
        }
        for id in jobs_deleted {
            state.jobs.remove(&id);
        }
        for mut job in jobs_inserted.into_iter().chain(jobs_updated) {
            job.revision += 1;
            state.jobs.insert(job.id, job);
        }
        state.form_instances.extend(form_instances);
        for record in history {
            state.apply_history(record);
        }
        Ok(())
    }

    async fn find_task(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        Ok(self.state.read().tasks.get(&id).cloned())
    }

    async fn list_tasks(&self, query: &TaskQuery) -> Result<Vec<Task>, StoreError> {
        let mut tasks: Vec<Task> = self
            .state
            .read()
            .tasks
            .values()
            .filter(|t| query.matches(t))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        Ok(tasks)
    }

    async fn acquire_jobs(
        &self,
        kind: JobKind,
        now: DateTime<Utc>,
        owner: &str,
        lock_until: DateTime<Utc>,
        max: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let mut state = self.state.write();
        let mut candidates: Vec<&mut Job> = state
            .jobs
            .values_mut()
            .filter(|j| j.kind == kind && j.is_acquirable(now))
            .collect();
        candidates.sort_by_key(|j| (j.due_at, j.id));

        Ok(candidates
            .into_iter()
            .take(max)
            .map(|job| {
                job.lock_owner = Some(owner.to_string());
                job.lock_expires_at = Some(lock_until);
                job.revision += 1;
                job.clone()
            })
            .collect())
    }

    async fn find_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.state.read().jobs.get(&id).cloned())
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let mut jobs: Vec<Job> = self
            .state
            .read()
            .jobs
            .values()
            .filter(|j| filter.matches(j))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.due_at, j.id));
        Ok(jobs)
    }

    async fn list_historic_instances(
        &self,
        query: &HistoricInstanceQuery,
    ) -> Result<Vec<HistoricProcessInstance>, StoreError> {
        let mut records: Vec<HistoricProcessInstance> = self
            .state
            .read()
            .hi_instances
            .values()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        records.sort_by_key(|r| (r.started_at, r.id));
        Ok(records)
    }

    async fn list_historic_activities(
        &self,
        instance_id: Uuid,
    ) -> Result<Vec<HistoricActivityInstance>, StoreError> {
        let mut records: Vec<HistoricActivityInstance> = self
            .state
            .read()
            .hi_activities
            .values()
            .filter(|r| r.instance_id == instance_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| (r.started_at, r.id));
        Ok(records)
    }

    async fn list_historic_tasks(
        &self,
        instance_id: Option<Uuid>,
    ) -> Result<Vec<HistoricTaskInstance>, StoreError> {
        let mut records: Vec<HistoricTaskInstance> = self
            .state
            .read()
            .hi_tasks
            .values()
            .filter(|r| instance_id.map_or(true, |id| r.instance_id == id))
            .cloned()
            .collect();
        records.sort_by_key(|r| (r.created_at, r.id));
        Ok(records)
    }

    async fn list_historic_variables(
        &self,
        instance_id: Uuid,
    ) -> Result<Vec<HistoricVariable>, StoreError> {
        let mut records: Vec<HistoricVariable> = self
            .state
            .read()
            .hi_variables
            .values()
            .filter(|r| r.instance_id == instance_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    async fn list_historic_details(
        &self,
        instance_id: Uuid,
    ) -> Result<Vec<HistoricDetail>, StoreError> {
        Ok(self
            .state
            .read()
            .hi_details
            .iter()
            .filter(|r| r.instance_id == instance_id)
            .cloned()
            .collect())
    }

    async fn save_user(&self, user: &User) -> Result<(), StoreError> {
        self.state.write().users.insert(user.id.clone(), user.clone());
        Ok(())
    }

    async fn find_user(&self, id: &str) -> Result<Option<User>, StoreError> {
        Ok(self.state.read().users.get(id).cloned())
    }

    async fn list_users(&self) -> Result<Vec<User>, StoreError> {
        let mut users: Vec<User> = self.state.read().users.values().cloned().collect();
        users.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(users)
    }

    async fn delete_user(&self, id: &str) -> Result<(), StoreError> {
        let mut state = self.state.write();
        state.users.remove(id);
        state.memberships.retain(|(user, _)| user != id);
        Ok(())
    }

    async fn save_group(&self, group: &Group) -> Result<(), StoreError> {
        self.state
            .write()
            .groups
            .insert(group.id.clone(), group.clone());
        Ok(())
    }

    async fn find_group(&self, id: &str) -> Result<Option<Group>, StoreError> {
        Ok(self.state.read().groups.get(id).cloned())
    }

    async fn list_groups(&self) -> Result<Vec<Group>, StoreError> {
        let mut groups: Vec<Group> = self.state.read().groups.values().cloned().collect();
        groups.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(groups)
    }

    async fn delete_group(&self, id: &str) -> Result<(), StoreError> {
        let mut state = self.state.write();
        state.groups.remove(id);
        state.memberships.retain(|(_, group)| group != id);
        Ok(())
    }

    async fn create_membership(&self, user_id: &str, group_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.write();
        if !state.users.contains_key(user_id) {
            return Err(StoreError::not_found("user", user_id));
        }
        if !state.groups.contains_key(group_id) {
            return Err(StoreError::not_found("group", group_id));
        }
        state
            .memberships
            .insert((user_id.to_string(), group_id.to_string()));
        Ok(())
    }

    async fn delete_membership(&self, user_id: &str, group_id: &str) -> Result<(), StoreError> {
        self.state
            .write()
            .memberships
            .remove(&(user_id.to_string(), group_id.to_string()));
        Ok(())
    }

    async fn groups_of_user(&self, user_id: &str) -> Result<Vec<Group>, StoreError> {
        let state = self.state.read();
        let mut groups: Vec<Group> = state
            .memberships
            .iter()
            .filter(|(user, _)| user == user_id)
            .filter_map(|(_, group)| state.groups.get(group).cloned())
            .collect();
        groups.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(groups)
    }

    async fn users_of_group(&self, group_id: &str) -> Result<Vec<User>, StoreError> {
        let state = self.state.read();
        let mut users: Vec<User> = state
            .memberships
            .iter()
            .filter(|(_, group)| group == group_id)
            .filter_map(|(user, _)| state.users.get(user).cloned())
            .collect();
        users.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(users)
    }

    async fn insert_form_definition(&self, definition: &FormDefinition) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let taken = state
            .form_definitions
            .values()
            .any(|d| d.key == definition.key && d.version == definition.version);
        if taken {
            return Err(StoreError::Duplicate {
                entity: "form definition",
                id: format!("{}:{}", definition.key, definition.version),
            });
        }
        state
            .form_definitions
            .insert(definition.id, definition.clone());
        Ok(())
    }

    async fn find_form_definition(&self, id: Uuid) -> Result<Option<FormDefinition>, StoreError> {
        Ok(self.state.read().form_definitions.get(&id).cloned())
    }

    async fn find_latest_form_definition(
        &self,
        key: &str,
    ) -> Result<Option<FormDefinition>, StoreError> {
        Ok(self
            .state
            .read()
            .form_definitions
            .values()
            .filter(|d| d.key == key)
            .max_by_key(|d| d.version)
            .cloned())
    }

    async fn list_form_definitions(
        &self,
        key: Option<&str>,
    ) -> Result<Vec<FormDefinition>, StoreError> {
        let mut definitions: Vec<FormDefinition> = self
            .state
            .read()
            .form_definitions
            .values()
            .filter(|d| key.map_or(true, |k| d.key == k))
            .cloned()
            .collect();
        definitions.sort_by(|a, b| a.key.cmp(&b.key).then(a.version.cmp(&b.version)));
        Ok(definitions)
    }

    async fn list_form_instances(
        &self,
        query: &FormInstanceQuery,
    ) -> Result<Vec<FormInstance>, StoreError> {
        Ok(self
            .state
            .read()
            .form_instances
            .iter()
            .filter(|f| query.matches(f))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::InstanceStatus;
    use serde_json::Map;

    fn instance() -> ProcessInstance {
        ProcessInstance {
            id: Uuid::now_v7(),
            definition_id: Uuid::now_v7(),
            definition_key: "p".into(),
            business_key: None,
            status: InstanceStatus::Active,
            variables: Map::new(),
            executions: Vec::new(),
            start_user: None,
            started_at: Utc::now(),
            ended_at: None,
            end_reason: None,
            revision: 0,
        }
    }

    #[tokio::test]
    async fn test_commit_bumps_revision_and_detects_stale_writes() {
        let store = InMemoryProcessStore::new();
        let inst = instance();

        store
            .commit(Changeset {
                instance: Some(inst.clone()),
                ..Default::default()
            })
            .await
            .unwrap();
        let stored = store.find_instance(inst.id).await.unwrap().unwrap();
        assert_eq!(stored.revision, 1);

        // a second writer still holding revision 0 loses
        let err = store
            .commit(Changeset {
                instance: Some(inst.clone()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::ConcurrencyConflict {
                expected: 0,
                actual: 1,
                ..
            }
        ));

        store
            .commit(Changeset {
                instance: Some(stored),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(
            store.find_instance(inst.id).await.unwrap().unwrap().revision,
            2
        );
    }

    #[tokio::test]
    async fn test_failed_commit_writes_nothing() {
        let store = InMemoryProcessStore::new();
        let inst = instance();
        let now = Utc::now();
        let job = Job::new(JobKind::Timer, inst.id, Uuid::now_v7(), "wait", now, 3, now);

        let err = store
            .commit(Changeset {
                instance: Some(inst.clone()),
                jobs_inserted: vec![job],
                jobs_deleted: vec![Uuid::now_v7()],
                ..Default::default()
            })
            .await;
        assert!(err.is_err());
        assert_eq!(store.instance_count(), 0);
        assert_eq!(store.job_count(), 0);
    }

    #[tokio::test]
    async fn test_acquire_locks_jobs_once() {
        let store = InMemoryProcessStore::new();
        let now = Utc::now();
        let due = Job::new(JobKind::Timer, Uuid::now_v7(), Uuid::now_v7(), "t", now, 3, now);
        let later = Job::new(
            JobKind::Timer,
            Uuid::now_v7(),
            Uuid::now_v7(),
            "t",
            now + chrono::Duration::hours(1),
            3,
            now,
        );
        let other_kind = Job::new(
            JobKind::AsyncContinuation,
            Uuid::now_v7(),
            Uuid::now_v7(),
            "a",
            now,
            3,
            now,
        );
        store
            .commit(Changeset {
                jobs_inserted: vec![due.clone(), later, other_kind],
                ..Default::default()
            })
            .await
            .unwrap();

        let lock_until = now + chrono::Duration::minutes(5);
        let acquired = store
            .acquire_jobs(JobKind::Timer, now, "worker-1", lock_until, 10)
            .await
            .unwrap();
        assert_eq!(acquired.len(), 1);
        assert_eq!(acquired[0].id, due.id);
        assert_eq!(acquired[0].lock_owner.as_deref(), Some("worker-1"));

        let again = store
            .acquire_jobs(JobKind::Timer, now, "worker-2", lock_until, 10)
            .await
            .unwrap();
        assert!(again.is_empty());

        // lock expiry makes it acquirable again
        let stolen = store
            .acquire_jobs(JobKind::Timer, lock_until, "worker-2", lock_until, 10)
            .await
            .unwrap();
        assert_eq!(stolen.len(), 1);
    }

    #[tokio::test]
    async fn test_memberships_require_both_sides() {
        let store = InMemoryProcessStore::new();
        store.save_user(&User::new("kim")).await.unwrap();
        assert!(matches!(
            store.create_membership("kim", "yard").await,
            Err(StoreError::NotFound { entity: "group", .. })
        ));

        store.save_group(&Group::new("yard")).await.unwrap();
        store.create_membership("kim", "yard").await.unwrap();
        assert_eq!(store.groups_of_user("kim").await.unwrap().len(), 1);

        store.delete_group("yard").await.unwrap();
        assert!(store.users_of_group("yard").await.unwrap().is_empty());
    }
}
