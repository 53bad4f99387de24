//! Runtime service

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::instrument;
use uuid::Uuid;

use super::command;
use super::{CommandExtras, InstanceFilter, ProcessInstance};
use crate::engine::EngineContext;
use crate::error::{EngineError, Result};

/// Start, inspect and signal process instances
#[derive(Clone)]
pub struct RuntimeService {
    ctx: Arc<EngineContext>,
}

impl RuntimeService {
    pub(crate) fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Start the latest version of the definition with `key`
    pub async fn start_process_instance_by_key(
        &self,
        key: &str,
        business_key: Option<String>,
        variables: Map<String, Value>,
    ) -> Result<ProcessInstance> {
        let mut builder = self
            .create_process_instance_builder()
            .definition_key(key)
            .variables(variables);
        if let Some(business_key) = business_key {
            builder = builder.business_key(business_key);
        }
        builder.start().await
    }

    pub async fn start_process_instance_by_id(
        &self,
        definition_id: Uuid,
        business_key: Option<String>,
        variables: Map<String, Value>,
    ) -> Result<ProcessInstance> {
        let mut builder = self
            .create_process_instance_builder()
            .definition_id(definition_id)
            .variables(variables);
        if let Some(business_key) = business_key {
            builder = builder.business_key(business_key);
        }
        builder.start().await
    }

    pub fn create_process_instance_builder(&self) -> ProcessInstanceBuilder {
        ProcessInstanceBuilder::new(self.ctx.clone())
    }

    pub async fn get_process_instance(&self, instance_id: Uuid) -> Result<Option<ProcessInstance>> {
        Ok(self.ctx.store.find_instance(instance_id).await?)
    }

    pub async fn list_process_instances(&self, filter: &InstanceFilter) -> Result<Vec<ProcessInstance>> {
        Ok(self.ctx.store.list_instances(filter).await?)
    }

    pub async fn get_variables(&self, instance_id: Uuid) -> Result<Map<String, Value>> {
        self.ctx
            .store
            .find_instance(instance_id)
            .await?
            .map(|instance| instance.variables)
            .ok_or(EngineError::InstanceNotFound(instance_id))
    }

    pub async fn get_variable(&self, instance_id: Uuid, name: &str) -> Result<Option<Value>> {
        Ok(self.get_variables(instance_id).await?.remove(name))
    }

    /// Merge variables into an active instance
    pub async fn set_variables(&self, instance_id: Uuid, variables: Map<String, Value>) -> Result<()> {
        command::set_variables(&self.ctx, instance_id, variables).await
    }

    /// Move an execution waiting in `activity_id` forward
    ///
    /// Works for receive tasks and timers (the pending timer job is dropped);
    /// an async service or business rule task runs immediately.
    pub async fn trigger(
        &self,
        instance_id: Uuid,
        activity_id: &str,
        variables: Map<String, Value>,
    ) -> Result<ProcessInstance> {
        command::trigger(&self.ctx, instance_id, activity_id, variables).await
    }

    /// Cancel an active instance, removing its tasks and jobs
    pub async fn delete_process_instance(
        &self,
        instance_id: Uuid,
        reason: Option<String>,
    ) -> Result<()> {
        command::delete_instance(&self.ctx, instance_id, reason).await
    }
}

/// Fluent start of a process instance
///
/// # Example
///
/// ```ignore
/// let instance = engine
///     .runtime_service()
///     .create_process_instance_builder()
///     .definition_key("wagon-inspection")
///     .business_key("WAG-1042")
///     .variable("wagon", json!("318054761230"))
///     .start()
///     .await?;
/// ```
pub struct ProcessInstanceBuilder {
    ctx: Arc<EngineContext>,
    definition_key: Option<String>,
    definition_id: Option<Uuid>,
    business_key: Option<String>,
    start_user: Option<String>,
    variables: Map<String, Value>,
    extras: CommandExtras,
}

impl ProcessInstanceBuilder {
    pub(crate) fn new(ctx: Arc<EngineContext>) -> Self {
        Self {
            ctx,
            definition_key: None,
            definition_id: None,
            business_key: None,
            start_user: None,
            variables: Map::new(),
            extras: CommandExtras::default(),
        }
    }

    pub fn definition_key(mut self, key: impl Into<String>) -> Self {
        self.definition_key = Some(key.into());
        self
    }

    pub fn definition_id(mut self, id: Uuid) -> Self {
        self.definition_id = Some(id);
        self
    }

    pub fn business_key(mut self, business_key: impl Into<String>) -> Self {
        self.business_key = Some(business_key.into());
        self
    }

    pub fn start_user(mut self, user_id: impl Into<String>) -> Self {
        self.start_user = Some(user_id.into());
        self
    }

    pub fn variables(mut self, variables: Map<String, Value>) -> Self {
        self.variables.extend(variables);
        self
    }

    pub fn variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    pub(crate) fn extras(mut self, extras: CommandExtras) -> Self {
        self.extras = extras;
        self
    }

    #[instrument(skip(self), fields(key = ?self.definition_key, id = ?self.definition_id))]
    pub async fn start(self) -> Result<ProcessInstance> {
        let definition = match (self.definition_id, &self.definition_key) {
            (Some(id), _) => self.ctx.definition(id).await?,
            (None, Some(key)) => self
                .ctx
                .store
                .find_latest_definition(key)
                .await?
                .ok_or_else(|| EngineError::DefinitionNotFound(key.clone()))?,
            (None, None) => {
                return Err(EngineError::IllegalArgument(
                    "a definition key or id is required to start a process instance".into(),
                ))
            }
        };
        command::start_instance(
            &self.ctx,
            &definition,
            self.business_key,
            self.start_user,
            self.variables,
            self.extras,
        )
        .await
    }
}
