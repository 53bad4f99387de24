//! Deployments and versioned process definitions

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::definition::{parse_definition, ProcessModel, SourceFormat};
use crate::engine::EngineContext;
use crate::error::{EngineError, Result};

/// A set of resources deployed together
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: Uuid,
    pub name: Option<String>,
    pub deployed_at: DateTime<Utc>,
    pub resource_names: Vec<String>,
}

/// One version of a process, as stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub id: Uuid,
    pub key: String,
    pub name: Option<String>,
    pub version: i32,
    pub deployment_id: Uuid,
    pub resource_name: String,
    /// Resource text; re-parsed on cache misses
    pub source: String,
    pub suspended: bool,
    pub has_start_form: bool,
    pub deployed_at: DateTime<Utc>,
}

/// Result of a deployment
#[derive(Debug, Clone)]
pub struct DeploymentResult {
    pub deployment: Deployment,
    pub definitions: Vec<ProcessDefinition>,
}

/// Manages deployments and definition lookups
#[derive(Clone)]
pub struct RepositoryService {
    ctx: Arc<EngineContext>,
}

impl RepositoryService {
    pub(crate) fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Start building a deployment
    pub fn create_deployment(&self) -> DeploymentBuilder {
        DeploymentBuilder {
            ctx: self.ctx.clone(),
            name: None,
            resources: Vec::new(),
            duplicate_filtering: false,
        }
    }

    pub async fn get_process_definition(&self, id: Uuid) -> Result<ProcessDefinition> {
        self.ctx.definition(id).await
    }

    /// Highest version deployed under `key`
    pub async fn get_latest_process_definition(&self, key: &str) -> Result<ProcessDefinition> {
        self.ctx
            .store
            .find_latest_definition(key)
            .await?
            .ok_or_else(|| EngineError::DefinitionNotFound(key.to_string()))
    }

    /// All definitions, or all versions of one key, ordered by key then version
    pub async fn list_process_definitions(&self, key: Option<&str>) -> Result<Vec<ProcessDefinition>> {
        Ok(self.ctx.store.list_definitions(key).await?)
    }

    pub async fn list_deployments(&self) -> Result<Vec<Deployment>> {
        Ok(self.ctx.store.list_deployments().await?)
    }

    /// Parsed model, served from the definition cache
    pub async fn get_model(&self, definition_id: Uuid) -> Result<Arc<ProcessModel>> {
        let definition = self.ctx.definition(definition_id).await?;
        self.ctx.model(&definition)
    }

    /// New instances cannot be started from a suspended definition
    #[instrument(skip(self))]
    pub async fn suspend_process_definition(&self, id: Uuid) -> Result<()> {
        self.ctx.definition(id).await?;
        self.ctx.store.set_definition_suspended(id, true).await?;
        info!(definition_id = %id, "process definition suspended");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn activate_process_definition(&self, id: Uuid) -> Result<()> {
        self.ctx.definition(id).await?;
        self.ctx.store.set_definition_suspended(id, false).await?;
        info!(definition_id = %id, "process definition activated");
        Ok(())
    }
}

/// Collects resources for one deployment
pub struct DeploymentBuilder {
    ctx: Arc<EngineContext>,
    name: Option<String>,
    resources: Vec<(String, String)>,
    duplicate_filtering: bool,
}

impl DeploymentBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Add a definition resource; the extension selects YAML or JSON
    pub fn add_resource(mut self, name: impl Into<String>, source: impl Into<String>) -> Self {
        self.resources.push((name.into(), source.into()));
        self
    }

    /// Skip resources identical to the latest deployed version of their key
    pub fn enable_duplicate_filtering(mut self) -> Self {
        self.duplicate_filtering = true;
        self
    }

    /// Parse every resource and store the deployment
    ///
    /// Either all resources deploy or none do.
    #[instrument(skip(self), fields(name = ?self.name, resources = self.resources.len()))]
    pub async fn deploy(self) -> Result<DeploymentResult> {
        if self.resources.is_empty() {
            return Err(EngineError::IllegalArgument(
                "deployment has no resources".into(),
            ));
        }

        let ctx = self.ctx;
        let now = ctx.now();
        let deployment = Deployment {
            id: Uuid::now_v7(),
            name: self.name,
            deployed_at: now,
            resource_names: self.resources.iter().map(|(n, _)| n.clone()).collect(),
        };

        let mut definitions = Vec::new();
        let mut models = Vec::new();
        let mut reused = Vec::new();
        let mut next_versions: HashMap<String, i32> = HashMap::new();

        for (resource_name, source) in &self.resources {
            let format = SourceFormat::from_resource_name(resource_name)?;
            let model = parse_definition(source, format, &ctx.parse_options)?;
            let key = model.key().to_string();

            let latest = ctx.store.find_latest_definition(&key).await?;
            if self.duplicate_filtering {
                if let Some(latest) = latest.as_ref().filter(|d| &d.source == source) {
                    reused.push(latest.clone());
                    continue;
                }
            }

            let version = match next_versions.get(&key) {
                Some(v) => *v,
                None => latest.map_or(1, |d| d.version + 1),
            };
            next_versions.insert(key.clone(), version + 1);

            let definition = ProcessDefinition {
                id: Uuid::now_v7(),
                key,
                name: model.name().map(str::to_string),
                version,
                deployment_id: deployment.id,
                resource_name: resource_name.clone(),
                source: source.clone(),
                suspended: false,
                has_start_form: model.has_start_form(),
                deployed_at: now,
            };
            models.push((definition.id, Arc::new(model)));
            definitions.push(definition);
        }

        if !definitions.is_empty() {
            ctx.store.insert_deployment(&deployment, &definitions).await?;
            for (id, model) in models {
                ctx.cache.insert(id, model);
            }
        }

        for definition in &definitions {
            info!(
                definition_id = %definition.id,
                key = %definition.key,
                version = definition.version,
                "deployed process definition"
            );
        }

        definitions.extend(reused);
        Ok(DeploymentResult {
            deployment,
            definitions,
        })
    }
}
