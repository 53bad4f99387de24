//! The built engine and the services handed to the rest of the application

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use conveyor_engine::clock::Clock;
use conveyor_engine::config::ProcessEngineConfiguration;
use conveyor_engine::form::{FormEngineFormService, FormRepositoryService, FormService};
use conveyor_engine::history::HistoryService;
use conveyor_engine::identity::IdentityService;
use conveyor_engine::management::ManagementService;
use conveyor_engine::repository::RepositoryService;
use conveyor_engine::runtime::RuntimeService;
use conveyor_engine::task::TaskService;
use conveyor_engine::ProcessEngine;

/// Build the engine; any failure is fatal for the application
pub async fn process_engine(config: ProcessEngineConfiguration) -> Result<ProcessEngine> {
    config
        .build_process_engine()
        .await
        .context("Failed to build process engine")
}

/// Shared handle to the engine with one accessor per service
#[derive(Debug, Clone)]
pub struct EngineServices {
    engine: Arc<ProcessEngine>,
}

impl EngineServices {
    pub fn new(engine: ProcessEngine) -> Self {
        Self {
            engine: Arc::new(engine),
        }
    }

    pub fn engine(&self) -> &ProcessEngine {
        &self.engine
    }

    pub fn repository_service(&self) -> RepositoryService {
        self.engine.repository_service()
    }

    pub fn runtime_service(&self) -> RuntimeService {
        self.engine.runtime_service()
    }

    pub fn task_service(&self) -> TaskService {
        self.engine.task_service()
    }

    pub fn history_service(&self) -> HistoryService {
        self.engine.history_service()
    }

    pub fn identity_service(&self) -> IdentityService {
        self.engine.identity_service()
    }

    pub fn management_service(&self) -> ManagementService {
        self.engine.management_service()
    }

    pub fn form_service(&self) -> FormService {
        self.engine.form_service()
    }

    pub fn form_repository_service(&self) -> FormRepositoryService {
        self.engine.form_repository_service()
    }

    pub fn form_engine_form_service(&self) -> FormEngineFormService {
        self.engine.form_engine_form_service()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.engine.clock()
    }

    pub async fn close(&self) {
        self.engine.close().await;
    }
}

fn is_definition_resource(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml" | "yml" | "json")
    )
}

/// Deploy every definition file in `dir` as one deployment
///
/// Files identical to the latest deployed version are not redeployed, so
/// restarts do not create new versions. Returns how many definitions the
/// directory maps to, new or already current.
pub async fn deploy_directory(services: &EngineServices, dir: &Path) -> Result<usize> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("Failed to read deploy directory {}", dir.display()))?;

    let mut resources = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !is_definition_resource(&path) {
            continue;
        }
        let source = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        resources.push((name, source));
    }
    resources.sort_by(|a, b| a.0.cmp(&b.0));

    if resources.is_empty() {
        warn!(dir = %dir.display(), "No definitions found to deploy");
        return Ok(0);
    }

    let mut deployment = services
        .repository_service()
        .create_deployment()
        .name(dir.display().to_string())
        .enable_duplicate_filtering();
    for (name, source) in resources {
        deployment = deployment.add_resource(name, source);
    }
    let result = deployment
        .deploy()
        .await
        .with_context(|| format!("Failed to deploy definitions from {}", dir.display()))?;

    info!(
        dir = %dir.display(),
        definitions = result.definitions.len(),
        "Definitions deployed"
    );
    Ok(result.definitions.len())
}
