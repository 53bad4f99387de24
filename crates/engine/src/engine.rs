//! The process engine and the state its services share

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::MailServerConfig;
use crate::decision::DecisionEvaluator;
use crate::definition::{parse_definition, DefinitionCache, ParseOptions, ProcessModel, SourceFormat};
use crate::delegate::ServiceTaskHandler;
use crate::error::{EngineError, Result};
use crate::form::{FormEngineFormService, FormRepositoryService, FormService, FormTypes};
use crate::history::{HistoryLevel, HistoryService};
use crate::identity::IdentityService;
use crate::jobs::{AsyncExecutor, AsyncExecutorConfig, AsyncExecutorHandle};
use crate::management::ManagementService;
use crate::persistence::ProcessStore;
use crate::repository::{ProcessDefinition, RepositoryService};
use crate::runtime::RuntimeService;
use crate::task::TaskService;

/// State shared by every service of one engine
pub(crate) struct EngineContext {
    pub store: Arc<dyn ProcessStore>,
    pub cache: DefinitionCache,
    pub clock: Arc<dyn Clock>,
    pub history_level: HistoryLevel,
    pub parse_options: ParseOptions,
    pub form_types: FormTypes,
    pub handlers: HashMap<String, Arc<dyn ServiceTaskHandler>>,
    pub decisions: Option<Arc<dyn DecisionEvaluator>>,
    pub job_retries: u32,
    pub failed_job_retry_wait: Duration,
    pub database_type: String,
    pub mail: Option<MailServerConfig>,
    pub executor_running: AtomicBool,
}

impl EngineContext {
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub async fn definition(&self, id: Uuid) -> Result<ProcessDefinition> {
        self.store
            .find_definition(id)
            .await?
            .ok_or_else(|| EngineError::DefinitionNotFound(id.to_string()))
    }

    /// Parsed model of a definition; parses and caches on a miss
    pub fn model(&self, definition: &ProcessDefinition) -> Result<Arc<ProcessModel>> {
        if let Some(model) = self.cache.get(&definition.id) {
            return Ok(model);
        }
        let format = SourceFormat::from_resource_name(&definition.resource_name)?;
        let model = Arc::new(parse_definition(&definition.source, format, &self.parse_options)?);
        self.cache.insert(definition.id, Arc::clone(&model));
        debug!(definition_id = %definition.id, key = %definition.key, "definition cached");
        Ok(model)
    }
}

/// A built process engine
///
/// Cheap service handles are created on demand; they all share the same
/// store, cache and clock. Call [`ProcessEngine::close`] to stop the async
/// executor.
pub struct ProcessEngine {
    ctx: Arc<EngineContext>,
    executor_config: AsyncExecutorConfig,
    executor: Mutex<Option<AsyncExecutorHandle>>,
}

impl ProcessEngine {
    pub(crate) fn new(ctx: Arc<EngineContext>, executor_config: AsyncExecutorConfig) -> Self {
        Self {
            ctx,
            executor_config,
            executor: Mutex::new(None),
        }
    }

    #[cfg(test)]
    pub(crate) fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    pub fn repository_service(&self) -> RepositoryService {
        RepositoryService::new(Arc::clone(&self.ctx))
    }

    pub fn runtime_service(&self) -> RuntimeService {
        RuntimeService::new(Arc::clone(&self.ctx))
    }

    pub fn task_service(&self) -> TaskService {
        TaskService::new(Arc::clone(&self.ctx))
    }

    pub fn history_service(&self) -> HistoryService {
        HistoryService::new(Arc::clone(&self.ctx))
    }

    pub fn identity_service(&self) -> IdentityService {
        IdentityService::new(Arc::clone(&self.ctx))
    }

    pub fn management_service(&self) -> ManagementService {
        ManagementService::new(Arc::clone(&self.ctx))
    }

    pub fn form_service(&self) -> FormService {
        FormService::new(Arc::clone(&self.ctx))
    }

    pub fn form_repository_service(&self) -> FormRepositoryService {
        FormRepositoryService::new(Arc::clone(&self.ctx))
    }

    pub fn form_engine_form_service(&self) -> FormEngineFormService {
        FormEngineFormService::new(Arc::clone(&self.ctx))
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.ctx.clock)
    }

    pub fn mail_server(&self) -> Option<&MailServerConfig> {
        self.ctx.mail.as_ref()
    }

    pub fn history_level(&self) -> HistoryLevel {
        self.ctx.history_level
    }

    /// Executor over this engine's jobs that is not started; drive it with
    /// [`AsyncExecutor::poll_once`]
    pub fn async_executor(&self) -> AsyncExecutor {
        AsyncExecutor::new(Arc::clone(&self.ctx), self.executor_config.clone())
    }

    /// Start the background executor; does nothing if it already runs
    pub fn start_async_executor(&self) {
        let mut executor = self.executor.lock();
        if executor.is_none() {
            *executor = Some(self.async_executor().start());
        }
    }

    pub fn is_async_executor_running(&self) -> bool {
        self.ctx.executor_running.load(Ordering::Acquire)
    }

    /// Stop the async executor and wait for in-flight jobs
    pub async fn close(&self) {
        let handle = self.executor.lock().take();
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
        info!("Process engine closed");
    }
}

impl std::fmt::Debug for ProcessEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessEngine")
            .field("database_type", &self.ctx.database_type)
            .field("history_level", &self.ctx.history_level)
            .field("cache", &self.ctx.cache)
            .field("async_executor_running", &self.is_async_executor_running())
            .finish()
    }
}
