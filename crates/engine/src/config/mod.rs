//! Process engine configuration
//!
//! [`ProcessEngineConfiguration`] collects every setting the engine needs and
//! builds a [`ProcessEngine`] from them. Values usually come from an
//! [`Environment`], but every field can also be set programmatically.

mod configurator;
mod environment;
mod mail;

pub use configurator::{EngineConfigurator, DEFAULT_CONFIGURATOR_PRIORITY};
pub use environment::{env_var_name, Environment, CONFIG_FILE_VAR, DEFAULT_CONFIG_FILE};
pub use mail::MailServerConfig;

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use sqlx::MySqlPool;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::decision::DecisionEvaluator;
use crate::definition::{DefinitionCache, ParseHandler, ParseOptions};
use crate::delegate::ServiceTaskHandler;
use crate::engine::{EngineContext, ProcessEngine};
use crate::error::Result;
use crate::form::{lock_schema_management, FormType, FormTypes};
use crate::history::HistoryLevel;
use crate::jobs::AsyncExecutorConfig;
use crate::persistence::{InMemoryProcessStore, MySqlProcessStore, ProcessStore};

/// Configuration errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("required property '{0}' is not set")]
    MissingProperty(String),

    #[error("invalid value '{value}' for property '{key}': {message}")]
    InvalidValue {
        key: String,
        value: String,
        message: String,
    },

    #[error("cannot read configuration file {path}: {message}")]
    Io { path: String, message: String },

    #[error("invalid configuration file: {0}")]
    Yaml(String),
}

/// Where engine state lives
#[derive(Clone)]
pub enum DataSource {
    MySql(MySqlPool),
    InMemory(Arc<InMemoryProcessStore>),
}

impl DataSource {
    /// Fresh in-memory store
    pub fn in_memory() -> Self {
        Self::InMemory(Arc::new(InMemoryProcessStore::new()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::MySql(_) => "mysql",
            Self::InMemory(_) => "memory",
        }
    }

    fn store(&self) -> Arc<dyn ProcessStore> {
        match self {
            Self::MySql(pool) => Arc::new(MySqlProcessStore::new(pool.clone())),
            Self::InMemory(store) => Arc::clone(store) as Arc<dyn ProcessStore>,
        }
    }
}

impl std::fmt::Debug for DataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DataSource").field(&self.kind()).finish()
    }
}

/// What the engine does about its tables at startup
///
/// The engine never creates or migrates tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchemaUpdate {
    /// Verify the tables exist; fail the build otherwise
    #[default]
    False,
    /// Trust the schema without checking
    Skip,
}

impl SchemaUpdate {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::False => "false",
            Self::Skip => "skip",
        }
    }
}

impl std::str::FromStr for SchemaUpdate {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "false" => Ok(Self::False),
            "skip" => Ok(Self::Skip),
            other => Err(ConfigError::InvalidValue {
                key: "database-schema-update".into(),
                value: other.into(),
                message: "expected one of: false, skip".into(),
            }),
        }
    }
}

/// Schema policy that only verifies existing tables
pub const DB_SCHEMA_UPDATE_FALSE: SchemaUpdate = SchemaUpdate::False;

/// Everything needed to build a [`ProcessEngine`]
pub struct ProcessEngineConfiguration {
    /// In memory when unset
    pub data_source: Option<DataSource>,
    pub database_type: String,
    pub database_schema_update: SchemaUpdate,
    pub history_level: HistoryLevel,
    pub async_executor_activate: bool,
    pub async_executor: AsyncExecutorConfig,
    pub custom_form_types: Vec<Arc<dyn FormType>>,
    pub mail: Option<MailServerConfig>,
    /// Maximum cached process models; zero or below means unbounded
    pub process_definition_cache_limit: i32,
    pub enable_safe_definition_parsing: bool,
    pub pre_parse_handlers: Vec<Arc<dyn ParseHandler>>,
    pub post_parse_handlers: Vec<Arc<dyn ParseHandler>>,
    pub service_task_handlers: HashMap<String, Arc<dyn ServiceTaskHandler>>,
    pub decision_evaluator: Option<Arc<dyn DecisionEvaluator>>,
    pub configurators: Vec<Arc<dyn EngineConfigurator>>,
    pub clock: Arc<dyn Clock>,
    /// Attempts a job gets before it becomes a dead letter
    pub job_retries: u32,
    pub failed_job_retry_wait: Duration,
}

impl Default for ProcessEngineConfiguration {
    fn default() -> Self {
        Self {
            data_source: None,
            database_type: "mysql".to_string(),
            database_schema_update: SchemaUpdate::default(),
            history_level: HistoryLevel::default(),
            async_executor_activate: false,
            async_executor: AsyncExecutorConfig::default(),
            custom_form_types: Vec::new(),
            mail: None,
            process_definition_cache_limit: -1,
            enable_safe_definition_parsing: false,
            pre_parse_handlers: Vec::new(),
            post_parse_handlers: Vec::new(),
            service_task_handlers: HashMap::new(),
            decision_evaluator: None,
            configurators: Vec::new(),
            clock: Arc::new(SystemClock),
            job_retries: 3,
            failed_job_retry_wait: Duration::from_secs(10),
        }
    }
}

impl ProcessEngineConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    /// In-memory configuration with schema checks skipped
    pub fn in_memory() -> Self {
        Self::default()
            .with_data_source(DataSource::in_memory())
            .with_database_schema_update(SchemaUpdate::Skip)
    }

    pub fn with_data_source(mut self, data_source: DataSource) -> Self {
        self.data_source = Some(data_source);
        self
    }

    pub fn with_database_type(mut self, database_type: impl Into<String>) -> Self {
        self.database_type = database_type.into();
        self
    }

    pub fn with_database_schema_update(mut self, policy: SchemaUpdate) -> Self {
        self.database_schema_update = policy;
        self
    }

    pub fn with_history_level(mut self, level: HistoryLevel) -> Self {
        self.history_level = level;
        self
    }

    pub fn with_async_executor_activate(mut self, activate: bool) -> Self {
        self.async_executor_activate = activate;
        self
    }

    pub fn with_async_executor(mut self, config: AsyncExecutorConfig) -> Self {
        self.async_executor = config;
        self
    }

    pub fn with_mail(mut self, mail: MailServerConfig) -> Self {
        self.mail = Some(mail);
        self
    }

    pub fn with_process_definition_cache_limit(mut self, limit: i32) -> Self {
        self.process_definition_cache_limit = limit;
        self
    }

    pub fn with_safe_definition_parsing(mut self, enabled: bool) -> Self {
        self.enable_safe_definition_parsing = enabled;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_job_retries(mut self, retries: u32) -> Self {
        self.job_retries = retries;
        self
    }

    pub fn with_failed_job_retry_wait(mut self, wait: Duration) -> Self {
        self.failed_job_retry_wait = wait;
        self
    }

    pub fn with_decision_evaluator(mut self, evaluator: Arc<dyn DecisionEvaluator>) -> Self {
        self.decision_evaluator = Some(evaluator);
        self
    }

    pub fn add_custom_form_type(mut self, form_type: Arc<dyn FormType>) -> Self {
        self.custom_form_types.push(form_type);
        self
    }

    pub fn add_pre_parse_handler(mut self, handler: Arc<dyn ParseHandler>) -> Self {
        self.pre_parse_handlers.push(handler);
        self
    }

    pub fn add_post_parse_handler(mut self, handler: Arc<dyn ParseHandler>) -> Self {
        self.post_parse_handlers.push(handler);
        self
    }

    pub fn add_configurator(mut self, configurator: Arc<dyn EngineConfigurator>) -> Self {
        self.configurators.push(configurator);
        self
    }

    /// Register the handler service tasks reference by `name`
    pub fn register_handler(
        mut self,
        name: impl Into<String>,
        handler: Arc<dyn ServiceTaskHandler>,
    ) -> Self {
        self.service_task_handlers.insert(name.into(), handler);
        self
    }

    fn parse_options(&self) -> ParseOptions {
        let mut options = if self.enable_safe_definition_parsing {
            ParseOptions::safe()
        } else {
            ParseOptions::default()
        };
        options.pre_parse_handlers = self.pre_parse_handlers.clone();
        options.post_parse_handlers = self.post_parse_handlers.clone();
        options
    }

    fn form_types(&self) -> FormTypes {
        let mut types = FormTypes::with_builtins();
        for form_type in &self.custom_form_types {
            types.register(Arc::clone(form_type));
        }
        types
    }

    async fn run_configurators(&mut self) -> Result<()> {
        let mut configurators = std::mem::take(&mut self.configurators);
        configurators.sort_by_key(|c| c.priority());

        for configurator in &configurators {
            debug!(name = configurator.name(), "before init");
            configurator.before_init(self)?;
        }
        for configurator in &configurators {
            debug!(name = configurator.name(), "configure");
            configurator.configure(self).await?;
            info!(name = configurator.name(), "Configurator applied");
        }

        // configurators may register further configurators; those are not run
        configurators.append(&mut self.configurators);
        self.configurators = configurators;
        Ok(())
    }

    /// Build the engine
    ///
    /// Runs configurators, opens the store, verifies the schema according to
    /// [`SchemaUpdate`] and starts the async executor when activated.
    pub async fn build_process_engine(mut self) -> Result<ProcessEngine> {
        self.run_configurators().await?;

        let data_source = match &self.data_source {
            Some(data_source) => data_source.clone(),
            None => {
                warn!("No data source configured, using an in-memory store");
                DataSource::in_memory()
            }
        };
        let store = data_source.store();

        let verify_form_tables = lock_schema_management();
        match self.database_schema_update {
            SchemaUpdate::False => {
                store.verify_schema(verify_form_tables).await?;
                debug!(verify_form_tables, "schema verified");
            }
            SchemaUpdate::Skip => debug!("schema verification skipped"),
        }

        let ctx = Arc::new(EngineContext {
            store,
            cache: DefinitionCache::new(self.process_definition_cache_limit),
            clock: Arc::clone(&self.clock),
            history_level: self.history_level,
            parse_options: self.parse_options(),
            form_types: self.form_types(),
            handlers: std::mem::take(&mut self.service_task_handlers),
            decisions: self.decision_evaluator.take(),
            job_retries: self.job_retries,
            failed_job_retry_wait: self.failed_job_retry_wait,
            database_type: self.database_type.clone(),
            mail: self.mail.clone(),
            executor_running: AtomicBool::new(false),
        });

        info!(
            data_source = data_source.kind(),
            history_level = %self.history_level,
            cache_limit = self.process_definition_cache_limit,
            async_executor = self.async_executor_activate,
            "Process engine built"
        );

        let engine = ProcessEngine::new(ctx, self.async_executor.clone());
        if self.async_executor_activate {
            engine.start_async_executor();
        }
        Ok(engine)
    }
}

impl std::fmt::Debug for ProcessEngineConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut handlers: Vec<&String> = self.service_task_handlers.keys().collect();
        handlers.sort();
        f.debug_struct("ProcessEngineConfiguration")
            .field("data_source", &self.data_source)
            .field("database_type", &self.database_type)
            .field("database_schema_update", &self.database_schema_update)
            .field("history_level", &self.history_level)
            .field("async_executor_activate", &self.async_executor_activate)
            .field("async_executor", &self.async_executor)
            .field(
                "custom_form_types",
                &self.custom_form_types.iter().map(|t| t.name()).collect::<Vec<_>>(),
            )
            .field("mail", &self.mail)
            .field("process_definition_cache_limit", &self.process_definition_cache_limit)
            .field("enable_safe_definition_parsing", &self.enable_safe_definition_parsing)
            .field("pre_parse_handlers", &self.pre_parse_handlers.len())
            .field("post_parse_handlers", &self.post_parse_handlers.len())
            .field("service_task_handlers", &handlers)
            .field("decision_evaluator", &self.decision_evaluator.is_some())
            .field(
                "configurators",
                &self.configurators.iter().map(|c| c.name()).collect::<Vec<_>>(),
            )
            .field("job_retries", &self.job_retries)
            .field("failed_job_retry_wait", &self.failed_job_retry_wait)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct Recording {
        name: &'static str,
        priority: i32,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl EngineConfigurator for Recording {
        fn name(&self) -> &str {
            self.name
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        fn before_init(&self, _config: &mut ProcessEngineConfiguration) -> Result<()> {
            self.log.lock().push(format!("before:{}", self.name));
            Ok(())
        }

        async fn configure(&self, config: &mut ProcessEngineConfiguration) -> Result<()> {
            self.log.lock().push(format!("configure:{}", self.name));
            config.job_retries += 1;
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl EngineConfigurator for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn configure(&self, _config: &mut ProcessEngineConfiguration) -> Result<()> {
            Err(EngineError::Configurator {
                name: "failing".into(),
                message: "boom".into(),
            })
        }
    }

    #[test]
    fn test_defaults() {
        let config = ProcessEngineConfiguration::default();
        assert_eq!(config.database_type, "mysql");
        assert_eq!(config.database_schema_update, DB_SCHEMA_UPDATE_FALSE);
        assert_eq!(config.history_level, HistoryLevel::Audit);
        assert_eq!(config.process_definition_cache_limit, -1);
        assert_eq!(config.job_retries, 3);
        assert!(!config.async_executor_activate);
        assert!(config.mail.is_none());
    }

    #[test]
    fn test_schema_update_parse() {
        assert_eq!("FALSE".parse::<SchemaUpdate>().unwrap(), SchemaUpdate::False);
        assert_eq!("skip".parse::<SchemaUpdate>().unwrap(), SchemaUpdate::Skip);
        assert!("create-drop".parse::<SchemaUpdate>().is_err());
    }

    #[tokio::test]
    async fn test_configurators_run_in_priority_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let config = ProcessEngineConfiguration::in_memory()
            .add_configurator(Arc::new(Recording {
                name: "late",
                priority: 20,
                log: Arc::clone(&log),
            }))
            .add_configurator(Arc::new(Recording {
                name: "early",
                priority: 5,
                log: Arc::clone(&log),
            }));

        let engine = config.build_process_engine().await.unwrap();
        assert_eq!(
            *log.lock(),
            vec!["before:early", "before:late", "configure:early", "configure:late"]
        );
        assert_eq!(engine.context().job_retries, 5);
        engine.close().await;
    }

    #[tokio::test]
    async fn test_failing_configurator_aborts_build() {
        let err = ProcessEngineConfiguration::in_memory()
            .add_configurator(Arc::new(Failing))
            .build_process_engine()
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Configurator { .. }));
    }

    #[tokio::test]
    async fn test_in_memory_verifies_schema() {
        let engine = ProcessEngineConfiguration::new()
            .with_data_source(DataSource::in_memory())
            .build_process_engine()
            .await
            .unwrap();
        let info = engine.management_service().engine_info().await.unwrap();
        assert_eq!(info.database_type, "mysql");
        assert!(!info.async_executor_active);
        engine.close().await;
    }
}
