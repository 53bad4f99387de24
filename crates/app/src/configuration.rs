//! Process engine configuration for the terminal
//!
//! Property names are relaxed: `email.useCredentials` can be set as
//! `EMAIL_USECREDENTIALS` in the environment or as a YAML key.
//!
//! | property | effect |
//! |---|---|
//! | `email.host` | enables mail settings when not empty |
//! | `email.port` | required once `email.host` is set |
//! | `email.useCredentials` | `true` reads `email.username` and `email.password` |
//! | `email.ssl`, `email.tls` | applied when present |
//!
//! Flags accept `true`/`false`, `on`/`off`, `yes`/`no` and `1`/`0` in any
//! letter case.
//! | `activiti.process-definitions.cache.max` | definition cache limit, default 128 |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info};

use conveyor_dmn::{DmnEngineConfiguration, DmnEngineConfigurator};
use conveyor_engine::config::{
    ConfigError, DataSource, EngineConfigurator, Environment, MailServerConfig,
    ProcessEngineConfiguration, SchemaUpdate,
};
use conveyor_engine::error::Result;
use conveyor_engine::form::set_schema_management_enabled;
use conveyor_engine::history::HistoryLevel;
use conveyor_engine::jobs::AsyncExecutorConfig;

use crate::form_types::custom_form_types;

pub const EMAIL_HOST: &str = "email.host";
pub const EMAIL_PORT: &str = "email.port";
pub const EMAIL_USE_CREDENTIALS: &str = "email.useCredentials";
pub const EMAIL_USERNAME: &str = "email.username";
pub const EMAIL_PASSWORD: &str = "email.password";
pub const EMAIL_SSL: &str = "email.ssl";
pub const EMAIL_TLS: &str = "email.tls";
pub const DEFINITION_CACHE_MAX: &str = "activiti.process-definitions.cache.max";

pub const DEFAULT_DEFINITION_CACHE_MAX: i32 = 128;

/// Wait between acquisition rounds of the async executor
pub const ACQUIRE_WAIT_TIME: Duration = Duration::from_millis(5000);

/// Executor settings: async and timer jobs are both acquired every 5 s
pub fn async_executor() -> AsyncExecutorConfig {
    AsyncExecutorConfig::default()
        .with_async_job_acquire_wait_time(ACQUIRE_WAIT_TIME)
        .with_timer_job_acquire_wait_time(ACQUIRE_WAIT_TIME)
}

/// Mail server settings, or `None` when `email.host` is empty or absent
pub fn mail_server(env: &Environment) -> std::result::Result<Option<MailServerConfig>, ConfigError> {
    let host = match env.get_property(EMAIL_HOST) {
        Some(host) if !host.is_empty() => host,
        _ => return Ok(None),
    };

    let port: u16 = env.get_required(EMAIL_PORT)?;
    let mut mail = MailServerConfig::new(host, port);

    if env.get_bool(EMAIL_USE_CREDENTIALS)? == Some(true) {
        mail.username = env.get_property(EMAIL_USERNAME);
        mail.password = env.get_property(EMAIL_PASSWORD);
    }
    if let Some(ssl) = env.get_bool(EMAIL_SSL)? {
        mail = mail.with_ssl(ssl);
    }
    if let Some(tls) = env.get_bool(EMAIL_TLS)? {
        mail = mail.with_tls(tls);
    }
    Ok(Some(mail))
}

/// Decision engine settings over the process engine's data source
pub fn dmn_engine_configuration(data_source: Option<DataSource>) -> DmnEngineConfiguration {
    let configuration = DmnEngineConfiguration::new().with_database_schema_update(SchemaUpdate::False);
    match data_source {
        Some(data_source) => configuration.with_data_source(data_source),
        None => configuration,
    }
}

/// Assemble the process engine configuration
///
/// Only mail settings and the cache limit come from `env`; everything else
/// is fixed for the terminal. Fails when `email.host` is set without
/// `email.port` or when a property does not parse.
pub fn engine_configuration(
    env: &Environment,
    data_source: DataSource,
) -> std::result::Result<ProcessEngineConfiguration, ConfigError> {
    let mut cfg = ProcessEngineConfiguration::new()
        .with_data_source(data_source.clone())
        .with_database_type("mysql")
        .with_database_schema_update(SchemaUpdate::False)
        .with_history_level(HistoryLevel::Audit)
        .with_async_executor_activate(true)
        .with_async_executor(async_executor());

    for form_type in custom_form_types() {
        cfg = cfg.add_custom_form_type(form_type);
    }

    if let Some(mail) = mail_server(env)? {
        info!(host = %mail.host, port = mail.port, "Mail server configured");
        cfg = cfg.with_mail(mail);
    }

    let cache_limit = env.get_or(DEFINITION_CACHE_MAX, DEFAULT_DEFINITION_CACHE_MAX)?;
    cfg = cfg
        .with_process_definition_cache_limit(cache_limit)
        .with_safe_definition_parsing(true);
    cfg.pre_parse_handlers = Vec::new();

    info!("Disabling form engine schema management");
    if let Err(e) = set_schema_management_enabled(false) {
        error!(error = %e, "Failed to disable form engine schema management");
    }

    Ok(with_decision_engine(cfg, dmn_engine_configuration(Some(data_source))))
}

/// Attach a decision engine whose failures never abort the process engine build
pub fn with_decision_engine(
    cfg: ProcessEngineConfiguration,
    configuration: DmnEngineConfiguration,
) -> ProcessEngineConfiguration {
    let configurator = DmnEngineConfigurator::new(configuration);
    info!("Decision engine configurator added");
    cfg.add_configurator(Arc::new(IsolatedConfigurator::new(configurator)))
}

/// Runs a configurator and logs its failure instead of failing the build
pub struct IsolatedConfigurator<C> {
    inner: C,
}

impl<C: EngineConfigurator> IsolatedConfigurator<C> {
    pub fn new(inner: C) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }
}

#[async_trait]
impl<C: EngineConfigurator> EngineConfigurator for IsolatedConfigurator<C> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn priority(&self) -> i32 {
        self.inner.priority()
    }

    fn before_init(&self, config: &mut ProcessEngineConfiguration) -> Result<()> {
        if let Err(e) = self.inner.before_init(config) {
            error!(configurator = self.inner.name(), error = %e, "Configurator failed before init, skipping");
        }
        Ok(())
    }

    async fn configure(&self, config: &mut ProcessEngineConfiguration) -> Result<()> {
        if let Err(e) = self.inner.configure(config).await {
            error!(configurator = self.inner.name(), error = %e, "Configurator failed, continuing without it");
        }
        Ok(())
    }
}
