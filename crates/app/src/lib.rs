//! # Conveyor
//!
//! The terminal's workflow application: one process engine over MySQL with
//! the decision engine attached and the terminal's own form types.
//!
//! ```text
//! Environment ──engine_configuration()──▶ ProcessEngineConfiguration
//!   (env vars, application.yml)               │  + DmnEngineConfigurator (isolated)
//!                                             │  + wagon / location / vport / wport
//!                                             ▼
//!                                  process_engine() ──▶ EngineServices
//! ```

pub mod configuration;
pub mod form_types;
pub mod services;
pub mod telemetry;

pub use configuration::{
    async_executor, dmn_engine_configuration, engine_configuration, mail_server,
    with_decision_engine, IsolatedConfigurator,
};
pub use services::{deploy_directory, process_engine, EngineServices};
pub use telemetry::{init_telemetry, TelemetryConfig};

/// Required MySQL connection URL
pub const DATASOURCE_URL: &str = "datasource.url";
pub const DATASOURCE_MAX_POOL_SIZE: &str = "datasource.max-pool-size";
pub const DEFAULT_MAX_POOL_SIZE: u32 = 10;
/// Directory of definitions deployed at startup
pub const DEPLOY_DIR: &str = "conveyor.deploy-dir";
