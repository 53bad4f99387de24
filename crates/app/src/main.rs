use std::path::PathBuf;

use anyhow::{Context, Result};
use sqlx::mysql::MySqlPoolOptions;

use conveyor_app::{
    deploy_directory, engine_configuration, init_telemetry, process_engine, EngineServices,
    TelemetryConfig, DATASOURCE_MAX_POOL_SIZE, DATASOURCE_URL, DEFAULT_MAX_POOL_SIZE, DEPLOY_DIR,
};
use conveyor_engine::config::{DataSource, Environment};

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    // Configure via environment variables:
    // - RUST_LOG or LOG_LEVEL: Log filter (default: "conveyor=info,...")
    // - LOG_FORMAT: "json" for JSON lines
    let telemetry_config = TelemetryConfig::from_env();
    init_telemetry(&telemetry_config);

    tracing::info!("conveyor starting...");

    let env = Environment::from_process().context("Failed to load configuration")?;
    let url: String = env.get_required(DATASOURCE_URL)?;
    let max_connections = env.get_or(DATASOURCE_MAX_POOL_SIZE, DEFAULT_MAX_POOL_SIZE)?;

    tracing::info!(max_connections, "Connecting to MySQL");
    let pool = MySqlPoolOptions::new()
        .max_connections(max_connections)
        .connect(&url)
        .await
        .context("Failed to connect to MySQL")?;

    let config = engine_configuration(&env, DataSource::MySql(pool))?;
    let services = EngineServices::new(process_engine(config).await?);
    tracing::info!(
        history = ?services.engine().history_level(),
        async_executor = services.engine().is_async_executor_running(),
        "Process engine started"
    );

    if let Some(dir) = env.get_property(DEPLOY_DIR).filter(|d| !d.trim().is_empty()) {
        deploy_directory(&services, &PathBuf::from(dir.trim())).await?;
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Received shutdown signal");

    services.close().await;
    tracing::info!("Shutdown complete");
    Ok(())
}
