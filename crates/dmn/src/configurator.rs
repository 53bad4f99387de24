//! Plugs the decision engine into a process engine

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use tracing::info;

use conveyor_engine::config::{EngineConfigurator, ProcessEngineConfiguration};
use conveyor_engine::decision::DecisionEvaluator;
use conveyor_engine::error::{EngineError, Result};

use crate::engine::{DmnEngine, DmnEngineConfiguration};

/// Runs after the default configurators so the data source is settled
pub const DMN_CONFIGURATOR_PRIORITY: i32 = 20_000;

/// Builds a [`DmnEngine`] during the process engine build and registers it
/// as the decision evaluator for business rule tasks
///
/// Without its own data source the decision engine uses the process
/// engine's.
#[derive(Debug)]
pub struct DmnEngineConfigurator {
    configuration: DmnEngineConfiguration,
    engine: OnceLock<DmnEngine>,
}

impl DmnEngineConfigurator {
    pub fn new(configuration: DmnEngineConfiguration) -> Self {
        Self {
            configuration,
            engine: OnceLock::new(),
        }
    }

    pub fn configuration(&self) -> &DmnEngineConfiguration {
        &self.configuration
    }

    /// The engine built by [`EngineConfigurator::configure`]
    pub fn dmn_engine(&self) -> Option<&DmnEngine> {
        self.engine.get()
    }
}

#[async_trait]
impl EngineConfigurator for DmnEngineConfigurator {
    fn name(&self) -> &str {
        "dmn"
    }

    fn priority(&self) -> i32 {
        DMN_CONFIGURATOR_PRIORITY
    }

    async fn configure(&self, config: &mut ProcessEngineConfiguration) -> Result<()> {
        let mut configuration = self.configuration.clone();
        if configuration.data_source.is_none() {
            configuration.data_source = config.data_source.clone();
        }

        let engine = configuration
            .build_dmn_engine()
            .await
            .map_err(|e| EngineError::Configurator {
                name: self.name().to_string(),
                message: e.to_string(),
            })?;
        let engine = self.engine.get_or_init(|| engine).clone();

        config.decision_evaluator = Some(Arc::new(engine) as Arc<dyn DecisionEvaluator>);
        info!("Decision engine registered as decision evaluator");
        Ok(())
    }
}
