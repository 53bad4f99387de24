//! Pluggable configuration steps run while the engine is built

use async_trait::async_trait;

use super::ProcessEngineConfiguration;
use crate::error::Result;

/// Priority given to configurators that do not override [`EngineConfigurator::priority`]
pub const DEFAULT_CONFIGURATOR_PRIORITY: i32 = 10_000;

/// A step that adjusts the configuration before the engine is built
///
/// All `before_init` calls run first, then all `configure` calls, each pass
/// in ascending priority order. An error aborts the build.
#[async_trait]
pub trait EngineConfigurator: Send + Sync + 'static {
    /// Name used in logs and errors
    fn name(&self) -> &str;

    fn priority(&self) -> i32 {
        DEFAULT_CONFIGURATOR_PRIORITY
    }

    fn before_init(&self, _config: &mut ProcessEngineConfiguration) -> Result<()> {
        Ok(())
    }

    async fn configure(&self, config: &mut ProcessEngineConfiguration) -> Result<()>;
}
