//! Decision engine and its services
//!
//! ```text
//! DmnEngineConfiguration ──build_dmn_engine()──▶ DmnEngine
//!                                                  ├── repository_service() deploy / latest / list
//!                                                  └── rule_service()       execute_decision_by_key
//! ```
//!
//! Compiled tables are cached by definition id; definitions are immutable
//! once deployed, so the cache never needs invalidation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use conveyor_engine::config::{DataSource, SchemaUpdate};
use conveyor_engine::decision::{DecisionEvaluationError, DecisionEvaluator};

use crate::error::DecisionError;
use crate::store::{DecisionDefinition, DecisionStore, InMemoryDecisionStore, MySqlDecisionStore};
use crate::table::{CompiledDecision, DecisionTable};

/// Settings for building a [`DmnEngine`]
#[derive(Debug, Clone, Default)]
pub struct DmnEngineConfiguration {
    /// Where decisions live; `None` falls back to a private in-memory store
    pub data_source: Option<DataSource>,
    pub database_schema_update: SchemaUpdate,
}

impl DmnEngineConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data_source(mut self, data_source: DataSource) -> Self {
        self.data_source = Some(data_source);
        self
    }

    pub fn with_database_schema_update(mut self, policy: SchemaUpdate) -> Self {
        self.database_schema_update = policy;
        self
    }

    pub async fn build_dmn_engine(&self) -> Result<DmnEngine, DecisionError> {
        let store: Arc<dyn DecisionStore> = match &self.data_source {
            Some(DataSource::MySql(pool)) => Arc::new(MySqlDecisionStore::new(pool.clone())),
            Some(DataSource::InMemory(_)) => Arc::new(InMemoryDecisionStore::new()),
            None => {
                warn!("No data source for the decision engine, using an in-memory store");
                Arc::new(InMemoryDecisionStore::new())
            }
        };

        match self.database_schema_update {
            SchemaUpdate::False => store.verify_schema().await?,
            SchemaUpdate::Skip => debug!("decision schema verification skipped"),
        }

        info!(
            data_source = self.data_source.as_ref().map_or("none", DataSource::kind),
            schema_update = self.database_schema_update.as_str(),
            "Decision engine built"
        );
        Ok(DmnEngine::with_store(store))
    }
}

struct DmnEngineInner {
    store: Arc<dyn DecisionStore>,
    compiled: RwLock<HashMap<Uuid, Arc<CompiledDecision>>>,
}

/// Handle to a built decision engine; clones share state
#[derive(Clone)]
pub struct DmnEngine {
    inner: Arc<DmnEngineInner>,
}

impl std::fmt::Debug for DmnEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmnEngine")
            .field("compiled", &self.inner.compiled.read().len())
            .finish_non_exhaustive()
    }
}

impl DmnEngine {
    pub fn with_store(store: Arc<dyn DecisionStore>) -> Self {
        Self {
            inner: Arc::new(DmnEngineInner {
                store,
                compiled: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn repository_service(&self) -> DmnRepositoryService {
        DmnRepositoryService {
            engine: self.clone(),
        }
    }

    pub fn rule_service(&self) -> DmnRuleService {
        DmnRuleService {
            engine: self.clone(),
        }
    }

    fn compiled(&self, definition: &DecisionDefinition) -> Result<Arc<CompiledDecision>, DecisionError> {
        if let Some(hit) = self.inner.compiled.read().get(&definition.id) {
            return Ok(Arc::clone(hit));
        }
        let compiled = Arc::new(DecisionTable::parse(&definition.resource_name, &definition.source)?.compile()?);
        self.inner
            .compiled
            .write()
            .insert(definition.id, Arc::clone(&compiled));
        Ok(compiled)
    }
}

/// Deploys and looks up decision tables
#[derive(Debug, Clone)]
pub struct DmnRepositoryService {
    engine: DmnEngine,
}

impl DmnRepositoryService {
    /// Validate and store a table as the next version of its key
    pub async fn deploy(
        &self,
        resource_name: &str,
        source: &str,
    ) -> Result<DecisionDefinition, DecisionError> {
        let compiled = DecisionTable::parse(resource_name, source)?.compile()?;
        let store = &self.engine.inner.store;

        let version = store
            .find_latest(compiled.key())
            .await?
            .map_or(1, |latest| latest.version + 1);
        let definition = DecisionDefinition {
            id: Uuid::now_v7(),
            key: compiled.key().to_string(),
            name: compiled.table().name.clone(),
            version,
            resource_name: resource_name.to_string(),
            source: source.to_string(),
            deployed_at: Utc::now(),
        };
        store.insert(definition.clone()).await?;
        self.engine
            .inner
            .compiled
            .write()
            .insert(definition.id, Arc::new(compiled));

        info!(key = %definition.key, version, "Decision deployed");
        Ok(definition)
    }

    pub async fn get_latest(&self, key: &str) -> Result<DecisionDefinition, DecisionError> {
        self.engine
            .inner
            .store
            .find_latest(key)
            .await?
            .ok_or_else(|| DecisionError::NotFound(key.to_string()))
    }

    pub async fn get(&self, id: Uuid) -> Result<DecisionDefinition, DecisionError> {
        self.engine
            .inner
            .store
            .find(id)
            .await?
            .ok_or_else(|| DecisionError::NotFound(id.to_string()))
    }

    pub async fn list(&self, key: Option<&str>) -> Result<Vec<DecisionDefinition>, DecisionError> {
        Ok(self.engine.inner.store.list(key).await?)
    }
}

/// Output of one decision evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionResult {
    pub decision_key: String,
    pub version: i32,
    pub rows: Vec<Map<String, Value>>,
}

impl DecisionResult {
    /// The only row, if exactly one rule contributed
    pub fn single_result(&self) -> Option<&Map<String, Value>> {
        match self.rows.as_slice() {
            [row] => Some(row),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Evaluates deployed decisions
#[derive(Debug, Clone)]
pub struct DmnRuleService {
    engine: DmnEngine,
}

impl DmnRuleService {
    /// Evaluate the latest version of `key`
    pub async fn execute_decision_by_key(
        &self,
        key: &str,
        variables: &Map<String, Value>,
    ) -> Result<DecisionResult, DecisionError> {
        let definition = self.engine.repository_service().get_latest(key).await?;
        let compiled = self.engine.compiled(&definition)?;
        let rows = compiled.evaluate(variables)?;
        Ok(DecisionResult {
            decision_key: definition.key,
            version: definition.version,
            rows,
        })
    }
}

#[async_trait]
impl DecisionEvaluator for DmnEngine {
    async fn evaluate(
        &self,
        decision_key: &str,
        variables: &Map<String, Value>,
    ) -> Result<Vec<Map<String, Value>>, DecisionEvaluationError> {
        self.rule_service()
            .execute_decision_by_key(decision_key, variables)
            .await
            .map(|result| result.rows)
            .map_err(|e| DecisionEvaluationError::new(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const FEES_V1: &str = r#"
key: port_fees
hit_policy: first
inputs:
  - expression: tonnes
outputs:
  - name: fee
rules:
  - input_entries: ["> 100"]
    output_entries: [500]
  - input_entries: ["-"]
    output_entries: [100]
"#;

    fn vars(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    async fn engine() -> DmnEngine {
        DmnEngineConfiguration::new()
            .with_data_source(DataSource::in_memory())
            .build_dmn_engine()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_deploy_versions_and_execute_latest() {
        let engine = engine().await;
        let repository = engine.repository_service();

        let v1 = repository.deploy("fees.yaml", FEES_V1).await.unwrap();
        assert_eq!(v1.version, 1);
        let v2 = repository
            .deploy("fees.yaml", &FEES_V1.replace("[500]", "[750]"))
            .await
            .unwrap();
        assert_eq!(v2.version, 2);
        assert_eq!(repository.get_latest("port_fees").await.unwrap().id, v2.id);
        assert_eq!(repository.get(v1.id).await.unwrap().version, 1);
        assert_eq!(repository.list(Some("port_fees")).await.unwrap().len(), 2);

        let result = engine
            .rule_service()
            .execute_decision_by_key("port_fees", &vars(json!({"tonnes": 250})))
            .await
            .unwrap();
        assert_eq!(result.version, 2);
        assert_eq!(result.single_result().unwrap()["fee"], json!(750));
    }

    #[tokio::test]
    async fn test_invalid_table_is_not_stored() {
        let engine = engine().await;
        let repository = engine.repository_service();

        let err = repository
            .deploy("fees.yaml", &FEES_V1.replace("[500]", "[500, 1]"))
            .await
            .unwrap_err();
        assert!(matches!(err, DecisionError::InvalidTable { .. }));
        assert!(repository.list(None).await.unwrap().is_empty());
        assert!(matches!(
            repository.deploy("fees.txt", FEES_V1).await,
            Err(DecisionError::UnsupportedResource(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_key() {
        let engine = engine().await;
        let err = engine
            .rule_service()
            .execute_decision_by_key("nope", &Map::new())
            .await
            .unwrap_err();
        assert_eq!(err, DecisionError::NotFound("nope".into()));

        let err = DecisionEvaluator::evaluate(&engine, "nope", &Map::new())
            .await
            .unwrap_err();
        assert_eq!(err.message, "decision not found: nope");
    }

    #[tokio::test]
    async fn test_engine_without_data_source_uses_memory() {
        let engine = DmnEngineConfiguration::new().build_dmn_engine().await.unwrap();
        engine.repository_service().deploy("fees.yaml", FEES_V1).await.unwrap();
        let rows = DecisionEvaluator::evaluate(&engine, "port_fees", &vars(json!({"tonnes": 5})))
            .await
            .unwrap();
        assert_eq!(rows, vec![vars(json!({"fee": 100}))]);
    }
}
