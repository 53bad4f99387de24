//! Storage for deployed decision tables
//!
//! Decisions are versioned per key: every deployment of a key gets the next
//! version and the newest one wins lookups by key. The MySQL table is
//! created by `schema/mysql.sql` in the engine crate; the store only checks
//! that it exists.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conveyor_engine::persistence::StoreError;
use parking_lot::RwLock;
use sqlx::mysql::{MySql, MySqlPool, MySqlRow};
use sqlx::Row;
use tracing::{debug, error, instrument};
use uuid::Uuid;

/// Table holding decision deployments
pub const DECISION_TABLE: &str = "conveyor_dmn_decision_tables";

/// A deployed version of a decision table
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionDefinition {
    pub id: Uuid,
    pub key: String,
    pub name: Option<String>,
    pub version: i32,
    pub resource_name: String,
    pub source: String,
    pub deployed_at: DateTime<Utc>,
}

#[async_trait]
pub trait DecisionStore: Send + Sync + 'static {
    /// Fails with [`StoreError::SchemaMissing`] when the table is absent
    async fn verify_schema(&self) -> Result<(), StoreError>;

    /// Fails with [`StoreError::Duplicate`] when key and version are taken
    async fn insert(&self, definition: DecisionDefinition) -> Result<(), StoreError>;

    async fn find(&self, id: Uuid) -> Result<Option<DecisionDefinition>, StoreError>;

    async fn find_latest(&self, key: &str) -> Result<Option<DecisionDefinition>, StoreError>;

    /// Ordered by key, then version
    async fn list(&self, key: Option<&str>) -> Result<Vec<DecisionDefinition>, StoreError>;
}

// ============================================================================
// In-memory
// ============================================================================

#[derive(Debug, Default)]
pub struct InMemoryDecisionStore {
    definitions: RwLock<HashMap<Uuid, DecisionDefinition>>,
}

impl InMemoryDecisionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DecisionStore for InMemoryDecisionStore {
    async fn verify_schema(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn insert(&self, definition: DecisionDefinition) -> Result<(), StoreError> {
        let mut definitions = self.definitions.write();
        let taken = definitions
            .values()
            .any(|d| d.key == definition.key && d.version == definition.version);
        if taken {
            return Err(StoreError::Duplicate {
                entity: "decision definition",
                id: format!("{}:{}", definition.key, definition.version),
            });
        }
        definitions.insert(definition.id, definition);
        Ok(())
    }

    async fn find(&self, id: Uuid) -> Result<Option<DecisionDefinition>, StoreError> {
        Ok(self.definitions.read().get(&id).cloned())
    }

    async fn find_latest(&self, key: &str) -> Result<Option<DecisionDefinition>, StoreError> {
        Ok(self
            .definitions
            .read()
            .values()
            .filter(|d| d.key == key)
            .max_by_key(|d| d.version)
            .cloned())
    }

    async fn list(&self, key: Option<&str>) -> Result<Vec<DecisionDefinition>, StoreError> {
        let mut found: Vec<_> = self
            .definitions
            .read()
            .values()
            .filter(|d| key.map_or(true, |k| d.key == k))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.key.cmp(&b.key).then(a.version.cmp(&b.version)));
        Ok(found)
    }
}

// ============================================================================
// MySQL
// ============================================================================

fn db_err(e: sqlx::Error) -> StoreError {
    error!("database error: {}", e);
    StoreError::Database(e.to_string())
}

fn col<'r, T>(row: &'r MySqlRow, name: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, MySql> + sqlx::Type<MySql>,
{
    row.try_get(name).map_err(db_err)
}

fn definition_from_row(row: &MySqlRow) -> Result<DecisionDefinition, StoreError> {
    let id: String = col(row, "id")?;
    Ok(DecisionDefinition {
        id: Uuid::parse_str(&id)
            .map_err(|e| StoreError::Serialization(format!("bad uuid '{id}': {e}")))?,
        key: col(row, "decision_key")?,
        name: col(row, "name")?,
        version: col(row, "version")?,
        resource_name: col(row, "resource_name")?,
        source: col(row, "source")?,
        deployed_at: col(row, "deployed_at")?,
    })
}

const SELECT_COLUMNS: &str =
    "SELECT id, decision_key, name, version, resource_name, source, deployed_at FROM conveyor_dmn_decision_tables";

/// Decision storage sharing the process engine's MySQL pool
#[derive(Debug, Clone)]
pub struct MySqlDecisionStore {
    pool: MySqlPool,
}

impl MySqlDecisionStore {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DecisionStore for MySqlDecisionStore {
    async fn verify_schema(&self) -> Result<(), StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS found FROM information_schema.tables \
             WHERE table_schema = DATABASE() AND table_name = ?",
        )
        .bind(DECISION_TABLE)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        if col::<i64>(&row, "found")? > 0 {
            debug!("decision schema verified");
            Ok(())
        } else {
            Err(StoreError::SchemaMissing(vec![DECISION_TABLE.to_string()]))
        }
    }

    #[instrument(skip(self, definition), fields(key = %definition.key, version = definition.version))]
    async fn insert(&self, definition: DecisionDefinition) -> Result<(), StoreError> {
        let result = sqlx::query(
            "INSERT INTO conveyor_dmn_decision_tables \
             (id, decision_key, name, version, resource_name, source, deployed_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(definition.id.to_string())
        .bind(&definition.key)
        .bind(&definition.name)
        .bind(definition.version)
        .bind(&definition.resource_name)
        .bind(&definition.source)
        .bind(definition.deployed_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(StoreError::Duplicate {
                entity: "decision definition",
                id: format!("{}:{}", definition.key, definition.version),
            }),
            Err(e) => Err(db_err(e)),
        }
    }

    async fn find(&self, id: Uuid) -> Result<Option<DecisionDefinition>, StoreError> {
        let sql = format!("{SELECT_COLUMNS} WHERE id = ?");
        sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .as_ref()
            .map(definition_from_row)
            .transpose()
    }

    async fn find_latest(&self, key: &str) -> Result<Option<DecisionDefinition>, StoreError> {
        let sql = format!("{SELECT_COLUMNS} WHERE decision_key = ? ORDER BY version DESC LIMIT 1");
        sqlx::query(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .as_ref()
            .map(definition_from_row)
            .transpose()
    }

    async fn list(&self, key: Option<&str>) -> Result<Vec<DecisionDefinition>, StoreError> {
        let rows = match key {
            Some(key) => {
                let sql = format!("{SELECT_COLUMNS} WHERE decision_key = ? ORDER BY decision_key, version");
                sqlx::query(&sql).bind(key).fetch_all(&self.pool).await
            }
            None => {
                let sql = format!("{SELECT_COLUMNS} ORDER BY decision_key, version");
                sqlx::query(&sql).fetch_all(&self.pool).await
            }
        }
        .map_err(db_err)?;
        rows.iter().map(definition_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(key: &str, version: i32) -> DecisionDefinition {
        DecisionDefinition {
            id: Uuid::now_v7(),
            key: key.to_string(),
            name: None,
            version,
            resource_name: format!("{key}.yaml"),
            source: String::new(),
            deployed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_latest_and_listing() {
        let store = InMemoryDecisionStore::new();
        store.insert(definition("fees", 1)).await.unwrap();
        store.insert(definition("fees", 2)).await.unwrap();
        store.insert(definition("class", 1)).await.unwrap();

        let latest = store.find_latest("fees").await.unwrap().unwrap();
        assert_eq!(latest.version, 2);
        assert_eq!(store.find(latest.id).await.unwrap(), Some(latest));
        assert!(store.find_latest("unknown").await.unwrap().is_none());

        let all = store.list(None).await.unwrap();
        let keys: Vec<_> = all.iter().map(|d| (d.key.as_str(), d.version)).collect();
        assert_eq!(keys, vec![("class", 1), ("fees", 1), ("fees", 2)]);
        assert_eq!(store.list(Some("fees")).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_version_rejected() {
        let store = InMemoryDecisionStore::new();
        store.insert(definition("fees", 1)).await.unwrap();
        let err = store.insert(definition("fees", 1)).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate { .. }));
    }
}
