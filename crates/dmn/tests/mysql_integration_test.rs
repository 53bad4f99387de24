//! Integration tests for MySqlDecisionStore
//!
//! Run with: cargo test -p conveyor-dmn --test mysql_integration_test -- --test-threads=1
//!
//! Requirements:
//! - MySQL 8 reachable through DATABASE_URL; tests are skipped when it is not set
//! - the engine's schema/mysql.sql is applied by the tests themselves

use chrono::Utc;
use sqlx::MySqlPool;
use uuid::Uuid;

use conveyor_dmn::{DecisionDefinition, DecisionStore, DmnEngineConfiguration, MySqlDecisionStore, DECISION_TABLE};
use conveyor_engine::config::{DataSource, SchemaUpdate};
use conveyor_engine::persistence::StoreError;

const SCHEMA: &str = include_str!("../../engine/schema/mysql.sql");

const BERTH_TABLE: &str = r#"
key: berth_fee
hit_policy: first
inputs:
  - { label: Length, expression: length }
outputs:
  - { name: fee }
rules:
  - { input_entries: ["> 200"], output_entries: ["1200"] }
  - { input_entries: ["-"], output_entries: ["400"] }
"#;

async fn connect() -> Option<MySqlPool> {
    let Ok(database_url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set, skipping MySQL integration test");
        return None;
    };
    let pool = MySqlPool::connect(&database_url)
        .await
        .expect("Failed to connect to MySQL. Check DATABASE_URL.");
    let statements: String = SCHEMA
        .lines()
        .filter(|line| !line.trim_start().starts_with("--"))
        .collect::<Vec<_>>()
        .join("\n");
    for statement in statements.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        sqlx::query(statement)
            .execute(&pool)
            .await
            .expect("Failed to apply schema/mysql.sql");
    }
    Some(pool)
}

async fn cleanup_key(pool: &MySqlPool, key: &str) {
    sqlx::query("DELETE FROM conveyor_dmn_decision_tables WHERE decision_key = ?")
        .bind(key)
        .execute(pool)
        .await
        .ok();
}

fn definition(key: &str, version: i32) -> DecisionDefinition {
    DecisionDefinition {
        id: Uuid::now_v7(),
        key: key.to_string(),
        name: Some("Berth fee".to_string()),
        version,
        resource_name: "berth_fee.dmn.yaml".to_string(),
        source: BERTH_TABLE.to_string(),
        deployed_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_versions_and_duplicates() {
    let Some(pool) = connect().await else {
        return;
    };
    let key = format!("berth_fee_{}", Uuid::now_v7().simple());
    let store = MySqlDecisionStore::new(pool.clone());
    store.verify_schema().await.unwrap();

    let v1 = definition(&key, 1);
    store.insert(v1.clone()).await.unwrap();
    store.insert(definition(&key, 2)).await.unwrap();

    let err = store.insert(definition(&key, 2)).await.unwrap_err();
    assert!(matches!(err, StoreError::Duplicate { .. }));

    assert_eq!(store.find_latest(&key).await.unwrap().unwrap().version, 2);
    assert_eq!(store.find(v1.id).await.unwrap().unwrap().key, key);
    let versions: Vec<i32> = store
        .list(Some(&key))
        .await
        .unwrap()
        .iter()
        .map(|d| d.version)
        .collect();
    assert_eq!(versions, vec![1, 2]);

    cleanup_key(&pool, &key).await;
}

#[tokio::test]
async fn test_engine_deploys_and_evaluates_over_mysql() {
    let Some(pool) = connect().await else {
        return;
    };
    let engine = DmnEngineConfiguration::new()
        .with_data_source(DataSource::MySql(pool.clone()))
        .with_database_schema_update(SchemaUpdate::False)
        .build_dmn_engine()
        .await
        .unwrap();

    let latest_before = engine
        .repository_service()
        .get_latest("berth_fee")
        .await
        .map_or(0, |d| d.version);
    let deployed = engine
        .repository_service()
        .deploy("berth_fee.dmn.yaml", BERTH_TABLE)
        .await
        .unwrap();
    assert_eq!(deployed.version, latest_before + 1);

    let mut variables = serde_json::Map::new();
    variables.insert("length".into(), serde_json::json!(240));
    let result = engine
        .rule_service()
        .execute_decision_by_key("berth_fee", &variables)
        .await
        .unwrap();
    assert_eq!(result.rows.len(), 1);
    assert_eq!(result.rows[0]["fee"], serde_json::json!(1200));

    sqlx::query("DELETE FROM conveyor_dmn_decision_tables WHERE id = ?")
        .bind(deployed.id.to_string())
        .execute(&pool)
        .await
        .ok();
}

#[tokio::test]
async fn test_missing_table_fails_verification() {
    let Some(pool) = connect().await else {
        return;
    };
    let store = MySqlDecisionStore::new(pool.clone());

    sqlx::query("RENAME TABLE conveyor_dmn_decision_tables TO conveyor_dmn_decision_tables_parked")
        .execute(&pool)
        .await
        .unwrap();
    let result = store.verify_schema().await;
    let engine = DmnEngineConfiguration::new()
        .with_data_source(DataSource::MySql(pool.clone()))
        .with_database_schema_update(SchemaUpdate::False)
        .build_dmn_engine()
        .await;
    sqlx::query("RENAME TABLE conveyor_dmn_decision_tables_parked TO conveyor_dmn_decision_tables")
        .execute(&pool)
        .await
        .unwrap();

    assert_eq!(
        result.unwrap_err(),
        StoreError::SchemaMissing(vec![DECISION_TABLE.to_string()])
    );
    assert!(engine.is_err());
    store.verify_schema().await.unwrap();
}
