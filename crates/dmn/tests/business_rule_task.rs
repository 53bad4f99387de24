//! Business rule tasks evaluated by the decision engine through its configurator

use std::sync::Arc;

use conveyor_dmn::{DmnEngineConfiguration, DmnEngineConfigurator};
use conveyor_engine::config::SchemaUpdate;
use conveyor_engine::prelude::*;

const CLASSIFY: &str = r#"
key: classify_wagon
elements:
  - id: start
    type: start_event
  - id: classify
    type: business_rule_task
    decision_key: wagon_class
  - id: end
    type: end_event
flows:
  - { id: f1, source: start, target: classify }
  - { id: f2, source: classify, target: end }
"#;

const SURCHARGES: &str = r#"
key: surcharges
elements:
  - id: start
    type: start_event
  - id: collect
    type: business_rule_task
    decision_key: surcharges
    result_variable: surcharges
  - id: end
    type: end_event
flows:
  - { id: f1, source: start, target: collect }
  - { id: f2, source: collect, target: end }
"#;

const WAGON_CLASS: &str = r#"
key: wagon_class
name: Wagon class
inputs:
  - { label: Axles, expression: wagon.axles }
  - { label: Load, expression: load_tonnes }
outputs:
  - { name: class }
rules:
  - input_entries: ["<= 2", "< 40"]
    output_entries: [light]
  - input_entries: ["<= 2", ">= 40"]
    output_entries: [medium]
  - input_entries: ["> 2", "-"]
    output_entries: [heavy]
"#;

const SURCHARGE_TABLE: &str = r#"{
  "key": "surcharges",
  "hit_policy": "rule_order",
  "inputs": [{ "expression": "cargo" }],
  "outputs": [{ "name": "code" }, { "name": "amount" }],
  "rules": [
    { "input_entries": ["\"hazmat\", \"reefer\""], "output_entries": ["\"SPECIAL\"", 120] },
    { "input_entries": ["hazmat"], "output_entries": ["\"ADR\"", 80] },
    { "input_entries": ["-"], "output_entries": ["\"BASE\"", 10] }
  ]
}"#;

fn vars(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

async fn engine_with_decisions(resources: &[(&str, &str)]) -> (ProcessEngine, Arc<DmnEngineConfigurator>) {
    let configurator = Arc::new(DmnEngineConfigurator::new(
        DmnEngineConfiguration::new().with_database_schema_update(SchemaUpdate::False),
    ));
    let engine = ProcessEngineConfiguration::in_memory()
        .add_configurator(configurator.clone())
        .build_process_engine()
        .await
        .unwrap();

    let mut deployment = engine.repository_service().create_deployment().name("decisions");
    for (name, source) in resources {
        deployment = deployment.add_resource(*name, *source);
    }
    deployment.deploy().await.unwrap();
    (engine, configurator)
}

#[test_log::test(tokio::test)]
async fn test_single_row_merges_into_variables() {
    let (engine, configurator) = engine_with_decisions(&[("classify.yaml", CLASSIFY)]).await;
    let dmn = configurator.dmn_engine().expect("configurator ran");
    dmn.repository_service()
        .deploy("wagon_class.yaml", WAGON_CLASS)
        .await
        .unwrap();

    let runtime = engine.runtime_service();
    let light = runtime
        .start_process_instance_by_key("classify_wagon", None, vars(json!({"wagon": {"axles": 2}, "load_tonnes": 25})))
        .await
        .unwrap();
    assert_eq!(light.status, InstanceStatus::Completed);
    assert_eq!(light.variables["class"], json!("light"));

    let heavy = runtime
        .start_process_instance_by_key("classify_wagon", None, vars(json!({"wagon": {"axles": 6}})))
        .await
        .unwrap();
    assert_eq!(heavy.variables["class"], json!("heavy"));

    // no rule matches: nothing is merged
    let unknown = runtime
        .start_process_instance_by_key("classify_wagon", None, Map::new())
        .await
        .unwrap();
    assert_eq!(unknown.status, InstanceStatus::Completed);
    assert!(!unknown.variables.contains_key("class"));
}

#[test_log::test(tokio::test)]
async fn test_result_variable_collects_rows() {
    let (engine, configurator) = engine_with_decisions(&[("surcharges.yaml", SURCHARGES)]).await;
    configurator
        .dmn_engine()
        .unwrap()
        .repository_service()
        .deploy("surcharges.json", SURCHARGE_TABLE)
        .await
        .unwrap();

    let done = engine
        .runtime_service()
        .start_process_instance_by_key("surcharges", None, vars(json!({"cargo": "hazmat"})))
        .await
        .unwrap();
    assert_eq!(
        done.variables["surcharges"],
        json!([
            {"code": "SPECIAL", "amount": 120},
            {"code": "ADR", "amount": 80},
            {"code": "BASE", "amount": 10}
        ])
    );
}

#[test_log::test(tokio::test)]
async fn test_missing_decision_fails_the_start() {
    let (engine, _configurator) = engine_with_decisions(&[("classify.yaml", CLASSIFY)]).await;

    let err = engine
        .runtime_service()
        .start_process_instance_by_key("classify_wagon", None, Map::new())
        .await
        .unwrap_err();
    match err {
        EngineError::DecisionFailed { decision_key, message } => {
            assert_eq!(decision_key, "wagon_class");
            assert!(message.contains("not found"), "{message}");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test_log::test(tokio::test)]
async fn test_unique_violation_surfaces() {
    let (engine, configurator) = engine_with_decisions(&[("classify.yaml", CLASSIFY)]).await;
    let overlapping = WAGON_CLASS.replace("[\"> 2\", \"-\"]", "[\"-\", \"-\"]");
    configurator
        .dmn_engine()
        .unwrap()
        .repository_service()
        .deploy("wagon_class.yaml", &overlapping)
        .await
        .unwrap();

    let err = engine
        .runtime_service()
        .start_process_instance_by_key("classify_wagon", None, vars(json!({"wagon": {"axles": 2}, "load_tonnes": 10})))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::DecisionFailed { .. }), "{err}");
}

#[tokio::test]
async fn test_configuration_is_kept() {
    let configurator = DmnEngineConfigurator::new(
        DmnEngineConfiguration::new().with_database_schema_update(SchemaUpdate::False),
    );
    assert_eq!(configurator.configuration().database_schema_update, SchemaUpdate::False);
    assert!(configurator.configuration().data_source.is_none());
    assert!(configurator.dmn_engine().is_none());
}
