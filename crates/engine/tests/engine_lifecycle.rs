//! End-to-end engine tests on the in-memory store with a manual clock

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use conveyor_engine::history::{DetailKind, HistoricInstanceQuery};
use conveyor_engine::identity::{Group, User};
use conveyor_engine::prelude::*;

const ORDER: &str = r#"
key: order
name: Order handling
elements:
  - id: start
    type: start_event
  - id: review
    type: user_task
    name: Review order
    candidate_groups: [sales]
  - id: route
    type: exclusive_gateway
    default: to_manual
  - id: ship
    type: service_task
    handler: ship
  - id: manual
    type: user_task
    name: Manual check
    assignee: "${reviewer}"
  - id: end
    type: end_event
flows:
  - { id: f1, source: start, target: review }
  - { id: f2, source: review, target: route }
  - { id: f3, source: route, target: ship, condition: "${amount < 100}" }
  - { id: to_manual, source: route, target: manual }
  - { id: f5, source: ship, target: end }
  - { id: f6, source: manual, target: end }
"#;

const LOADING: &str = r#"
key: loading
elements:
  - id: start
    type: start_event
  - id: fork
    type: parallel_gateway
  - id: load_wagon
    type: user_task
  - id: paperwork
    type: user_task
  - id: join
    type: parallel_gateway
  - id: end
    type: end_event
flows:
  - { id: f1, source: start, target: fork }
  - { id: f2, source: fork, target: load_wagon }
  - { id: f3, source: fork, target: paperwork }
  - { id: f4, source: load_wagon, target: join }
  - { id: f5, source: paperwork, target: join }
  - { id: f6, source: join, target: end }
"#;

const DEMURRAGE: &str = r#"
key: demurrage
elements:
  - id: start
    type: start_event
  - id: wait
    type: timer_event
    duration: PT2H
  - id: charge
    type: service_task
    handler: charge
    async: true
  - id: end
    type: end_event
flows:
  - { id: f1, source: start, target: wait }
  - { id: f2, source: wait, target: charge }
  - { id: f3, source: charge, target: end }
"#;

const DISPATCH: &str = r#"
key: dispatch
elements:
  - id: start
    type: start_event
  - id: fork
    type: parallel_gateway
  - { id: notify_rail, type: service_task, handler: notify, async: true }
  - { id: notify_port, type: service_task, handler: notify, async: true }
  - { id: notify_customs, type: service_task, handler: notify, async: true }
  - { id: notify_customer, type: service_task, handler: notify, async: true }
  - id: join
    type: parallel_gateway
  - id: end
    type: end_event
flows:
  - { id: f1, source: start, target: fork }
  - { id: f2, source: fork, target: notify_rail }
  - { id: f3, source: fork, target: notify_port }
  - { id: f4, source: fork, target: notify_customs }
  - { id: f5, source: fork, target: notify_customer }
  - { id: f6, source: notify_rail, target: join }
  - { id: f7, source: notify_port, target: join }
  - { id: f8, source: notify_customs, target: join }
  - { id: f9, source: notify_customer, target: join }
  - { id: f10, source: join, target: end }
"#;

const INSPECTION: &str = r#"
key: inspection
elements:
  - id: start
    type: start_event
    form_properties:
      - { id: wagons, type: long, required: true }
      - { id: inspector, type: string }
  - id: inspect
    type: user_task
    form_properties:
      - { id: passed, type: boolean, required: true }
  - id: end
    type: end_event
flows:
  - { id: f1, source: start, target: inspect }
  - { id: f2, source: inspect, target: end }
"#;

fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()))
}

fn vars(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

async fn engine_with(configuration: ProcessEngineConfiguration, resources: &[(&str, &str)]) -> ProcessEngine {
    let engine = configuration.build_process_engine().await.unwrap();
    let mut deployment = engine.repository_service().create_deployment().name("test");
    for (name, source) in resources {
        deployment = deployment.add_resource(*name, *source);
    }
    deployment.deploy().await.unwrap();
    engine
}

fn shipping_handler(shipped: Arc<AtomicUsize>) -> Arc<dyn ServiceTaskHandler> {
    Arc::new(FnHandler(move |execution: &mut DelegateExecution| {
        shipped.fetch_add(1, Ordering::SeqCst);
        execution.set_variable("shipped", json!(true));
        Ok(())
    }))
}

#[test_log::test(tokio::test)]
async fn test_user_task_claim_and_exclusive_gateway() {
    let shipped = Arc::new(AtomicUsize::new(0));
    let engine = engine_with(
        ProcessEngineConfiguration::in_memory()
            .with_clock(clock())
            .register_handler("ship", shipping_handler(Arc::clone(&shipped))),
        &[("order.yaml", ORDER)],
    )
    .await;

    let identity = engine.identity_service();
    identity.save_user(&User::new("alice")).await.unwrap();
    identity.save_group(&Group::new("sales")).await.unwrap();
    identity.create_membership("alice", "sales").await.unwrap();

    let runtime = engine.runtime_service();
    let tasks = engine.task_service();

    // cheap order goes through the service task
    let cheap = runtime
        .start_process_instance_by_key("order", Some("PO-1".into()), vars(json!({"amount": 40})))
        .await
        .unwrap();
    assert_eq!(cheap.status, InstanceStatus::Active);

    let candidates = tasks.list(TaskQuery::new().candidate_user("alice")).await.unwrap();
    assert_eq!(candidates.len(), 1);
    let review = &candidates[0];
    assert_eq!(review.task_definition_key, "review");
    assert_eq!(review.priority, 50);

    tasks.claim(review.id, "alice").await.unwrap();
    tasks.claim(review.id, "alice").await.unwrap();
    assert!(matches!(
        tasks.claim(review.id, "bob").await,
        Err(EngineError::TaskAlreadyClaimed { .. })
    ));
    assert!(tasks
        .list(TaskQuery::new().candidate_user("alice"))
        .await
        .unwrap()
        .is_empty());

    tasks.complete(review.id, Map::new()).await.unwrap();
    let done = runtime.get_process_instance(cheap.id).await.unwrap().unwrap();
    assert_eq!(done.status, InstanceStatus::Completed);
    assert_eq!(done.variables["shipped"], json!(true));
    assert_eq!(shipped.load(Ordering::SeqCst), 1);

    // expensive order takes the default flow to a task assigned by expression
    let pricey = runtime
        .start_process_instance_by_key(
            "order",
            None,
            vars(json!({"amount": 900, "reviewer": "carol"})),
        )
        .await
        .unwrap();
    let review = tasks.list(TaskQuery::new().instance(pricey.id)).await.unwrap();
    tasks.complete(review[0].id, Map::new()).await.unwrap();

    let manual = tasks.list(TaskQuery::new().assignee("carol")).await.unwrap();
    assert_eq!(manual.len(), 1);
    assert_eq!(manual[0].task_definition_key, "manual");
    assert_eq!(shipped.load(Ordering::SeqCst), 1);

    engine.close().await;
}

#[tokio::test]
async fn test_parallel_gateway_joins_both_branches() {
    let engine = engine_with(
        ProcessEngineConfiguration::in_memory().with_clock(clock()),
        &[("loading.yml", LOADING)],
    )
    .await;
    let runtime = engine.runtime_service();
    let tasks = engine.task_service();

    let instance = runtime
        .start_process_instance_by_key("loading", None, Map::new())
        .await
        .unwrap();
    let open = tasks.list(TaskQuery::new().instance(instance.id)).await.unwrap();
    assert_eq!(open.len(), 2);

    tasks.complete(open[0].id, Map::new()).await.unwrap();
    let halfway = runtime.get_process_instance(instance.id).await.unwrap().unwrap();
    assert_eq!(halfway.status, InstanceStatus::Active);

    tasks.complete(open[1].id, Map::new()).await.unwrap();
    let done = runtime.get_process_instance(instance.id).await.unwrap().unwrap();
    assert_eq!(done.status, InstanceStatus::Completed);
    assert!(done.executions.is_empty());

    let activities = engine
        .history_service()
        .list_activity_instances(instance.id)
        .await
        .unwrap();
    assert!(activities.iter().all(|a| a.ended_at.is_some()));
    assert_eq!(activities.iter().filter(|a| a.activity_id == "end").count(), 1);

    engine.close().await;
}

#[tokio::test]
async fn test_timer_then_async_job_with_retries_and_dead_letter() {
    let clock = clock();
    let failing = Arc::new(AtomicBool::new(true));
    let handler_flag = Arc::clone(&failing);
    let engine = engine_with(
        ProcessEngineConfiguration::in_memory()
            .with_clock(clock.clone())
            .with_job_retries(2)
            .with_failed_job_retry_wait(Duration::from_secs(30))
            .register_handler(
                "charge",
                Arc::new(FnHandler(move |execution: &mut DelegateExecution| {
                    if handler_flag.load(Ordering::SeqCst) {
                        return Err(DelegateError::new("billing system unavailable"));
                    }
                    execution.set_variable("charged", json!(true));
                    Ok(())
                })),
            ),
        &[("demurrage.yaml", DEMURRAGE)],
    )
    .await;
    let management = engine.management_service();
    let executor = engine.async_executor();

    let instance = engine
        .runtime_service()
        .start_process_instance_by_key("demurrage", None, Map::new())
        .await
        .unwrap();

    // timer is not due yet
    let timers = management.list_timer_jobs().await.unwrap();
    assert_eq!(timers.len(), 1);
    assert_eq!(executor.poll_once(JobKind::Timer).await.unwrap(), 0);

    clock.advance(Duration::from_secs(2 * 3600));
    assert_eq!(executor.poll_once(JobKind::Timer).await.unwrap(), 1);
    assert!(management.list_timer_jobs().await.unwrap().is_empty());

    // async continuation fails until retries run out
    assert_eq!(executor.poll_once(JobKind::AsyncContinuation).await.unwrap(), 1);
    let jobs = management.list_jobs(&Default::default()).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].retries, 1);
    assert!(jobs[0]
        .exception_message
        .as_deref()
        .unwrap()
        .contains("billing system unavailable"));

    assert_eq!(executor.poll_once(JobKind::AsyncContinuation).await.unwrap(), 0);
    clock.advance(Duration::from_secs(30));
    assert_eq!(executor.poll_once(JobKind::AsyncContinuation).await.unwrap(), 1);

    let dead = management.list_dead_letter_jobs().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert!(matches!(
        management.execute_job(dead[0].id).await,
        Err(EngineError::Job(_))
    ));

    // revive and succeed
    failing.store(false, Ordering::SeqCst);
    management.set_job_retries(dead[0].id, 1).await.unwrap();
    assert_eq!(executor.poll_once(JobKind::AsyncContinuation).await.unwrap(), 1);

    let done = engine
        .runtime_service()
        .get_process_instance(instance.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(done.status, InstanceStatus::Completed);
    assert_eq!(done.variables["charged"], json!(true));
    assert!(management.list_jobs(&Default::default()).await.unwrap().is_empty());

    engine.close().await;
}

/// Handler that suspends before finishing, so concurrent jobs interleave
struct YieldingNotifier {
    sent: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl ServiceTaskHandler for YieldingNotifier {
    async fn execute(&self, _execution: &mut DelegateExecution) -> Result<(), DelegateError> {
        tokio::task::yield_now().await;
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test_log::test(tokio::test)]
async fn test_forked_async_jobs_survive_commit_conflicts() {
    let sent = Arc::new(AtomicUsize::new(0));
    let engine = engine_with(
        ProcessEngineConfiguration::in_memory()
            .with_clock(clock())
            .with_job_retries(3)
            .register_handler(
                "notify",
                Arc::new(YieldingNotifier {
                    sent: Arc::clone(&sent),
                }),
            ),
        &[("dispatch.yaml", DISPATCH)],
    )
    .await;
    let management = engine.management_service();
    let executor = engine.async_executor();

    let instance = engine
        .runtime_service()
        .start_process_instance_by_key("dispatch", None, Map::new())
        .await
        .unwrap();
    assert_eq!(management.list_jobs(&Default::default()).await.unwrap().len(), 4);

    // every round commits at least one job; the losers are only unlocked
    for _ in 0..4 {
        if executor.poll_once(JobKind::AsyncContinuation).await.unwrap() == 0 {
            break;
        }
        for job in management.list_jobs(&Default::default()).await.unwrap() {
            assert_eq!(job.retries, 3, "job {} lost a retry", job.activity_id);
            assert!(job.exception_message.is_none());
            assert!(job.lock_owner.is_none());
        }
    }

    assert!(management.list_dead_letter_jobs().await.unwrap().is_empty());
    assert!(management.list_jobs(&Default::default()).await.unwrap().is_empty());
    let done = engine
        .runtime_service()
        .get_process_instance(instance.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(done.status, InstanceStatus::Completed);
    assert!(sent.load(Ordering::SeqCst) >= 4);

    engine.close().await;
}

#[tokio::test]
async fn test_execute_timer_job_through_management() {
    let engine = engine_with(
        ProcessEngineConfiguration::in_memory()
            .with_clock(clock())
            .register_handler(
                "charge",
                Arc::new(FnHandler(|_: &mut DelegateExecution| Ok(()))),
            ),
        &[("demurrage.yaml", DEMURRAGE)],
    )
    .await;
    let management = engine.management_service();
    engine
        .runtime_service()
        .start_process_instance_by_key("demurrage", None, Map::new())
        .await
        .unwrap();

    let timer = management.list_timer_jobs().await.unwrap().remove(0);
    management.execute_job(timer.id).await.unwrap();

    let jobs = management.list_jobs(&Default::default()).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].kind, JobKind::AsyncContinuation);

    engine.close().await;
}

#[tokio::test]
async fn test_history_levels() {
    for (level, expect_tasks, expect_updates) in [
        (HistoryLevel::Activity, false, false),
        (HistoryLevel::Audit, true, false),
        (HistoryLevel::Full, true, true),
    ] {
        let engine = engine_with(
            ProcessEngineConfiguration::in_memory()
                .with_clock(clock())
                .with_history_level(level),
            &[("loading.yaml", LOADING)],
        )
        .await;
        let instance = engine
            .runtime_service()
            .start_process_instance_by_key("loading", None, vars(json!({"wagons": 3})))
            .await
            .unwrap();

        let history = engine.history_service();
        assert!(history.get_process_instance(instance.id).await.unwrap().is_some());
        assert_eq!(history.list_variables(instance.id).await.unwrap().len(), 1);
        assert_eq!(
            !history.list_task_instances(Some(instance.id)).await.unwrap().is_empty(),
            expect_tasks,
            "task history at {level}"
        );
        let updates = history
            .list_details(instance.id)
            .await
            .unwrap()
            .into_iter()
            .filter(|d| d.kind == DetailKind::VariableUpdate)
            .count();
        assert_eq!(updates > 0, expect_updates, "variable updates at {level}");
        engine.close().await;
    }

    let silent = engine_with(
        ProcessEngineConfiguration::in_memory().with_history_level(HistoryLevel::None),
        &[("loading.yaml", LOADING)],
    )
    .await;
    silent
        .runtime_service()
        .start_process_instance_by_key("loading", None, Map::new())
        .await
        .unwrap();
    assert!(silent
        .history_service()
        .list_process_instances(&HistoricInstanceQuery::default())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_start_and_task_forms() {
    let engine = engine_with(
        ProcessEngineConfiguration::in_memory().with_clock(clock()),
        &[("inspection.yaml", INSPECTION)],
    )
    .await;
    let definition = engine
        .repository_service()
        .get_latest_process_definition("inspection")
        .await
        .unwrap();
    let forms = engine.form_service();

    let start_form = forms.get_start_form_data(definition.id).await.unwrap();
    assert_eq!(start_form.properties.len(), 2);

    let missing = forms
        .submit_start_form(definition.id, None, HashMap::new())
        .await;
    assert!(matches!(missing, Err(EngineError::Form(_))));

    let submitted = HashMap::from([
        ("wagons".to_string(), "12".to_string()),
        ("inspector".to_string(), "dana".to_string()),
    ]);
    let instance = forms
        .submit_start_form(definition.id, Some("TRAIN-7".into()), submitted)
        .await
        .unwrap();
    assert_eq!(instance.variables["wagons"], json!(12));

    let task = engine
        .task_service()
        .list(TaskQuery::new().instance(instance.id))
        .await
        .unwrap()
        .remove(0);
    let task_form = forms.get_task_form_data(task.id).await.unwrap();
    assert_eq!(task_form.properties[0].id, "passed");

    forms
        .submit_task_form(task.id, HashMap::from([("passed".to_string(), "true".to_string())]))
        .await
        .unwrap();

    let done = engine
        .runtime_service()
        .get_process_instance(instance.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(done.status, InstanceStatus::Completed);
    assert_eq!(done.variables["passed"], json!(true));

    let form_details = engine
        .history_service()
        .list_details(instance.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|d| d.kind == DetailKind::FormProperty)
        .count();
    assert_eq!(form_details, 3);

    engine.close().await;
}

#[tokio::test]
async fn test_suspended_definition_and_versions() {
    let engine = engine_with(
        ProcessEngineConfiguration::in_memory().with_clock(clock()),
        &[("loading.yaml", LOADING)],
    )
    .await;
    let repository = engine.repository_service();
    repository
        .create_deployment()
        .add_resource("loading.yaml", LOADING.replace("load_wagon", "load_train"))
        .deploy()
        .await
        .unwrap();

    let latest = repository.get_latest_process_definition("loading").await.unwrap();
    assert_eq!(latest.version, 2);
    assert_eq!(repository.list_process_definitions(Some("loading")).await.unwrap().len(), 2);

    repository.suspend_process_definition(latest.id).await.unwrap();
    let runtime = engine.runtime_service();
    assert!(matches!(
        runtime.start_process_instance_by_key("loading", None, Map::new()).await,
        Err(EngineError::DefinitionSuspended(_))
    ));

    repository.activate_process_definition(latest.id).await.unwrap();
    let instance = runtime
        .start_process_instance_by_key("loading", None, Map::new())
        .await
        .unwrap();
    assert_eq!(instance.definition_id, latest.id);

    runtime
        .delete_process_instance(instance.id, Some("cancelled by dispatcher".into()))
        .await
        .unwrap();
    let cancelled = runtime.get_process_instance(instance.id).await.unwrap().unwrap();
    assert_eq!(cancelled.status, InstanceStatus::Cancelled);
    assert!(engine
        .task_service()
        .list(TaskQuery::new().instance(instance.id))
        .await
        .unwrap()
        .is_empty());

    assert!(matches!(
        runtime.start_process_instance_by_key("unknown", None, Map::new()).await,
        Err(EngineError::DefinitionNotFound(_))
    ));
}
