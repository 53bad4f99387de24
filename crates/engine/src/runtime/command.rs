//! Engine commands
//!
//! Each command loads what it needs, runs the agenda and commits exactly one
//! changeset. A concurrent writer makes the commit fail with a concurrency
//! conflict and nothing of the command is stored.

use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::agenda::{Agenda, Operation};
use super::{Changeset, CommandExtras, Execution, ExecutionState, InstanceStatus, ProcessInstance};
use crate::definition::ElementKind;
use crate::engine::EngineContext;
use crate::error::{EngineError, Result};
use crate::history::HistoryRecord;
use crate::jobs::{Job, JobFilter};
use crate::repository::ProcessDefinition;
use crate::task::TaskQuery;

pub(crate) async fn load_active_instance(
    ctx: &EngineContext,
    instance_id: Uuid,
) -> Result<ProcessInstance> {
    let instance = ctx
        .store
        .find_instance(instance_id)
        .await?
        .ok_or(EngineError::InstanceNotFound(instance_id))?;
    if !instance.is_active() {
        return Err(EngineError::InstanceNotActive(instance_id));
    }
    Ok(instance)
}

async fn agenda_for(ctx: &EngineContext, instance: ProcessInstance) -> Result<Agenda<'_>> {
    let definition = ctx.definition(instance.definition_id).await?;
    let model = ctx.model(&definition)?;
    let baseline = instance.variables.clone();
    Ok(Agenda::new(ctx, model, instance, baseline))
}

#[instrument(skip(ctx, definition, variables, extras), fields(definition_key = %definition.key))]
pub(crate) async fn start_instance(
    ctx: &EngineContext,
    definition: &ProcessDefinition,
    business_key: Option<String>,
    start_user: Option<String>,
    variables: Map<String, Value>,
    extras: CommandExtras,
) -> Result<ProcessInstance> {
    if definition.suspended {
        return Err(EngineError::DefinitionSuspended(format!(
            "{}:{}",
            definition.key, definition.version
        )));
    }
    let model = ctx.model(definition)?;
    let start = Execution::new(model.start_event().id.clone());
    let start_id = start.id;
    let instance = ProcessInstance {
        id: Uuid::now_v7(),
        definition_id: definition.id,
        definition_key: definition.key.clone(),
        business_key,
        status: InstanceStatus::Active,
        variables,
        executions: vec![start],
        start_user,
        started_at: ctx.now(),
        ended_at: None,
        end_reason: None,
        revision: 0,
    };

    let mut agenda = Agenda::new(ctx, model, instance, Map::new());
    let record = agenda.historic_instance(None, None);
    agenda.record(HistoryRecord::ProcessInstance(record));
    agenda.schedule(Operation::Arrive(start_id));
    agenda.run().await?;

    let (instance, changeset) = agenda.finish(extras, None);
    ctx.store.commit(changeset).await?;
    info!(
        instance_id = %instance.id,
        version = definition.version,
        status = %instance.status,
        "process instance started"
    );
    Ok(instance)
}

#[instrument(skip(ctx, variables, extras))]
pub(crate) async fn complete_task(
    ctx: &EngineContext,
    task_id: Uuid,
    variables: Map<String, Value>,
    extras: CommandExtras,
) -> Result<()> {
    let task = ctx
        .store
        .find_task(task_id)
        .await?
        .ok_or(EngineError::TaskNotFound(task_id))?;
    let instance = load_active_instance(ctx, task.instance_id).await?;
    let mut agenda = agenda_for(ctx, instance).await?;

    let waiting = agenda
        .instance()
        .execution(task.execution_id)
        .is_some_and(|e| e.state == ExecutionState::Waiting);
    if !waiting {
        return Err(EngineError::NotWaiting {
            instance_id: task.instance_id,
            activity_id: task.task_definition_key.clone(),
        });
    }

    agenda.instance_mut().variables.extend(variables);
    let now = agenda.now();
    agenda.record(HistoryRecord::TaskInstance(task.to_history(Some(now), None)));
    agenda.changeset_mut().tasks_deleted.push(task.id);
    agenda.schedule(Operation::Leave(task.execution_id));
    agenda.run().await?;

    let (_, changeset) = agenda.finish(extras, Some(task.id));
    ctx.store.commit(changeset).await?;
    info!(%task_id, instance_id = %task.instance_id, "task completed");
    Ok(())
}

/// Signal a waiting receive task or timer (or run an async activity now)
#[instrument(skip(ctx, variables))]
pub(crate) async fn trigger(
    ctx: &EngineContext,
    instance_id: Uuid,
    activity_id: &str,
    variables: Map<String, Value>,
) -> Result<ProcessInstance> {
    let instance = load_active_instance(ctx, instance_id).await?;
    let execution_id = instance
        .executions
        .iter()
        .find(|e| e.activity_id == activity_id && e.state == ExecutionState::Waiting)
        .map(|e| e.id)
        .ok_or_else(|| EngineError::NotWaiting {
            instance_id,
            activity_id: activity_id.to_string(),
        })?;

    let mut agenda = agenda_for(ctx, instance).await?;
    let model = agenda.model().clone();
    let operation = match model.element(activity_id).map(|e| &e.kind) {
        Some(ElementKind::ReceiveTask { .. }) | Some(ElementKind::TimerEvent { .. }) => {
            Operation::Leave(execution_id)
        }
        Some(ElementKind::ServiceTask { .. }) | Some(ElementKind::BusinessRuleTask { .. }) => {
            Operation::Continue(execution_id)
        }
        Some(ElementKind::UserTask(_)) => {
            return Err(EngineError::IllegalArgument(format!(
                "activity '{activity_id}' is a user task; complete its task instead"
            )))
        }
        _ => {
            return Err(EngineError::NotWaiting {
                instance_id,
                activity_id: activity_id.to_string(),
            })
        }
    };

    let jobs = ctx
        .store
        .list_jobs(&JobFilter {
            instance_id: Some(instance_id),
            ..JobFilter::default()
        })
        .await?;
    for job in jobs.iter().filter(|j| j.execution_id == execution_id) {
        agenda.changeset_mut().jobs_deleted.push(job.id);
    }

    agenda.instance_mut().variables.extend(variables);
    if let Some(execution) = agenda.instance_mut().execution_mut(execution_id) {
        execution.state = ExecutionState::Active;
    }
    agenda.schedule(operation);
    agenda.run().await?;

    let (instance, changeset) = agenda.finish(CommandExtras::default(), None);
    ctx.store.commit(changeset).await?;
    info!(%instance_id, activity_id, "execution triggered");
    Ok(instance)
}

#[instrument(skip(ctx, variables))]
pub(crate) async fn set_variables(
    ctx: &EngineContext,
    instance_id: Uuid,
    variables: Map<String, Value>,
) -> Result<()> {
    let instance = load_active_instance(ctx, instance_id).await?;
    let mut agenda = agenda_for(ctx, instance).await?;
    agenda.instance_mut().variables.extend(variables);
    let (_, changeset) = agenda.finish(CommandExtras::default(), None);
    ctx.store.commit(changeset).await?;
    Ok(())
}

#[instrument(skip(ctx))]
pub(crate) async fn delete_instance(
    ctx: &EngineContext,
    instance_id: Uuid,
    reason: Option<String>,
) -> Result<()> {
    let instance = load_active_instance(ctx, instance_id).await?;
    let tasks = ctx
        .store
        .list_tasks(&TaskQuery::new().instance(instance_id))
        .await?;
    let jobs = ctx
        .store
        .list_jobs(&JobFilter {
            instance_id: Some(instance_id),
            ..JobFilter::default()
        })
        .await?;

    let mut agenda = agenda_for(ctx, instance).await?;
    let now = agenda.now();
    for task in &tasks {
        agenda.record(HistoryRecord::TaskInstance(
            task.to_history(Some(now), reason.clone()),
        ));
        agenda.changeset_mut().tasks_deleted.push(task.id);
    }
    for job in &jobs {
        agenda.changeset_mut().jobs_deleted.push(job.id);
    }

    let executions: Vec<Uuid> = agenda.instance().executions.iter().map(|e| e.id).collect();
    for execution_id in executions {
        agenda.record_activity(execution_id, true);
    }

    let instance = agenda.instance_mut();
    instance.executions.clear();
    instance.status = InstanceStatus::Cancelled;
    instance.ended_at = Some(now);
    instance.end_reason = reason.clone();
    let record = agenda.historic_instance(None, reason);
    agenda.record(HistoryRecord::ProcessInstance(record));

    let (_, changeset) = agenda.finish(CommandExtras::default(), None);
    ctx.store.commit(changeset).await?;
    info!(%instance_id, "process instance deleted");
    Ok(())
}

/// Run an acquired job
///
/// Jobs whose instance or execution is gone are deleted.
#[instrument(skip(ctx, job), fields(job_id = %job.id, kind = %job.kind))]
pub(crate) async fn execute_job(ctx: &EngineContext, job: &Job) -> Result<()> {
    let instance = match ctx.store.find_instance(job.instance_id).await? {
        Some(instance) if instance.is_active() && instance.execution(job.execution_id).is_some() => {
            instance
        }
        _ => {
            warn!(instance_id = %job.instance_id, "dropping job without a waiting execution");
            ctx.store
                .commit(Changeset {
                    jobs_deleted: vec![job.id],
                    ..Changeset::default()
                })
                .await?;
            return Ok(());
        }
    };

    let mut agenda = agenda_for(ctx, instance).await?;
    agenda.changeset_mut().jobs_deleted.push(job.id);
    agenda.schedule(Operation::Continue(job.execution_id));
    agenda.run().await?;

    let (_, changeset) = agenda.finish(CommandExtras::default(), None);
    ctx.store.commit(changeset).await?;
    info!(instance_id = %job.instance_id, activity_id = %job.activity_id, "job executed");
    Ok(())
}

/// Unlock a job whose command lost an optimistic-lock race
///
/// Retries and due date stay as they are; the job runs again on the next
/// acquisition against the fresh instance state.
pub(crate) async fn release_job(ctx: &EngineContext, job: &Job) -> Result<()> {
    let mut released = job.clone();
    released.unlock();
    ctx.store
        .commit(Changeset {
            jobs_updated: vec![released],
            ..Changeset::default()
        })
        .await?;
    debug!(job_id = %job.id, "job released after concurrent update");
    Ok(())
}

/// Store a failed attempt on the job, leaving the instance untouched
pub(crate) async fn record_job_failure(ctx: &EngineContext, job: &Job, message: &str) -> Result<Job> {
    let mut failed = job.clone();
    failed.record_failure(message, ctx.now(), ctx.failed_job_retry_wait);
    ctx.store
        .commit(Changeset {
            jobs_updated: vec![failed.clone()],
            ..Changeset::default()
        })
        .await?;
    failed.revision += 1;
    if failed.dead_letter {
        warn!(job_id = %job.id, error = %message, "job moved to dead letter");
    } else {
        warn!(job_id = %job.id, retries = failed.retries, error = %message, "job failed; retrying later");
    }
    Ok(failed)
}
