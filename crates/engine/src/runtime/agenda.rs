//! Token-moving state machine
//!
//! An [`Agenda`] owns one process instance for the duration of a command.
//! Operations are queued and executed until every execution has reached a
//! wait state or ended; all writes accumulate in a [`Changeset`] that the
//! caller commits in one store call.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

use super::{Changeset, CommandExtras, Execution, ExecutionState, InstanceStatus, ProcessInstance};
use crate::definition::{parse_duration, Element, ElementKind, ProcessModel, SequenceFlow, UserTaskDefinition};
use crate::delegate::DelegateExecution;
use crate::engine::EngineContext;
use crate::error::{EngineError, Result};
use crate::expression::{evaluate_condition, is_expression, Expression};
use crate::history::{
    DetailKind, HistoricActivityInstance, HistoricDetail, HistoricProcessInstance,
    HistoricVariable, HistoryRecord,
};
use crate::jobs::{Job, JobKind};
use crate::task::{Task, DEFAULT_PRIORITY};

/// Upper bound on operations per command
pub(crate) const MAX_AGENDA_OPERATIONS: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Operation {
    /// The execution reached its activity; run the activity behaviour
    Arrive(Uuid),
    /// The activity is done; follow its outgoing flows
    Leave(Uuid),
    /// Run the deferred body of an async activity, then leave
    Continue(Uuid),
}

pub(crate) struct Agenda<'a> {
    ctx: &'a EngineContext,
    model: Arc<ProcessModel>,
    instance: ProcessInstance,
    changeset: Changeset,
    baseline: Map<String, Value>,
    operations: VecDeque<Operation>,
    executed: usize,
    now: DateTime<Utc>,
}

impl<'a> Agenda<'a> {
    /// `baseline` holds the variables as stored before the command; the
    /// difference is written to history on [`Agenda::finish`].
    pub(crate) fn new(
        ctx: &'a EngineContext,
        model: Arc<ProcessModel>,
        instance: ProcessInstance,
        baseline: Map<String, Value>,
    ) -> Self {
        Self {
            now: ctx.now(),
            ctx,
            model,
            instance,
            changeset: Changeset::new(),
            baseline,
            operations: VecDeque::new(),
            executed: 0,
        }
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub(crate) fn model(&self) -> &Arc<ProcessModel> {
        &self.model
    }

    pub(crate) fn instance(&self) -> &ProcessInstance {
        &self.instance
    }

    pub(crate) fn instance_mut(&mut self) -> &mut ProcessInstance {
        &mut self.instance
    }

    pub(crate) fn changeset_mut(&mut self) -> &mut Changeset {
        &mut self.changeset
    }

    pub(crate) fn schedule(&mut self, operation: Operation) {
        self.operations.push_back(operation);
    }

    pub(crate) fn record(&mut self, record: HistoryRecord) {
        self.changeset.record(self.ctx.history_level, record);
    }

    /// Drain the operation queue
    pub(crate) async fn run(&mut self) -> Result<()> {
        while let Some(operation) = self.operations.pop_front() {
            self.executed += 1;
            if self.executed > MAX_AGENDA_OPERATIONS {
                return Err(EngineError::AgendaLimitExceeded(MAX_AGENDA_OPERATIONS));
            }
            debug!(instance_id = %self.instance.id, ?operation, "agenda");
            match operation {
                Operation::Arrive(execution_id) => self.arrive(execution_id).await?,
                Operation::Leave(execution_id) => self.leave(execution_id)?,
                Operation::Continue(execution_id) => self.resume(execution_id).await?,
            }
        }
        Ok(())
    }

    /// Seal the command: variable history, form details, the instance row
    ///
    /// Returns the instance as it will be stored and the changeset to commit.
    pub(crate) fn finish(
        mut self,
        extras: CommandExtras,
        task_id: Option<Uuid>,
    ) -> (ProcessInstance, Changeset) {
        let changed: Vec<(String, Value)> = self
            .instance
            .variables
            .iter()
            .filter(|(name, value)| self.baseline.get(*name) != Some(*value))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        for (name, value) in changed {
            self.record(HistoryRecord::Variable(HistoricVariable {
                instance_id: self.instance.id,
                name: name.clone(),
                value: value.clone(),
                created_at: self.now,
                updated_at: self.now,
            }));
            self.record(HistoryRecord::Detail(HistoricDetail {
                id: Uuid::now_v7(),
                kind: DetailKind::VariableUpdate,
                instance_id: self.instance.id,
                task_id,
                name,
                value,
                time: self.now,
            }));
        }

        for (name, value) in extras.form_properties {
            self.record(HistoryRecord::Detail(HistoricDetail {
                id: Uuid::now_v7(),
                kind: DetailKind::FormProperty,
                instance_id: self.instance.id,
                task_id,
                name,
                value,
                time: self.now,
            }));
        }
        self.changeset.form_instances.extend(extras.form_instances);

        let mut stored = self.instance.clone();
        stored.revision += 1;
        self.changeset.instance = Some(self.instance);
        (stored, self.changeset)
    }

    // =========================================================================
    // History helpers
    // =========================================================================

    pub(crate) fn historic_instance(
        &self,
        end_activity_id: Option<String>,
        delete_reason: Option<String>,
    ) -> HistoricProcessInstance {
        let instance = &self.instance;
        HistoricProcessInstance {
            id: instance.id,
            definition_id: instance.definition_id,
            definition_key: instance.definition_key.clone(),
            business_key: instance.business_key.clone(),
            start_user: instance.start_user.clone(),
            start_activity_id: self.model.start_event().id.clone(),
            end_activity_id,
            started_at: instance.started_at,
            ended_at: instance.ended_at,
            duration_ms: instance
                .ended_at
                .map(|end| (end - instance.started_at).num_milliseconds()),
            delete_reason,
        }
    }

    /// Write the activity record of the execution's current visit
    pub(crate) fn record_activity(&mut self, execution_id: Uuid, ended: bool) {
        let record = {
            let Some(execution) = self.instance.execution(execution_id) else {
                return;
            };
            let (Some(id), Some(started_at)) =
                (execution.activity_instance_id, execution.activity_started_at)
            else {
                return;
            };
            let element = self.model.element(&execution.activity_id);
            let ended_at = ended.then_some(self.now);
            HistoricActivityInstance {
                id,
                instance_id: self.instance.id,
                execution_id,
                activity_id: execution.activity_id.clone(),
                activity_name: element
                    .and_then(|e| e.kind.display_name())
                    .map(str::to_string),
                activity_type: element.map_or("unknown", |e| e.kind.type_name()).to_string(),
                task_id: execution.task_id,
                started_at,
                ended_at,
                duration_ms: ended_at.map(|end| (end - started_at).num_milliseconds()),
            }
        };
        self.record(HistoryRecord::ActivityInstance(record));
    }

    fn start_activity(&mut self, execution_id: Uuid) -> Result<()> {
        let now = self.now;
        let execution = self.execution_mut(execution_id)?;
        execution.activity_instance_id = Some(Uuid::now_v7());
        execution.activity_started_at = Some(now);
        execution.task_id = None;
        self.record_activity(execution_id, false);
        Ok(())
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    fn execution(&self, execution_id: Uuid) -> Result<&Execution> {
        self.instance.execution(execution_id).ok_or_else(|| {
            EngineError::IllegalArgument(format!(
                "execution {execution_id} does not belong to instance {}",
                self.instance.id
            ))
        })
    }

    fn execution_mut(&mut self, execution_id: Uuid) -> Result<&mut Execution> {
        let instance_id = self.instance.id;
        self.instance.execution_mut(execution_id).ok_or_else(|| {
            EngineError::IllegalArgument(format!(
                "execution {execution_id} does not belong to instance {instance_id}"
            ))
        })
    }

    fn current_element(&self, execution_id: Uuid) -> Result<(Arc<ProcessModel>, String)> {
        let activity_id = self.execution(execution_id)?.activity_id.clone();
        if self.model.element(&activity_id).is_none() {
            return Err(EngineError::IllegalArgument(format!(
                "activity '{activity_id}' is not part of process '{}'",
                self.model.key()
            )));
        }
        Ok((self.model.clone(), activity_id))
    }

    fn set_state(&mut self, execution_id: Uuid, state: ExecutionState) -> Result<()> {
        self.execution_mut(execution_id)?.state = state;
        Ok(())
    }

    // =========================================================================
    // Operations
    // =========================================================================

    async fn arrive(&mut self, execution_id: Uuid) -> Result<()> {
        let (model, activity_id) = self.current_element(execution_id)?;
        let Some(element) = model.element(&activity_id) else {
            return Ok(());
        };
        self.start_activity(execution_id)?;

        match &element.kind {
            ElementKind::StartEvent { .. } | ElementKind::ExclusiveGateway { .. } => {
                self.schedule(Operation::Leave(execution_id));
            }
            ElementKind::EndEvent => self.end(execution_id, &element.id),
            ElementKind::UserTask(definition) => {
                self.create_task(execution_id, element, definition)?;
            }
            ElementKind::ServiceTask {
                asynchronous: true,
                ..
            }
            | ElementKind::BusinessRuleTask {
                asynchronous: true,
                ..
            } => {
                let due = self.now;
                self.create_job(execution_id, JobKind::AsyncContinuation, due)?;
            }
            ElementKind::ServiceTask { .. } | ElementKind::BusinessRuleTask { .. } => {
                self.execute_body(execution_id, element).await?;
                self.schedule(Operation::Leave(execution_id));
            }
            ElementKind::ReceiveTask { .. } => {
                self.set_state(execution_id, ExecutionState::Waiting)?;
            }
            ElementKind::TimerEvent { duration } => {
                let wait = parse_duration(duration)?;
                let due = self.now
                    + chrono::Duration::from_std(wait).map_err(|e| {
                        EngineError::IllegalArgument(format!("timer duration out of range: {e}"))
                    })?;
                self.create_job(execution_id, JobKind::Timer, due)?;
            }
            ElementKind::ParallelGateway => self.join(execution_id, &element.id)?,
        }
        Ok(())
    }

    async fn resume(&mut self, execution_id: Uuid) -> Result<()> {
        let (model, activity_id) = self.current_element(execution_id)?;
        let Some(element) = model.element(&activity_id) else {
            return Ok(());
        };
        self.set_state(execution_id, ExecutionState::Active)?;
        if matches!(
            element.kind,
            ElementKind::ServiceTask { .. } | ElementKind::BusinessRuleTask { .. }
        ) {
            self.execute_body(execution_id, element).await?;
        }
        self.schedule(Operation::Leave(execution_id));
        Ok(())
    }

    fn leave(&mut self, execution_id: Uuid) -> Result<()> {
        let (model, activity_id) = self.current_element(execution_id)?;
        let Some(element) = model.element(&activity_id) else {
            return Ok(());
        };
        self.record_activity(execution_id, true);

        let flows = self.select_flows(&model, element)?;
        for (index, flow) in flows.into_iter().enumerate() {
            let next = if index == 0 {
                let execution = self.execution_mut(execution_id)?;
                execution.activity_id = flow.target.clone();
                execution.state = ExecutionState::Active;
                execution.activity_instance_id = None;
                execution.activity_started_at = None;
                execution.task_id = None;
                execution_id
            } else {
                let execution = Execution::new(flow.target.clone());
                let id = execution.id;
                self.instance.executions.push(execution);
                id
            };
            debug!(flow_id = %flow.id, target = %flow.target, "taking sequence flow");
            self.schedule(Operation::Arrive(next));
        }
        Ok(())
    }

    // =========================================================================
    // Behaviours
    // =========================================================================

    fn select_flows<'m>(
        &self,
        model: &'m ProcessModel,
        element: &Element,
    ) -> Result<Vec<&'m SequenceFlow>> {
        let variables = &self.instance.variables;
        let holds = |flow: &SequenceFlow| -> Result<bool> {
            match &flow.condition {
                Some(condition) => Ok(evaluate_condition(condition, variables)?),
                None => Ok(true),
            }
        };

        let selected: Vec<&'m SequenceFlow> = match &element.kind {
            ElementKind::ExclusiveGateway { default } => {
                let mut chosen = None;
                for flow in model.outgoing(&element.id) {
                    if default.as_deref() == Some(flow.id.as_str()) {
                        continue;
                    }
                    if holds(flow)? {
                        chosen = Some(flow);
                        break;
                    }
                }
                chosen
                    .or_else(|| default.as_deref().and_then(|id| model.flow(id)))
                    .into_iter()
                    .collect()
            }
            ElementKind::ParallelGateway => model.outgoing(&element.id).collect(),
            _ => {
                let mut taken = Vec::new();
                for flow in model.outgoing(&element.id) {
                    if holds(flow)? {
                        taken.push(flow);
                    }
                }
                taken
            }
        };

        if selected.is_empty() {
            return Err(EngineError::NoOutgoingFlow {
                activity_id: element.id.clone(),
            });
        }
        Ok(selected)
    }

    fn end(&mut self, execution_id: Uuid, activity_id: &str) {
        self.record_activity(execution_id, true);
        self.instance.executions.retain(|e| e.id != execution_id);

        if self.instance.executions.is_empty() {
            self.instance.status = InstanceStatus::Completed;
            self.instance.ended_at = Some(self.now);
            let record = self.historic_instance(Some(activity_id.to_string()), None);
            self.record(HistoryRecord::ProcessInstance(record));
            info!(
                instance_id = %self.instance.id,
                definition_key = %self.instance.definition_key,
                "process instance completed"
            );
        }
    }

    fn join(&mut self, execution_id: Uuid, gateway_id: &str) -> Result<()> {
        self.set_state(execution_id, ExecutionState::Joined)?;
        let required = self.model.incoming_count(gateway_id).max(1);
        let arrived: Vec<Uuid> = self
            .instance
            .executions
            .iter()
            .filter(|e| e.activity_id == gateway_id && e.state == ExecutionState::Joined)
            .map(|e| e.id)
            .collect();
        if arrived.len() < required {
            debug!(gateway_id, arrived = arrived.len(), required, "waiting at join");
            return Ok(());
        }

        for other in arrived.into_iter().filter(|id| *id != execution_id) {
            self.record_activity(other, true);
            self.instance.executions.retain(|e| e.id != other);
        }
        self.set_state(execution_id, ExecutionState::Active)?;
        self.schedule(Operation::Leave(execution_id));
        Ok(())
    }

    fn create_task(
        &mut self,
        execution_id: Uuid,
        element: &Element,
        definition: &UserTaskDefinition,
    ) -> Result<()> {
        let assignee = match &definition.assignee {
            Some(text) if is_expression(text) => {
                match Expression::parse(text)?.evaluate(&self.instance.variables)? {
                    Value::Null => None,
                    Value::String(user) => Some(user),
                    other => Some(other.to_string()),
                }
            }
            Some(text) => Some(text.clone()),
            None => None,
        };
        let due_date = match &definition.due_in {
            Some(text) => {
                let wait = parse_duration(text)?;
                Some(
                    self.now
                        + chrono::Duration::from_std(wait).map_err(|e| {
                            EngineError::IllegalArgument(format!("due date out of range: {e}"))
                        })?,
                )
            }
            None => None,
        };

        let task = Task {
            id: Uuid::now_v7(),
            instance_id: self.instance.id,
            execution_id,
            definition_id: self.instance.definition_id,
            definition_key: self.instance.definition_key.clone(),
            task_definition_key: element.id.clone(),
            name: definition.name.clone(),
            assignee,
            candidate_users: definition.candidate_users.clone(),
            candidate_groups: definition.candidate_groups.clone(),
            form_key: definition.form_key.clone(),
            priority: definition.priority.unwrap_or(DEFAULT_PRIORITY),
            due_date,
            created_at: self.now,
            claimed_at: None,
            revision: 0,
        };

        let execution = self.execution_mut(execution_id)?;
        execution.state = ExecutionState::Waiting;
        execution.task_id = Some(task.id);
        self.record_activity(execution_id, false);
        self.record(HistoryRecord::TaskInstance(task.to_history(None, None)));
        debug!(task_id = %task.id, task_definition_key = %task.task_definition_key, "task created");
        self.changeset.tasks_inserted.push(task);
        Ok(())
    }

    fn create_job(&mut self, execution_id: Uuid, kind: JobKind, due_at: DateTime<Utc>) -> Result<()> {
        let activity_id = self.execution(execution_id)?.activity_id.clone();
        let job = Job::new(
            kind,
            self.instance.id,
            execution_id,
            activity_id,
            due_at,
            self.ctx.job_retries,
            self.now,
        );
        self.set_state(execution_id, ExecutionState::Waiting)?;
        debug!(job_id = %job.id, %kind, %due_at, "job created");
        self.changeset.jobs_inserted.push(job);
        Ok(())
    }

    /// Body of a service or business rule task
    async fn execute_body(&mut self, execution_id: Uuid, element: &Element) -> Result<()> {
        match &element.kind {
            ElementKind::ServiceTask { handler, .. } => {
                self.run_handler(execution_id, &element.id, handler).await
            }
            ElementKind::BusinessRuleTask {
                decision_key,
                result_variable,
                ..
            } => {
                self.run_decision(decision_key, result_variable.as_deref())
                    .await
            }
            _ => Ok(()),
        }
    }

    async fn run_handler(&mut self, execution_id: Uuid, activity_id: &str, name: &str) -> Result<()> {
        let handler = self
            .ctx
            .handlers
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::HandlerNotRegistered(name.to_string()))?;

        let mut delegate = DelegateExecution {
            instance_id: self.instance.id,
            execution_id,
            activity_id: activity_id.to_string(),
            definition_key: self.instance.definition_key.clone(),
            business_key: self.instance.business_key.clone(),
            variables: self.instance.variables.clone(),
        };
        handler
            .execute(&mut delegate)
            .await
            .map_err(|e| EngineError::ServiceTaskFailed {
                activity_id: activity_id.to_string(),
                message: e.message,
            })?;
        self.instance.variables = delegate.variables;
        Ok(())
    }

    async fn run_decision(&mut self, decision_key: &str, result_variable: Option<&str>) -> Result<()> {
        let evaluator = self
            .ctx
            .decisions
            .clone()
            .ok_or_else(|| EngineError::DecisionEvaluatorMissing(decision_key.to_string()))?;

        let rows = evaluator
            .evaluate(decision_key, &self.instance.variables)
            .await
            .map_err(|e| EngineError::DecisionFailed {
                decision_key: decision_key.to_string(),
                message: e.message,
            })?;

        match result_variable {
            Some(name) => {
                let rows = rows.into_iter().map(Value::Object).collect();
                self.instance
                    .variables
                    .insert(name.to_string(), Value::Array(rows));
            }
            None if rows.len() > 1 => {
                return Err(EngineError::DecisionFailed {
                    decision_key: decision_key.to_string(),
                    message: format!(
                        "{} rows matched but no result variable is declared",
                        rows.len()
                    ),
                });
            }
            None => {
                if let Some(row) = rows.into_iter().next() {
                    self.instance.variables.extend(row);
                }
            }
        }
        Ok(())
    }
}
