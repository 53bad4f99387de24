//! Engine error type
//!
//! Each module owns its error enum; [`EngineError`] aggregates them for the
//! service APIs.

use uuid::Uuid;

use crate::config::ConfigError;
use crate::definition::DefinitionError;
use crate::expression::ExpressionError;
use crate::form::FormError;
use crate::jobs::JobError;
use crate::persistence::StoreError;

/// Result alias used throughout the engine
pub type Result<T, E = EngineError> = std::result::Result<T, E>;

/// Errors returned by engine services
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error(transparent)]
    Form(#[from] FormError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("process definition not found: {0}")]
    DefinitionNotFound(String),

    #[error("process definition {0} is suspended")]
    DefinitionSuspended(String),

    #[error("process instance not found: {0}")]
    InstanceNotFound(Uuid),

    #[error("process instance {0} is not active")]
    InstanceNotActive(Uuid),

    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("task {task_id} is already claimed by {assignee}")]
    TaskAlreadyClaimed { task_id: Uuid, assignee: String },

    #[error("no execution of instance {instance_id} is waiting in activity '{activity_id}'")]
    NotWaiting {
        instance_id: Uuid,
        activity_id: String,
    },

    #[error("no outgoing sequence flow could be taken from activity '{activity_id}'")]
    NoOutgoingFlow { activity_id: String },

    #[error("no service task handler registered under '{0}'")]
    HandlerNotRegistered(String),

    #[error("service task '{activity_id}' failed: {message}")]
    ServiceTaskFailed {
        activity_id: String,
        message: String,
    },

    #[error("no decision evaluator configured (decision '{0}')")]
    DecisionEvaluatorMissing(String),

    #[error("decision '{decision_key}' failed: {message}")]
    DecisionFailed {
        decision_key: String,
        message: String,
    },

    #[error("configurator '{name}' failed: {message}")]
    Configurator { name: String, message: String },

    #[error("agenda exceeded {0} operations; the process model probably loops without a wait state")]
    AgendaLimitExceeded(usize),

    #[error("illegal argument: {0}")]
    IllegalArgument(String),
}

impl EngineError {
    /// Whether retrying the same command may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Store(StoreError::ConcurrencyConflict { .. }) | Self::Store(StoreError::Database(_))
        )
    }
}
