//! Process instance runtime
//!
//! - [`RuntimeService`] starts, inspects, signals and deletes instances
//! - the agenda moves executions through the process model
//! - every command commits one [`Changeset`]

mod agenda;
mod changeset;
mod command;
mod instance;
mod service;

pub use changeset::Changeset;
pub use instance::{Execution, ExecutionState, InstanceFilter, InstanceStatus, ProcessInstance};
pub use service::{ProcessInstanceBuilder, RuntimeService};

pub(crate) use command::{complete_task, execute_job, record_job_failure, release_job};

use serde_json::Value;

use crate::form::FormInstance;

/// Side data a command writes next to the instance
#[derive(Debug, Clone, Default)]
pub struct CommandExtras {
    /// Submitted form properties, recorded as history details
    pub form_properties: Vec<(String, Value)>,
    /// Form engine submissions stored in the same commit
    pub form_instances: Vec<FormInstance>,
}
