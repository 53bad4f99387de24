//! Unit of work committed by a single store call

use uuid::Uuid;

use crate::form::FormInstance;
use crate::history::{HistoryLevel, HistoryRecord};
use crate::jobs::Job;
use crate::runtime::ProcessInstance;
use crate::task::Task;

/// Everything one engine command writes
///
/// Rows carry the revision they were read at. The store checks that revision
/// against the stored one and persists `revision + 1`; a new row has
/// revision 0.
#[derive(Debug, Default)]
pub struct Changeset {
    pub instance: Option<ProcessInstance>,
    pub tasks_inserted: Vec<Task>,
    pub tasks_updated: Vec<Task>,
    pub tasks_deleted: Vec<Uuid>,
    pub jobs_inserted: Vec<Job>,
    pub jobs_updated: Vec<Job>,
    pub jobs_deleted: Vec<Uuid>,
    pub form_instances: Vec<FormInstance>,
    pub history: Vec<HistoryRecord>,
}

impl Changeset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record history if the configured level keeps it
    pub(crate) fn record(&mut self, level: HistoryLevel, record: HistoryRecord) {
        if level.is_at_least(record.required_level()) {
            self.history.push(record);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.instance.is_none()
            && self.tasks_inserted.is_empty()
            && self.tasks_updated.is_empty()
            && self.tasks_deleted.is_empty()
            && self.jobs_inserted.is_empty()
            && self.jobs_updated.is_empty()
            && self.jobs_deleted.is_empty()
            && self.form_instances.is_empty()
            && self.history.is_empty()
    }
}
