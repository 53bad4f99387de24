//! Forms
//!
//! Two flavours: form properties declared inline on start events and user
//! tasks ([`FormService`]), and standalone form definitions deployed to the
//! form engine ([`FormRepositoryService`], [`FormEngineFormService`]).

mod engine;
mod schema;
mod service;
mod types;

pub use engine::{
    validate_values, FieldError, FieldType, FormDefinition, FormDefinitionModel,
    FormEngineFormService, FormField, FormInstance, FormInstanceQuery, FormRepositoryService,
    FormSubmission,
};
pub use schema::{is_schema_management_enabled, set_schema_management_enabled};
pub(crate) use schema::lock_schema_management;
pub use service::{FormPropertyValue, FormService, StartFormData, TaskFormData};
pub use types::{
    chrono_pattern, BooleanFormType, DateFormType, DoubleFormType, EnumFormType, FormType,
    FormTypes, LongFormType, StringFormType, DEFAULT_DATE_PATTERN,
};

/// Errors from form handling
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FormError {
    #[error("unknown form type '{0}'")]
    UnknownType(String),

    #[error("invalid value for form property '{property}': {message}")]
    InvalidValue { property: String, message: String },

    #[error("form property '{0}' is required")]
    RequiredMissing(String),

    #[error("form property '{0}' is not writable")]
    NotWritable(String),

    #[error("form definition not found: {0}")]
    FormDefinitionNotFound(String),

    #[error("invalid form definition: {0}")]
    InvalidDefinition(String),

    #[error("form validation failed: {}", format_field_errors(.0))]
    Validation(Vec<FieldError>),

    #[error("outcome '{outcome}' is not defined by form '{form_key}'")]
    InvalidOutcome { form_key: String, outcome: String },

    #[error("form engine schema management can no longer be changed; a process engine has already been built")]
    SchemaManagementLocked,
}

fn format_field_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
