//! Form engine: standalone form definitions and submitted form instances

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, instrument};
use uuid::Uuid;

use super::FormError;
use crate::definition::SourceFormat;
use crate::engine::EngineContext;
use crate::error::{EngineError, Result};
use crate::runtime::{Changeset, CommandExtras};

/// Deployable form layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormDefinitionModel {
    pub key: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub fields: Vec<FormField>,
    /// Buttons the user can finish the form with; empty means no choice
    #[serde(default)]
    pub outcomes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormField {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(flatten)]
    pub field_type: FieldType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Multiline,
    Integer,
    Decimal,
    Boolean,
    /// ISO date, `YYYY-MM-DD`
    Date,
    Dropdown { options: Vec<String> },
}

/// A deployed version of a form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormDefinition {
    pub id: Uuid,
    pub key: String,
    pub name: Option<String>,
    pub version: i32,
    pub deployed_at: DateTime<Utc>,
    pub model: FormDefinitionModel,
}

/// Values submitted for a form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormInstance {
    pub id: Uuid,
    pub form_definition_id: Uuid,
    pub form_key: String,
    pub task_id: Option<Uuid>,
    pub instance_id: Option<Uuid>,
    pub submitted_by: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub values: Map<String, Value>,
    pub outcome: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FormInstanceQuery {
    pub form_key: Option<String>,
    pub task_id: Option<Uuid>,
    pub instance_id: Option<Uuid>,
}

impl FormInstanceQuery {
    pub fn matches(&self, form: &FormInstance) -> bool {
        self.form_key.as_ref().map_or(true, |k| &form.form_key == k)
            && self.task_id.map_or(true, |id| form.task_id == Some(id))
            && self.instance_id.map_or(true, |id| form.instance_id == Some(id))
    }
}

/// Problem with one field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Check `values` against the form and return them normalized
///
/// Keys the form does not declare are dropped.
pub fn validate_values(
    model: &FormDefinitionModel,
    values: &Map<String, Value>,
) -> std::result::Result<Map<String, Value>, FormError> {
    let mut errors = Vec::new();
    let mut normalized = Map::new();

    for field in &model.fields {
        let value = values.get(&field.id).filter(|v| !is_blank(v));
        let Some(value) = value else {
            if field.required {
                errors.push(FieldError {
                    field: field.id.clone(),
                    message: "is required".into(),
                });
            }
            continue;
        };
        match normalize(&field.field_type, value) {
            Ok(v) => {
                normalized.insert(field.id.clone(), v);
            }
            Err(message) => errors.push(FieldError {
                field: field.id.clone(),
                message,
            }),
        }
    }

    if errors.is_empty() {
        Ok(normalized)
    } else {
        Err(FormError::Validation(errors))
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn normalize(field_type: &FieldType, value: &Value) -> std::result::Result<Value, String> {
    match field_type {
        FieldType::Text | FieldType::Multiline => match value {
            Value::String(_) => Ok(value.clone()),
            Value::Number(_) | Value::Bool(_) => Ok(Value::String(value.to_string())),
            _ => Err("expected text".into()),
        },
        FieldType::Integer => match value {
            Value::Number(n) if n.is_i64() => Ok(value.clone()),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| format!("'{s}' is not a whole number")),
            _ => Err("expected a whole number".into()),
        },
        FieldType::Decimal => match value {
            Value::Number(_) => Ok(value.clone()),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| format!("'{s}' is not a number")),
            _ => Err("expected a number".into()),
        },
        FieldType::Boolean => match value {
            Value::Bool(_) => Ok(value.clone()),
            Value::String(s) if s == "true" || s == "false" => Ok(Value::Bool(s == "true")),
            _ => Err("expected true or false".into()),
        },
        FieldType::Date => value
            .as_str()
            .and_then(|s| NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok())
            .map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
            .ok_or_else(|| "expected a date as YYYY-MM-DD".into()),
        FieldType::Dropdown { options } => match value.as_str() {
            Some(s) if options.iter().any(|o| o == s) => Ok(value.clone()),
            _ => Err(format!("must be one of {}", options.join(", "))),
        },
    }
}

fn parse_form_resource(name: &str, source: &str) -> Result<FormDefinitionModel> {
    let parsed: std::result::Result<FormDefinitionModel, String> =
        match SourceFormat::from_resource_name(name)? {
            SourceFormat::Yaml => serde_yaml::from_str(source).map_err(|e| e.to_string()),
            SourceFormat::Json => serde_json::from_str(source).map_err(|e| e.to_string()),
        };
    parsed.map_err(|message| FormError::InvalidDefinition(message).into())
}

/// Deploys and looks up form definitions
#[derive(Clone)]
pub struct FormRepositoryService {
    ctx: Arc<EngineContext>,
}

impl FormRepositoryService {
    pub(crate) fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Store a new version of the form
    #[instrument(skip(self, model), fields(key = %model.key))]
    pub async fn deploy_form(&self, model: FormDefinitionModel) -> Result<FormDefinition> {
        if model.key.trim().is_empty() {
            return Err(FormError::InvalidDefinition("key must not be empty".into()).into());
        }
        let mut seen = std::collections::HashSet::new();
        if let Some(field) = model.fields.iter().find(|f| !seen.insert(f.id.as_str())) {
            return Err(
                FormError::InvalidDefinition(format!("duplicate field '{}'", field.id)).into(),
            );
        }

        let version = self
            .ctx
            .store
            .find_latest_form_definition(&model.key)
            .await?
            .map_or(1, |d| d.version + 1);
        let definition = FormDefinition {
            id: Uuid::now_v7(),
            key: model.key.clone(),
            name: model.name.clone(),
            version,
            deployed_at: self.ctx.now(),
            model,
        };
        self.ctx.store.insert_form_definition(&definition).await?;
        info!(form_definition_id = %definition.id, version, "deployed form definition");
        Ok(definition)
    }

    /// Parse a YAML or JSON resource and deploy it
    pub async fn deploy_form_resource(&self, name: &str, source: &str) -> Result<FormDefinition> {
        let model = parse_form_resource(name, source)?;
        self.deploy_form(model).await
    }

    pub async fn get_form_definition(&self, id: Uuid) -> Result<FormDefinition> {
        self.ctx
            .store
            .find_form_definition(id)
            .await?
            .ok_or_else(|| FormError::FormDefinitionNotFound(id.to_string()).into())
    }

    pub async fn get_latest_form_definition(&self, key: &str) -> Result<FormDefinition> {
        self.ctx
            .store
            .find_latest_form_definition(key)
            .await?
            .ok_or_else(|| FormError::FormDefinitionNotFound(key.to_string()).into())
    }

    pub async fn list_form_definitions(&self, key: Option<&str>) -> Result<Vec<FormDefinition>> {
        Ok(self.ctx.store.list_form_definitions(key).await?)
    }
}

/// Data submitted through [`FormEngineFormService::submit_form`]
#[derive(Debug, Clone, Default)]
pub struct FormSubmission {
    pub form_key: String,
    pub values: Map<String, Value>,
    pub outcome: Option<String>,
    pub instance_id: Option<Uuid>,
    pub task_id: Option<Uuid>,
    pub submitted_by: Option<String>,
}

/// Validates and stores form submissions
#[derive(Clone)]
pub struct FormEngineFormService {
    ctx: Arc<EngineContext>,
}

impl FormEngineFormService {
    pub(crate) fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    async fn latest(&self, form_key: &str) -> Result<FormDefinition> {
        self.ctx
            .store
            .find_latest_form_definition(form_key)
            .await?
            .ok_or_else(|| FormError::FormDefinitionNotFound(form_key.to_string()).into())
    }

    fn check_outcome(definition: &FormDefinition, outcome: Option<&str>) -> Result<()> {
        match outcome {
            Some(o) if !definition.model.outcomes.iter().any(|allowed| allowed == o) => {
                Err(FormError::InvalidOutcome {
                    form_key: definition.key.clone(),
                    outcome: o.to_string(),
                }
                .into())
            }
            _ => Ok(()),
        }
    }

    /// Validate against the latest version of the form
    pub async fn validate(
        &self,
        form_key: &str,
        values: &Map<String, Value>,
    ) -> Result<Map<String, Value>> {
        let definition = self.latest(form_key).await?;
        Ok(validate_values(&definition.model, values)?)
    }

    /// Validate and store a form instance
    #[instrument(skip(self, submission), fields(form_key = %submission.form_key))]
    pub async fn submit_form(&self, submission: FormSubmission) -> Result<FormInstance> {
        let definition = self.latest(&submission.form_key).await?;
        Self::check_outcome(&definition, submission.outcome.as_deref())?;
        let values = validate_values(&definition.model, &submission.values)?;

        let form = FormInstance {
            id: Uuid::now_v7(),
            form_definition_id: definition.id,
            form_key: definition.key,
            task_id: submission.task_id,
            instance_id: submission.instance_id,
            submitted_by: submission.submitted_by,
            submitted_at: self.ctx.now(),
            values,
            outcome: submission.outcome,
        };
        let changeset = Changeset {
            form_instances: vec![form.clone()],
            ..Changeset::default()
        };
        self.ctx.store.commit(changeset).await?;
        info!(form_instance_id = %form.id, "form submitted");
        Ok(form)
    }

    /// Validate the form, store it and complete the task with its values
    ///
    /// The outcome, when given, is also set as `form_<key>_outcome`.
    #[instrument(skip(self, values))]
    pub async fn complete_task_with_form(
        &self,
        task_id: Uuid,
        form_key: &str,
        values: Map<String, Value>,
        outcome: Option<String>,
        submitted_by: Option<String>,
    ) -> Result<FormInstance> {
        let task = self
            .ctx
            .store
            .find_task(task_id)
            .await?
            .ok_or(EngineError::TaskNotFound(task_id))?;
        let definition = self.latest(form_key).await?;
        Self::check_outcome(&definition, outcome.as_deref())?;
        let values = validate_values(&definition.model, &values)?;

        let mut variables = values.clone();
        if let Some(o) = &outcome {
            variables.insert(format!("form_{}_outcome", definition.key), Value::String(o.clone()));
        }

        let form = FormInstance {
            id: Uuid::now_v7(),
            form_definition_id: definition.id,
            form_key: definition.key,
            task_id: Some(task.id),
            instance_id: Some(task.instance_id),
            submitted_by,
            submitted_at: self.ctx.now(),
            values,
            outcome,
        };
        let extras = CommandExtras {
            form_instances: vec![form.clone()],
            ..CommandExtras::default()
        };
        crate::runtime::complete_task(&self.ctx, task_id, variables, extras).await?;
        Ok(form)
    }

    pub async fn list_form_instances(&self, query: &FormInstanceQuery) -> Result<Vec<FormInstance>> {
        Ok(self.ctx.store.list_form_instances(query).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn inspection_form() -> FormDefinitionModel {
        serde_yaml::from_str(
            r#"
key: inspection
name: Wagon inspection
fields:
  - { id: inspector, type: text, required: true }
  - { id: axles, type: integer, required: true }
  - { id: load_tons, type: decimal }
  - { id: damaged, type: boolean }
  - { id: inspected_on, type: date }
  - { id: grade, type: dropdown, options: [A, B, C] }
outcomes: [approve, reject]
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_validate_normalizes_values() {
        let values = json!({
            "inspector": "kim",
            "axles": "4",
            "load_tons": 61.5,
            "damaged": "false",
            "inspected_on": "2025-02-11",
            "grade": "B",
            "unknown": 1
        });
        let normalized =
            validate_values(&inspection_form(), values.as_object().unwrap()).unwrap();
        assert_eq!(normalized["axles"], json!(4));
        assert_eq!(normalized["damaged"], json!(false));
        assert!(!normalized.contains_key("unknown"));
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let values = json!({"axles": "four", "grade": "Z", "inspected_on": "11/02/2025"});
        let err = validate_values(&inspection_form(), values.as_object().unwrap()).unwrap_err();
        let FormError::Validation(errors) = err else {
            panic!("expected validation error");
        };
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["inspector", "axles", "inspected_on", "grade"]);
    }

    #[test]
    fn test_blank_optional_fields_are_skipped() {
        let values = json!({"inspector": "kim", "axles": 2, "grade": ""});
        let normalized =
            validate_values(&inspection_form(), values.as_object().unwrap()).unwrap();
        assert!(!normalized.contains_key("grade"));
    }
}
