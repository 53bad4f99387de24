//! Start and task forms declared in process definitions

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::instrument;
use uuid::Uuid;

use super::types::FormTypes;
use super::FormError;
use crate::definition::{ElementKind, FormEnumValue, FormProperty};
use crate::engine::EngineContext;
use crate::error::{EngineError, Result};
use crate::runtime::{CommandExtras, ProcessInstance, ProcessInstanceBuilder};

/// A form property with its current display value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormPropertyValue {
    pub id: String,
    pub name: Option<String>,
    pub type_name: String,
    pub value: Option<String>,
    pub required: bool,
    pub readable: bool,
    pub writable: bool,
    pub date_pattern: Option<String>,
    pub enum_values: Vec<FormEnumValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartFormData {
    pub definition_id: Uuid,
    pub form_key: Option<String>,
    pub properties: Vec<FormPropertyValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFormData {
    pub task_id: Uuid,
    pub form_key: Option<String>,
    pub properties: Vec<FormPropertyValue>,
}

/// Converted submission: variables to set and raw values for history
pub(crate) struct ConvertedForm {
    pub variables: Map<String, Value>,
    pub submitted: Vec<(String, Value)>,
}

/// Convert submitted strings with the declared property types
///
/// Submitted keys without a declared property are stored as text.
pub(crate) fn convert_submission(
    form_types: &FormTypes,
    properties: &[FormProperty],
    submitted: &HashMap<String, String>,
) -> std::result::Result<ConvertedForm, FormError> {
    let mut variables = Map::new();
    let mut recorded = Vec::new();

    for property in properties {
        match submitted.get(&property.id) {
            Some(text) => {
                if !property.writable {
                    return Err(FormError::NotWritable(property.id.clone()));
                }
                if property.required && text.trim().is_empty() {
                    return Err(FormError::RequiredMissing(property.id.clone()));
                }
                let form_type = form_types.get(&property.type_name)?;
                let value = form_type.to_model_value(property, text)?;
                variables.insert(property.variable_name().to_string(), value);
                recorded.push((property.id.clone(), Value::String(text.clone())));
            }
            None if property.required && property.writable => {
                return Err(FormError::RequiredMissing(property.id.clone()));
            }
            None => {}
        }
    }

    let declared: Vec<&str> = properties.iter().map(|p| p.id.as_str()).collect();
    let mut extra: Vec<(&String, &String)> = submitted
        .iter()
        .filter(|(k, _)| !declared.contains(&k.as_str()))
        .collect();
    extra.sort();
    for (key, text) in extra {
        variables.insert(key.clone(), Value::String(text.clone()));
        recorded.push((key.clone(), Value::String(text.clone())));
    }

    Ok(ConvertedForm {
        variables,
        submitted: recorded,
    })
}

fn render(
    form_types: &FormTypes,
    properties: &[FormProperty],
    variables: &Map<String, Value>,
) -> std::result::Result<Vec<FormPropertyValue>, FormError> {
    properties
        .iter()
        .filter(|p| p.readable)
        .map(|property| {
            let form_type = form_types.get(&property.type_name)?;
            let value = variables
                .get(property.variable_name())
                .and_then(|v| form_type.to_form_value(property, v));
            Ok(FormPropertyValue {
                id: property.id.clone(),
                name: property.name.clone(),
                type_name: property.type_name.clone(),
                value,
                required: property.required,
                readable: property.readable,
                writable: property.writable,
                date_pattern: property.date_pattern.clone(),
                enum_values: property.values.clone(),
            })
        })
        .collect()
}

/// Reads and submits forms declared on start events and user tasks
#[derive(Clone)]
pub struct FormService {
    ctx: Arc<EngineContext>,
}

impl FormService {
    pub(crate) fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    pub async fn get_start_form_data(&self, definition_id: Uuid) -> Result<StartFormData> {
        let definition = self.ctx.definition(definition_id).await?;
        let model = self.ctx.model(&definition)?;
        let (form_key, properties) = model.start_form();
        Ok(StartFormData {
            definition_id,
            form_key: form_key.map(str::to_string),
            properties: render(&self.ctx.form_types, properties, &Map::new())?,
        })
    }

    /// Task form with values taken from the instance's variables
    pub async fn get_task_form_data(&self, task_id: Uuid) -> Result<TaskFormData> {
        let task = self
            .ctx
            .store
            .find_task(task_id)
            .await?
            .ok_or(EngineError::TaskNotFound(task_id))?;
        let definition = self.ctx.definition(task.definition_id).await?;
        let model = self.ctx.model(&definition)?;
        let instance = self
            .ctx
            .store
            .find_instance(task.instance_id)
            .await?
            .ok_or(EngineError::InstanceNotFound(task.instance_id))?;

        let properties = match model.element(&task.task_definition_key).map(|e| &e.kind) {
            Some(ElementKind::UserTask(user_task)) => user_task.form_properties.as_slice(),
            _ => &[],
        };
        Ok(TaskFormData {
            task_id,
            form_key: task.form_key.clone(),
            properties: render(&self.ctx.form_types, properties, &instance.variables)?,
        })
    }

    /// Convert the properties and start an instance with them as variables
    #[instrument(skip(self, properties))]
    pub async fn submit_start_form(
        &self,
        definition_id: Uuid,
        business_key: Option<String>,
        properties: HashMap<String, String>,
    ) -> Result<ProcessInstance> {
        let definition = self.ctx.definition(definition_id).await?;
        let model = self.ctx.model(&definition)?;
        let (_, declared) = model.start_form();
        let converted = convert_submission(&self.ctx.form_types, declared, &properties)?;

        let mut builder = ProcessInstanceBuilder::new(self.ctx.clone())
            .definition_id(definition_id)
            .variables(converted.variables);
        if let Some(key) = business_key {
            builder = builder.business_key(key);
        }
        builder
            .extras(CommandExtras {
                form_properties: converted.submitted,
                ..CommandExtras::default()
            })
            .start()
            .await
    }

    /// Convert the properties and complete the task with them as variables
    #[instrument(skip(self, properties))]
    pub async fn submit_task_form(
        &self,
        task_id: Uuid,
        properties: HashMap<String, String>,
    ) -> Result<()> {
        let task = self
            .ctx
            .store
            .find_task(task_id)
            .await?
            .ok_or(EngineError::TaskNotFound(task_id))?;
        let definition = self.ctx.definition(task.definition_id).await?;
        let model = self.ctx.model(&definition)?;
        let declared = match model.element(&task.task_definition_key).map(|e| &e.kind) {
            Some(ElementKind::UserTask(user_task)) => user_task.form_properties.as_slice(),
            _ => &[],
        };
        let converted = convert_submission(&self.ctx.form_types, declared, &properties)?;

        crate::runtime::complete_task(
            &self.ctx,
            task_id,
            converted.variables,
            CommandExtras {
                form_properties: converted.submitted,
                ..CommandExtras::default()
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn properties() -> Vec<FormProperty> {
        let mut readonly = FormProperty::new("reference", "string");
        readonly.writable = false;
        let mut weight = FormProperty::new("weight", "long").required();
        weight.variable = Some("grossWeight".into());
        vec![weight, FormProperty::new("note", "string"), readonly]
    }

    fn submit(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_convert_maps_to_variables() {
        let converted = convert_submission(
            &FormTypes::with_builtins(),
            &properties(),
            &submit(&[("weight", "8200"), ("extra", "x")]),
        )
        .unwrap();
        assert_eq!(converted.variables["grossWeight"], json!(8200));
        assert_eq!(converted.variables["extra"], json!("x"));
        assert_eq!(
            converted.submitted,
            vec![
                ("weight".to_string(), json!("8200")),
                ("extra".to_string(), json!("x"))
            ]
        );
    }

    #[test]
    fn test_convert_enforces_required_and_writable() {
        let types = FormTypes::with_builtins();
        assert!(matches!(
            convert_submission(&types, &properties(), &submit(&[("note", "n")])),
            Err(FormError::RequiredMissing(p)) if p == "weight"
        ));
        assert!(matches!(
            convert_submission(
                &types,
                &properties(),
                &submit(&[("weight", "1"), ("reference", "r")])
            ),
            Err(FormError::NotWritable(p)) if p == "reference"
        ));
        assert!(matches!(
            convert_submission(&types, &properties(), &submit(&[("weight", "heavy")])),
            Err(FormError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_render_uses_variables() {
        let variables = json!({"grossWeight": 8200});
        let rendered = render(
            &FormTypes::with_builtins(),
            &properties(),
            variables.as_object().unwrap(),
        )
        .unwrap();
        assert_eq!(rendered[0].value.as_deref(), Some("8200"));
        assert_eq!(rendered[1].value, None);
    }
}
