//! Form property types
//!
//! A form type converts between the string a user submits and the JSON value
//! stored as a process variable.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use serde_json::Value;

use super::FormError;
use crate::definition::FormProperty;

/// Pattern used by `date` properties that do not declare one
pub const DEFAULT_DATE_PATTERN: &str = "dd/MM/yyyy";

/// Conversion between submitted text and model values
pub trait FormType: Send + Sync + 'static {
    /// Name referenced by `type:` in form properties
    fn name(&self) -> &str;

    /// Convert submitted text into the variable value
    fn to_model_value(&self, property: &FormProperty, text: &str) -> Result<Value, FormError>;

    /// Render a stored variable for display; `None` when it cannot be shown
    fn to_form_value(&self, property: &FormProperty, value: &Value) -> Option<String>;
}

fn invalid(property: &FormProperty, message: impl Into<String>) -> FormError {
    FormError::InvalidValue {
        property: property.id.clone(),
        message: message.into(),
    }
}

fn plain_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

pub struct StringFormType;

impl FormType for StringFormType {
    fn name(&self) -> &str {
        "string"
    }

    fn to_model_value(&self, _property: &FormProperty, text: &str) -> Result<Value, FormError> {
        Ok(Value::String(text.to_string()))
    }

    fn to_form_value(&self, _property: &FormProperty, value: &Value) -> Option<String> {
        plain_text(value)
    }
}

pub struct LongFormType;

impl FormType for LongFormType {
    fn name(&self) -> &str {
        "long"
    }

    fn to_model_value(&self, property: &FormProperty, text: &str) -> Result<Value, FormError> {
        text.trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| invalid(property, format!("'{text}' is not a whole number")))
    }

    fn to_form_value(&self, _property: &FormProperty, value: &Value) -> Option<String> {
        value.as_i64().map(|n| n.to_string())
    }
}

pub struct DoubleFormType;

impl FormType for DoubleFormType {
    fn name(&self) -> &str {
        "double"
    }

    fn to_model_value(&self, property: &FormProperty, text: &str) -> Result<Value, FormError> {
        text.trim()
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| invalid(property, format!("'{text}' is not a number")))
    }

    fn to_form_value(&self, _property: &FormProperty, value: &Value) -> Option<String> {
        value.as_f64().map(|n| n.to_string())
    }
}

pub struct BooleanFormType;

impl FormType for BooleanFormType {
    fn name(&self) -> &str {
        "boolean"
    }

    fn to_model_value(&self, property: &FormProperty, text: &str) -> Result<Value, FormError> {
        match text.trim().to_ascii_lowercase().as_str() {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err(invalid(property, format!("'{text}' is not true or false"))),
        }
    }

    fn to_form_value(&self, _property: &FormProperty, value: &Value) -> Option<String> {
        value.as_bool().map(|b| b.to_string())
    }
}

/// Dates are stored as ISO-8601 text (`2024-03-01` or `2024-03-01T08:30:00`)
pub struct DateFormType;

impl DateFormType {
    fn pattern(property: &FormProperty) -> String {
        chrono_pattern(property.date_pattern.as_deref().unwrap_or(DEFAULT_DATE_PATTERN))
    }
}

impl FormType for DateFormType {
    fn name(&self) -> &str {
        "date"
    }

    fn to_model_value(&self, property: &FormProperty, text: &str) -> Result<Value, FormError> {
        let pattern = Self::pattern(property);
        let text = text.trim();
        let parsed = if has_time_fields(&pattern) {
            NaiveDateTime::parse_from_str(text, &pattern)
                .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S").to_string())
        } else {
            NaiveDate::parse_from_str(text, &pattern).map(|d| d.format("%Y-%m-%d").to_string())
        };
        parsed.map(Value::String).map_err(|_| {
            invalid(
                property,
                format!(
                    "'{text}' does not match date pattern {}",
                    property.date_pattern.as_deref().unwrap_or(DEFAULT_DATE_PATTERN)
                ),
            )
        })
    }

    fn to_form_value(&self, property: &FormProperty, value: &Value) -> Option<String> {
        let text = value.as_str()?;
        let pattern = Self::pattern(property);
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S") {
            return Some(dt.format(&pattern).to_string());
        }
        NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .ok()
            .map(|d| d.format(&pattern).to_string())
    }
}

fn has_time_fields(pattern: &str) -> bool {
    ["%H", "%M", "%S"].iter().any(|f| pattern.contains(f))
}

/// Accepts only the ids listed in the property's `values`
pub struct EnumFormType;

impl FormType for EnumFormType {
    fn name(&self) -> &str {
        "enum"
    }

    fn to_model_value(&self, property: &FormProperty, text: &str) -> Result<Value, FormError> {
        if property.values.iter().any(|v| v.id == text) {
            Ok(Value::String(text.to_string()))
        } else {
            let allowed: Vec<&str> = property.values.iter().map(|v| v.id.as_str()).collect();
            Err(invalid(
                property,
                format!("'{text}' is not one of {}", allowed.join(", ")),
            ))
        }
    }

    fn to_form_value(&self, _property: &FormProperty, value: &Value) -> Option<String> {
        value.as_str().map(str::to_string)
    }
}

/// Translate a `dd/MM/yyyy HH:mm:ss` style pattern to chrono's format syntax
pub fn chrono_pattern(pattern: &str) -> String {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let mut run = 1;
        while i + run < chars.len() && chars[i + run] == c {
            run += 1;
        }
        let mapped = match (c, run) {
            ('y', 2) => Some("%y"),
            ('y', _) => Some("%Y"),
            ('M', _) => Some("%m"),
            ('d', _) => Some("%d"),
            ('H', _) => Some("%H"),
            ('m', _) => Some("%M"),
            ('s', _) => Some("%S"),
            _ => None,
        };
        match mapped {
            Some(m) => out.push_str(m),
            None => {
                for _ in 0..run {
                    if c == '%' {
                        out.push_str("%%");
                    } else {
                        out.push(c);
                    }
                }
            }
        }
        i += run;
    }
    out
}

/// Registry of form types by name
#[derive(Clone)]
pub struct FormTypes {
    types: HashMap<String, Arc<dyn FormType>>,
}

impl FormTypes {
    /// Registry holding `string`, `long`, `double`, `boolean`, `date` and `enum`
    pub fn with_builtins() -> Self {
        let mut types = Self {
            types: HashMap::new(),
        };
        types.register(Arc::new(StringFormType));
        types.register(Arc::new(LongFormType));
        types.register(Arc::new(DoubleFormType));
        types.register(Arc::new(BooleanFormType));
        types.register(Arc::new(DateFormType));
        types.register(Arc::new(EnumFormType));
        types
    }

    /// Add or replace a type
    pub fn register(&mut self, form_type: Arc<dyn FormType>) {
        self.types.insert(form_type.name().to_string(), form_type);
    }

    pub fn get(&self, name: &str) -> Result<&Arc<dyn FormType>, FormError> {
        self.types
            .get(name)
            .ok_or_else(|| FormError::UnknownType(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.types.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for FormTypes {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl std::fmt::Debug for FormTypes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::FormEnumValue;
    use serde_json::json;

    #[test]
    fn test_chrono_pattern() {
        assert_eq!(chrono_pattern("dd/MM/yyyy"), "%d/%m/%Y");
        assert_eq!(chrono_pattern("yyyy-MM-dd HH:mm:ss"), "%Y-%m-%d %H:%M:%S");
        assert_eq!(chrono_pattern("dd.MM.yy"), "%d.%m.%y");
    }

    #[test]
    fn test_date_default_pattern() {
        let property = FormProperty::new("eta", "date");
        let value = DateFormType.to_model_value(&property, "31/01/2025").unwrap();
        assert_eq!(value, json!("2025-01-31"));
        assert_eq!(
            DateFormType.to_form_value(&property, &value).as_deref(),
            Some("31/01/2025")
        );
        assert!(DateFormType.to_model_value(&property, "2025-01-31").is_err());
    }

    #[test]
    fn test_date_with_time_pattern() {
        let mut property = FormProperty::new("departure", "date");
        property.date_pattern = Some("yyyy-MM-dd HH:mm".into());
        let value = DateFormType
            .to_model_value(&property, "2025-03-04 06:45")
            .unwrap();
        assert_eq!(value, json!("2025-03-04T06:45:00"));
    }

    #[test]
    fn test_numeric_and_boolean_types() {
        let p = FormProperty::new("x", "long");
        assert_eq!(LongFormType.to_model_value(&p, " 42 ").unwrap(), json!(42));
        assert!(LongFormType.to_model_value(&p, "4.2").is_err());
        assert_eq!(DoubleFormType.to_model_value(&p, "4.25").unwrap(), json!(4.25));
        assert_eq!(BooleanFormType.to_model_value(&p, "TRUE").unwrap(), json!(true));
        assert!(BooleanFormType.to_model_value(&p, "yes").is_err());
    }

    #[test]
    fn test_enum_type() {
        let mut property = FormProperty::new("priority", "enum");
        property.values = vec![
            FormEnumValue {
                id: "low".into(),
                name: None,
            },
            FormEnumValue {
                id: "high".into(),
                name: Some("High".into()),
            },
        ];
        assert_eq!(
            EnumFormType.to_model_value(&property, "high").unwrap(),
            json!("high")
        );
        assert!(matches!(
            EnumFormType.to_model_value(&property, "urgent"),
            Err(FormError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_registry() {
        let types = FormTypes::with_builtins();
        assert_eq!(
            types.names(),
            vec!["boolean", "date", "double", "enum", "long", "string"]
        );
        assert!(matches!(types.get("wagon"), Err(FormError::UnknownType(_))));
    }
}
