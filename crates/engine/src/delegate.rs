//! Service task handlers
//!
//! A service task names a handler; the handler runs with a mutable view of
//! the process variables and may fail, which fails the command (or the job,
//! for async service tasks).

use async_trait::async_trait;
use serde_json::{Map, Value};
use uuid::Uuid;

/// Failure raised by a service task handler
#[derive(Debug, Clone, PartialEq)]
pub struct DelegateError {
    pub message: String,
}

impl DelegateError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for DelegateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for DelegateError {}

impl From<String> for DelegateError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for DelegateError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// What a handler sees of the execution it runs in
#[derive(Debug, Clone)]
pub struct DelegateExecution {
    pub instance_id: Uuid,
    pub execution_id: Uuid,
    pub activity_id: String,
    pub definition_key: String,
    pub business_key: Option<String>,
    /// Process variables; changes are written back when the handler succeeds
    pub variables: Map<String, Value>,
}

impl DelegateExecution {
    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }
}

/// Behaviour behind a `service_task`
///
/// # Example
///
/// ```ignore
/// struct ReserveWagon;
///
/// #[async_trait]
/// impl ServiceTaskHandler for ReserveWagon {
///     async fn execute(&self, execution: &mut DelegateExecution) -> Result<(), DelegateError> {
///         execution.set_variable("reserved", json!(true));
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait ServiceTaskHandler: Send + Sync + 'static {
    async fn execute(&self, execution: &mut DelegateExecution) -> Result<(), DelegateError>;
}

/// Adapter turning a synchronous closure into a handler
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> ServiceTaskHandler for FnHandler<F>
where
    F: Fn(&mut DelegateExecution) -> Result<(), DelegateError> + Send + Sync + 'static,
{
    async fn execute(&self, execution: &mut DelegateExecution) -> Result<(), DelegateError> {
        (self.0)(execution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_fn_handler_mutates_variables() {
        let handler = FnHandler(|execution: &mut DelegateExecution| {
            let weight = execution
                .variable("weight")
                .and_then(Value::as_i64)
                .ok_or("weight missing")?;
            execution.set_variable("heavy", json!(weight > 40));
            Ok(())
        });

        let mut execution = DelegateExecution {
            instance_id: Uuid::now_v7(),
            execution_id: Uuid::now_v7(),
            activity_id: "classify".into(),
            definition_key: "shipment".into(),
            business_key: None,
            variables: Map::new(),
        };
        let err = handler.execute(&mut execution).await.unwrap_err();
        assert_eq!(err.message, "weight missing");

        execution.set_variable("weight", json!(55));
        handler.execute(&mut execution).await.unwrap();
        assert_eq!(execution.variable("heavy"), Some(&json!(true)));
    }
}
