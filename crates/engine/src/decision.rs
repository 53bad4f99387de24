//! Seam between business rule tasks and a decision engine

use async_trait::async_trait;
use serde_json::{Map, Value};

/// Failure reported by a decision evaluator
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct DecisionEvaluationError {
    pub message: String,
}

impl DecisionEvaluationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Evaluates a deployed decision against process variables
///
/// Returns one output row per matched rule (after the hit policy applied).
#[async_trait]
pub trait DecisionEvaluator: Send + Sync + 'static {
    async fn evaluate(
        &self,
        decision_key: &str,
        variables: &Map<String, Value>,
    ) -> Result<Vec<Map<String, Value>>, DecisionEvaluationError>;
}
