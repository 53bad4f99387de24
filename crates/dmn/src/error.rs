//! Decision engine errors

use conveyor_engine::expression::ExpressionError;
use conveyor_engine::persistence::StoreError;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecisionError {
    #[error("cannot parse decision table: {0}")]
    Syntax(String),

    #[error("unsupported decision resource: {0}")]
    UnsupportedResource(String),

    #[error("invalid decision table '{key}': {message}")]
    InvalidTable { key: String, message: String },

    #[error("invalid entry '{entry}' in rule {rule}, column {column}: {message}")]
    InvalidEntry {
        rule: usize,
        column: usize,
        entry: String,
        message: String,
    },

    #[error("decision not found: {0}")]
    NotFound(String),

    #[error("hit policy {policy} violated in decision '{key}': {message}")]
    HitPolicyViolation {
        key: String,
        policy: &'static str,
        message: String,
    },

    #[error("input '{input}' of decision '{key}': {source}")]
    Input {
        key: String,
        input: String,
        #[source]
        source: ExpressionError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}
