//! # Conveyor Decision Engine
//!
//! Decision tables evaluated against process variables.
//!
//! A table has input clauses (expressions over the variables), output
//! clauses and rules. Each rule holds one unary test per input and one
//! literal per output; the hit policy decides what happens when several
//! rules match.
//!
//! ```yaml
//! key: wagon_class
//! hit_policy: unique
//! inputs:
//!   - { label: Axles, expression: wagon.axles }
//!   - { label: Load, expression: load_tonnes }
//! outputs:
//!   - { name: class }
//! rules:
//!   - input_entries: ["<= 2", "< 40"]
//!     output_entries: [light]
//!   - input_entries: ["<= 2", ">= 40"]
//!     output_entries: [medium]
//!   - input_entries: ["> 2", "-"]
//!     output_entries: [heavy]
//! ```
//!
//! [`DmnEngineConfigurator`] plugs the engine into a process engine so
//! business rule tasks can evaluate deployed tables.

pub mod configurator;
pub mod engine;
pub mod error;
pub mod store;
pub mod table;
pub mod unary;

pub use configurator::DmnEngineConfigurator;
pub use engine::{DecisionResult, DmnEngine, DmnEngineConfiguration, DmnRepositoryService, DmnRuleService};
pub use error::DecisionError;
pub use store::{DecisionDefinition, DecisionStore, InMemoryDecisionStore, MySqlDecisionStore, DECISION_TABLE};
pub use table::{Aggregation, CompiledDecision, DecisionTable, HitPolicy, InputClause, OutputClause, Rule};
pub use unary::UnaryTests;
