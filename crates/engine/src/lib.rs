//! # Conveyor Process Engine
//!
//! A small process engine: versioned process definitions, a token-based
//! state machine, user tasks, forms, an async executor for background jobs
//! and history, persisted in memory or in MySQL.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 ProcessEngineConfiguration                   │
//! │  (environment, configurators, schema policy, form types)     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ build_process_engine()
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       ProcessEngine                          │
//! │  repository / runtime / task / history / identity /          │
//! │  management / form services over one shared context          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!               ┌──────────────┴──────────────┐
//!               ▼                             ▼
//! ┌───────────────────────────┐ ┌───────────────────────────────┐
//! │          Agenda           │ │         AsyncExecutor         │
//! │ (advances executions one  │ │ (acquires due jobs, retries,  │
//! │  operation at a time)     │ │  dead letters)                │
//! └───────────────────────────┘ └───────────────────────────────┘
//!               │                             │
//!               └──────────────┬──────────────┘
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        ProcessStore                          │
//! │  (InMemoryProcessStore, MySqlProcessStore)                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use conveyor_engine::prelude::*;
//!
//! let engine = ProcessEngineConfiguration::in_memory()
//!     .build_process_engine()
//!     .await?;
//!
//! engine
//!     .repository_service()
//!     .create_deployment()
//!     .add_resource("order.yaml", ORDER_PROCESS)
//!     .deploy()
//!     .await?;
//!
//! let instance = engine
//!     .runtime_service()
//!     .start_process_instance_by_key("order", Some("PO-1".into()), Map::new())
//!     .await?;
//! ```

pub mod clock;
pub mod config;
pub mod decision;
pub mod definition;
pub mod delegate;
pub mod engine;
pub mod error;
pub mod expression;
pub mod form;
pub mod history;
pub mod identity;
pub mod jobs;
pub mod management;
pub mod persistence;
pub mod repository;
pub mod runtime;
pub mod task;

pub use engine::ProcessEngine;
pub use error::{EngineError, Result};

/// Prelude for common imports
pub mod prelude {
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::config::{
        ConfigError, DataSource, EngineConfigurator, Environment, MailServerConfig,
        ProcessEngineConfiguration, SchemaUpdate, DB_SCHEMA_UPDATE_FALSE,
    };
    pub use crate::decision::{DecisionEvaluationError, DecisionEvaluator};
    pub use crate::delegate::{DelegateError, DelegateExecution, FnHandler, ServiceTaskHandler};
    pub use crate::engine::ProcessEngine;
    pub use crate::error::{EngineError, Result};
    pub use crate::form::FormType;
    pub use crate::history::HistoryLevel;
    pub use crate::jobs::{AsyncExecutorConfig, Job, JobKind};
    pub use crate::runtime::{InstanceStatus, ProcessInstance};
    pub use crate::task::{Task, TaskQuery};
    pub use serde_json::{json, Map, Value};
}
