//! Persistence layer for the process engine
//!
//! This module provides:
//! - [`ProcessStore`] trait for all engine state
//! - [`InMemoryProcessStore`] for tests and embedded use
//! - [`MySqlProcessStore`] for production (schema managed externally)

mod memory;
mod mysql;
mod store;

pub use memory::InMemoryProcessStore;
pub use mysql::MySqlProcessStore;
pub use store::{ProcessStore, StoreError, ENGINE_TABLES, FORM_TABLES, SCHEMA_VERSION};
