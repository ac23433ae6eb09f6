//! Persistence layer for workflow instances and executor leases
//!
//! This module provides:
//! - [`InstanceStore`] trait for instances, action history and executors
//! - [`PostgresInstanceStore`] for production
//! - [`InMemoryInstanceStore`] for testing

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryInstanceStore;
pub use postgres::PostgresInstanceStore;
pub use store::{
    validate_variables, ActionRecord, ActionType, ClaimToken, ExecutionOutcome, ExecutorInfo,
    InstanceFilter, InstanceStatus, InstanceStore, ManualUpdate, NewAction, NewExecutor,
    NewInstance, StoreError, WorkflowInstance, DEFAULT_MAX_VARIABLE_LENGTH,
};

/// Embedded schema migrations for [`PostgresInstanceStore`]
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
