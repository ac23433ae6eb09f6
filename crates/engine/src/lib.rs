//! # Stateflow Engine
//!
//! A PostgreSQL-backed workflow state machine engine. Many executor processes
//! share one database; each claims due instances, runs the handler of the
//! instance's current state and writes the outcome back.
//!
//! ## Features
//!
//! - **Validated definitions**: states, permitted transitions and handlers are
//!   checked once at registration and immutable afterwards
//! - **Lease-based claiming**: `FOR UPDATE SKIP LOCKED` claim batches; instances
//!   of crashed executors become claimable when the lease expires
//! - **Retries**: per-state retry limits, binary exponential backoff and an
//!   error state for exhausted instances
//! - **Bounded dispatch**: claim batches sized to spare worker capacity, with
//!   graceful drain on shutdown
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        EngineNode                            │
//! │  (registers the executor, heartbeats, dispatches claims)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      StateExecutor                           │
//! │  (runs state handlers, applies retries and transitions)     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      InstanceStore                           │
//! │  (PostgreSQL: stateflow_instances, actions, executors)      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use stateflow_engine::prelude::*;
//!
//! let definition = WorkflowDefinition::builder("signup")
//!     .start_state("create_account")
//!     .error_state("failed")
//!     .state(StateDefinition::start("create_account").with_handler(FnHandler::new(
//!         |ctx: &mut ExecutionContext| {
//!             ctx.set_variable("account", "created");
//!             Ok(Some(ctx.move_to("done", "account created")))
//!         },
//!     )))
//!     .state(StateDefinition::end("done"))
//!     .state(StateDefinition::manual("failed"))
//!     .permit("create_account", "done")
//!     .build()
//!     .unwrap();
//!
//! let mut definitions = WorkflowDefinitionRegistry::new();
//! definitions.register(definition).unwrap();
//! assert!(definitions.contains("signup"));
//! ```

pub mod config;
pub mod definition;
pub mod engine;
pub mod persistence;
pub mod reliability;
pub mod service;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::definition::{
        FnHandler, HandlerError, HandlerResult, NextAction, StateDefinition, StateHandler,
        StateType, WorkflowDefinition, WorkflowDefinitionRegistry,
    };
    pub use crate::engine::{
        ExecutionContext, ExecutionListener, ListenerChain, ListenerContext, StepOutcome,
    };
    pub use crate::persistence::{
        InMemoryInstanceStore, InstanceFilter, InstanceStatus, InstanceStore, NewInstance,
        PostgresInstanceStore, StoreError, WorkflowInstance,
    };
    pub use crate::reliability::BackoffPolicy;
    pub use crate::service::{ManualAction, WorkflowInstanceService};
    pub use crate::worker::{DispatcherError, EngineNode};
}

// Re-export key types at crate root
pub use config::{ConfigError, EngineConfig};
pub use definition::{
    DefinitionError, FnHandler, HandlerError, NextAction, StateDefinition, StateHandler,
    StateType, WorkflowDefinition, WorkflowDefinitionRegistry,
};
pub use engine::{ExecutionContext, ExecutionError, ListenerChain, LoggingListener, StateExecutor};
pub use persistence::{
    InMemoryInstanceStore, InstanceStatus, InstanceStore, PostgresInstanceStore, StoreError,
    WorkflowInstance, MIGRATOR,
};
pub use reliability::BackoffPolicy;
pub use service::{ManualAction, ServiceError, WorkflowInstanceService};
pub use worker::{DispatcherError, DispatcherStatus, EngineNode};
