//! State execution engine
//!
//! The engine module runs the current state of a claimed instance: it calls
//! the state handler, applies retry and error-state rules, persists the
//! outcome and notifies execution listeners.

mod context;
mod executor;
mod listener;

pub use context::ExecutionContext;
pub use executor::{ExecutionError, ExecutorSettings, StateExecutor};
pub use listener::{
    ExecutionListener, ListenerChain, ListenerContext, LoggingListener, StepOutcome,
};
