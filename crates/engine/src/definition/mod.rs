//! Workflow state machine definitions
//!
//! A definition names its start and error states, declares every state with
//! its type and handler, and lists the permitted transitions between them.
//! Definitions are validated when built and never change afterwards.

mod handler;
mod registry;
mod state;
mod workflow;

pub use handler::{FnHandler, HandlerError, HandlerResult, NextAction, StateHandler};
pub use registry::WorkflowDefinitionRegistry;
pub use state::{StateDefinition, StateType};
pub use workflow::{
    DefinitionError, StateInfo, UnknownState, WorkflowDefinition, WorkflowDefinitionBuilder,
    DEFAULT_MAX_RETRIES,
};
