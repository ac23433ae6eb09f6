//! State declarations

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::handler::StateHandler;

/// Kind of a workflow state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateType {
    /// Only valid as the initial state of an instance
    Start,
    /// Intermediate state, re-activated automatically
    Normal,
    /// Awaits an external trigger; never scheduled
    Manual,
    /// Awaits a timed re-activation
    Wait,
    /// Terminal state
    End,
}

impl StateType {
    /// Whether the engine invokes a handler for this state type
    pub fn requires_handler(&self) -> bool {
        matches!(self, Self::Start | Self::Normal | Self::Wait)
    }

    /// Whether an instance may rest in this state without outgoing transitions
    pub fn is_resting(&self) -> bool {
        matches!(self, Self::Manual | Self::End)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Normal => "normal",
            Self::Manual => "manual",
            Self::Wait => "wait",
            Self::End => "end",
        }
    }
}

impl fmt::Display for StateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StateType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Self::Start),
            "normal" => Ok(Self::Normal),
            "manual" => Ok(Self::Manual),
            "wait" => Ok(Self::Wait),
            "end" => Ok(Self::End),
            other => Err(format!("unknown state type: {}", other)),
        }
    }
}

/// One declared state of a workflow definition
///
/// Unset limits fall back to the definition-wide defaults.
#[derive(Clone)]
pub struct StateDefinition {
    pub(crate) name: String,
    pub(crate) state_type: StateType,
    pub(crate) description: Option<String>,
    pub(crate) handler: Option<Arc<dyn StateHandler>>,
    pub(crate) max_retries: Option<u32>,
    pub(crate) failure_state: Option<String>,
    pub(crate) execution_warning: Option<Duration>,
}

impl StateDefinition {
    /// Declare a state of the given type
    pub fn new(name: impl Into<String>, state_type: StateType) -> Self {
        Self {
            name: name.into(),
            state_type,
            description: None,
            handler: None,
            max_retries: None,
            failure_state: None,
            execution_warning: None,
        }
    }

    pub fn start(name: impl Into<String>) -> Self {
        Self::new(name, StateType::Start)
    }

    pub fn normal(name: impl Into<String>) -> Self {
        Self::new(name, StateType::Normal)
    }

    pub fn manual(name: impl Into<String>) -> Self {
        Self::new(name, StateType::Manual)
    }

    pub fn wait(name: impl Into<String>) -> Self {
        Self::new(name, StateType::Wait)
    }

    pub fn end(name: impl Into<String>) -> Self {
        Self::new(name, StateType::End)
    }

    /// Attach the handler invoked while an instance is in this state
    pub fn with_handler(mut self, handler: impl StateHandler) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Attach an already shared handler
    pub fn with_shared_handler(mut self, handler: Arc<dyn StateHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Override the definition's retry limit for this state
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Route exhausted retries to this state instead of the definition's error state
    pub fn with_failure_state(mut self, state: impl Into<String>) -> Self {
        self.failure_state = Some(state.into());
        self
    }

    /// Warn when a single handler invocation runs longer than `threshold`
    pub fn with_execution_warning(mut self, threshold: Duration) -> Self {
        self.execution_warning = Some(threshold);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state_type(&self) -> StateType {
        self.state_type
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn handler(&self) -> Option<&Arc<dyn StateHandler>> {
        self.handler.as_ref()
    }
}

impl fmt::Debug for StateDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateDefinition")
            .field("name", &self.name)
            .field("state_type", &self.state_type)
            .field("has_handler", &self.handler.is_some())
            .field("max_retries", &self.max_retries)
            .field("failure_state", &self.failure_state)
            .field("execution_warning", &self.execution_warning)
            .finish()
    }
}
