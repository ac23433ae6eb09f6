//! Workflow definitions: states, permitted transitions and failure routing

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use super::handler::StateHandler;
use super::state::{StateDefinition, StateType};

/// Retry limit applied to states that do not declare their own
pub const DEFAULT_MAX_RETRIES: u32 = 17;

/// Errors detected while validating a workflow definition
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DefinitionError {
    #[error("workflow type must not be empty")]
    MissingType,

    #[error("workflow {workflow_type}: state {state} declared twice")]
    DuplicateState { workflow_type: String, state: String },

    #[error("workflow {workflow_type}: start state {state} is not declared")]
    UndeclaredStartState { workflow_type: String, state: String },

    #[error("workflow {workflow_type}: start state {state} is not of type start")]
    InvalidStartState { workflow_type: String, state: String },

    #[error("workflow {workflow_type}: error state {state} is not declared")]
    UndeclaredErrorState { workflow_type: String, state: String },

    #[error("workflow {workflow_type}: transition source {state} is not declared")]
    UndeclaredTransitionSource { workflow_type: String, state: String },

    #[error("workflow {workflow_type}: transition {from} -> {to} targets an undeclared state")]
    UndeclaredTransitionTarget {
        workflow_type: String,
        from: String,
        to: String,
    },

    #[error("workflow {workflow_type}: failure state {failure_state} of {state} is not declared")]
    UndeclaredFailureState {
        workflow_type: String,
        state: String,
        failure_state: String,
    },

    #[error("workflow {workflow_type}: transition {from} -> {to} re-enters a start state")]
    TransitionToStart {
        workflow_type: String,
        from: String,
        to: String,
    },

    #[error("workflow {workflow_type}: end state {state} cannot have outgoing transitions")]
    TransitionFromEnd { workflow_type: String, state: String },

    #[error("workflow {workflow_type}: state {state} of type {state_type} has no handler")]
    MissingHandler {
        workflow_type: String,
        state: String,
        state_type: StateType,
    },

    #[error("workflow {workflow_type}: reachable state {state} has no outgoing transition")]
    DeadEnd { workflow_type: String, state: String },

    #[error("workflow type {0} is already registered")]
    DuplicateWorkflowType(String),
}

/// Lookup of a state that the definition does not declare
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown state {state} in workflow {workflow_type}")]
pub struct UnknownState {
    pub workflow_type: String,
    pub state: String,
}

/// Resolved view of one state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateInfo<'a> {
    pub name: &'a str,
    pub state_type: StateType,
    /// States reachable by an explicit transition, sorted
    pub next_states: Vec<&'a str>,
    /// Where exhausted retries are routed
    pub error_state: &'a str,
    pub max_retries: u32,
    pub execution_warning: Option<Duration>,
}

/// Immutable, validated workflow state machine
///
/// # Example
///
/// ```ignore
/// let definition = WorkflowDefinition::builder("demo")
///     .start_state("start")
///     .error_state("error")
///     .state(StateDefinition::start("start").with_handler(Begin))
///     .state(StateDefinition::normal("process").with_handler(Process))
///     .state(StateDefinition::end("done"))
///     .state(StateDefinition::manual("error"))
///     .permit("start", "process")
///     .permit("process", "done")
///     .build()?;
/// ```
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    workflow_type: String,
    description: Option<String>,
    start_state: String,
    error_state: String,
    states: HashMap<String, StateDefinition>,
    transitions: HashMap<String, BTreeSet<String>>,
    default_max_retries: u32,
    default_execution_warning: Option<Duration>,
}

impl WorkflowDefinition {
    /// Start building a definition for the given workflow type
    pub fn builder(workflow_type: impl Into<String>) -> WorkflowDefinitionBuilder {
        WorkflowDefinitionBuilder::new(workflow_type)
    }

    pub fn workflow_type(&self) -> &str {
        &self.workflow_type
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn start_state(&self) -> &str {
        &self.start_state
    }

    pub fn error_state(&self) -> &str {
        &self.error_state
    }

    /// Declared state, if any
    pub fn state(&self, name: &str) -> Option<&StateDefinition> {
        self.states.get(name)
    }

    /// All declared states
    pub fn states(&self) -> impl Iterator<Item = &StateDefinition> {
        self.states.values()
    }

    /// Resolve a state's type, transitions, failure routing and retry limit
    pub fn get_state(&self, name: &str) -> Result<StateInfo<'_>, UnknownState> {
        let state = self.require_state(name)?;
        let next_states = self
            .transitions
            .get(name)
            .map(|targets| targets.iter().map(String::as_str).collect())
            .unwrap_or_default();

        Ok(StateInfo {
            name: &state.name,
            state_type: state.state_type,
            next_states,
            error_state: state.failure_state.as_deref().unwrap_or(&self.error_state),
            max_retries: state.max_retries.unwrap_or(self.default_max_retries),
            execution_warning: state.execution_warning.or(self.default_execution_warning),
        })
    }

    /// Handler for a state, if the state declares one
    pub fn handler(&self, name: &str) -> Result<Option<&Arc<dyn StateHandler>>, UnknownState> {
        Ok(self.require_state(name)?.handler.as_ref())
    }

    /// Whether a handler may move an instance from `from` to `to`
    ///
    /// A state's failure state (or the definition's error state) is always
    /// a permitted target.
    pub fn is_transition_permitted(&self, from: &str, to: &str) -> bool {
        let Some(state) = self.states.get(from) else {
            return false;
        };
        if !self.states.contains_key(to) {
            return false;
        }
        if to == state.failure_state.as_deref().unwrap_or(&self.error_state) {
            return true;
        }
        self.transitions
            .get(from)
            .is_some_and(|targets| targets.contains(to))
    }

    /// Check structural integrity of the definition
    pub fn validate(&self) -> Result<(), DefinitionError> {
        let workflow_type = || self.workflow_type.clone();

        if self.workflow_type.trim().is_empty() {
            return Err(DefinitionError::MissingType);
        }

        let start = self.states.get(&self.start_state).ok_or_else(|| {
            DefinitionError::UndeclaredStartState {
                workflow_type: workflow_type(),
                state: self.start_state.clone(),
            }
        })?;
        if start.state_type != StateType::Start {
            return Err(DefinitionError::InvalidStartState {
                workflow_type: workflow_type(),
                state: self.start_state.clone(),
            });
        }

        if !self.states.contains_key(&self.error_state) {
            return Err(DefinitionError::UndeclaredErrorState {
                workflow_type: workflow_type(),
                state: self.error_state.clone(),
            });
        }

        // Sorted for deterministic error reporting
        let mut sources: Vec<_> = self.transitions.iter().collect();
        sources.sort_by(|a, b| a.0.cmp(b.0));
        for (from, targets) in sources {
            let Some(source) = self.states.get(from) else {
                return Err(DefinitionError::UndeclaredTransitionSource {
                    workflow_type: workflow_type(),
                    state: from.clone(),
                });
            };
            if source.state_type == StateType::End && !targets.is_empty() {
                return Err(DefinitionError::TransitionFromEnd {
                    workflow_type: workflow_type(),
                    state: from.clone(),
                });
            }
            if let Some(to) = targets.iter().find(|to| !self.states.contains_key(*to)) {
                return Err(DefinitionError::UndeclaredTransitionTarget {
                    workflow_type: workflow_type(),
                    from: from.clone(),
                    to: to.clone(),
                });
            }
            // Start states are only entered on insert
            if let Some(to) = targets
                .iter()
                .find(|to| self.states[*to].state_type == StateType::Start)
            {
                return Err(DefinitionError::TransitionToStart {
                    workflow_type: workflow_type(),
                    from: from.clone(),
                    to: to.clone(),
                });
            }
        }

        let mut names: Vec<_> = self.states.keys().collect();
        names.sort();
        for name in names {
            let state = &self.states[name];
            if let Some(failure_state) = &state.failure_state {
                if !self.states.contains_key(failure_state) {
                    return Err(DefinitionError::UndeclaredFailureState {
                        workflow_type: workflow_type(),
                        state: name.clone(),
                        failure_state: failure_state.clone(),
                    });
                }
            }
            if state.state_type.requires_handler() && state.handler.is_none() {
                return Err(DefinitionError::MissingHandler {
                    workflow_type: workflow_type(),
                    state: name.clone(),
                    state_type: state.state_type,
                });
            }
        }

        self.check_reachable_states()
    }

    fn check_reachable_states(&self) -> Result<(), DefinitionError> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([self.start_state.as_str()]);
        let mut dead_ends = Vec::new();

        while let Some(name) = queue.pop_front() {
            if !seen.insert(name) {
                continue;
            }
            let targets = self.transitions.get(name);
            let has_edges = targets.is_some_and(|t| !t.is_empty());
            let resting = self
                .states
                .get(name)
                .is_some_and(|s| s.state_type.is_resting());

            if !has_edges && !resting {
                dead_ends.push(name);
            }
            if let Some(targets) = targets {
                queue.extend(targets.iter().map(String::as_str));
            }
        }

        dead_ends.sort();
        match dead_ends.first() {
            Some(state) => Err(DefinitionError::DeadEnd {
                workflow_type: self.workflow_type.clone(),
                state: state.to_string(),
            }),
            None => Ok(()),
        }
    }

    fn require_state(&self, name: &str) -> Result<&StateDefinition, UnknownState> {
        self.states.get(name).ok_or_else(|| UnknownState {
            workflow_type: self.workflow_type.clone(),
            state: name.to_string(),
        })
    }
}

/// Builder for [`WorkflowDefinition`]
#[derive(Debug)]
pub struct WorkflowDefinitionBuilder {
    workflow_type: String,
    description: Option<String>,
    start_state: Option<String>,
    error_state: Option<String>,
    states: Vec<StateDefinition>,
    transitions: HashMap<String, BTreeSet<String>>,
    default_max_retries: u32,
    default_execution_warning: Option<Duration>,
}

impl WorkflowDefinitionBuilder {
    fn new(workflow_type: impl Into<String>) -> Self {
        Self {
            workflow_type: workflow_type.into(),
            description: None,
            start_state: None,
            error_state: None,
            states: Vec::new(),
            transitions: HashMap::new(),
            default_max_retries: DEFAULT_MAX_RETRIES,
            default_execution_warning: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Initial state of new instances
    pub fn start_state(mut self, state: impl Into<String>) -> Self {
        self.start_state = Some(state.into());
        self
    }

    /// Fallback state for exhausted retries
    pub fn error_state(mut self, state: impl Into<String>) -> Self {
        self.error_state = Some(state.into());
        self
    }

    /// Declare a state
    pub fn state(mut self, state: StateDefinition) -> Self {
        self.states.push(state);
        self
    }

    /// Permit a transition from one state to another
    pub fn permit(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.transitions
            .entry(from.into())
            .or_default()
            .insert(to.into());
        self
    }

    /// Retry limit for states without their own
    pub fn default_max_retries(mut self, max_retries: u32) -> Self {
        self.default_max_retries = max_retries;
        self
    }

    /// Execution-time warning threshold for states without their own
    pub fn default_execution_warning(mut self, threshold: Duration) -> Self {
        self.default_execution_warning = Some(threshold);
        self
    }

    /// Validate and build the definition
    ///
    /// When no start state is named, the single state of type `start` is used.
    pub fn build(self) -> Result<WorkflowDefinition, DefinitionError> {
        let mut states = HashMap::with_capacity(self.states.len());
        for state in self.states {
            if states.contains_key(&state.name) {
                return Err(DefinitionError::DuplicateState {
                    workflow_type: self.workflow_type,
                    state: state.name,
                });
            }
            states.insert(state.name.clone(), state);
        }

        let start_state = match self.start_state {
            Some(start) => start,
            None => {
                let mut starts = states
                    .values()
                    .filter(|s| s.state_type == StateType::Start)
                    .map(|s| s.name.clone());
                match (starts.next(), starts.next()) {
                    (Some(only), None) => only,
                    _ => String::new(),
                }
            }
        };

        let definition = WorkflowDefinition {
            workflow_type: self.workflow_type,
            description: self.description,
            start_state,
            error_state: self.error_state.unwrap_or_default(),
            states,
            transitions: self.transitions,
            default_max_retries: self.default_max_retries,
            default_execution_warning: self.default_execution_warning,
        };

        definition.validate()?;
        Ok(definition)
    }
}
