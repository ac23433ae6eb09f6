//! Registry of validated workflow definitions
//!
//! Definitions are registered once at startup, before the dispatcher runs,
//! and shared read-only with every worker afterwards.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::info;

use super::workflow::{DefinitionError, WorkflowDefinition};

/// Registry mapping workflow type names to definitions
#[derive(Default)]
pub struct WorkflowDefinitionRegistry {
    definitions: HashMap<String, Arc<WorkflowDefinition>>,
}

impl WorkflowDefinitionRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition
    ///
    /// The definition is validated again here; registration errors are
    /// fatal for the process that attempts them.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let mut registry = WorkflowDefinitionRegistry::new();
    /// registry.register(demo_definition()?)?;
    /// ```
    pub fn register(&mut self, definition: WorkflowDefinition) -> Result<(), DefinitionError> {
        definition.validate()?;

        let workflow_type = definition.workflow_type().to_string();
        if self.definitions.contains_key(&workflow_type) {
            return Err(DefinitionError::DuplicateWorkflowType(workflow_type));
        }

        info!(
            workflow_type = %workflow_type,
            states = definition.states().count(),
            "registered workflow definition"
        );
        self.definitions
            .insert(workflow_type, Arc::new(definition));
        Ok(())
    }

    /// Check if a workflow type is registered
    pub fn contains(&self, workflow_type: &str) -> bool {
        self.definitions.contains_key(workflow_type)
    }

    /// Look up a definition by type name
    pub fn get(&self, workflow_type: &str) -> Option<Arc<WorkflowDefinition>> {
        self.definitions.get(workflow_type).cloned()
    }

    /// Get the number of registered workflow types
    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Get all registered workflow type names
    pub fn workflow_types(&self) -> impl Iterator<Item = &str> {
        self.definitions.keys().map(|s| s.as_str())
    }
}

impl fmt::Debug for WorkflowDefinitionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowDefinitionRegistry")
            .field("workflow_types", &self.definitions.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{FnHandler, NextAction, StateDefinition};
    use crate::engine::ExecutionContext;

    fn definition(workflow_type: &str) -> WorkflowDefinition {
        WorkflowDefinition::builder(workflow_type)
            .start_state("start")
            .error_state("error")
            .state(StateDefinition::start("start").with_handler(FnHandler::new(
                |_ctx: &mut ExecutionContext| Ok(Some(NextAction::move_to_state("done", "ok"))),
            )))
            .state(StateDefinition::end("done"))
            .state(StateDefinition::manual("error"))
            .permit("start", "done")
            .build()
            .unwrap()
    }

    #[test]
    fn test_register_and_get() {
        let mut registry = WorkflowDefinitionRegistry::new();
        registry.register(definition("orders")).unwrap();

        assert!(registry.contains("orders"));
        assert!(!registry.contains("unknown"));
        assert_eq!(registry.len(), 1);

        let found = registry.get("orders").unwrap();
        assert_eq!(found.workflow_type(), "orders");
        assert!(registry.get("unknown").is_none());
    }

    #[test]
    fn test_duplicate_type_rejected() {
        let mut registry = WorkflowDefinitionRegistry::new();
        registry.register(definition("orders")).unwrap();

        let result = registry.register(definition("orders"));
        assert!(matches!(result, Err(DefinitionError::DuplicateWorkflowType(t)) if t == "orders"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registry_debug() {
        let mut registry = WorkflowDefinitionRegistry::new();
        registry.register(definition("orders")).unwrap();

        let debug_str = format!("{:?}", registry);
        assert!(debug_str.contains("orders"));
    }

    #[test]
    fn test_workflow_types_iterator() {
        let mut registry = WorkflowDefinitionRegistry::new();
        assert!(registry.is_empty());
        registry.register(definition("orders")).unwrap();

        let types: Vec<_> = registry.workflow_types().collect();
        assert_eq!(types, vec!["orders"]);
    }
}
