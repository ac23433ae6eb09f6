//! Submission API for workflow instances
//!
//! Used by outer surfaces (REST, CLI) to create instances, inspect them and
//! resume instances parked in manual states.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::definition::{StateType, UnknownState, WorkflowDefinition, WorkflowDefinitionRegistry};
use crate::persistence::{
    ActionRecord, ExecutorInfo, InstanceFilter, InstanceStatus, InstanceStore, ManualUpdate,
    NewInstance, StoreError, WorkflowInstance,
};

/// Service errors
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// No definition registered for the type
    #[error("unknown workflow type: {0}")]
    UnknownWorkflowType(String),

    #[error(transparent)]
    UnknownState(#[from] UnknownState),

    /// Instances must be created in a start state
    #[error("state {state} of workflow {workflow_type} is not a start state")]
    NotStartState {
        workflow_type: String,
        state: String,
    },

    /// Rejected request
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// External change to an instance
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManualAction {
    /// Target state; the current state when absent
    pub state: Option<String>,
    /// Next activation for scheduled targets; now when absent
    pub next_activation: Option<DateTime<Utc>>,
    /// Variables to merge into the instance
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    /// Recorded in the instance's history
    pub reason: Option<String>,
}

impl ManualAction {
    /// Move to `state`
    pub fn move_to(state: impl Into<String>) -> Self {
        Self {
            state: Some(state.into()),
            ..Default::default()
        }
    }

    pub fn with_next_activation(mut self, at: DateTime<Utc>) -> Self {
        self.next_activation = Some(at);
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Validates requests against registered definitions before they reach the store
pub struct WorkflowInstanceService {
    store: Arc<dyn InstanceStore>,
    definitions: Arc<WorkflowDefinitionRegistry>,
}

impl WorkflowInstanceService {
    pub fn new(store: Arc<dyn InstanceStore>, definitions: Arc<WorkflowDefinitionRegistry>) -> Self {
        Self { store, definitions }
    }

    /// Create an instance
    ///
    /// An empty state selects the definition's start state.
    #[instrument(skip(self, instance), fields(workflow_type = %instance.workflow_type))]
    pub async fn insert(&self, mut instance: NewInstance) -> Result<Uuid, ServiceError> {
        let definition = self.definition(&instance.workflow_type)?;

        if instance.state.trim().is_empty() {
            instance.state = definition.start_state().to_string();
        }
        let state = definition.get_state(&instance.state)?;
        if state.state_type != StateType::Start {
            return Err(ServiceError::NotStartState {
                workflow_type: instance.workflow_type,
                state: instance.state,
            });
        }

        let id = self.store.insert_instance(instance).await?;
        info!(instance_id = %id, "Workflow instance created");
        Ok(id)
    }

    pub async fn get(&self, instance_id: Uuid) -> Result<WorkflowInstance, ServiceError> {
        Ok(self.store.get_instance(instance_id).await?)
    }

    pub async fn list(&self, filter: InstanceFilter) -> Result<Vec<WorkflowInstance>, ServiceError> {
        Ok(self.store.list_instances(filter).await?)
    }

    /// Action history, oldest first
    pub async fn actions(&self, instance_id: Uuid) -> Result<Vec<ActionRecord>, ServiceError> {
        Ok(self.store.list_actions(instance_id).await?)
    }

    pub async fn executors(&self, executor_group: &str) -> Result<Vec<ExecutorInfo>, ServiceError> {
        Ok(self.store.list_executors(executor_group).await?)
    }

    /// Change an instance that is not currently executing
    ///
    /// The status follows the target state's type. Fails with
    /// `ConcurrentModification` while an executor holds a live claim.
    #[instrument(skip(self, action), fields(%instance_id))]
    pub async fn update_manual(
        &self,
        instance_id: Uuid,
        action: ManualAction,
    ) -> Result<WorkflowInstance, ServiceError> {
        let current = self.store.get_instance(instance_id).await?;
        let definition = self.definition(&current.workflow_type)?;

        let target = action.state.unwrap_or_else(|| current.state.clone());
        let target_type = definition.get_state(&target)?.state_type;
        let status = InstanceStatus::for_state_type(target_type);

        let next_activation = match (status.is_scheduled(), action.next_activation) {
            (true, at) => Some(at.unwrap_or_else(Utc::now)),
            (false, None) => None,
            (false, Some(_)) => {
                return Err(ServiceError::InvalidRequest(format!(
                    "{} state {} cannot be scheduled",
                    target_type, target
                )))
            }
        };

        let reason = action
            .reason
            .unwrap_or_else(|| format!("manually moved to {}", target));
        let updated = self
            .store
            .update_manual(
                instance_id,
                ManualUpdate {
                    state: target,
                    status,
                    next_activation,
                    variables: action.variables,
                    reason,
                },
            )
            .await?;

        info!(state = %updated.state, status = %updated.status, "Workflow instance updated");
        Ok(updated)
    }

    fn definition(&self, workflow_type: &str) -> Result<Arc<WorkflowDefinition>, ServiceError> {
        self.definitions
            .get(workflow_type)
            .ok_or_else(|| ServiceError::UnknownWorkflowType(workflow_type.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{FnHandler, NextAction, StateDefinition};
    use crate::engine::ExecutionContext;
    use crate::persistence::{ActionType, InMemoryInstanceStore, NewExecutor};
    use std::time::Duration;

    fn service() -> (Arc<InMemoryInstanceStore>, WorkflowInstanceService) {
        let definition = WorkflowDefinition::builder("approval")
            .start_state("submit")
            .error_state("error")
            .state(StateDefinition::start("submit").with_handler(FnHandler::new(
                |_ctx: &mut ExecutionContext| Ok(Some(NextAction::move_to_state("review", "ok"))),
            )))
            .state(StateDefinition::manual("review"))
            .state(StateDefinition::normal("approved").with_handler(FnHandler::new(
                |_ctx: &mut ExecutionContext| Ok(Some(NextAction::move_to_state("done", "ok"))),
            )))
            .state(StateDefinition::end("done"))
            .state(StateDefinition::manual("error"))
            .permit("submit", "review")
            .permit("review", "approved")
            .permit("approved", "done")
            .build()
            .unwrap();
        let mut registry = WorkflowDefinitionRegistry::new();
        registry.register(definition).unwrap();

        let store = Arc::new(InMemoryInstanceStore::new());
        let service = WorkflowInstanceService::new(store.clone(), Arc::new(registry));
        (store, service)
    }

    #[tokio::test]
    async fn test_insert_defaults_to_start_state() {
        let (_store, service) = service();
        let id = service
            .insert(NewInstance::new("approval", "").with_variable("amount", "100"))
            .await
            .unwrap();

        let instance = service.get(id).await.unwrap();
        assert_eq!(instance.state, "submit");
        assert_eq!(instance.status, InstanceStatus::Created);
        assert_eq!(instance.variables["amount"], "100");
    }

    #[tokio::test]
    async fn test_insert_rejects_unknown_type_and_non_start_state() {
        let (_store, service) = service();

        assert!(matches!(
            service.insert(NewInstance::new("missing", "submit")).await,
            Err(ServiceError::UnknownWorkflowType(_))
        ));
        assert!(matches!(
            service.insert(NewInstance::new("approval", "review")).await,
            Err(ServiceError::NotStartState { .. })
        ));
        assert!(matches!(
            service.insert(NewInstance::new("approval", "nowhere")).await,
            Err(ServiceError::UnknownState(_))
        ));
    }

    #[tokio::test]
    async fn test_insert_surfaces_validation_errors() {
        let (_store, service) = service();
        let result = service
            .insert(NewInstance::new("approval", "submit").with_next_activation(None))
            .await;
        assert!(matches!(
            result,
            Err(ServiceError::Store(StoreError::ValidationError(_)))
        ));
    }

    #[tokio::test]
    async fn test_update_manual_resumes_instance() {
        let (store, service) = service();
        let id = service
            .insert(NewInstance::new("approval", "submit"))
            .await
            .unwrap();

        let parked = service
            .update_manual(id, ManualAction::move_to("review"))
            .await
            .unwrap();
        assert_eq!(parked.status, InstanceStatus::Manual);
        assert_eq!(parked.next_activation, None);

        let resumed = service
            .update_manual(
                id,
                ManualAction::move_to("approved")
                    .with_variable("approver", "kim")
                    .with_reason("approved by reviewer"),
            )
            .await
            .unwrap();
        assert_eq!(resumed.state, "approved");
        assert_eq!(resumed.status, InstanceStatus::InProgress);
        assert!(resumed.next_activation.is_some());
        assert_eq!(resumed.variables["approver"], "kim");

        let actions = store.list_actions(id).await.unwrap();
        assert_eq!(actions.len(), 2);
        assert!(actions
            .iter()
            .all(|a| a.action_type == ActionType::ExternalChange));
        assert_eq!(actions[1].state_text.as_deref(), Some("approved by reviewer"));
    }

    #[tokio::test]
    async fn test_update_manual_rejects_scheduling_resting_state() {
        let (_store, service) = service();
        let id = service
            .insert(NewInstance::new("approval", "submit"))
            .await
            .unwrap();

        let result = service
            .update_manual(id, ManualAction::move_to("review").with_next_activation(Utc::now()))
            .await;
        assert!(matches!(result, Err(ServiceError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_update_manual_rejects_claimed_instance() {
        let (store, service) = service();
        let id = service
            .insert(NewInstance::new("approval", "submit"))
            .await
            .unwrap();
        let executor = store
            .register_executor(
                NewExecutor {
                    host: "test".into(),
                    pid: 1,
                    executor_group: "default".into(),
                },
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        store.claim_due_instances(executor.id, "default", 1).await.unwrap();

        let result = service.update_manual(id, ManualAction::move_to("review")).await;
        assert!(matches!(
            result,
            Err(ServiceError::Store(StoreError::ConcurrentModification(_)))
        ));
    }
}
