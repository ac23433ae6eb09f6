//! In-memory implementation of InstanceStore for testing

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;
use crate::reliability::add_duration;

#[derive(Default)]
struct Inner {
    instances: HashMap<Uuid, WorkflowInstance>,
    actions: Vec<ActionRecord>,
    executors: HashMap<Uuid, ExecutorInfo>,
    next_action_id: i64,
}

impl Inner {
    fn live_executors(&self, now: DateTime<Utc>) -> HashSet<Uuid> {
        self.executors
            .values()
            .filter(|e| e.is_live(now))
            .map(|e| e.id)
            .collect()
    }

    fn push_action(
        &mut self,
        instance_id: Uuid,
        executor_id: Option<Uuid>,
        action: NewAction,
        updated_variables: BTreeMap<String, String>,
    ) {
        self.next_action_id += 1;
        self.actions.push(ActionRecord {
            id: self.next_action_id,
            instance_id,
            action_type: action.action_type,
            state: action.state,
            state_text: action.state_text,
            retry_no: action.retry_no,
            executor_id,
            execution_start: action.execution_start,
            execution_end: action.execution_end,
            updated_variables,
        });
    }

    /// Instance still held under exactly this claim
    fn claimed_mut(&mut self, claim: &ClaimToken) -> Result<&mut WorkflowInstance, StoreError> {
        let instance = self
            .instances
            .get_mut(&claim.instance_id)
            .ok_or(StoreError::InstanceNotFound(claim.instance_id))?;

        let held = instance.status == InstanceStatus::Executing
            && instance.executor_id == Some(claim.executor_id)
            && instance.version == claim.version
            && instance.state == claim.state;
        if !held {
            return Err(StoreError::ConcurrentModification(claim.instance_id));
        }
        Ok(instance)
    }
}

/// In-memory implementation of InstanceStore
///
/// This is primarily for testing. It keeps all data behind a single lock
/// and provides the same claim and lease semantics as the PostgreSQL
/// implementation.
///
/// # Example
///
/// ```
/// use stateflow_engine::InMemoryInstanceStore;
///
/// let store = InMemoryInstanceStore::new();
/// assert_eq!(store.instance_count(), 0);
/// ```
pub struct InMemoryInstanceStore {
    inner: RwLock<Inner>,
    max_variable_length: usize,
}

impl InMemoryInstanceStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            max_variable_length: DEFAULT_MAX_VARIABLE_LENGTH,
        }
    }

    /// Set the maximum state variable length
    pub fn with_max_variable_length(mut self, length: usize) -> Self {
        self.max_variable_length = length;
        self
    }

    /// Get the number of instances
    pub fn instance_count(&self) -> usize {
        self.inner.read().instances.len()
    }

    /// Get the number of instances in a given status
    pub fn count_by_status(&self, status: InstanceStatus) -> usize {
        self.inner
            .read()
            .instances
            .values()
            .filter(|i| i.status == status)
            .count()
    }

    /// Force an executor's lease to lapse (for testing)
    pub fn expire_executor(&self, executor_id: Uuid) {
        if let Some(executor) = self.inner.write().executors.get_mut(&executor_id) {
            executor.expires = Utc::now() - chrono::Duration::seconds(1);
        }
    }

    /// Make an instance due now (for testing)
    pub fn make_due(&self, instance_id: Uuid) {
        if let Some(instance) = self.inner.write().instances.get_mut(&instance_id) {
            if instance.next_activation.is_some() {
                instance.next_activation = Some(Utc::now());
            }
        }
    }

    /// Clear all data
    pub fn clear(&self) {
        *self.inner.write() = Inner::default();
    }
}

impl Default for InMemoryInstanceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InstanceStore for InMemoryInstanceStore {
    async fn insert_instance(&self, instance: NewInstance) -> Result<Uuid, StoreError> {
        instance.validate(self.max_variable_length)?;

        let id = Uuid::now_v7();
        let now = Utc::now();
        let row = WorkflowInstance {
            id,
            workflow_type: instance.workflow_type,
            executor_group: instance.executor_group,
            business_key: instance.business_key,
            external_id: instance.external_id.unwrap_or_else(|| id.to_string()),
            state: instance.state,
            state_text: instance.state_text,
            status: instance.status,
            next_activation: instance.next_activation,
            retries: 0,
            priority: instance.priority,
            executor_id: None,
            version: 0,
            variables: instance.variables,
            created: now,
            modified: now,
            started: None,
        };

        let mut inner = self.inner.write();
        let duplicate = inner.instances.values().any(|i| {
            i.workflow_type == row.workflow_type && i.external_id == row.external_id
        });
        if duplicate {
            return Err(StoreError::ValidationError(format!(
                "duplicate external id {} for workflow type {}",
                row.external_id, row.workflow_type
            )));
        }
        inner.instances.insert(id, row);
        Ok(id)
    }

    async fn get_instance(&self, instance_id: Uuid) -> Result<WorkflowInstance, StoreError> {
        self.inner
            .read()
            .instances
            .get(&instance_id)
            .cloned()
            .ok_or(StoreError::InstanceNotFound(instance_id))
    }

    async fn list_instances(
        &self,
        filter: InstanceFilter,
    ) -> Result<Vec<WorkflowInstance>, StoreError> {
        let inner = self.inner.read();
        let mut instances: Vec<_> = inner
            .instances
            .values()
            .filter(|i| filter.matches(i))
            .cloned()
            .collect();

        // v7 ids sort by creation time
        instances.sort_by(|a, b| b.id.cmp(&a.id));
        if let Some(limit) = filter.limit {
            instances.truncate(limit);
        }
        Ok(instances)
    }

    async fn list_actions(&self, instance_id: Uuid) -> Result<Vec<ActionRecord>, StoreError> {
        let inner = self.inner.read();
        if !inner.instances.contains_key(&instance_id) {
            return Err(StoreError::InstanceNotFound(instance_id));
        }
        Ok(inner
            .actions
            .iter()
            .filter(|a| a.instance_id == instance_id)
            .cloned()
            .collect())
    }

    async fn update_manual(
        &self,
        instance_id: Uuid,
        update: ManualUpdate,
    ) -> Result<WorkflowInstance, StoreError> {
        update.validate(self.max_variable_length)?;

        let now = Utc::now();
        let mut inner = self.inner.write();
        let live = inner.live_executors(now);

        let instance = inner
            .instances
            .get_mut(&instance_id)
            .ok_or(StoreError::InstanceNotFound(instance_id))?;

        if instance.status == InstanceStatus::Executing
            && instance.executor_id.is_some_and(|owner| live.contains(&owner))
        {
            return Err(StoreError::ConcurrentModification(instance_id));
        }

        let previous_state = std::mem::replace(&mut instance.state, update.state);
        let retry_no = instance.retries;
        if instance.state != previous_state {
            instance.retries = 0;
        }
        instance.status = update.status;
        instance.next_activation = update.next_activation;
        instance.state_text = Some(update.reason.clone());
        instance.executor_id = None;
        instance.version += 1;
        instance.modified = now;
        instance
            .variables
            .extend(update.variables.iter().map(|(k, v)| (k.clone(), v.clone())));
        let snapshot = instance.clone();

        inner.push_action(
            instance_id,
            None,
            NewAction {
                action_type: ActionType::ExternalChange,
                state: previous_state,
                state_text: Some(update.reason),
                retry_no,
                execution_start: now,
                execution_end: now,
            },
            update.variables,
        );
        Ok(snapshot)
    }

    async fn claim_due_instances(
        &self,
        executor_id: Uuid,
        executor_group: &str,
        limit: usize,
    ) -> Result<Vec<WorkflowInstance>, StoreError> {
        if limit == 0 {
            return Ok(vec![]);
        }

        let now = Utc::now();
        let mut inner = self.inner.write();
        let live = inner.live_executors(now);
        if !live.contains(&executor_id) {
            return Err(StoreError::ExecutorNotFound(executor_id));
        }

        let mut due: Vec<_> = inner
            .instances
            .values()
            .filter(|i| {
                i.executor_group == executor_group
                    && matches!(
                        i.status,
                        InstanceStatus::Created
                            | InstanceStatus::InProgress
                            | InstanceStatus::Executing
                    )
                    && i.next_activation.is_some_and(|at| at <= now)
                    && i.executor_id.map_or(true, |owner| !live.contains(&owner))
            })
            .map(|i| (i.next_activation, Reverse(i.priority), i.id))
            .collect();
        due.sort();
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, _, id) in due {
            if let Some(instance) = inner.instances.get_mut(&id) {
                instance.status = InstanceStatus::Executing;
                instance.executor_id = Some(executor_id);
                instance.version += 1;
                instance.modified = now;
                instance.started.get_or_insert(now);
                claimed.push(instance.clone());
            }
        }
        Ok(claimed)
    }

    async fn update_after_execution(
        &self,
        claim: &ClaimToken,
        outcome: ExecutionOutcome,
    ) -> Result<(), StoreError> {
        validate_variables(&outcome.updated_variables, self.max_variable_length)?;

        let mut inner = self.inner.write();
        let instance = inner.claimed_mut(claim)?;

        instance.state = outcome.state;
        instance.state_text = outcome.state_text;
        instance.status = outcome.status;
        instance.next_activation = outcome.next_activation;
        instance.retries = outcome.retries;
        instance.executor_id = None;
        instance.version += 1;
        instance.modified = Utc::now();
        instance.variables.extend(
            outcome
                .updated_variables
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );

        inner.push_action(
            claim.instance_id,
            Some(claim.executor_id),
            outcome.action,
            outcome.updated_variables,
        );
        Ok(())
    }

    async fn release_claim(
        &self,
        claim: &ClaimToken,
        next_activation: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let instance = inner.claimed_mut(claim)?;

        instance.executor_id = None;
        instance.next_activation = Some(next_activation);
        instance.version += 1;
        instance.modified = Utc::now();
        Ok(())
    }

    async fn recover_orphaned_instances(
        &self,
        executor_id: Uuid,
        executor_group: &str,
    ) -> Result<Vec<Uuid>, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.write();
        let live = inner.live_executors(now);

        let mut recovered = Vec::new();
        for instance in inner.instances.values_mut() {
            let Some(owner) = instance.executor_id else {
                continue;
            };
            if instance.status != InstanceStatus::Executing
                || instance.executor_group != executor_group
                || live.contains(&owner)
            {
                continue;
            }

            instance.status = InstanceStatus::InProgress;
            instance.executor_id = None;
            instance.next_activation = Some(now);
            instance.version += 1;
            instance.modified = now;
            recovered.push((instance.id, owner, instance.state.clone(), instance.retries));
        }

        let ids = recovered.iter().map(|(id, ..)| *id).collect();
        for (id, owner, state, retries) in recovered {
            inner.push_action(
                id,
                Some(executor_id),
                NewAction {
                    action_type: ActionType::Recovery,
                    state,
                    state_text: Some(format!("recovered from expired executor {}", owner)),
                    retry_no: retries,
                    execution_start: now,
                    execution_end: now,
                },
                BTreeMap::new(),
            );
        }
        Ok(ids)
    }

    async fn register_executor(
        &self,
        executor: NewExecutor,
        lease: Duration,
    ) -> Result<ExecutorInfo, StoreError> {
        let now = Utc::now();
        let info = ExecutorInfo {
            id: Uuid::now_v7(),
            host: executor.host,
            pid: executor.pid,
            executor_group: executor.executor_group,
            started: now,
            active: now,
            expires: add_duration(now, lease),
            stopped: None,
        };

        self.inner.write().executors.insert(info.id, info.clone());
        Ok(info)
    }

    async fn heartbeat_executor(
        &self,
        executor_id: Uuid,
        lease: Duration,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.write();
        match inner.executors.get_mut(&executor_id) {
            Some(executor) if executor.stopped.is_none() && executor.expires > now => {
                executor.active = now;
                executor.expires = add_duration(now, lease);
                Ok(())
            }
            _ => Err(StoreError::ExecutorNotFound(executor_id)),
        }
    }

    async fn deregister_executor(&self, executor_id: Uuid) -> Result<u64, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.write();
        let executor = inner
            .executors
            .get_mut(&executor_id)
            .ok_or(StoreError::ExecutorNotFound(executor_id))?;
        executor.stopped = Some(now);
        executor.expires = now;

        let mut released = 0;
        for instance in inner.instances.values_mut() {
            if instance.status == InstanceStatus::Executing
                && instance.executor_id == Some(executor_id)
            {
                instance.executor_id = None;
                instance.version += 1;
                instance.modified = now;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn list_executors(
        &self,
        executor_group: &str,
    ) -> Result<Vec<ExecutorInfo>, StoreError> {
        let inner = self.inner.read();
        let mut executors: Vec<_> = inner
            .executors
            .values()
            .filter(|e| e.executor_group == executor_group)
            .cloned()
            .collect();
        executors.sort_by_key(|e| e.id);
        Ok(executors)
    }
}
