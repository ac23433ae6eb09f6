//! InstanceStore trait definition

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::definition::StateType;

/// Default upper bound for a single state variable value, in bytes
pub const DEFAULT_MAX_VARIABLE_LENGTH: usize = 10_000;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Rejected input, nothing was written
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Instance not found
    #[error("workflow instance not found: {0}")]
    InstanceNotFound(Uuid),

    /// Executor not registered, stopped, or its lease has expired
    #[error("executor not found or not live: {0}")]
    ExecutorNotFound(Uuid),

    /// The instance changed since it was read or claimed
    #[error("concurrent modification of workflow instance {0}")]
    ConcurrentModification(Uuid),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Database(_))
    }
}

/// Lifecycle status of a workflow instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Inserted, never executed
    Created,

    /// Scheduled for (re-)execution
    InProgress,

    /// Claimed by an executor
    Executing,

    /// Waiting for an external update
    Manual,

    /// Reached an end state
    Finished,
}

impl InstanceStatus {
    /// Status an instance takes after moving into a state of the given type
    pub fn for_state_type(state_type: StateType) -> Self {
        match state_type {
            StateType::End => Self::Finished,
            StateType::Manual => Self::Manual,
            StateType::Start | StateType::Normal | StateType::Wait => Self::InProgress,
        }
    }

    /// Whether instances in this status carry a next activation
    pub fn is_scheduled(&self) -> bool {
        matches!(self, Self::Created | Self::InProgress)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::InProgress => "in_progress",
            Self::Executing => "executing",
            Self::Manual => "manual",
            Self::Finished => "finished",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "in_progress" => Ok(Self::InProgress),
            "executing" => Ok(Self::Executing),
            "manual" => Ok(Self::Manual),
            "finished" => Ok(Self::Finished),
            other => Err(StoreError::Serialization(format!(
                "unknown instance status: {}",
                other
            ))),
        }
    }
}

/// A persisted workflow instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: Uuid,
    pub workflow_type: String,
    pub executor_group: String,
    pub business_key: Option<String>,
    pub external_id: String,
    pub state: String,
    pub state_text: Option<String>,
    pub status: InstanceStatus,
    pub next_activation: Option<DateTime<Utc>>,
    pub retries: u32,
    pub priority: i16,
    /// Owning executor, set only while a claim is held
    pub executor_id: Option<Uuid>,
    /// Incremented on every write; used for optimistic checks
    pub version: i64,
    pub variables: BTreeMap<String, String>,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    /// First time the instance was claimed
    pub started: Option<DateTime<Utc>>,
}

impl WorkflowInstance {
    /// Token identifying the claim this snapshot was returned under
    pub fn claim_token(&self) -> Option<ClaimToken> {
        Some(ClaimToken {
            instance_id: self.id,
            executor_id: self.executor_id?,
            state: self.state.clone(),
            version: self.version,
        })
    }
}

/// Identity of one claim on one instance
///
/// Write-backs succeed only while the instance still matches the token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimToken {
    pub instance_id: Uuid,
    pub executor_id: Uuid,
    /// State at claim time
    pub state: String,
    /// Version at claim time
    pub version: i64,
}

/// Instance to insert
#[derive(Debug, Clone)]
pub struct NewInstance {
    pub workflow_type: String,
    pub executor_group: String,
    pub business_key: Option<String>,
    /// Generated when not supplied
    pub external_id: Option<String>,
    pub state: String,
    pub state_text: Option<String>,
    pub status: InstanceStatus,
    pub next_activation: Option<DateTime<Utc>>,
    pub priority: i16,
    pub variables: BTreeMap<String, String>,
}

impl NewInstance {
    /// New instance in `state`, due immediately
    pub fn new(workflow_type: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            workflow_type: workflow_type.into(),
            executor_group: "default".to_string(),
            business_key: None,
            external_id: None,
            state: state.into(),
            state_text: None,
            status: InstanceStatus::Created,
            next_activation: Some(Utc::now()),
            priority: 0,
            variables: BTreeMap::new(),
        }
    }

    pub fn with_executor_group(mut self, group: impl Into<String>) -> Self {
        self.executor_group = group.into();
        self
    }

    pub fn with_business_key(mut self, key: impl Into<String>) -> Self {
        self.business_key = Some(key.into());
        self
    }

    pub fn with_external_id(mut self, id: impl Into<String>) -> Self {
        self.external_id = Some(id.into());
        self
    }

    pub fn with_status(mut self, status: InstanceStatus) -> Self {
        self.status = status;
        self
    }

    /// Set the first activation; `None` leaves the instance unscheduled
    pub fn with_next_activation(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.next_activation = at;
        self
    }

    pub fn with_priority(mut self, priority: i16) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    /// Check the instance against the store's insert rules
    pub fn validate(&self, max_variable_length: usize) -> Result<(), StoreError> {
        if self.workflow_type.trim().is_empty() {
            return Err(StoreError::ValidationError(
                "workflow type is required".into(),
            ));
        }
        if self.state.trim().is_empty() {
            return Err(StoreError::ValidationError("state is required".into()));
        }
        match self.status {
            InstanceStatus::Created | InstanceStatus::InProgress => {
                if self.next_activation.is_none() {
                    return Err(StoreError::ValidationError(format!(
                        "next activation is required for status {}",
                        self.status
                    )));
                }
            }
            InstanceStatus::Manual => {
                if self.next_activation.is_some() {
                    return Err(StoreError::ValidationError(
                        "manual instances cannot be scheduled".into(),
                    ));
                }
            }
            InstanceStatus::Executing | InstanceStatus::Finished => {
                return Err(StoreError::ValidationError(format!(
                    "cannot insert instance with status {}",
                    self.status
                )));
            }
        }
        validate_variables(&self.variables, max_variable_length)
    }
}

/// Reject variable values longer than `max_length` bytes
pub fn validate_variables(
    variables: &BTreeMap<String, String>,
    max_length: usize,
) -> Result<(), StoreError> {
    match variables.iter().find(|(_, value)| value.len() > max_length) {
        Some((name, value)) => Err(StoreError::ValidationError(format!(
            "state variable {} is {} bytes, limit is {}",
            name,
            value.len(),
            max_length
        ))),
        None => Ok(()),
    }
}

/// Filter for listing instances
#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    pub workflow_type: Option<String>,
    pub state: Option<String>,
    pub status: Option<InstanceStatus>,
    pub business_key: Option<String>,
    pub external_id: Option<String>,
    pub executor_group: Option<String>,
    pub limit: Option<usize>,
}

impl InstanceFilter {
    pub fn by_type(workflow_type: impl Into<String>) -> Self {
        Self {
            workflow_type: Some(workflow_type.into()),
            ..Default::default()
        }
    }

    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    pub fn with_status(mut self, status: InstanceStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_business_key(mut self, key: impl Into<String>) -> Self {
        self.business_key = Some(key.into());
        self
    }

    pub fn with_external_id(mut self, id: impl Into<String>) -> Self {
        self.external_id = Some(id.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether an instance passes the filter
    pub fn matches(&self, instance: &WorkflowInstance) -> bool {
        fn eq(filter: &Option<String>, value: &str) -> bool {
            filter.as_deref().map_or(true, |f| f == value)
        }

        eq(&self.workflow_type, &instance.workflow_type)
            && eq(&self.state, &instance.state)
            && eq(&self.external_id, &instance.external_id)
            && eq(&self.executor_group, &instance.executor_group)
            && self.status.map_or(true, |s| s == instance.status)
            && self
                .business_key
                .as_deref()
                .map_or(true, |k| instance.business_key.as_deref() == Some(k))
    }
}

/// Kind of an action history record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Handler ran and its outcome was accepted
    StateExecution,
    /// Handler failed or declared an illegal transition
    StateExecutionFailed,
    /// Claim of an expired executor was released by a recovery sweep
    Recovery,
    /// Instance was changed from outside the engine
    ExternalChange,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StateExecution => "state_execution",
            Self::StateExecutionFailed => "state_execution_failed",
            Self::Recovery => "recovery",
            Self::ExternalChange => "external_change",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "state_execution" => Ok(Self::StateExecution),
            "state_execution_failed" => Ok(Self::StateExecutionFailed),
            "recovery" => Ok(Self::Recovery),
            "external_change" => Ok(Self::ExternalChange),
            other => Err(StoreError::Serialization(format!(
                "unknown action type: {}",
                other
            ))),
        }
    }
}

/// One row of an instance's action history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub id: i64,
    pub instance_id: Uuid,
    pub action_type: ActionType,
    /// State the action happened in
    pub state: String,
    pub state_text: Option<String>,
    pub retry_no: u32,
    pub executor_id: Option<Uuid>,
    pub execution_start: DateTime<Utc>,
    pub execution_end: DateTime<Utc>,
    /// Variables written by this action
    pub updated_variables: BTreeMap<String, String>,
}

/// History record appended with an execution outcome
#[derive(Debug, Clone)]
pub struct NewAction {
    pub action_type: ActionType,
    pub state: String,
    pub state_text: Option<String>,
    pub retry_no: u32,
    pub execution_start: DateTime<Utc>,
    pub execution_end: DateTime<Utc>,
}

/// Result of executing one state, written back in a single transaction
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub state: String,
    pub state_text: Option<String>,
    pub status: InstanceStatus,
    pub next_activation: Option<DateTime<Utc>>,
    pub retries: u32,
    /// Only the variables the handler changed
    pub updated_variables: BTreeMap<String, String>,
    pub action: NewAction,
}

/// External change to an instance that is not being executed
#[derive(Debug, Clone)]
pub struct ManualUpdate {
    pub state: String,
    pub status: InstanceStatus,
    pub next_activation: Option<DateTime<Utc>>,
    pub variables: BTreeMap<String, String>,
    /// Recorded as the history record's text
    pub reason: String,
}

impl ManualUpdate {
    /// Check scheduling invariants for the target status
    pub fn validate(&self, max_variable_length: usize) -> Result<(), StoreError> {
        match (self.status, self.next_activation) {
            (InstanceStatus::Executing, _) => Err(StoreError::ValidationError(
                "cannot set status executing externally".into(),
            )),
            (status, None) if status.is_scheduled() => Err(StoreError::ValidationError(
                format!("next activation is required for status {}", status),
            )),
            (status, Some(_)) if !status.is_scheduled() => Err(StoreError::ValidationError(
                format!("status {} cannot be scheduled", status),
            )),
            _ => validate_variables(&self.variables, max_variable_length),
        }
    }
}

/// Identity of an executor process to register
#[derive(Debug, Clone)]
pub struct NewExecutor {
    pub host: String,
    pub pid: u32,
    pub executor_group: String,
}

/// A registered executor and its lease
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorInfo {
    pub id: Uuid,
    pub host: String,
    pub pid: u32,
    pub executor_group: String,
    pub started: DateTime<Utc>,
    /// Last heartbeat
    pub active: DateTime<Utc>,
    /// Lease deadline
    pub expires: DateTime<Utc>,
    /// Set on graceful deregistration
    pub stopped: Option<DateTime<Utc>>,
}

impl ExecutorInfo {
    /// Whether the executor still holds a valid lease at `now`
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.stopped.is_none() && self.expires > now
    }
}

/// Persistence for workflow instances and executor leases
///
/// Implementations must guarantee that an instance claimed by a live
/// executor is never returned by another executor's claim.
#[async_trait]
pub trait InstanceStore: Send + Sync + 'static {
    // =========================================================================
    // Instances
    // =========================================================================

    /// Insert a new instance and return its id
    async fn insert_instance(&self, instance: NewInstance) -> Result<Uuid, StoreError>;

    /// Get an instance by id
    async fn get_instance(&self, instance_id: Uuid) -> Result<WorkflowInstance, StoreError>;

    /// List instances matching a filter, newest first
    async fn list_instances(
        &self,
        filter: InstanceFilter,
    ) -> Result<Vec<WorkflowInstance>, StoreError>;

    /// Action history of an instance, oldest first
    async fn list_actions(&self, instance_id: Uuid) -> Result<Vec<ActionRecord>, StoreError>;

    /// Apply an external change to an instance without a live claim
    async fn update_manual(
        &self,
        instance_id: Uuid,
        update: ManualUpdate,
    ) -> Result<WorkflowInstance, StoreError>;

    // =========================================================================
    // Claiming
    // =========================================================================

    /// Atomically claim up to `limit` due instances of `executor_group`
    ///
    /// Due instances are unowned (or owned by an executor whose lease is no
    /// longer valid) and have `next_activation <= now`. Claimed instances
    /// get status `executing` and `executor_id` set to the claimer.
    async fn claim_due_instances(
        &self,
        executor_id: Uuid,
        executor_group: &str,
        limit: usize,
    ) -> Result<Vec<WorkflowInstance>, StoreError>;

    /// Write back the outcome of one execution and release the claim
    ///
    /// Fails with `ConcurrentModification` if the instance changed since
    /// the claim was taken.
    async fn update_after_execution(
        &self,
        claim: &ClaimToken,
        outcome: ExecutionOutcome,
    ) -> Result<(), StoreError>;

    /// Release a claim without executing, keeping the instance claimable
    ///
    /// The instance stays `executing` with no owner until `next_activation`.
    async fn release_claim(
        &self,
        claim: &ClaimToken,
        next_activation: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Release claims held by dead executors of a group
    ///
    /// Each released instance becomes `in_progress`, due now, and gets a
    /// `recovery` history record. Returns the recovered instance ids.
    async fn recover_orphaned_instances(
        &self,
        executor_id: Uuid,
        executor_group: &str,
    ) -> Result<Vec<Uuid>, StoreError>;

    // =========================================================================
    // Executors
    // =========================================================================

    /// Register an executor with a lease of `lease` from now
    async fn register_executor(
        &self,
        executor: NewExecutor,
        lease: Duration,
    ) -> Result<ExecutorInfo, StoreError>;

    /// Extend an executor's lease to `lease` from now
    async fn heartbeat_executor(&self, executor_id: Uuid, lease: Duration)
        -> Result<(), StoreError>;

    /// Mark an executor stopped and release its claims
    ///
    /// Returns the number of released instances.
    async fn deregister_executor(&self, executor_id: Uuid) -> Result<u64, StoreError>;

    /// Executors of a group, including expired and stopped ones
    async fn list_executors(&self, executor_group: &str)
        -> Result<Vec<ExecutorInfo>, StoreError>;
}
