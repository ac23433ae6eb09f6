//! State execution for one claimed instance
//!
//! The `StateExecutor` is responsible for:
//! - Resolving the instance's definition and current state
//! - Running the state handler with panic isolation
//! - Turning the handler's result into a persisted outcome
//! - Counting failures and routing exhausted retries to the error state

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, error, instrument, warn, Instrument};
use uuid::Uuid;

use super::context::ExecutionContext;
use super::listener::{ListenerChain, ListenerContext, StepOutcome};
use crate::config::EngineConfig;
use crate::definition::{
    HandlerError, HandlerResult, NextAction, StateInfo, StateType, UnknownState,
    WorkflowDefinition, WorkflowDefinitionRegistry,
};
use crate::persistence::{
    validate_variables, ActionType, ClaimToken, ExecutionOutcome, InstanceStatus, InstanceStore,
    NewAction, StoreError, WorkflowInstance,
};
use crate::reliability::{add_duration, BackoffPolicy, StoreRetry};

/// Settings the executor takes from the engine configuration
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub backoff: BackoffPolicy,
    pub max_variable_length: usize,
    pub unknown_type_retry_delay: Duration,
    pub store_retry: StoreRetry,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for ExecutorSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            backoff: config.backoff.clone(),
            max_variable_length: config.max_variable_length,
            unknown_type_retry_delay: config.unknown_type_retry_delay,
            store_retry: StoreRetry::default(),
        }
    }
}

/// Errors from executing one instance
///
/// None of these corrupt the instance: its claim is released whenever the
/// store can still be reached, so another attempt picks it up later.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    /// No definition registered for the instance's type
    #[error("unknown workflow type {workflow_type} for instance {instance_id}")]
    UnknownWorkflowType {
        instance_id: Uuid,
        workflow_type: String,
    },

    /// The instance is in a state its definition does not declare
    #[error(transparent)]
    UnknownState(#[from] UnknownState),

    /// The instance snapshot carries no claim
    #[error("instance {0} is not claimed")]
    NotClaimed(Uuid),

    /// Store error, including lost claims
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Runs the current state of claimed instances
///
/// # Example
///
/// ```ignore
/// let executor = StateExecutor::new(store, Arc::new(registry), Arc::new(ListenerChain::new()));
///
/// for instance in store.claim_due_instances(executor_id, "default", 10).await? {
///     executor.execute(instance).await?;
/// }
/// ```
pub struct StateExecutor {
    store: Arc<dyn InstanceStore>,
    definitions: Arc<WorkflowDefinitionRegistry>,
    listeners: Arc<ListenerChain>,
    settings: ExecutorSettings,
}

enum Verdict {
    Success {
        state: String,
        status: InstanceStatus,
        next_activation: Option<DateTime<Utc>>,
        reason: String,
    },
    Failure {
        reason: String,
        retry_at: Option<DateTime<Utc>>,
    },
}

impl StateExecutor {
    /// Create a new executor
    pub fn new(
        store: Arc<dyn InstanceStore>,
        definitions: Arc<WorkflowDefinitionRegistry>,
        listeners: Arc<ListenerChain>,
    ) -> Self {
        Self {
            store,
            definitions,
            listeners,
            settings: ExecutorSettings::default(),
        }
    }

    /// Set executor settings
    pub fn with_settings(mut self, settings: ExecutorSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Get the definition registry
    pub fn definitions(&self) -> &WorkflowDefinitionRegistry {
        &self.definitions
    }

    /// Execute the current state of a claimed instance and persist the result
    #[instrument(
        skip(self, instance),
        fields(instance_id = %instance.id, workflow_type = %instance.workflow_type, state = %instance.state)
    )]
    pub async fn execute(&self, instance: WorkflowInstance) -> Result<StepOutcome, ExecutionError> {
        let claim = instance
            .claim_token()
            .ok_or(ExecutionError::NotClaimed(instance.id))?;

        let Some(definition) = self.definitions.get(&instance.workflow_type) else {
            error!("no definition registered for workflow type, deferring instance");
            self.defer(&claim).await;
            return Err(ExecutionError::UnknownWorkflowType {
                instance_id: instance.id,
                workflow_type: instance.workflow_type.clone(),
            });
        };

        let state = match definition.get_state(&instance.state) {
            Ok(state) => state,
            Err(e) => {
                error!(error = %e, "instance is in an undeclared state, deferring instance");
                self.defer(&claim).await;
                return Err(e.into());
            }
        };

        let ctx = ExecutionContext::new(&instance);
        let listener_ctx = ListenerContext {
            definition: &definition,
            instance: &instance,
            execution: &ctx,
        };
        self.listeners.before_execution(listener_ctx).await;

        let execution_start = Utc::now();
        let timer = Instant::now();
        let (mut ctx, result) = self.run_handler(&definition, ctx).await;
        let elapsed = timer.elapsed();
        let execution_end = Utc::now();

        if let Some(threshold) = state.execution_warning.filter(|t| elapsed > *t) {
            warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                threshold_ms = threshold.as_millis() as u64,
                "state execution exceeded warning threshold"
            );
            let listener_ctx = ListenerContext {
                definition: &definition,
                instance: &instance,
                execution: &ctx,
            };
            self.listeners
                .slow_execution(listener_ctx, elapsed, threshold)
                .await;
        }

        let verdict = self.judge(&definition, &state, &ctx, result, execution_end);
        let (outcome, mut step, mut failure) =
            self.resolve(&definition, &state, &instance, &mut ctx, verdict, execution_start, execution_end);

        match self.store_outcome(&claim, outcome).await {
            Ok(()) => {}
            Err(StoreError::ValidationError(reason)) => {
                // The store refused the outcome itself; record a failed attempt instead
                warn!(%reason, "store rejected execution outcome, counting a failure");
                let verdict = Verdict::Failure {
                    reason,
                    retry_at: None,
                };
                let (outcome, retry_step, retry_failure) = self.resolve(
                    &definition,
                    &state,
                    &instance,
                    &mut ctx,
                    verdict,
                    execution_start,
                    execution_end,
                );
                if let Err(e) = self.store_outcome(&claim, outcome).await {
                    if matches!(e, StoreError::ValidationError(_)) {
                        self.release_after_error(&claim, &e).await;
                    }
                    return Err(e.into());
                }
                step = retry_step;
                failure = retry_failure;
            }
            Err(e) => return Err(e.into()),
        }

        let listener_ctx = ListenerContext {
            definition: &definition,
            instance: &instance,
            execution: &ctx,
        };
        match failure {
            Some(reason) => {
                self.listeners
                    .after_failure(listener_ctx, &reason, &step)
                    .await
            }
            None => self.listeners.after_execution(listener_ctx, &step).await,
        }

        debug!(outcome = ?step, "state execution stored");
        Ok(step)
    }

    /// Write the outcome back, retrying transient store errors
    ///
    /// When the write keeps failing the claim is released, so the instance is
    /// executed again by whichever executor claims it next. Rejected outcomes
    /// are returned untouched for the caller to handle.
    async fn store_outcome(
        &self,
        claim: &ClaimToken,
        outcome: ExecutionOutcome,
    ) -> Result<(), StoreError> {
        let result = self
            .settings
            .store_retry
            .run("update after execution", || {
                self.store.update_after_execution(claim, outcome.clone())
            })
            .await;

        match result {
            Err(StoreError::ConcurrentModification(id)) => {
                warn!("instance changed during execution, discarding outcome");
                Err(StoreError::ConcurrentModification(id))
            }
            Err(StoreError::ValidationError(reason)) => Err(StoreError::ValidationError(reason)),
            Err(e) => {
                self.release_after_error(claim, &e).await;
                Err(e)
            }
            Ok(()) => Ok(()),
        }
    }

    async fn release_after_error(&self, claim: &ClaimToken, cause: &StoreError) {
        let retry_at = self.settings.backoff.next_activation(Utc::now(), 0);
        error!(error = %cause, %retry_at, "failed to store execution outcome, releasing claim");
        if let Err(e) = self.release_claim(claim, retry_at).await {
            error!(error = %e, "failed to release claim, instance waits for lease expiry");
        }
    }

    /// Release a claim so the instance becomes claimable at `next_activation`
    ///
    /// Transient store errors are retried with the executor's store retry budget.
    pub async fn release_claim(
        &self,
        claim: &ClaimToken,
        next_activation: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.settings
            .store_retry
            .run("release claim", || self.store.release_claim(claim, next_activation))
            .await
    }

    /// Release a claim that cannot be executed here, retrying much later
    async fn defer(&self, claim: &ClaimToken) {
        let retry_at = add_duration(Utc::now(), self.settings.unknown_type_retry_delay);
        if let Err(e) = self.release_claim(claim, retry_at).await {
            error!(error = %e, "failed to release claim of unexecutable instance");
        }
    }

    /// Run the state handler on its own task so a panic becomes a handler fault
    async fn run_handler(
        &self,
        definition: &WorkflowDefinition,
        mut ctx: ExecutionContext,
    ) -> (ExecutionContext, HandlerResult) {
        let handler = match definition.handler(ctx.state()) {
            Ok(Some(handler)) => Arc::clone(handler),
            Ok(None) => return (ctx, Ok(None)),
            Err(e) => return (ctx, Err(HandlerError::new(e.to_string()))),
        };

        // A panicking handler loses its writes, which failures discard anyway
        let fallback = ctx.clone();
        let task = tokio::spawn(
            async move {
                let result = handler.execute(&mut ctx).await;
                (ctx, result)
            }
            .in_current_span(),
        );

        match task.await {
            Ok(completed) => completed,
            Err(e) => {
                let message = match e.try_into_panic() {
                    Ok(panic) => panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string()),
                    Err(e) => e.to_string(),
                };
                (
                    fallback,
                    Err(HandlerError::new(format!("state handler panicked: {}", message))),
                )
            }
        }
    }

    /// Decide whether the handler's result counts as a success
    fn judge(
        &self,
        definition: &WorkflowDefinition,
        state: &StateInfo<'_>,
        ctx: &ExecutionContext,
        result: HandlerResult,
        now: DateTime<Utc>,
    ) -> Verdict {
        let action = match result {
            Ok(action) => action,
            Err(e) => {
                return Verdict::Failure {
                    reason: e.message,
                    retry_at: e.retry_at,
                }
            }
        };

        if let Err(e) = validate_variables(ctx.updated_variables(), self.settings.max_variable_length)
        {
            return Verdict::Failure {
                reason: e.to_string(),
                retry_at: None,
            };
        }

        let (target, activation, stop, reason) = match action {
            None => {
                return match state.state_type {
                    StateType::Manual | StateType::End => Verdict::Success {
                        state: state.name.to_string(),
                        status: InstanceStatus::for_state_type(state.state_type),
                        next_activation: None,
                        reason: format!("resting in {} state", state.state_type),
                    },
                    _ => Verdict::Failure {
                        reason: "state handler returned no next action".to_string(),
                        retry_at: None,
                    },
                };
            }
            Some(NextAction::RetryAfter { activation, reason }) => {
                return Verdict::Failure {
                    reason,
                    retry_at: Some(activation),
                }
            }
            Some(NextAction::MoveToState {
                state,
                activation,
                reason,
            }) => (state, activation, false, reason),
            Some(NextAction::StopInState { state, reason }) => (state, None, true, reason),
        };

        if !definition.is_transition_permitted(state.name, &target) {
            return Verdict::Failure {
                reason: format!("illegal state transition: {} -> {}", state.name, target),
                retry_at: None,
            };
        }

        let target_type = match definition.get_state(&target) {
            Ok(info) => info.state_type,
            Err(e) => {
                return Verdict::Failure {
                    reason: e.to_string(),
                    retry_at: None,
                }
            }
        };

        let (status, next_activation) = match (stop, InstanceStatus::for_state_type(target_type)) {
            (_, InstanceStatus::Finished) => (InstanceStatus::Finished, None),
            (true, _) | (_, InstanceStatus::Manual) => (InstanceStatus::Manual, None),
            (false, status) => (status, Some(activation.unwrap_or(now))),
        };

        Verdict::Success {
            state: target,
            status,
            next_activation,
            reason,
        }
    }

    /// Turn a verdict into the outcome to persist and the step to report
    #[allow(clippy::too_many_arguments)]
    fn resolve(
        &self,
        definition: &WorkflowDefinition,
        state: &StateInfo<'_>,
        instance: &WorkflowInstance,
        ctx: &mut ExecutionContext,
        verdict: Verdict,
        execution_start: DateTime<Utc>,
        execution_end: DateTime<Utc>,
    ) -> (ExecutionOutcome, StepOutcome, Option<String>) {
        let action = |action_type, state_text: &str| NewAction {
            action_type,
            state: instance.state.clone(),
            state_text: Some(state_text.to_string()),
            retry_no: instance.retries,
            execution_start,
            execution_end,
        };

        match verdict {
            Verdict::Success {
                state: target,
                status,
                next_activation,
                reason,
            } => {
                let outcome = ExecutionOutcome {
                    state: target.clone(),
                    state_text: Some(reason.clone()),
                    status,
                    next_activation,
                    retries: 0,
                    updated_variables: ctx.take_updated_variables(),
                    action: action(ActionType::StateExecution, &reason),
                };
                let step = StepOutcome::Advanced {
                    state: target,
                    status,
                    next_activation,
                };
                (outcome, step, None)
            }
            Verdict::Failure { reason, retry_at } => {
                // Variables written by a failed attempt are discarded
                ctx.take_updated_variables();
                let retries = instance.retries.saturating_add(1);

                if retries > state.max_retries {
                    let error_state = state.error_state.to_string();
                    let error_type = definition
                        .state(&error_state)
                        .map(|s| s.state_type())
                        .unwrap_or(StateType::Manual);
                    let status = InstanceStatus::for_state_type(error_type);
                    let next_activation = status.is_scheduled().then_some(execution_end);
                    let text = format!("max retries exceeded: {}", reason);

                    warn!(
                        retries,
                        max_retries = state.max_retries,
                        error_state = %error_state,
                        "retry limit exceeded, moving to error state"
                    );
                    let outcome = ExecutionOutcome {
                        state: error_state.clone(),
                        state_text: Some(text.clone()),
                        status,
                        next_activation,
                        retries: 0,
                        updated_variables: Default::default(),
                        action: action(ActionType::StateExecutionFailed, &text),
                    };
                    let step = StepOutcome::MovedToErrorState {
                        state: error_state,
                        status,
                        next_activation,
                    };
                    (outcome, step, Some(reason))
                } else {
                    let backoff = &self.settings.backoff;
                    let next_activation = match retry_at {
                        Some(at) => backoff.explicit_activation(execution_end, at),
                        None => backoff.next_activation(execution_end, retries),
                    };

                    debug!(retries, %next_activation, error = %reason, "scheduling retry");
                    let outcome = ExecutionOutcome {
                        state: instance.state.clone(),
                        state_text: Some(reason.clone()),
                        status: InstanceStatus::InProgress,
                        next_activation: Some(next_activation),
                        retries,
                        updated_variables: Default::default(),
                        action: action(ActionType::StateExecutionFailed, &reason),
                    };
                    let step = StepOutcome::RetryScheduled {
                        retries,
                        next_activation,
                    };
                    (outcome, step, Some(reason))
                }
            }
        }
    }
}
