// Execution Listeners
//
// Observers notified around every state execution. Listeners are used for
// metrics, audit logging and alerting on slow handlers. They never influence
// the outcome of an execution: errors, panics and timeouts inside a listener
// are logged and otherwise ignored.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use tracing::{debug, info, warn};

use super::context::ExecutionContext;
use crate::definition::WorkflowDefinition;
use crate::persistence::{InstanceStatus, WorkflowInstance};

// ============================================================================
// Listener types
// ============================================================================

/// What a listener gets to see about one execution
#[derive(Debug, Clone, Copy)]
pub struct ListenerContext<'a> {
    pub definition: &'a WorkflowDefinition,
    /// Instance snapshot as claimed
    pub instance: &'a WorkflowInstance,
    pub execution: &'a ExecutionContext,
}

/// Persisted result of one execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Handler succeeded and the instance moved on
    Advanced {
        state: String,
        status: InstanceStatus,
        next_activation: Option<DateTime<Utc>>,
    },

    /// Handler failed and the state will be retried
    RetryScheduled {
        retries: u32,
        next_activation: DateTime<Utc>,
    },

    /// Retry limit exceeded; the instance moved to its error state
    MovedToErrorState {
        state: String,
        status: InstanceStatus,
        next_activation: Option<DateTime<Utc>>,
    },
}

impl StepOutcome {
    /// State the instance is in after the step
    pub fn state<'a>(&'a self, current: &'a str) -> &'a str {
        match self {
            Self::Advanced { state, .. } | Self::MovedToErrorState { state, .. } => state,
            Self::RetryScheduled { .. } => current,
        }
    }
}

// ============================================================================
// ExecutionListener Trait
// ============================================================================

/// Trait for observing state executions
///
/// All methods default to doing nothing. Listeners should be fast; a call
/// that exceeds the chain's timeout is abandoned.
///
/// # Example
///
/// ```ignore
/// struct FailureCounter(AtomicU64);
///
/// #[async_trait]
/// impl ExecutionListener for FailureCounter {
///     async fn after_failure(&self, _ctx: ListenerContext<'_>, _error: &str, _outcome: &StepOutcome)
///         -> anyhow::Result<()>
///     {
///         self.0.fetch_add(1, Ordering::Relaxed);
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait ExecutionListener: Send + Sync {
    /// Called before the state handler runs
    async fn before_execution(&self, _ctx: ListenerContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called after a successful execution was persisted
    async fn after_execution(
        &self,
        _ctx: ListenerContext<'_>,
        _outcome: &StepOutcome,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called after a failed execution was persisted
    async fn after_failure(
        &self,
        _ctx: ListenerContext<'_>,
        _error: &str,
        _outcome: &StepOutcome,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called when a handler ran longer than the state's warning threshold
    async fn slow_execution(
        &self,
        _ctx: ListenerContext<'_>,
        _elapsed: Duration,
        _threshold: Duration,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Human-readable name for logging
    fn name(&self) -> &'static str {
        "ExecutionListener"
    }
}

// ============================================================================
// LoggingListener
// ============================================================================

/// Listener that writes one log line per execution
#[derive(Debug, Clone, Default)]
pub struct LoggingListener;

#[async_trait]
impl ExecutionListener for LoggingListener {
    async fn before_execution(&self, ctx: ListenerContext<'_>) -> anyhow::Result<()> {
        debug!(
            instance_id = %ctx.instance.id,
            workflow_type = %ctx.instance.workflow_type,
            state = %ctx.instance.state,
            retries = ctx.instance.retries,
            "executing state"
        );
        Ok(())
    }

    async fn after_execution(
        &self,
        ctx: ListenerContext<'_>,
        outcome: &StepOutcome,
    ) -> anyhow::Result<()> {
        info!(
            instance_id = %ctx.instance.id,
            from = %ctx.instance.state,
            to = %outcome.state(&ctx.instance.state),
            "state executed"
        );
        Ok(())
    }

    async fn after_failure(
        &self,
        ctx: ListenerContext<'_>,
        error: &str,
        outcome: &StepOutcome,
    ) -> anyhow::Result<()> {
        warn!(
            instance_id = %ctx.instance.id,
            state = %ctx.instance.state,
            next_state = %outcome.state(&ctx.instance.state),
            error,
            "state execution failed"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "LoggingListener"
    }
}

// ============================================================================
// ListenerChain
// ============================================================================

/// Ordered set of listeners, each isolated from the others
pub struct ListenerChain {
    listeners: Vec<Arc<dyn ExecutionListener>>,
    timeout: Duration,
}

impl Default for ListenerChain {
    fn default() -> Self {
        Self::new()
    }
}

impl ListenerChain {
    /// Create an empty chain
    pub fn new() -> Self {
        Self {
            listeners: Vec::new(),
            timeout: Duration::from_secs(5),
        }
    }

    /// Add a listener to the end of the chain
    pub fn with_listener(mut self, listener: Arc<dyn ExecutionListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Set the per-call timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Add a listener
    pub fn add(&mut self, listener: Arc<dyn ExecutionListener>) {
        self.listeners.push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub(crate) async fn before_execution(&self, ctx: ListenerContext<'_>) {
        for listener in &self.listeners {
            self.isolate(listener.name(), "before_execution", listener.before_execution(ctx))
                .await;
        }
    }

    pub(crate) async fn after_execution(&self, ctx: ListenerContext<'_>, outcome: &StepOutcome) {
        for listener in &self.listeners {
            self.isolate(
                listener.name(),
                "after_execution",
                listener.after_execution(ctx, outcome),
            )
            .await;
        }
    }

    pub(crate) async fn after_failure(
        &self,
        ctx: ListenerContext<'_>,
        error: &str,
        outcome: &StepOutcome,
    ) {
        for listener in &self.listeners {
            self.isolate(
                listener.name(),
                "after_failure",
                listener.after_failure(ctx, error, outcome),
            )
            .await;
        }
    }

    pub(crate) async fn slow_execution(
        &self,
        ctx: ListenerContext<'_>,
        elapsed: Duration,
        threshold: Duration,
    ) {
        for listener in &self.listeners {
            self.isolate(
                listener.name(),
                "slow_execution",
                listener.slow_execution(ctx, elapsed, threshold),
            )
            .await;
        }
    }

    async fn isolate<F>(&self, listener: &'static str, hook: &'static str, call: F)
    where
        F: std::future::Future<Output = anyhow::Result<()>>,
    {
        let guarded = AssertUnwindSafe(call).catch_unwind();
        match tokio::time::timeout(self.timeout, guarded).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => {
                warn!(listener, hook, error = %e, "execution listener failed");
            }
            Ok(Err(_)) => {
                warn!(listener, hook, "execution listener panicked");
            }
            Err(_) => {
                warn!(listener, hook, timeout = ?self.timeout, "execution listener timed out");
            }
        }
    }
}
