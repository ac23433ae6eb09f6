//! State handlers and the actions they return

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::ExecutionContext;
use crate::reliability::add_duration;

/// Outcome declared by a state handler
///
/// Returned from [`StateHandler::execute`]. The engine validates the target
/// state against the definition's permitted transitions before persisting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NextAction {
    /// Move to `state`, activating at `activation` (immediately when `None`)
    MoveToState {
        state: String,
        activation: Option<DateTime<Utc>>,
        reason: String,
    },

    /// Move to `state` and park there without a next activation
    StopInState { state: String, reason: String },

    /// Stay in the current state and retry at `activation`
    ///
    /// Counts as a failed attempt against the state's retry limit.
    RetryAfter {
        activation: DateTime<Utc>,
        reason: String,
    },
}

impl NextAction {
    /// Move to a state and continue immediately
    pub fn move_to_state(state: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MoveToState {
            state: state.into(),
            activation: None,
            reason: reason.into(),
        }
    }

    /// Move to a state and continue at the given time
    pub fn move_to_state_after(
        state: impl Into<String>,
        activation: DateTime<Utc>,
        reason: impl Into<String>,
    ) -> Self {
        Self::MoveToState {
            state: state.into(),
            activation: Some(activation),
            reason: reason.into(),
        }
    }

    /// Move to a state without scheduling further execution
    pub fn stop_in_state(state: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StopInState {
            state: state.into(),
            reason: reason.into(),
        }
    }

    /// Retry the current state at the given time
    pub fn retry_after(activation: DateTime<Utc>, reason: impl Into<String>) -> Self {
        Self::RetryAfter {
            activation,
            reason: reason.into(),
        }
    }

    /// Target state, if the action leaves the current state
    pub fn target_state(&self) -> Option<&str> {
        match self {
            Self::MoveToState { state, .. } | Self::StopInState { state, .. } => Some(state),
            Self::RetryAfter { .. } => None,
        }
    }

    /// Human-readable reason recorded in the action history
    pub fn reason(&self) -> &str {
        match self {
            Self::MoveToState { reason, .. }
            | Self::StopInState { reason, .. }
            | Self::RetryAfter { reason, .. } => reason,
        }
    }
}

/// A failed handler invocation
///
/// Counted against the state's retry limit. Any `anyhow::Error` converts
/// into a `HandlerError`, so handlers can use `?` freely.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    /// Error message recorded in the action history
    pub message: String,

    /// Explicit retry time, overriding the backoff policy
    pub retry_at: Option<DateTime<Utc>>,
}

impl HandlerError {
    /// Create a new handler error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retry_at: None,
        }
    }

    /// Retry at an explicit time instead of the backoff delay
    pub fn with_retry_at(mut self, at: DateTime<Utc>) -> Self {
        self.retry_at = Some(at);
        self
    }

    /// Retry after an explicit delay from now
    pub fn with_retry_delay(self, delay: Duration) -> Self {
        self.with_retry_at(add_duration(Utc::now(), delay))
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(error: anyhow::Error) -> Self {
        Self::new(format!("{:#}", error))
    }
}

/// Result of one handler invocation
///
/// `Ok(None)` means the handler declared no next action; this is only
/// valid in `manual` states.
pub type HandlerResult = Result<Option<NextAction>, HandlerError>;

/// Application logic invoked while an instance is in a given state
///
/// Handlers may be executed more than once for the same state (at-least-once
/// execution), so their side effects must tolerate re-runs.
///
/// # Example
///
/// ```ignore
/// struct ChargeCard { gateway: Gateway }
///
/// #[async_trait]
/// impl StateHandler for ChargeCard {
///     async fn execute(&self, ctx: &mut ExecutionContext) -> HandlerResult {
///         let amount: u64 = ctx.variable_as("amount")?;
///         let receipt = self.gateway.charge(amount).await?;
///         ctx.set_variable("receipt", receipt);
///         Ok(Some(NextAction::move_to_state("notify", "card charged")))
///     }
/// }
/// ```
#[async_trait]
pub trait StateHandler: Send + Sync + 'static {
    /// Execute the state
    async fn execute(&self, ctx: &mut ExecutionContext) -> HandlerResult;
}

/// Adapter turning a synchronous closure into a [`StateHandler`]
pub struct FnHandler<F>(F);

impl<F> FnHandler<F>
where
    F: Fn(&mut ExecutionContext) -> HandlerResult + Send + Sync + 'static,
{
    /// Wrap a closure
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> StateHandler for FnHandler<F>
where
    F: Fn(&mut ExecutionContext) -> HandlerResult + Send + Sync + 'static,
{
    async fn execute(&self, ctx: &mut ExecutionContext) -> HandlerResult {
        (self.0)(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_move_to_state_action() {
        let action = NextAction::move_to_state("process", "started");

        assert_eq!(action.target_state(), Some("process"));
        assert_eq!(action.reason(), "started");
        assert!(matches!(
            action,
            NextAction::MoveToState {
                activation: None,
                ..
            }
        ));
    }

    #[test]
    fn test_retry_after_has_no_target() {
        let action = NextAction::retry_after(Utc::now(), "remote busy");
        assert_eq!(action.target_state(), None);
        assert_eq!(action.reason(), "remote busy");
    }

    #[test]
    fn test_action_serialization() {
        let action = NextAction::stop_in_state("review", "needs approval");
        let value = serde_json::to_value(&action).unwrap();

        assert_eq!(
            value,
            json!({"type": "stop_in_state", "state": "review", "reason": "needs approval"})
        );
    }

    #[test]
    fn test_handler_error_from_anyhow() {
        let error: HandlerError = anyhow::anyhow!("connection refused")
            .context("calling gateway")
            .into();

        assert_eq!(error.message, "calling gateway: connection refused");
        assert!(error.retry_at.is_none());
    }

    #[test]
    fn test_handler_error_retry_delay() {
        let before = Utc::now();
        let error = HandlerError::new("throttled").with_retry_delay(Duration::from_secs(30));

        let retry_at = error.retry_at.unwrap();
        assert!(retry_at >= before + chrono::Duration::seconds(30));
    }
}
