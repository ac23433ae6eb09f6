//! Backoff policy for failed state executions

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::duration_millis;
use crate::persistence::StoreError;

/// Binary exponential backoff between consecutive failures in one state
///
/// The delay before retry number `n` (the instance's `retries` after the
/// failure was counted) is `min(max_delay, base_delay * 2^n)`.
///
/// # Example
///
/// ```
/// use stateflow_engine::BackoffPolicy;
/// use std::time::Duration;
///
/// let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(60));
///
/// assert_eq!(policy.next_delay(0), Duration::from_secs(1));
/// assert_eq!(policy.next_delay(3), Duration::from_secs(8));
/// assert_eq!(policy.next_delay(20), Duration::from_secs(60));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackoffPolicy {
    /// Delay for the first retry
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,

    /// Upper bound for any computed delay
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,

    /// Whether handler-supplied retry times are also capped by `max_delay`
    #[serde(default)]
    pub cap_explicit_delay: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(3600))
    }
}

impl BackoffPolicy {
    /// Create a policy with the given base and maximum delay
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            cap_explicit_delay: false,
        }
    }

    /// Create a policy that retries immediately
    pub fn immediate() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    /// Set the base delay
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the maximum delay
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Cap explicit handler-supplied retry times by `max_delay`
    pub fn with_cap_explicit_delay(mut self, cap: bool) -> Self {
        self.cap_explicit_delay = cap;
        self
    }

    /// Delay before the next attempt after `retries` consecutive failures
    pub fn next_delay(&self, retries: u32) -> Duration {
        // 2^32 overflows any Duration anyway, so saturate early
        let factor = 1u32.checked_shl(retries.min(31)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(Duration::MAX)
            .min(self.max_delay)
    }

    /// Absolute activation time for the next attempt
    pub fn next_activation(&self, now: DateTime<Utc>, retries: u32) -> DateTime<Utc> {
        add_duration(now, self.next_delay(retries))
    }

    /// Resolve a handler-supplied retry time against this policy
    ///
    /// Returns the requested time unchanged unless explicit delays are capped.
    pub fn explicit_activation(
        &self,
        now: DateTime<Utc>,
        requested: DateTime<Utc>,
    ) -> DateTime<Utc> {
        if !self.cap_explicit_delay {
            return requested;
        }
        let latest = add_duration(now, self.max_delay);
        requested.min(latest)
    }
}

/// Bounded retries for store calls that fail transiently
///
/// Only [`StoreError::is_transient`] errors are retried; conflicts and
/// rejected input are returned on the first attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreRetry {
    /// Total attempts, including the first
    pub attempts: u32,

    /// Delay between attempts
    pub backoff: BackoffPolicy,
}

impl Default for StoreRetry {
    fn default() -> Self {
        Self::new(
            3,
            BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(2)),
        )
    }
}

impl StoreRetry {
    /// Create a retry budget of `attempts` calls spaced by `backoff`
    pub fn new(attempts: u32, backoff: BackoffPolicy) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
        }
    }

    /// Call the store once, never retrying
    pub fn none() -> Self {
        Self::new(1, BackoffPolicy::immediate())
    }

    /// Run `call` until it succeeds, fails permanently or the budget is spent
    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Err(e) if e.is_transient() && attempt + 1 < self.attempts => {
                    let delay = self.backoff.next_delay(attempt);
                    attempt += 1;
                    warn!(
                        error = %e,
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "store call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                result => return result,
            }
        }
    }
}

pub(crate) fn add_duration(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
