//! Engine configuration
//!
//! All values are read-only once an engine node is started. Durations are
//! serialized as milliseconds.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::reliability::BackoffPolicy;

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// Invalid configuration value
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// Environment variable could not be parsed
    #[error("invalid value for {name}: {value}")]
    InvalidEnv { name: String, value: String },
}

/// Configuration for one executor process
///
/// # Example
///
/// ```
/// use stateflow_engine::EngineConfig;
/// use std::time::Duration;
///
/// let config = EngineConfig::default()
///     .with_executor_group("billing")
///     .with_pool_size(32)
///     .with_poll_interval(Duration::from_millis(500));
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Executors only claim instances of their own group
    pub executor_group: String,

    /// Sleep between polls when nothing was claimed
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// Maximum number of concurrently executing instances
    pub pool_size: usize,

    /// How long an executor lease stays valid without a heartbeat
    #[serde(with = "duration_millis")]
    pub lease_duration: Duration,

    /// Interval between executor heartbeats
    #[serde(with = "duration_millis")]
    pub heartbeat_interval: Duration,

    /// Maximum wait for in-flight executions on shutdown
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,

    /// Backoff between failed attempts
    pub backoff: BackoffPolicy,

    /// Maximum length of a single state variable value, in bytes
    pub max_variable_length: usize,

    /// Delay before an instance of an unregistered workflow type is retried
    #[serde(with = "duration_millis")]
    pub unknown_type_retry_delay: Duration,

    /// Interval of the orphaned-instance recovery sweep
    #[serde(with = "duration_millis")]
    pub recovery_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            executor_group: "default".to_string(),
            poll_interval: Duration::from_secs(2),
            pool_size: 10,
            lease_duration: Duration::from_secs(15 * 60),
            heartbeat_interval: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(60),
            backoff: BackoffPolicy::default(),
            max_variable_length: 10_000,
            unknown_type_retry_delay: Duration::from_secs(60 * 60),
            recovery_interval: Duration::from_secs(60),
        }
    }
}

impl EngineConfig {
    /// Create a configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from `STATEFLOW_*` environment variables
    ///
    /// Unset variables fall back to defaults. Durations are milliseconds.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let backoff = BackoffPolicy {
            base_delay: env_millis("STATEFLOW_BACKOFF_BASE_MS")?
                .unwrap_or(defaults.backoff.base_delay),
            max_delay: env_millis("STATEFLOW_BACKOFF_MAX_MS")?
                .unwrap_or(defaults.backoff.max_delay),
            cap_explicit_delay: env_parse("STATEFLOW_BACKOFF_CAP_EXPLICIT")?
                .unwrap_or(defaults.backoff.cap_explicit_delay),
        };

        let config = Self {
            executor_group: std::env::var("STATEFLOW_EXECUTOR_GROUP")
                .unwrap_or(defaults.executor_group),
            poll_interval: env_millis("STATEFLOW_POLL_INTERVAL_MS")?
                .unwrap_or(defaults.poll_interval),
            pool_size: env_parse("STATEFLOW_POOL_SIZE")?.unwrap_or(defaults.pool_size),
            lease_duration: env_millis("STATEFLOW_LEASE_DURATION_MS")?
                .unwrap_or(defaults.lease_duration),
            heartbeat_interval: env_millis("STATEFLOW_HEARTBEAT_INTERVAL_MS")?
                .unwrap_or(defaults.heartbeat_interval),
            shutdown_timeout: env_millis("STATEFLOW_SHUTDOWN_TIMEOUT_MS")?
                .unwrap_or(defaults.shutdown_timeout),
            backoff,
            max_variable_length: env_parse("STATEFLOW_MAX_VARIABLE_LENGTH")?
                .unwrap_or(defaults.max_variable_length),
            unknown_type_retry_delay: env_millis("STATEFLOW_UNKNOWN_TYPE_RETRY_MS")?
                .unwrap_or(defaults.unknown_type_retry_delay),
            recovery_interval: env_millis("STATEFLOW_RECOVERY_INTERVAL_MS")?
                .unwrap_or(defaults.recovery_interval),
        };

        config.validate()?;
        Ok(config)
    }

    /// Set the executor group
    pub fn with_executor_group(mut self, group: impl Into<String>) -> Self {
        self.executor_group = group.into();
        self
    }

    /// Set the poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the worker pool size
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size.max(1);
        self
    }

    /// Set the executor lease duration
    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }

    /// Set the heartbeat interval
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set the backoff policy
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the maximum state variable length
    pub fn with_max_variable_length(mut self, length: usize) -> Self {
        self.max_variable_length = length;
        self
    }

    /// Set the retry delay for unregistered workflow types
    pub fn with_unknown_type_retry_delay(mut self, delay: Duration) -> Self {
        self.unknown_type_retry_delay = delay;
        self
    }

    /// Set the recovery sweep interval
    pub fn with_recovery_interval(mut self, interval: Duration) -> Self {
        self.recovery_interval = interval;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size == 0 {
            return Err(ConfigError::Invalid("pool_size must be at least 1".into()));
        }
        if self.executor_group.trim().is_empty() {
            return Err(ConfigError::Invalid("executor_group must not be empty".into()));
        }
        if self.lease_duration.is_zero() {
            return Err(ConfigError::Invalid("lease_duration must be positive".into()));
        }
        if self.heartbeat_interval.is_zero() || self.heartbeat_interval >= self.lease_duration {
            return Err(ConfigError::Invalid(
                "heartbeat_interval must be positive and shorter than lease_duration".into(),
            ));
        }
        if self.poll_interval.is_zero() || self.recovery_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "poll_interval and recovery_interval must be positive".into(),
            ));
        }
        if self.backoff.base_delay > self.backoff.max_delay {
            return Err(ConfigError::Invalid(
                "backoff base_delay must not exceed max_delay".into(),
            ));
        }
        Ok(())
    }
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv {
                name: name.to_string(),
                value,
            }),
        Err(_) => Ok(None),
    }
}

fn env_millis(name: &str) -> Result<Option<Duration>, ConfigError> {
    Ok(env_parse::<u64>(name)?.map(Duration::from_millis))
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
