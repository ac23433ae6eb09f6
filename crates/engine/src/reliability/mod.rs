//! Reliability patterns for state execution
//!
//! This module provides:
//! - [`BackoffPolicy`] - Binary exponential backoff between failed attempts
//! - [`StoreRetry`] - Bounded retries of transient store errors

mod retry;

pub use retry::{BackoffPolicy, StoreRetry};
pub(crate) use retry::add_duration;
