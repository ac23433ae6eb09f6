//! Execution context handed to state handlers

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::definition::{HandlerError, NextAction};
use crate::persistence::WorkflowInstance;
use crate::reliability::add_duration;

/// View of one claimed instance during a single handler invocation
///
/// Variable writes are collected here and persisted together with the
/// outcome; they are discarded when the execution fails.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    instance_id: Uuid,
    workflow_type: String,
    state: String,
    business_key: Option<String>,
    external_id: String,
    retries: u32,
    started: DateTime<Utc>,
    variables: BTreeMap<String, String>,
    updated: BTreeMap<String, String>,
}

impl ExecutionContext {
    /// Build a context from a claimed instance snapshot
    pub fn new(instance: &WorkflowInstance) -> Self {
        Self {
            instance_id: instance.id,
            workflow_type: instance.workflow_type.clone(),
            state: instance.state.clone(),
            business_key: instance.business_key.clone(),
            external_id: instance.external_id.clone(),
            retries: instance.retries,
            started: Utc::now(),
            variables: instance.variables.clone(),
            updated: BTreeMap::new(),
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn workflow_type(&self) -> &str {
        &self.workflow_type
    }

    /// State being executed
    pub fn state(&self) -> &str {
        &self.state
    }

    pub fn business_key(&self) -> Option<&str> {
        self.business_key.as_deref()
    }

    pub fn external_id(&self) -> &str {
        &self.external_id
    }

    /// Consecutive failed attempts in the current state
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// When this execution started
    pub fn started(&self) -> DateTime<Utc> {
        self.started
    }

    /// Read a state variable
    pub fn variable(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(String::as_str)
    }

    /// Read a state variable, falling back to a default
    pub fn variable_or<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        self.variable(name).unwrap_or(default)
    }

    /// Read and parse a required state variable
    pub fn variable_as<T>(&self, name: &str) -> Result<T, HandlerError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let raw = self
            .variable(name)
            .ok_or_else(|| HandlerError::new(format!("missing state variable {}", name)))?;
        raw.parse()
            .map_err(|e| HandlerError::new(format!("invalid state variable {}: {}", name, e)))
    }

    /// Read a JSON-encoded state variable
    pub fn json_variable<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, HandlerError> {
        self.variable(name)
            .map(|raw| {
                serde_json::from_str(raw).map_err(|e| {
                    HandlerError::new(format!("invalid JSON in state variable {}: {}", name, e))
                })
            })
            .transpose()
    }

    /// Write a state variable
    pub fn set_variable(&mut self, name: impl Into<String>, value: impl ToString) {
        let name = name.into();
        let value = value.to_string();
        if self.variables.get(&name) != Some(&value) {
            self.variables.insert(name.clone(), value.clone());
            self.updated.insert(name, value);
        }
    }

    /// Write a JSON-encoded state variable
    pub fn set_json_variable<T: Serialize>(
        &mut self,
        name: impl Into<String>,
        value: &T,
    ) -> Result<(), HandlerError> {
        let encoded = serde_json::to_string(value)
            .map_err(|e| HandlerError::new(format!("failed to encode state variable: {}", e)))?;
        self.set_variable(name, encoded);
        Ok(())
    }

    /// All variables, including writes made during this execution
    pub fn variables(&self) -> &BTreeMap<String, String> {
        &self.variables
    }

    /// Variables written during this execution
    pub fn updated_variables(&self) -> &BTreeMap<String, String> {
        &self.updated
    }

    pub(crate) fn take_updated_variables(&mut self) -> BTreeMap<String, String> {
        std::mem::take(&mut self.updated)
    }

    /// Move to `state` immediately
    pub fn move_to(&self, state: impl Into<String>, reason: impl Into<String>) -> NextAction {
        NextAction::move_to_state(state, reason)
    }

    /// Move to `state` after `delay`
    pub fn move_to_after(
        &self,
        state: impl Into<String>,
        delay: Duration,
        reason: impl Into<String>,
    ) -> NextAction {
        NextAction::move_to_state_after(state, add_duration(Utc::now(), delay), reason)
    }

    /// Move to `state` and stop scheduling
    pub fn stop_in(&self, state: impl Into<String>, reason: impl Into<String>) -> NextAction {
        NextAction::stop_in_state(state, reason)
    }

    /// Retry the current state after `delay`
    pub fn retry_after(&self, delay: Duration, reason: impl Into<String>) -> NextAction {
        NextAction::retry_after(add_duration(Utc::now(), delay), reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InstanceStatus;
    use serde::Deserialize;

    fn instance() -> WorkflowInstance {
        let now = Utc::now();
        WorkflowInstance {
            id: Uuid::now_v7(),
            workflow_type: "demo".into(),
            executor_group: "default".into(),
            business_key: Some("order-7".into()),
            external_id: "ext-7".into(),
            state: "process".into(),
            state_text: None,
            status: InstanceStatus::Executing,
            next_activation: Some(now),
            retries: 2,
            priority: 0,
            executor_id: Some(Uuid::now_v7()),
            version: 3,
            variables: BTreeMap::from([
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string()),
            ]),
            created: now,
            modified: now,
            started: Some(now),
        }
    }

    #[test]
    fn test_context_exposes_instance() {
        let ctx = ExecutionContext::new(&instance());
        assert_eq!(ctx.workflow_type(), "demo");
        assert_eq!(ctx.state(), "process");
        assert_eq!(ctx.retries(), 2);
        assert_eq!(ctx.business_key(), Some("order-7"));
        assert_eq!(ctx.variable("a"), Some("1"));
        assert_eq!(ctx.variable_or("missing", "x"), "x");
    }

    #[test]
    fn test_only_changed_variables_are_tracked() {
        let mut ctx = ExecutionContext::new(&instance());
        ctx.set_variable("a", 10);
        ctx.set_variable("b", "2");

        assert_eq!(ctx.variable("a"), Some("10"));
        assert_eq!(
            ctx.updated_variables(),
            &BTreeMap::from([("a".to_string(), "10".to_string())])
        );
    }

    #[test]
    fn test_variable_parsing() {
        let ctx = ExecutionContext::new(&instance());
        let a: u32 = ctx.variable_as("a").unwrap();
        assert_eq!(a, 1);

        let missing = ctx.variable_as::<u32>("nope").unwrap_err();
        assert!(missing.message.contains("missing state variable nope"));
    }

    #[test]
    fn test_json_variables() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Order {
            id: u32,
            items: Vec<String>,
        }

        let mut ctx = ExecutionContext::new(&instance());
        let order = Order {
            id: 7,
            items: vec!["book".into()],
        };
        ctx.set_json_variable("order", &order).unwrap();

        assert_eq!(ctx.json_variable::<Order>("order").unwrap(), Some(order));
        assert_eq!(ctx.json_variable::<Order>("missing").unwrap(), None);
        assert!(ctx.json_variable::<Order>("a").is_err());
    }

    #[test]
    fn test_action_helpers() {
        let ctx = ExecutionContext::new(&instance());

        let action = ctx.move_to_after("done", Duration::from_secs(60), "later");
        match action {
            NextAction::MoveToState { state, activation, .. } => {
                assert_eq!(state, "done");
                assert!(activation.unwrap() > Utc::now());
            }
            other => panic!("unexpected action {:?}", other),
        }

        assert!(matches!(ctx.stop_in("review", "hold"), NextAction::StopInState { .. }));
        assert!(matches!(
            ctx.retry_after(Duration::from_secs(5), "busy"),
            NextAction::RetryAfter { .. }
        ));
    }
}
