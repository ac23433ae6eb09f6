//! End-to-end scenarios against the in-memory store
//!
//! Each cycle claims due instances and executes them the way a running
//! dispatcher would, without timers.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use stateflow_engine::definition::{
    FnHandler, HandlerError, StateDefinition, WorkflowDefinition, WorkflowDefinitionRegistry,
};
use stateflow_engine::engine::{ExecutionContext, ExecutionError, ListenerChain, StateExecutor};
use stateflow_engine::persistence::{
    ActionType, InMemoryInstanceStore, InstanceStatus, InstanceStore, NewExecutor, NewInstance,
};

struct Engine {
    store: Arc<InMemoryInstanceStore>,
    executor: StateExecutor,
}

impl Engine {
    fn new(definitions: Vec<WorkflowDefinition>) -> Self {
        let store = Arc::new(InMemoryInstanceStore::new());
        let mut registry = WorkflowDefinitionRegistry::new();
        for definition in definitions {
            registry.register(definition).unwrap();
        }
        let executor = StateExecutor::new(
            store.clone(),
            Arc::new(registry),
            Arc::new(ListenerChain::new()),
        );
        Self { store, executor }
    }

    async fn register(&self, lease: Duration) -> Uuid {
        self.store
            .register_executor(
                NewExecutor {
                    host: "scenario".into(),
                    pid: 1,
                    executor_group: "default".into(),
                },
                lease,
            )
            .await
            .unwrap()
            .id
    }

    /// Make the instance due, claim it and execute it once
    async fn cycle(&self, executor_id: Uuid, instance_id: Uuid) -> Result<(), ExecutionError> {
        self.store.make_due(instance_id);
        let claimed = self
            .store
            .claim_due_instances(executor_id, "default", 1)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1, "instance {} was not claimable", instance_id);
        self.executor.execute(claimed.into_iter().next().unwrap()).await?;
        Ok(())
    }
}

fn demo() -> WorkflowDefinition {
    WorkflowDefinition::builder("demo")
        .start_state("start")
        .error_state("error")
        .state(StateDefinition::start("start").with_handler(FnHandler::new(
            |ctx: &mut ExecutionContext| Ok(Some(ctx.move_to("process", "started"))),
        )))
        .state(StateDefinition::normal("process").with_handler(FnHandler::new(
            |ctx: &mut ExecutionContext| {
                let a: u32 = ctx.variable_as("a")?;
                ctx.set_variable("a", a + 1);
                Ok(Some(ctx.move_to("done", "processed")))
            },
        )))
        .state(StateDefinition::end("done"))
        .state(StateDefinition::manual("error"))
        .permit("start", "process")
        .permit("process", "done")
        .build()
        .unwrap()
}

fn always_failing(attempts: Arc<AtomicU32>) -> WorkflowDefinition {
    WorkflowDefinition::builder("failing")
        .start_state("start")
        .error_state("error")
        .state(StateDefinition::start("start").with_handler(FnHandler::new(
            |ctx: &mut ExecutionContext| Ok(Some(ctx.move_to("x", "started"))),
        )))
        .state(
            StateDefinition::normal("x")
                .with_handler(FnHandler::new(move |_ctx: &mut ExecutionContext| {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(HandlerError::new("downstream unavailable"))
                }))
                .with_max_retries(2),
        )
        .state(StateDefinition::end("done"))
        .state(StateDefinition::manual("error"))
        .permit("start", "x")
        .permit("x", "done")
        .build()
        .unwrap()
}

#[test_log::test(tokio::test)]
async fn demo_workflow_runs_to_completion() {
    let engine = Engine::new(vec![demo()]);
    let executor_id = engine.register(Duration::from_secs(60)).await;
    let id = engine
        .store
        .insert_instance(
            NewInstance::new("demo", "start")
                .with_variable("a", "1")
                .with_variable("b", "2"),
        )
        .await
        .unwrap();

    engine.cycle(executor_id, id).await.unwrap();
    let instance = engine.store.get_instance(id).await.unwrap();
    assert_eq!(instance.state, "process");
    assert_eq!(instance.status, InstanceStatus::InProgress);
    assert_eq!(instance.retries, 0);

    engine.cycle(executor_id, id).await.unwrap();
    let instance = engine.store.get_instance(id).await.unwrap();
    assert_eq!(instance.state, "done");
    assert_eq!(instance.status, InstanceStatus::Finished);
    assert_eq!(instance.next_activation, None);

    // Only `a` was written; `b` is untouched
    assert_eq!(instance.variables["a"], "2");
    assert_eq!(instance.variables["b"], "2");

    let actions = engine.store.list_actions(id).await.unwrap();
    assert_eq!(actions.len(), 2);
    assert_eq!(actions[0].state, "start");
    assert_eq!(actions[1].state, "process");
    assert_eq!(actions[1].updated_variables.len(), 1);
    assert_eq!(actions[1].updated_variables["a"], "2");
}

#[test_log::test(tokio::test)]
async fn exhausted_retries_route_to_error_state() {
    let attempts = Arc::new(AtomicU32::new(0));
    let engine = Engine::new(vec![always_failing(attempts.clone())]);
    let executor_id = engine.register(Duration::from_secs(60)).await;
    let id = engine
        .store
        .insert_instance(NewInstance::new("failing", "start"))
        .await
        .unwrap();
    engine.cycle(executor_id, id).await.unwrap();

    for expected in 1..=2 {
        engine.cycle(executor_id, id).await.unwrap();
        let instance = engine.store.get_instance(id).await.unwrap();
        assert_eq!(instance.state, "x");
        assert_eq!(instance.retries, expected);
        assert_eq!(instance.status, InstanceStatus::InProgress);
    }

    engine.cycle(executor_id, id).await.unwrap();
    let instance = engine.store.get_instance(id).await.unwrap();
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(instance.state, "error");
    assert_eq!(instance.retries, 0);
    assert_eq!(instance.status, InstanceStatus::Manual);

    let failures = engine
        .store
        .list_actions(id)
        .await
        .unwrap()
        .into_iter()
        .filter(|a| a.action_type == ActionType::StateExecutionFailed)
        .count();
    assert_eq!(failures, 3);
}

#[test_log::test(tokio::test)]
async fn live_claims_are_mutually_exclusive() {
    let engine = Engine::new(vec![demo()]);
    let first = engine.register(Duration::from_secs(60)).await;
    let second = engine.register(Duration::from_secs(60)).await;
    for _ in 0..20 {
        engine
            .store
            .insert_instance(NewInstance::new("demo", "start").with_variable("a", "0"))
            .await
            .unwrap();
    }

    let store: Arc<dyn InstanceStore> = engine.store.clone();
    let (a, b) = tokio::join!(
        store.claim_due_instances(first, "default", 15),
        store.claim_due_instances(second, "default", 15),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.len() + b.len(), 20);
    assert!(a.iter().all(|i| !b.iter().any(|j| j.id == i.id)));
    assert!(store
        .claim_due_instances(first, "default", 10)
        .await
        .unwrap()
        .is_empty());
}

#[test_log::test(tokio::test)]
async fn expired_lease_makes_instance_reclaimable() {
    let engine = Engine::new(vec![demo()]);
    let crashed = engine.register(Duration::from_secs(60)).await;
    let survivor = engine.register(Duration::from_secs(60)).await;
    let id = engine
        .store
        .insert_instance(NewInstance::new("demo", "start"))
        .await
        .unwrap();

    let claimed = engine
        .store
        .claim_due_instances(crashed, "default", 1)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    assert!(engine
        .store
        .claim_due_instances(survivor, "default", 1)
        .await
        .unwrap()
        .is_empty());

    engine.store.expire_executor(crashed);
    let reclaimed = engine
        .store
        .claim_due_instances(survivor, "default", 1)
        .await
        .unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].executor_id, Some(survivor));

    // The crashed executor's late write-back is rejected
    let stale = claimed.into_iter().next().unwrap();
    let result = engine.executor.execute(stale).await;
    assert!(result.is_err());

    engine.executor.execute(reclaimed.into_iter().next().unwrap()).await.unwrap();
    assert_eq!(engine.store.get_instance(id).await.unwrap().state, "process");
}

#[test_log::test(tokio::test)]
async fn unknown_workflow_type_stays_claimable() {
    let engine = Engine::new(vec![demo()]);
    let executor_id = engine.register(Duration::from_secs(60)).await;
    let id = engine
        .store
        .insert_instance(NewInstance::new("retired", "start"))
        .await
        .unwrap();

    let result = engine.cycle(executor_id, id).await;
    assert!(matches!(
        result,
        Err(ExecutionError::UnknownWorkflowType { .. })
    ));

    let instance = engine.store.get_instance(id).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Executing);
    assert_eq!(instance.executor_id, None);
    assert!(instance.next_activation.unwrap() > Utc::now());

    // Claimable again once due
    engine.store.make_due(id);
    let claimed = engine
        .store
        .claim_due_instances(executor_id, "default", 1)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
}
