//! Integration tests for PostgresInstanceStore
//!
//! Run with: DATABASE_URL=postgres://... cargo test -p stateflow-engine --test postgres_integration_test
//!
//! Tests are skipped when DATABASE_URL is not set. Migrations are applied
//! automatically. Every test uses its own executor group and workflow type,
//! so tests can run in parallel against one database.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use stateflow_engine::persistence::{
    ActionType, ExecutionOutcome, InstanceFilter, InstanceStatus, InstanceStore, ManualUpdate,
    NewAction, NewExecutor, NewInstance, PostgresInstanceStore, StoreError, MIGRATOR,
};

/// Connect to the test database, or `None` when DATABASE_URL is unset
async fn create_test_store() -> Option<PostgresInstanceStore> {
    let Ok(database_url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set, skipping PostgreSQL test");
        return None;
    };
    let pool = PgPool::connect(&database_url)
        .await
        .expect("Failed to connect to PostgreSQL. Check DATABASE_URL.");
    MIGRATOR.run(&pool).await.expect("Failed to run migrations");
    Some(PostgresInstanceStore::new(pool).with_max_variable_length(64))
}

/// Unique names so parallel tests never see each other's rows
fn unique(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::now_v7())
}

async fn register(store: &PostgresInstanceStore, group: &str, lease: Duration) -> Uuid {
    store
        .register_executor(
            NewExecutor {
                host: "integration".into(),
                pid: 42,
                executor_group: group.to_string(),
            },
            lease,
        )
        .await
        .unwrap()
        .id
}

async fn cleanup(store: &PostgresInstanceStore, workflow_type: &str, group: &str) {
    sqlx::query("DELETE FROM stateflow_instances WHERE workflow_type = $1")
        .bind(workflow_type)
        .execute(store.pool())
        .await
        .ok();
    sqlx::query("DELETE FROM stateflow_executors WHERE executor_group = $1")
        .bind(group)
        .execute(store.pool())
        .await
        .ok();
}

fn outcome(state: &str, status: InstanceStatus, variables: &[(&str, &str)]) -> ExecutionOutcome {
    let now = Utc::now();
    ExecutionOutcome {
        state: state.to_string(),
        state_text: Some("moved".into()),
        status,
        next_activation: status.is_scheduled().then_some(now),
        retries: 0,
        updated_variables: variables
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        action: NewAction {
            action_type: ActionType::StateExecution,
            state: "start".into(),
            state_text: Some("moved".into()),
            retry_no: 0,
            execution_start: now,
            execution_end: now,
        },
    }
}

// ============================================
// Instance Tests
// ============================================

#[tokio::test]
async fn test_insert_and_get_instance() {
    let Some(store) = create_test_store().await else {
        return;
    };
    let workflow_type = unique("insert");
    let group = unique("group");

    let id = store
        .insert_instance(
            NewInstance::new(&workflow_type, "start")
                .with_executor_group(&group)
                .with_business_key("order-1")
                .with_variable("a", "1")
                .with_variable("b", "2"),
        )
        .await
        .unwrap();

    let instance = store.get_instance(id).await.unwrap();
    assert_eq!(instance.workflow_type, workflow_type);
    assert_eq!(instance.state, "start");
    assert_eq!(instance.status, InstanceStatus::Created);
    assert_eq!(instance.business_key.as_deref(), Some("order-1"));
    assert!(!instance.external_id.is_empty());
    assert_eq!(
        instance.variables,
        BTreeMap::from([("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())])
    );

    let listed = store
        .list_instances(InstanceFilter::by_type(&workflow_type).with_business_key("order-1"))
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, id);

    assert!(matches!(
        store.get_instance(Uuid::now_v7()).await,
        Err(StoreError::InstanceNotFound(_))
    ));

    cleanup(&store, &workflow_type, &group).await;
}

#[tokio::test]
async fn test_insert_validation() {
    let Some(store) = create_test_store().await else {
        return;
    };
    let workflow_type = unique("validation");
    let group = unique("group");

    let oversized = store
        .insert_instance(NewInstance::new(&workflow_type, "start").with_variable("a", "x".repeat(65)))
        .await;
    assert!(matches!(oversized, Err(StoreError::ValidationError(_))));

    let unscheduled = store
        .insert_instance(NewInstance::new(&workflow_type, "start").with_next_activation(None))
        .await;
    assert!(matches!(unscheduled, Err(StoreError::ValidationError(_))));

    store
        .insert_instance(NewInstance::new(&workflow_type, "start").with_external_id("ext-1"))
        .await
        .unwrap();
    let duplicate = store
        .insert_instance(NewInstance::new(&workflow_type, "start").with_external_id("ext-1"))
        .await;
    assert!(matches!(duplicate, Err(StoreError::ValidationError(_))));

    cleanup(&store, &workflow_type, &group).await;
}

// ============================================
// Claim Tests
// ============================================

#[tokio::test]
async fn test_concurrent_claims_never_overlap() {
    let Some(store) = create_test_store().await else {
        return;
    };
    let store = Arc::new(store);
    let workflow_type = unique("claims");
    let group = unique("group");

    for _ in 0..50 {
        store
            .insert_instance(NewInstance::new(&workflow_type, "start").with_executor_group(&group))
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..5 {
        let executor_id = register(&store, &group, Duration::from_secs(60)).await;
        let store = Arc::clone(&store);
        let group = group.clone();
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            loop {
                let batch = store
                    .claim_due_instances(executor_id, &group, 4)
                    .await
                    .unwrap();
                if batch.is_empty() {
                    break;
                }
                assert!(batch.iter().all(|i| i.executor_id == Some(executor_id)));
                claimed.extend(batch.into_iter().map(|i| i.id));
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    let total = all.len();
    all.sort();
    all.dedup();
    assert_eq!(total, 50);
    assert_eq!(all.len(), 50);

    cleanup(&store, &workflow_type, &group).await;
}

#[tokio::test]
async fn test_claim_orders_by_activation_then_priority() {
    let Some(store) = create_test_store().await else {
        return;
    };
    let workflow_type = unique("ordering");
    let group = unique("group");
    let executor_id = register(&store, &group, Duration::from_secs(60)).await;
    let due = Utc::now() - chrono::Duration::seconds(10);

    let low = store
        .insert_instance(
            NewInstance::new(&workflow_type, "start")
                .with_executor_group(&group)
                .with_next_activation(Some(due)),
        )
        .await
        .unwrap();
    let high = store
        .insert_instance(
            NewInstance::new(&workflow_type, "start")
                .with_executor_group(&group)
                .with_next_activation(Some(due))
                .with_priority(5),
        )
        .await
        .unwrap();
    store
        .insert_instance(
            NewInstance::new(&workflow_type, "start")
                .with_executor_group(&group)
                .with_next_activation(Some(Utc::now() + chrono::Duration::hours(1))),
        )
        .await
        .unwrap();

    let claimed = store.claim_due_instances(executor_id, &group, 10).await.unwrap();
    let ids: Vec<_> = claimed.iter().map(|i| i.id).collect();
    assert_eq!(ids, vec![high, low]);
    assert!(claimed.iter().all(|i| i.status == InstanceStatus::Executing));

    cleanup(&store, &workflow_type, &group).await;
}

#[tokio::test]
async fn test_update_after_execution_and_stale_token() {
    let Some(store) = create_test_store().await else {
        return;
    };
    let workflow_type = unique("writeback");
    let group = unique("group");
    let executor_id = register(&store, &group, Duration::from_secs(60)).await;

    let id = store
        .insert_instance(
            NewInstance::new(&workflow_type, "start")
                .with_executor_group(&group)
                .with_variable("a", "1")
                .with_variable("b", "2"),
        )
        .await
        .unwrap();
    let claimed = store.claim_due_instances(executor_id, &group, 1).await.unwrap();
    let token = claimed[0].claim_token().unwrap();

    let mut stale = token.clone();
    stale.version -= 1;
    assert!(matches!(
        store
            .update_after_execution(&stale, outcome("process", InstanceStatus::InProgress, &[]))
            .await,
        Err(StoreError::ConcurrentModification(_))
    ));

    store
        .update_after_execution(
            &token,
            outcome("process", InstanceStatus::InProgress, &[("a", "10")]),
        )
        .await
        .unwrap();

    let instance = store.get_instance(id).await.unwrap();
    assert_eq!(instance.state, "process");
    assert_eq!(instance.status, InstanceStatus::InProgress);
    assert_eq!(instance.executor_id, None);
    assert_eq!(instance.variables["a"], "10");
    assert_eq!(instance.variables["b"], "2");

    // The token is single-use
    assert!(store
        .update_after_execution(&token, outcome("done", InstanceStatus::Finished, &[]))
        .await
        .is_err());

    let actions = store.list_actions(id).await.unwrap();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].action_type, ActionType::StateExecution);
    assert_eq!(actions[0].executor_id, Some(executor_id));
    assert_eq!(actions[0].updated_variables["a"], "10");

    cleanup(&store, &workflow_type, &group).await;
}

// ============================================
// Executor Lease Tests
// ============================================

#[tokio::test]
async fn test_expired_lease_allows_reclaim_and_recovery() {
    let Some(store) = create_test_store().await else {
        return;
    };
    let workflow_type = unique("lease");
    let group = unique("group");
    let crashed = register(&store, &group, Duration::from_millis(200)).await;
    let survivor = register(&store, &group, Duration::from_secs(60)).await;

    let first = store
        .insert_instance(NewInstance::new(&workflow_type, "start").with_executor_group(&group))
        .await
        .unwrap();
    let second = store
        .insert_instance(NewInstance::new(&workflow_type, "start").with_executor_group(&group))
        .await
        .unwrap();
    assert_eq!(
        store.claim_due_instances(crashed, &group, 2).await.unwrap().len(),
        2
    );
    assert!(store
        .claim_due_instances(survivor, &group, 2)
        .await
        .unwrap()
        .is_empty());

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(matches!(
        store.heartbeat_executor(crashed, Duration::from_secs(60)).await,
        Err(StoreError::ExecutorNotFound(_))
    ));

    let recovered = store.recover_orphaned_instances(survivor, &group).await.unwrap();
    assert_eq!(recovered.len(), 2);
    assert!(recovered.contains(&first) && recovered.contains(&second));

    let instance = store.get_instance(first).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::InProgress);
    assert_eq!(instance.executor_id, None);
    let actions = store.list_actions(first).await.unwrap();
    assert_eq!(actions[0].action_type, ActionType::Recovery);

    let reclaimed = store.claim_due_instances(survivor, &group, 2).await.unwrap();
    assert_eq!(reclaimed.len(), 2);

    cleanup(&store, &workflow_type, &group).await;
}

#[tokio::test]
async fn test_deregister_releases_claims() {
    let Some(store) = create_test_store().await else {
        return;
    };
    let workflow_type = unique("deregister");
    let group = unique("group");
    let executor_id = register(&store, &group, Duration::from_secs(60)).await;

    store
        .heartbeat_executor(executor_id, Duration::from_secs(60))
        .await
        .unwrap();
    let id = store
        .insert_instance(NewInstance::new(&workflow_type, "start").with_executor_group(&group))
        .await
        .unwrap();
    store.claim_due_instances(executor_id, &group, 1).await.unwrap();

    assert_eq!(store.deregister_executor(executor_id).await.unwrap(), 1);
    let instance = store.get_instance(id).await.unwrap();
    assert_eq!(instance.executor_id, None);

    let executors = store.list_executors(&group).await.unwrap();
    assert_eq!(executors.len(), 1);
    assert!(executors[0].stopped.is_some());
    assert!(!executors[0].is_live(Utc::now()));

    assert!(matches!(
        store.claim_due_instances(executor_id, &group, 1).await,
        Err(StoreError::ExecutorNotFound(_))
    ));

    cleanup(&store, &workflow_type, &group).await;
}

// ============================================
// Manual Update Tests
// ============================================

#[tokio::test]
async fn test_manual_update() {
    let Some(store) = create_test_store().await else {
        return;
    };
    let workflow_type = unique("manual");
    let group = unique("group");
    let executor_id = register(&store, &group, Duration::from_secs(60)).await;

    let id = store
        .insert_instance(NewInstance::new(&workflow_type, "start").with_executor_group(&group))
        .await
        .unwrap();
    let update = ManualUpdate {
        state: "review".into(),
        status: InstanceStatus::Manual,
        next_activation: None,
        variables: BTreeMap::from([("note".to_string(), "checked".to_string())]),
        reason: "parked by operator".into(),
    };

    let claimed = store.claim_due_instances(executor_id, &group, 1).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert!(matches!(
        store.update_manual(id, update.clone()).await,
        Err(StoreError::ConcurrentModification(_))
    ));

    store
        .release_claim(&claimed[0].claim_token().unwrap(), Utc::now())
        .await
        .unwrap();
    let updated = store.update_manual(id, update).await.unwrap();
    assert_eq!(updated.state, "review");
    assert_eq!(updated.status, InstanceStatus::Manual);
    assert_eq!(updated.next_activation, None);
    assert_eq!(updated.variables["note"], "checked");

    let actions = store.list_actions(id).await.unwrap();
    assert_eq!(actions.last().unwrap().action_type, ActionType::ExternalChange);

    cleanup(&store, &workflow_type, &group).await;
}
