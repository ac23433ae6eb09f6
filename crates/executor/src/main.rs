//! Stateflow executor process

mod demo;
mod telemetry;

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use stateflow_engine::persistence::NewInstance;
use stateflow_engine::{
    EngineConfig, EngineNode, ListenerChain, LoggingListener, PostgresInstanceStore,
    WorkflowDefinitionRegistry, WorkflowInstanceService, MIGRATOR,
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init_tracing();

    tracing::info!("stateflow-executor starting...");

    let config = EngineConfig::from_env().context("Invalid STATEFLOW_* configuration")?;
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

    // Workers plus headroom for heartbeat, recovery and claim queries
    let pool = PgPoolOptions::new()
        .max_connections(config.pool_size as u32 + 4)
        .connect(&database_url)
        .await
        .context("Failed to connect to PostgreSQL")?;
    MIGRATOR
        .run(&pool)
        .await
        .context("Failed to run database migrations")?;

    let store = Arc::new(
        PostgresInstanceStore::new(pool).with_max_variable_length(config.max_variable_length),
    );

    let mut definitions = WorkflowDefinitionRegistry::new();
    definitions
        .register(demo::definition().context("Invalid demo workflow definition")?)
        .context("Failed to register demo workflow")?;
    let definitions = Arc::new(definitions);

    if std::env::var("STATEFLOW_SEED_DEMO").is_ok_and(|v| v == "true") {
        let service = WorkflowInstanceService::new(store.clone(), Arc::clone(&definitions));
        let id = service
            .insert(
                NewInstance::new(demo::WORKFLOW_TYPE, "")
                    .with_executor_group(config.executor_group.clone())
                    .with_variable("flaky", "true"),
            )
            .await
            .context("Failed to seed demo instance")?;
        tracing::info!(instance_id = %id, "Seeded demo instance");
    }

    tracing::info!(
        group = %config.executor_group,
        pool_size = config.pool_size,
        poll_interval = ?config.poll_interval,
        lease = ?config.lease_duration,
        "Starting engine node"
    );

    let node = EngineNode::new(store, definitions, config)
        .context("Failed to create engine node")?
        .with_listeners(ListenerChain::new().with_listener(Arc::new(LoggingListener)));
    let executor_id = node.start().await.context("Failed to start engine node")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!(%executor_id, "Received shutdown signal");

    if node.shutdown().await.context("Shutdown failed")? {
        tracing::info!("Executor shutdown complete");
    } else {
        tracing::warn!("Executor stopped before in-flight executions finished");
    }
    Ok(())
}
