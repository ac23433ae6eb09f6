//! Engine node: one executor process's dispatcher and lease upkeep

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::dispatcher::{Dispatcher, DispatcherError, DispatcherStatus};
use super::registry::ExecutorRegistry;
use crate::config::EngineConfig;
use crate::definition::WorkflowDefinitionRegistry;
use crate::engine::{ExecutorSettings, ListenerChain, StateExecutor};
use crate::persistence::InstanceStore;

struct Running {
    executor_id: Uuid,
    dispatcher: Arc<Dispatcher>,
    shutdown_tx: watch::Sender<bool>,
    heartbeat_stop_tx: watch::Sender<bool>,
    dispatch_handle: JoinHandle<()>,
    heartbeat_handle: JoinHandle<()>,
    recovery_handle: JoinHandle<()>,
}

/// A running executor: registration, heartbeat, recovery and dispatch
///
/// # Example
///
/// ```ignore
/// let node = EngineNode::new(store, Arc::new(definitions), EngineConfig::from_env()?)?;
///
/// node.start().await?;
/// tokio::signal::ctrl_c().await?;
/// node.shutdown().await?;
/// ```
pub struct EngineNode {
    config: EngineConfig,
    store: Arc<dyn InstanceStore>,
    definitions: Arc<WorkflowDefinitionRegistry>,
    listeners: Arc<ListenerChain>,
    registry: ExecutorRegistry,
    running: Mutex<Option<Running>>,
}

impl EngineNode {
    /// Create a node; the configuration is validated here
    pub fn new(
        store: Arc<dyn InstanceStore>,
        definitions: Arc<WorkflowDefinitionRegistry>,
        config: EngineConfig,
    ) -> Result<Self, DispatcherError> {
        config.validate()?;
        let registry = ExecutorRegistry::new(
            Arc::clone(&store),
            config.executor_group.clone(),
            config.lease_duration,
            config.heartbeat_interval,
            config.recovery_interval,
        );

        Ok(Self {
            config,
            store,
            definitions,
            listeners: Arc::new(ListenerChain::new()),
            registry,
            running: Mutex::new(None),
        })
    }

    /// Set the execution listeners
    pub fn with_listeners(mut self, listeners: ListenerChain) -> Self {
        self.listeners = Arc::new(listeners);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Executor id while running
    pub fn executor_id(&self) -> Option<Uuid> {
        self.running.lock().as_ref().map(|r| r.executor_id)
    }

    /// Dispatcher status; `Stopped` when not running
    pub fn status(&self) -> DispatcherStatus {
        self.running
            .lock()
            .as_ref()
            .map(|r| r.dispatcher.status())
            .unwrap_or(DispatcherStatus::Stopped)
    }

    /// Register the executor and start dispatching
    #[instrument(skip(self), fields(group = %self.config.executor_group))]
    pub async fn start(&self) -> Result<Uuid, DispatcherError> {
        if self.running.lock().is_some() {
            return Err(DispatcherError::AlreadyRunning);
        }

        let executor = self.registry.register().await?;
        let executor_id = executor.id;

        let state_executor = Arc::new(
            StateExecutor::new(
                Arc::clone(&self.store),
                Arc::clone(&self.definitions),
                Arc::clone(&self.listeners),
            )
            .with_settings(ExecutorSettings::from(&self.config)),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (heartbeat_stop_tx, heartbeat_stop_rx) = watch::channel(false);

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&self.store),
            state_executor,
            executor_id,
            self.config.executor_group.clone(),
            self.config.pool_size,
            self.config.poll_interval,
            shutdown_rx.clone(),
        ));

        let dispatch_handle = tokio::spawn({
            let dispatcher = Arc::clone(&dispatcher);
            async move { dispatcher.run().await }
        });
        let heartbeat_handle = self.registry.spawn_heartbeat(executor_id, heartbeat_stop_rx);
        let recovery_handle = self.registry.spawn_recovery(executor_id, shutdown_rx);

        let running = Running {
            executor_id,
            dispatcher,
            shutdown_tx,
            heartbeat_stop_tx,
            dispatch_handle,
            heartbeat_handle,
            recovery_handle,
        };
        let rejected = {
            let mut slot = self.running.lock();
            if slot.is_some() {
                Some(running)
            } else {
                *slot = Some(running);
                None
            }
        };
        if let Some(running) = rejected {
            // Lost a race with a concurrent start; undo ours
            let _ = running.shutdown_tx.send(true);
            let _ = running.heartbeat_stop_tx.send(true);
            self.registry.deregister(executor_id).await?;
            return Err(DispatcherError::AlreadyRunning);
        }

        info!(
            %executor_id,
            pool_size = self.config.pool_size,
            definitions = self.definitions.len(),
            "Engine node started"
        );
        Ok(executor_id)
    }

    /// Stop claiming, drain in-flight work and release the lease
    ///
    /// Returns `true` when every execution finished within the shutdown
    /// timeout. Otherwise the executor is left registered and its remaining
    /// claims become reclaimable when the lease expires.
    #[instrument(skip(self), fields(group = %self.config.executor_group))]
    pub async fn shutdown(&self) -> Result<bool, DispatcherError> {
        let running = self.running.lock().take();
        let Some(running) = running else {
            return Err(DispatcherError::NotRunning);
        };
        let executor_id = running.executor_id;

        info!(%executor_id, "Initiating graceful shutdown");
        let _ = running.shutdown_tx.send(true);
        if let Err(e) = running.dispatch_handle.await {
            warn!(%executor_id, "Dispatch loop ended abnormally: {}", e);
        }
        if let Err(e) = running.recovery_handle.await {
            warn!(%executor_id, "Recovery loop ended abnormally: {}", e);
        }

        let drained = running.dispatcher.drain(self.config.shutdown_timeout).await;

        let _ = running.heartbeat_stop_tx.send(true);
        if let Err(e) = running.heartbeat_handle.await {
            warn!(%executor_id, "Heartbeat loop ended abnormally: {}", e);
        }

        if drained {
            self.registry.deregister(executor_id).await?;
            info!(%executor_id, "Engine node stopped");
        } else {
            warn!(
                %executor_id,
                lease = ?self.config.lease_duration,
                "Engine node stopped with executions in flight; claims held until lease expiry"
            );
        }
        Ok(drained)
    }
}
