//! Executor registration and lease upkeep

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use crate::persistence::{ExecutorInfo, InstanceStore, NewExecutor, StoreError};

/// Registers this process as an executor and keeps its lease alive
#[derive(Clone)]
pub struct ExecutorRegistry {
    store: Arc<dyn InstanceStore>,
    executor_group: String,
    lease_duration: Duration,
    heartbeat_interval: Duration,
    recovery_interval: Duration,
}

impl ExecutorRegistry {
    /// Create a new registry handle
    pub fn new(
        store: Arc<dyn InstanceStore>,
        executor_group: impl Into<String>,
        lease_duration: Duration,
        heartbeat_interval: Duration,
        recovery_interval: Duration,
    ) -> Self {
        Self {
            store,
            executor_group: executor_group.into(),
            lease_duration,
            heartbeat_interval,
            recovery_interval,
        }
    }

    pub fn executor_group(&self) -> &str {
        &self.executor_group
    }

    /// Register this process under the configured group
    #[instrument(skip(self), fields(group = %self.executor_group))]
    pub async fn register(&self) -> Result<ExecutorInfo, StoreError> {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());

        let executor = self
            .store
            .register_executor(
                NewExecutor {
                    host,
                    pid: std::process::id(),
                    executor_group: self.executor_group.clone(),
                },
                self.lease_duration,
            )
            .await?;

        info!(
            executor_id = %executor.id,
            host = %executor.host,
            pid = executor.pid,
            expires = %executor.expires,
            "Registered executor"
        );
        Ok(executor)
    }

    /// Refresh the lease once
    pub async fn heartbeat(&self, executor_id: Uuid) -> Result<(), StoreError> {
        self.store
            .heartbeat_executor(executor_id, self.lease_duration)
            .await
    }

    /// Reset instances owned by expired executors once
    pub async fn recover(&self, executor_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let recovered = self
            .store
            .recover_orphaned_instances(executor_id, &self.executor_group)
            .await?;
        if !recovered.is_empty() {
            info!(count = recovered.len(), "Recovered orphaned instances");
        }
        Ok(recovered)
    }

    /// Expire the lease immediately and release remaining claims
    #[instrument(skip(self))]
    pub async fn deregister(&self, executor_id: Uuid) -> Result<u64, StoreError> {
        let released = self.store.deregister_executor(executor_id).await?;
        info!(%executor_id, released, "Deregistered executor");
        Ok(released)
    }

    /// Start the heartbeat loop
    pub fn spawn_heartbeat(
        &self,
        executor_id: Uuid,
        mut stop_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let registry = self.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(registry.heartbeat_interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match registry.heartbeat(executor_id).await {
                            Ok(()) => debug!(%executor_id, "Heartbeat sent"),
                            Err(StoreError::ExecutorNotFound(_)) => {
                                // Expired leases are never renewed; the dispatcher stops on its next claim
                                error!(%executor_id, "Executor lease lost, stopping heartbeat");
                                break;
                            }
                            Err(e) => error!(%executor_id, "Heartbeat failed: {}", e),
                        }
                    }
                    _ = stop_rx.changed() => {
                        debug!("Heartbeat loop: stop requested");
                        break;
                    }
                }
            }

            debug!("Heartbeat loop exited");
        })
    }

    /// Start the orphan recovery loop
    pub fn spawn_recovery(
        &self,
        executor_id: Uuid,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let registry = self.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(registry.recovery_interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = registry.recover(executor_id).await {
                            error!("Orphan recovery failed: {}", e);
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Recovery loop: shutdown requested");
                        break;
                    }
                }
            }

            debug!("Recovery loop exited");
        })
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("executor_group", &self.executor_group)
            .field("lease_duration", &self.lease_duration)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{InMemoryInstanceStore, InstanceStatus, NewInstance};

    fn registry(store: &Arc<InMemoryInstanceStore>) -> ExecutorRegistry {
        ExecutorRegistry::new(
            store.clone(),
            "default",
            Duration::from_secs(60),
            Duration::from_millis(10),
            Duration::from_millis(10),
        )
    }

    #[tokio::test]
    async fn test_register_uses_process_identity() {
        let store = Arc::new(InMemoryInstanceStore::new());
        let executor = registry(&store).register().await.unwrap();

        assert_eq!(executor.pid, std::process::id());
        assert_eq!(executor.executor_group, "default");
        assert!(!executor.host.is_empty());
        assert!(executor.expires > executor.started);
    }

    #[tokio::test]
    async fn test_heartbeat_loop_extends_lease() {
        let store = Arc::new(InMemoryInstanceStore::new());
        let registry = registry(&store);
        let executor = registry.register().await.unwrap();

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = registry.spawn_heartbeat(executor.id, stop_rx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop_tx.send(true).unwrap();
        handle.await.unwrap();

        let executors = store.list_executors("default").await.unwrap();
        assert!(executors[0].active > executor.active);
        assert!(executors[0].expires > executor.expires);
    }

    #[tokio::test]
    async fn test_heartbeat_loop_exits_after_lease_is_lost() {
        let store = Arc::new(InMemoryInstanceStore::new());
        let registry = registry(&store);
        let executor = registry.register().await.unwrap();
        store.expire_executor(executor.id);

        let (_stop_tx, stop_rx) = watch::channel(false);
        let handle = registry.spawn_heartbeat(executor.id, stop_rx);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("heartbeat kept running without a lease")
            .unwrap();

        let executors = store.list_executors("default").await.unwrap();
        assert!(executors[0].expires < chrono::Utc::now());
    }

    #[tokio::test]
    async fn test_recovery_loop_resets_orphans() {
        let store = Arc::new(InMemoryInstanceStore::new());
        let registry = registry(&store);
        let crashed = registry.register().await.unwrap();
        let survivor = registry.register().await.unwrap();

        let id = store
            .insert_instance(NewInstance::new("demo", "start"))
            .await
            .unwrap();
        store.claim_due_instances(crashed.id, "default", 1).await.unwrap();
        store.expire_executor(crashed.id);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = registry.spawn_recovery(survivor.id, shutdown_rx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        let instance = store.get_instance(id).await.unwrap();
        assert_eq!(instance.status, InstanceStatus::InProgress);
        assert_eq!(instance.executor_id, None);
    }

    #[tokio::test]
    async fn test_deregister_releases_claims() {
        let store = Arc::new(InMemoryInstanceStore::new());
        let registry = registry(&store);
        let executor = registry.register().await.unwrap();
        store
            .insert_instance(NewInstance::new("demo", "start"))
            .await
            .unwrap();
        store.claim_due_instances(executor.id, "default", 1).await.unwrap();

        assert_eq!(registry.deregister(executor.id).await.unwrap(), 1);
        assert!(matches!(
            registry.heartbeat(executor.id).await,
            Err(StoreError::ExecutorNotFound(_))
        ));
    }
}
