//! Instance polling
//!
//! Claims due instances for one executor at a fixed interval.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, instrument, trace};
use uuid::Uuid;

use crate::persistence::{InstanceStore, StoreError, WorkflowInstance};

/// Claims batches of due instances on behalf of one executor
pub struct InstancePoller {
    store: Arc<dyn InstanceStore>,
    executor_id: Uuid,
    executor_group: String,
    poll_interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl InstancePoller {
    /// Create a new instance poller
    pub fn new(
        store: Arc<dyn InstanceStore>,
        executor_id: Uuid,
        executor_group: impl Into<String>,
        poll_interval: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            executor_id,
            executor_group: executor_group.into(),
            poll_interval,
            shutdown_rx,
        }
    }

    /// Claim up to `max_instances` due instances
    #[instrument(skip(self), fields(executor_id = %self.executor_id, group = %self.executor_group))]
    pub async fn poll(&self, max_instances: usize) -> Result<Vec<WorkflowInstance>, StoreError> {
        if self.is_shutdown() {
            debug!("Poller shutdown requested");
            return Ok(vec![]);
        }
        if max_instances == 0 {
            return Ok(vec![]);
        }

        let instances = self
            .store
            .claim_due_instances(self.executor_id, &self.executor_group, max_instances)
            .await?;

        if instances.is_empty() {
            trace!("No due instances");
        } else {
            debug!(count = instances.len(), "Claimed instances");
        }

        Ok(instances)
    }

    /// Sleep for one poll interval
    ///
    /// Returns `true` if shutdown was signaled while waiting.
    pub async fn wait(&self) -> bool {
        let mut shutdown_rx = self.shutdown_rx.clone();
        if *shutdown_rx.borrow_and_update() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(self.poll_interval) => false,
            _ = shutdown_rx.changed() => {
                debug!("Shutdown signal received during wait");
                true
            }
        }
    }

    /// Get the poll interval
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Check if shutdown has been requested
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{InMemoryInstanceStore, NewExecutor, NewInstance};

    async fn setup() -> (Arc<InMemoryInstanceStore>, Uuid) {
        let store = Arc::new(InMemoryInstanceStore::new());
        let executor = store
            .register_executor(
                NewExecutor {
                    host: "test".into(),
                    pid: 1,
                    executor_group: "default".into(),
                },
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        (store, executor.id)
    }

    #[tokio::test]
    async fn test_poll_respects_batch_size() {
        let (store, executor_id) = setup().await;
        for _ in 0..5 {
            store
                .insert_instance(NewInstance::new("demo", "start"))
                .await
                .unwrap();
        }
        let (_tx, rx) = watch::channel(false);
        let poller = InstancePoller::new(
            store.clone(),
            executor_id,
            "default",
            Duration::from_millis(10),
            rx,
        );

        assert_eq!(poller.poll(3).await.unwrap().len(), 3);
        assert_eq!(poller.poll(0).await.unwrap().len(), 0);
        assert_eq!(poller.poll(10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_poll_after_shutdown_claims_nothing() {
        let (store, executor_id) = setup().await;
        store
            .insert_instance(NewInstance::new("demo", "start"))
            .await
            .unwrap();
        let (tx, rx) = watch::channel(false);
        let poller =
            InstancePoller::new(store.clone(), executor_id, "default", Duration::from_secs(60), rx);

        tx.send(true).unwrap();
        assert!(poller.is_shutdown());
        assert!(poller.poll(10).await.unwrap().is_empty());
        assert!(poller.wait().await);
    }

    #[tokio::test]
    async fn test_wait_is_interrupted_by_shutdown() {
        let (store, executor_id) = setup().await;
        let (tx, rx) = watch::channel(false);
        let poller = InstancePoller::new(store, executor_id, "default", Duration::from_secs(3600), rx);

        let waiter = tokio::spawn(async move { poller.wait().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();

        let interrupted = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(interrupted);
    }
}
