//! Dispatcher for claimed instances
//!
//! Claims due instances while the worker pool has spare capacity and hands
//! each one to the state executor on its own task.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{watch, Semaphore};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::poller::InstancePoller;
use crate::config::ConfigError;
use crate::engine::StateExecutor;
use crate::persistence::{InstanceStore, StoreError, WorkflowInstance};

/// Dispatcher status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherStatus {
    /// Nothing was due at the last poll
    Idle,
    /// Claiming a batch
    Polling,
    /// All workers are busy
    AwaitingCapacity,
    /// No longer claiming; in-flight executions are draining
    ShuttingDown,
    /// Not running
    Stopped,
}

/// Dispatcher and node errors
#[derive(Debug, thiserror::Error)]
pub enum DispatcherError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Already running
    #[error("engine node is already running")]
    AlreadyRunning,

    /// Not running
    #[error("engine node is not running")]
    NotRunning,
}

/// Bounded dispatcher for one executor
///
/// # Example
///
/// ```ignore
/// let (shutdown_tx, shutdown_rx) = watch::channel(false);
/// let dispatcher = Arc::new(Dispatcher::new(store, executor, executor_id, "default", 10, poll_interval, shutdown_rx));
///
/// let handle = tokio::spawn({
///     let dispatcher = Arc::clone(&dispatcher);
///     async move { dispatcher.run().await }
/// });
///
/// // ... later
/// shutdown_tx.send(true)?;
/// handle.await?;
/// let drained = dispatcher.drain(Duration::from_secs(30)).await;
/// ```
pub struct Dispatcher {
    executor: Arc<StateExecutor>,
    poller: InstancePoller,
    executor_id: Uuid,
    pool_size: usize,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    status: RwLock<DispatcherStatus>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Dispatcher {
    /// Create a new dispatcher
    pub fn new(
        store: Arc<dyn InstanceStore>,
        executor: Arc<StateExecutor>,
        executor_id: Uuid,
        executor_group: impl Into<String>,
        pool_size: usize,
        poll_interval: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let pool_size = pool_size.max(1);
        let poller = InstancePoller::new(
            store,
            executor_id,
            executor_group,
            poll_interval,
            shutdown_rx.clone(),
        );

        Self {
            executor,
            poller,
            executor_id,
            pool_size,
            permits: Arc::new(Semaphore::new(pool_size)),
            tracker: TaskTracker::new(),
            status: RwLock::new(DispatcherStatus::Stopped),
            shutdown_rx,
        }
    }

    /// Get current status
    pub fn status(&self) -> DispatcherStatus {
        *self.status.read()
    }

    /// Number of executions currently running
    pub fn in_flight(&self) -> usize {
        self.pool_size - self.permits.available_permits()
    }

    /// Spare worker capacity
    pub fn spare_capacity(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run the dispatch loop until shutdown is signaled
    #[instrument(skip(self), fields(executor_id = %self.executor_id))]
    pub async fn run(&self) {
        info!(pool_size = self.pool_size, "Dispatcher started");
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            if self.poller.is_shutdown() {
                debug!("Dispatch loop: shutdown requested");
                break;
            }

            if self.spare_capacity() == 0 {
                self.set_status(DispatcherStatus::AwaitingCapacity);
                tokio::select! {
                    permit = Arc::clone(&self.permits).acquire_owned() => {
                        if permit.is_err() {
                            break;
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Dispatch loop: shutdown requested while awaiting capacity");
                        break;
                    }
                }
                continue;
            }

            match self.dispatch_batch().await {
                Ok(0) => {
                    self.set_status(DispatcherStatus::Idle);
                    if self.poller.wait().await {
                        break;
                    }
                }
                Ok(_) => {}
                Err(DispatcherError::Store(StoreError::ExecutorNotFound(_))) => {
                    error!(
                        executor_id = %self.executor_id,
                        "Executor lease lost, no further instances will be claimed"
                    );
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Claiming due instances failed");
                    self.set_status(DispatcherStatus::Idle);
                    if self.poller.wait().await {
                        break;
                    }
                }
            }
        }

        self.set_status(DispatcherStatus::ShuttingDown);
        debug!("Dispatch loop exited");
    }

    /// Claim one batch sized to spare capacity and submit every instance
    ///
    /// Returns the number of instances submitted.
    pub async fn dispatch_batch(&self) -> Result<usize, DispatcherError> {
        let spare = self.spare_capacity();
        if spare == 0 {
            return Ok(0);
        }

        self.set_status(DispatcherStatus::Polling);
        let instances = self.poller.poll(spare).await?;
        let mut submitted = 0;
        for instance in instances {
            if self.submit(instance).await {
                submitted += 1;
            }
        }
        Ok(submitted)
    }

    async fn submit(&self, instance: WorkflowInstance) -> bool {
        let permit = match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(instance_id = %instance.id, "No worker available, releasing claim");
                if let Some(claim) = instance.claim_token() {
                    if let Err(e) = self.executor.release_claim(&claim, chrono::Utc::now()).await {
                        error!(instance_id = %instance.id, error = %e, "Failed to release claim");
                    }
                }
                return false;
            }
        };

        let executor = Arc::clone(&self.executor);
        self.tracker.spawn(async move {
            let instance_id = instance.id;
            if let Err(e) = executor.execute(instance).await {
                debug!(%instance_id, error = %e, "State execution did not complete");
            }
            drop(permit);
        });
        true
    }

    /// Stop accepting work and wait up to `timeout` for in-flight executions
    ///
    /// Returns `true` if every execution finished in time. Executions still
    /// running keep their claims until the executor's lease expires.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.set_status(DispatcherStatus::ShuttingDown);
        self.tracker.close();

        let drained = match tokio::time::timeout(timeout, self.tracker.wait()).await {
            Ok(()) => {
                debug!("All executions completed");
                true
            }
            Err(_) => {
                warn!(
                    remaining = self.tracker.len(),
                    "Shutdown timeout reached with executions in flight"
                );
                false
            }
        };

        self.set_status(DispatcherStatus::Stopped);
        drained
    }

    fn set_status(&self, status: DispatcherStatus) {
        *self.status.write() = status;
    }
}
