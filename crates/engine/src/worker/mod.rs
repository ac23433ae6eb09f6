//! Executor process runtime
//!
//! This module provides:
//! - [`EngineNode`] - One executor process: registration, dispatch and shutdown
//! - [`Dispatcher`] - Claims due instances into a bounded worker pool
//! - [`ExecutorRegistry`] - Executor lease, heartbeat and orphan recovery
//! - [`InstancePoller`] - Fixed-interval claim polling
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       EngineNode                             │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │ Dispatcher  │  │  Heartbeat  │  │  Orphan Recovery    │  │
//! │  │  (polling)  │  │   (lease)   │  │     (sweep)         │  │
//! │  └──────┬──────┘  └─────────────┘  └─────────────────────┘  │
//! │         │                                                    │
//! │         ▼                                                    │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │       StateExecutor (Semaphore-limited tasks)       │    │
//! │  │  [Instance 1] [Instance 2] ... [Instance N]         │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use stateflow_engine::worker::EngineNode;
//!
//! let node = EngineNode::new(store, Arc::new(definitions), EngineConfig::default().with_pool_size(20))?;
//!
//! node.start().await?;
//!
//! // Graceful shutdown
//! node.shutdown().await?;
//! ```

mod dispatcher;
mod node;
mod poller;
mod registry;

pub use dispatcher::{Dispatcher, DispatcherError, DispatcherStatus};
pub use node::EngineNode;
pub use poller::InstancePoller;
pub use registry::ExecutorRegistry;
