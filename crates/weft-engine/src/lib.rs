//! Weft Engine
//!
//! Drives workflow instances built by `weft-processor` to completion.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Engine                             │
//! │  - start / stop / pause / resume / recover instances        │
//! │  - metadata and timing queries                              │
//! └─────────────────────────────────────────────────────────────┘
//!                               │ schedule(instance)
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        WorkerPool                           │
//! │  - priority queue of advances, FIFO on ties                 │
//! │  - min/max workers, idle keep-alive, bounded queue          │
//! └─────────────────────────────────────────────────────────────┘
//!                               │ advance(instance)
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Scheduler                            │
//! │  - walks one processor tree under its driver lock           │
//! │  - conditions, quorum, admission, dispatch with backoff     │
//! └─────────────────────────────────────────────────────────────┘
//!               │ assign/reduce load          │ execute/kill
//!               ▼                             ▼
//!        ResourceMonitor                 BatchManager ──► TaskCompletion
//! ```
//!
//! Every change to a tree is saved to the
//! [`InstanceRepository`](weft_store::InstanceRepository) before the driver
//! lock is released, and
//! every state change is reported through an [`ExecutionNotifier`].
//!
//! # Usage
//!
//! ```ignore
//! let (completions, receiver) = completion_channel();
//! let batch = Arc::new(LocalBatchManager::new(registry.clone(), completions));
//! let engine = Engine::new(config, registry, monitor, batch, repository)?;
//! engine.spawn_completion_listener(receiver);
//!
//! let instance_id = engine.start_workflow(&graph, metadata).await?;
//! ```

mod config;
mod engine;
mod error;
mod events;
mod instance;
mod pool;
mod scheduler;

pub use config::{EngineConfig, RetryPolicy, WorkerPoolConfig};
pub use engine::Engine;
pub use error::EngineError;
pub use events::{ChannelNotifier, ExecutionEvent, ExecutionNotifier, NoopNotifier};
pub use pool::{Job, WorkerPool};
