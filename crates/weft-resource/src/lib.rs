//! Weft Resource
//!
//! The engine's view of the resource manager, split the same way the
//! resource manager itself is:
//!
//! - [`ResourceMonitor`] tracks per-node load against capacity
//! - [`BatchManager`] dispatches jobs to nodes and kills them
//!
//! Dispatch is fire-and-forget. A batch manager reports each finished job as
//! a [`TaskCompletion`] through the [`CompletionNotifier`] it was given.
//!
//! [`LoadMonitor`] and [`LocalBatchManager`] are in-process implementations:
//! the first keeps an atomic load counter per node, the second runs tasks from
//! an [`ExecutionTypeRegistry`](weft_processor::ExecutionTypeRegistry) on the
//! tokio runtime.

mod batch;
mod error;
mod job;
mod monitor;

pub use batch::{BatchManager, LocalBatchManager};
pub use error::ResourceError;
pub use job::{
  CompletionNotifier, CompletionReceiver, JobSpec, TaskCompletion, TaskOutcome,
  completion_channel,
};
pub use monitor::{LoadMonitor, ResourceMonitor};
