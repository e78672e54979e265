//! Execution events and notifiers for observability.
//!
//! The engine emits an event for every processor state change, dispatch,
//! completion and instance lifecycle step. Events for one instance are
//! emitted while its tree is locked, so their order matches the order in
//! which the tree changed.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Events emitted while driving workflow instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExecutionEvent {
  /// A new instance was created.
  InstanceStarted {
    instance_id: String,
    model_id: String,
  },

  /// A saved instance was loaded and reconciled at start-up.
  InstanceRecovered { instance_id: String, reset: usize },

  /// A processor moved to a new state.
  StateChanged {
    instance_id: String,
    model_id: String,
    state: String,
    message: String,
  },

  /// A task was handed to the batch manager.
  TaskDispatched {
    instance_id: String,
    model_id: String,
    job_id: String,
    node: String,
  },

  /// The batch manager reported a finished job.
  TaskCompleted {
    instance_id: String,
    model_id: String,
    job_id: String,
    success: bool,
  },

  InstancePaused { instance_id: String },

  InstanceResumed { instance_id: String },

  /// The instance's root reached `Success`.
  InstanceCompleted { instance_id: String },

  /// The instance's root reached `Failure`.
  InstanceFailed { instance_id: String, error: String },
}

/// Receives execution events.
///
/// The engine calls `notify` for each event; implementations decide what to
/// do with them.
pub trait ExecutionNotifier: Send + Sync + 'static {
  fn notify(&self, event: ExecutionEvent);
}

/// A notifier that discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl ExecutionNotifier for NoopNotifier {
  fn notify(&self, _event: ExecutionEvent) {}
}

/// A notifier that sends events to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  // Unbounded so a slow consumer never stalls a driver holding a tree lock.
  sender: mpsc::UnboundedSender<ExecutionEvent>,
}

impl ChannelNotifier {
  pub fn new(sender: mpsc::UnboundedSender<ExecutionEvent>) -> Self {
    Self { sender }
  }

  /// Create a notifier together with the receiving end of its channel.
  pub fn channel() -> (Self, mpsc::UnboundedReceiver<ExecutionEvent>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (Self { sender }, receiver)
  }
}

impl ExecutionNotifier for ChannelNotifier {
  fn notify(&self, event: ExecutionEvent) {
    // receiver may have been dropped
    let _ = self.sender.send(event);
  }
}
