use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use weft_processor::{StateKind, WorkflowProcessor};

/// Retry bookkeeping for one processor, keyed by its child path.
#[derive(Debug, Default, Clone)]
pub(crate) struct RetryState {
  pub dispatch_attempts: u32,
  pub post_attempts: u32,
  /// The processor is not looked at again before this instant.
  pub not_before: Option<Instant>,
}

/// Everything guarded by an instance's driver lock.
pub(crate) struct InstanceDriver {
  pub tree: WorkflowProcessor,
  pub retries: HashMap<Vec<usize>, RetryState>,
  /// Dispatched job id to the node it holds load on.
  pub jobs: HashMap<String, String>,
}

impl InstanceDriver {
  pub fn new(tree: WorkflowProcessor) -> Self {
    Self {
      tree,
      retries: HashMap::new(),
      jobs: HashMap::new(),
    }
  }

  /// Drop retry state for the processor at `path` and everything below it.
  pub fn forget(&mut self, path: &[usize]) {
    self.retries.retain(|key, _| !key.starts_with(path));
  }

  pub fn not_before(&self, path: &[usize]) -> Option<Instant> {
    self.retries.get(path).and_then(|r| r.not_before)
  }

  pub fn earliest_retry(&self) -> Option<Instant> {
    self.retries.values().filter_map(|r| r.not_before).min()
  }
}

/// One in-flight workflow instance.
pub(crate) struct InstanceHandle {
  pub id: String,
  pub driver: tokio::sync::Mutex<InstanceDriver>,
  pub paused: AtomicBool,
  pub stopped: AtomicBool,
  /// An advance is queued and has not started yet.
  pub scheduled: AtomicBool,
  pub priority: AtomicI32,
  /// Deadline of the pending wake-up timer, if one is armed.
  pub timer: Mutex<Option<Instant>>,
  pub cancel: CancellationToken,
}

impl InstanceHandle {
  pub fn new(tree: WorkflowProcessor, cancel: CancellationToken) -> Self {
    let paused = matches!(tree.state.kind, StateKind::Paused { .. });
    Self {
      id: tree.instance_id.clone(),
      priority: AtomicI32::new(tree.priority),
      driver: tokio::sync::Mutex::new(InstanceDriver::new(tree)),
      paused: AtomicBool::new(paused),
      stopped: AtomicBool::new(false),
      scheduled: AtomicBool::new(false),
      timer: Mutex::new(None),
      cancel,
    }
  }

  pub fn is_paused(&self) -> bool {
    self.paused.load(Ordering::SeqCst)
  }

  pub fn is_stopped(&self) -> bool {
    self.stopped.load(Ordering::SeqCst)
  }

  pub fn priority(&self) -> i32 {
    self.priority.load(Ordering::SeqCst)
  }

  /// Claim the right to arm a timer for `deadline`. Returns `false` when a
  /// timer that fires no later is already armed.
  pub fn arm_timer(&self, deadline: Instant) -> bool {
    let mut timer = self.timer.lock().unwrap_or_else(|e| e.into_inner());
    match *timer {
      Some(armed) if armed <= deadline => false,
      _ => {
        *timer = Some(deadline);
        true
      }
    }
  }

  /// Release the timer slot if it still belongs to `deadline`.
  pub fn disarm_timer(&self, deadline: Instant) {
    let mut timer = self.timer.lock().unwrap_or_else(|e| e.into_inner());
    if *timer == Some(deadline) {
      *timer = None;
    }
  }
}
