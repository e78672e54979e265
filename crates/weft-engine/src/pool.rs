//! Priority worker pool that runs instance advances.
//!
//! Jobs are popped highest priority first, FIFO among equal priorities.
//! The pool keeps `min_workers` tokio tasks alive, grows up to
//! `max_workers` when a job arrives and nobody is idle, and lets workers
//! above the minimum exit after `keep_alive_ms` without work.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::config::WorkerPoolConfig;
use crate::error::EngineError;

pub type Job = BoxFuture<'static, ()>;

struct QueuedJob {
  priority: i32,
  seq: u64,
  job: Job,
}

impl PartialEq for QueuedJob {
  fn eq(&self, other: &Self) -> bool {
    self.priority == other.priority && self.seq == other.seq
  }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl Ord for QueuedJob {
  fn cmp(&self, other: &Self) -> Ordering {
    // max-heap: higher priority wins, then the earlier submission
    self
      .priority
      .cmp(&other.priority)
      .then_with(|| other.seq.cmp(&self.seq))
  }
}

#[derive(Default)]
struct PoolState {
  queue: BinaryHeap<QueuedJob>,
  next_seq: u64,
  live: usize,
  idle: usize,
}

struct Shared {
  config: WorkerPoolConfig,
  state: Mutex<PoolState>,
  notify: Notify,
  cancel: CancellationToken,
}

impl Shared {
  fn lock(&self) -> MutexGuard<'_, PoolState> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }
}

/// Bounded pool of tokio workers draining a priority queue.
pub struct WorkerPool {
  shared: Arc<Shared>,
}

impl WorkerPool {
  /// Create the pool and spawn the minimum number of workers. Must be called
  /// from within a tokio runtime.
  pub fn new(config: WorkerPoolConfig, cancel: CancellationToken) -> Self {
    let shared = Arc::new(Shared {
      config,
      state: Mutex::new(PoolState::default()),
      notify: Notify::new(),
      cancel,
    });

    let min = shared.config.min_workers;
    shared.lock().live = min;
    for _ in 0..min {
      tokio::spawn(worker(shared.clone()));
    }
    Self { shared }
  }

  /// Queue a job. Fails with [`EngineError::QueueFull`] when the queue is at
  /// capacity and [`EngineError::ShutDown`] after [`shutdown`](Self::shutdown).
  pub fn submit(&self, priority: i32, job: Job) -> Result<(), EngineError> {
    if self.shared.cancel.is_cancelled() {
      return Err(EngineError::ShutDown);
    }

    let spawn = {
      let mut state = self.shared.lock();
      if let Some(capacity) = self.shared.config.queue_capacity
        && state.queue.len() >= capacity
      {
        return Err(EngineError::QueueFull);
      }
      let seq = state.next_seq;
      state.next_seq += 1;
      state.queue.push(QueuedJob { priority, seq, job });

      let grow = state.idle == 0 && state.live < self.shared.config.max_workers;
      if grow {
        state.live += 1;
      }
      grow
    };

    if spawn {
      tokio::spawn(worker(self.shared.clone()));
    }
    self.shared.notify.notify_one();
    Ok(())
  }

  /// Jobs waiting for a worker.
  pub fn queued(&self) -> usize {
    self.shared.lock().queue.len()
  }

  /// Workers currently alive.
  pub fn workers(&self) -> usize {
    self.shared.lock().live
  }

  /// Stop accepting jobs and let every worker exit once its current job is
  /// done. Queued jobs are dropped.
  pub fn shutdown(&self) {
    self.shared.cancel.cancel();
    self.shared.lock().queue.clear();
    self.shared.notify.notify_waiters();
  }
}

impl Drop for WorkerPool {
  fn drop(&mut self) {
    self.shutdown();
  }
}

enum Next {
  Run(Job),
  Wait,
}

async fn worker(shared: Arc<Shared>) {
  let keep_alive = Duration::from_millis(shared.config.keep_alive_ms);
  debug!("pool_worker_started");

  loop {
    if shared.cancel.is_cancelled() {
      break;
    }

    let next = {
      let mut state = shared.lock();
      match state.queue.pop() {
        Some(queued) => Next::Run(queued.job),
        None => {
          state.idle += 1;
          Next::Wait
        }
      }
    };

    match next {
      Next::Run(job) => {
        if AssertUnwindSafe(job).catch_unwind().await.is_err() {
          error!("pool_job_panicked");
        }
      }
      Next::Wait => {
        tokio::select! {
          _ = shared.cancel.cancelled() => {
            shared.lock().idle -= 1;
            break;
          }
          _ = shared.notify.notified() => {
            shared.lock().idle -= 1;
          }
          _ = tokio::time::sleep(keep_alive) => {
            let mut state = shared.lock();
            state.idle -= 1;
            if state.queue.is_empty() && state.live > shared.config.min_workers {
              state.live -= 1;
              debug!("pool_worker_retired");
              return;
            }
          }
        }
      }
    }
  }

  shared.lock().live -= 1;
  debug!("pool_worker_stopped");
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

  use tokio::sync::{mpsc, oneshot};

  use super::*;

  fn config(min: usize, max: usize, capacity: Option<usize>) -> WorkerPoolConfig {
    WorkerPoolConfig {
      min_workers: min,
      max_workers: max,
      keep_alive_ms: 50,
      queue_capacity: capacity,
    }
  }

  #[tokio::test]
  async fn test_runs_submitted_jobs() {
    let pool = WorkerPool::new(config(1, 4, None), CancellationToken::new());
    let counter = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx) = mpsc::unbounded_channel();

    for _ in 0..10 {
      let counter = counter.clone();
      let tx = tx.clone();
      pool
        .submit(
          0,
          async move {
            counter.fetch_add(1, AtomicOrdering::SeqCst);
            let _ = tx.send(());
          }
          .boxed(),
        )
        .unwrap();
    }
    for _ in 0..10 {
      rx.recv().await.unwrap();
    }
    assert_eq!(counter.load(AtomicOrdering::SeqCst), 10);
  }

  #[tokio::test]
  async fn test_priority_then_fifo() {
    // no workers yet and max 1, so everything queues behind the blocker
    let pool = WorkerPool::new(config(0, 1, None), CancellationToken::new());
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let (order_tx, mut order_rx) = mpsc::unbounded_channel();

    pool
      .submit(
        100,
        async move {
          let _ = release_rx.await;
        }
        .boxed(),
      )
      .unwrap();
    while pool.queued() > 0 {
      tokio::task::yield_now().await;
    }

    for (priority, label) in [(1, "low-a"), (5, "high"), (1, "low-b"), (3, "mid")] {
      let tx = order_tx.clone();
      pool
        .submit(
          priority,
          async move {
            let _ = tx.send(label);
          }
          .boxed(),
        )
        .unwrap();
    }
    release_tx.send(()).unwrap();

    let mut order = Vec::new();
    for _ in 0..4 {
      order.push(order_rx.recv().await.unwrap());
    }
    assert_eq!(order, vec!["high", "mid", "low-a", "low-b"]);
  }

  #[tokio::test]
  async fn test_bounded_queue_rejects_overflow() {
    let pool = WorkerPool::new(config(0, 1, Some(2)), CancellationToken::new());
    let (release_tx, release_rx) = oneshot::channel::<()>();
    pool
      .submit(
        0,
        async move {
          let _ = release_rx.await;
        }
        .boxed(),
      )
      .unwrap();
    // let the single worker take the blocker off the queue
    while pool.queued() > 0 {
      tokio::task::yield_now().await;
    }

    pool.submit(0, async {}.boxed()).unwrap();
    pool.submit(0, async {}.boxed()).unwrap();
    let err = pool.submit(0, async {}.boxed()).unwrap_err();
    assert!(matches!(err, EngineError::QueueFull));
    assert_eq!(pool.queued(), 2);

    release_tx.send(()).unwrap();
  }

  #[tokio::test]
  async fn test_grows_to_max_and_retires_idle_workers() {
    let pool = WorkerPool::new(config(1, 3, None), CancellationToken::new());
    assert_eq!(pool.workers(), 1);

    let (release_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    for _ in 0..5 {
      let mut release = release_tx.subscribe();
      pool
        .submit(
          0,
          async move {
            let _ = release.recv().await;
          }
          .boxed(),
        )
        .unwrap();
    }
    assert_eq!(pool.workers(), 3);

    release_tx.send(()).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(pool.workers(), 1);
  }

  #[tokio::test]
  async fn test_submit_after_shutdown() {
    let pool = WorkerPool::new(config(1, 1, None), CancellationToken::new());
    pool.shutdown();
    let err = pool.submit(0, async {}.boxed()).unwrap_err();
    assert!(matches!(err, EngineError::ShutDown));
  }
}
