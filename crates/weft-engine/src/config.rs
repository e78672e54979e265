use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
  /// Attempts allowed before giving up. Must be at least 1.
  pub max_attempts: u32,
  /// Delay after the first failed attempt; doubles on each further one.
  pub backoff_ms: u64,
  /// Upper bound for the delay.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub max_backoff_ms: Option<u64>,
}

impl RetryPolicy {
  pub fn new(max_attempts: u32, backoff_ms: u64) -> Self {
    Self {
      max_attempts,
      backoff_ms,
      max_backoff_ms: None,
    }
  }

  /// Delay before the next attempt, given how many attempts have failed.
  pub fn delay(&self, failed_attempts: u32) -> Duration {
    let exponent = failed_attempts.saturating_sub(1).min(32);
    let millis = self.backoff_ms.saturating_mul(1u64 << exponent);
    let millis = match self.max_backoff_ms {
      Some(cap) => millis.min(cap),
      None => millis,
    };
    Duration::from_millis(millis)
  }

  pub fn exhausted(&self, failed_attempts: u32) -> bool {
    failed_attempts >= self.max_attempts
  }
}

/// Sizing of the worker pool that advances instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
  #[serde(default = "default_min_workers")]
  pub min_workers: usize,
  #[serde(default = "default_max_workers")]
  pub max_workers: usize,
  /// How long a worker above the minimum stays idle before exiting.
  #[serde(default = "default_keep_alive_ms")]
  pub keep_alive_ms: u64,
  /// Maximum queued advances. `None` is unbounded.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub queue_capacity: Option<usize>,
}

fn default_min_workers() -> usize {
  1
}

fn default_max_workers() -> usize {
  8
}

fn default_keep_alive_ms() -> u64 {
  60_000
}

impl Default for WorkerPoolConfig {
  fn default() -> Self {
    Self {
      min_workers: default_min_workers(),
      max_workers: default_max_workers(),
      keep_alive_ms: default_keep_alive_ms(),
      queue_capacity: None,
    }
  }
}

/// Engine configuration.
///
/// The two retry policies have no defaults and must always be given.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
  #[serde(default)]
  pub pool: WorkerPoolConfig,
  /// Delay before re-checking a processor waiting on capacity.
  #[serde(default = "default_poll_interval_ms")]
  pub poll_interval_ms: u64,
  /// Pre/post-condition evaluations allowed before a processor fails blocked.
  pub condition_retry: RetryPolicy,
  /// Resource-manager attempts allowed before a task fails to dispatch.
  pub dispatch_retry: RetryPolicy,
  /// Load units a task occupies on its execution node.
  #[serde(default = "default_task_load")]
  pub task_load: u32,
  /// How long `stop` waits for each kill request.
  #[serde(default = "default_stop_timeout_ms")]
  pub stop_timeout_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
  1_000
}

fn default_task_load() -> u32 {
  1
}

fn default_stop_timeout_ms() -> u64 {
  5_000
}

impl EngineConfig {
  pub fn new(condition_retry: RetryPolicy, dispatch_retry: RetryPolicy) -> Self {
    Self {
      pool: WorkerPoolConfig::default(),
      poll_interval_ms: default_poll_interval_ms(),
      condition_retry,
      dispatch_retry,
      task_load: default_task_load(),
      stop_timeout_ms: default_stop_timeout_ms(),
    }
  }

  pub fn from_json(json: &str) -> Result<Self, EngineError> {
    let config: EngineConfig =
      serde_json::from_str(json).map_err(|e| EngineError::InvalidConfig {
        message: e.to_string(),
      })?;
    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<(), EngineError> {
    let invalid = |message: &str| {
      Err(EngineError::InvalidConfig {
        message: message.to_string(),
      })
    };
    if self.pool.max_workers == 0 {
      return invalid("pool.max_workers must be at least 1");
    }
    if self.pool.min_workers > self.pool.max_workers {
      return invalid("pool.min_workers cannot exceed pool.max_workers");
    }
    if self.pool.queue_capacity == Some(0) {
      return invalid("pool.queue_capacity must be at least 1");
    }
    if self.condition_retry.max_attempts == 0 {
      return invalid("condition_retry.max_attempts must be at least 1");
    }
    if self.dispatch_retry.max_attempts == 0 {
      return invalid("dispatch_retry.max_attempts must be at least 1");
    }
    if self.task_load == 0 {
      return invalid("task_load must be at least 1");
    }
    Ok(())
  }

  pub fn poll_interval(&self) -> Duration {
    Duration::from_millis(self.poll_interval_ms)
  }

  pub fn stop_timeout(&self) -> Duration {
    Duration::from_millis(self.stop_timeout_ms)
  }
}
