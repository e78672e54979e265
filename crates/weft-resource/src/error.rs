use thiserror::Error;

/// Failure of a resource-manager call. The engine treats every variant as
/// transient and retries with backoff.
#[derive(Debug, Clone, Error)]
pub enum ResourceError {
  #[error("unknown node: {0}")]
  UnknownNode(String),

  #[error("node unreachable: {0}")]
  Unreachable(String),

  #[error("no task registered for instance class {0:?}")]
  UnknownTask(String),

  #[error("batch manager has shut down")]
  ShutDown,
}
