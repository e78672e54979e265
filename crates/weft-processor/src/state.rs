use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle tag of a processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StateKind {
  Loaded,
  Queued,
  /// Blocked on capacity or a transient dispatch failure. Carries the state
  /// that was interrupted.
  WaitingOnResources { previous: Box<StateKind> },
  Executing,
  /// Suspended by a pause request. Carries the state to restore on resume.
  Paused { previous: Box<StateKind> },
  Success,
  Failure,
}

impl StateKind {
  pub fn waiting_on(previous: StateKind) -> Self {
    StateKind::WaitingOnResources {
      previous: Box::new(previous),
    }
  }

  pub fn paused(previous: StateKind) -> Self {
    StateKind::Paused {
      previous: Box::new(previous),
    }
  }

  pub fn is_terminal(&self) -> bool {
    matches!(self, StateKind::Success | StateKind::Failure)
  }

  /// The interrupted state of `WaitingOnResources` or `Paused`.
  pub fn previous(&self) -> Option<&StateKind> {
    match self {
      StateKind::WaitingOnResources { previous } | StateKind::Paused { previous } => Some(previous),
      _ => None,
    }
  }

  pub fn name(&self) -> &'static str {
    match self {
      StateKind::Loaded => "Loaded",
      StateKind::Queued => "Queued",
      StateKind::WaitingOnResources { .. } => "WaitingOnResources",
      StateKind::Executing => "Executing",
      StateKind::Paused { .. } => "Paused",
      StateKind::Success => "Success",
      StateKind::Failure => "Failure",
    }
  }
}

impl fmt::Display for StateKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.previous() {
      Some(previous) => write!(f, "{}({})", self.name(), previous),
      None => f.write_str(self.name()),
    }
  }
}

/// Current state of a processor: tag, message and the time it was entered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
  pub kind: StateKind,
  pub message: String,
  pub start_time: DateTime<Utc>,
}

impl WorkflowState {
  pub fn new(kind: StateKind, message: impl Into<String>) -> Self {
    Self {
      kind,
      message: message.into(),
      start_time: Utc::now(),
    }
  }

  pub fn loaded() -> Self {
    Self::new(StateKind::Loaded, "")
  }

  pub fn is_terminal(&self) -> bool {
    self.kind.is_terminal()
  }
}

impl fmt::Display for WorkflowState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.message.is_empty() {
      write!(f, "{}", self.kind)
    } else {
      write!(f, "{}: {}", self.kind, self.message)
    }
  }
}
