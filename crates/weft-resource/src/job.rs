use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use weft_metadata::Metadata;

/// Everything a batch manager needs to run one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
  pub job_id: String,
  pub instance_id: String,
  pub model_id: String,
  pub model_name: String,
  /// Registry key of the task implementation.
  pub instance_class: String,
  /// Task input: the processor's static and dynamic metadata merged.
  pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
  Success,
  Failure { message: String },
}

/// Notification that a dispatched job finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCompletion {
  pub job_id: String,
  pub instance_id: String,
  pub outcome: TaskOutcome,
  /// Dynamic metadata produced by the task.
  pub metadata: Metadata,
}

impl TaskCompletion {
  pub fn success(job: &JobSpec, metadata: Metadata) -> Self {
    Self {
      job_id: job.job_id.clone(),
      instance_id: job.instance_id.clone(),
      outcome: TaskOutcome::Success,
      metadata,
    }
  }

  pub fn failure(job: &JobSpec, message: impl Into<String>) -> Self {
    Self {
      job_id: job.job_id.clone(),
      instance_id: job.instance_id.clone(),
      outcome: TaskOutcome::Failure {
        message: message.into(),
      },
      metadata: Metadata::new(),
    }
  }
}

pub type CompletionReceiver = mpsc::UnboundedReceiver<TaskCompletion>;

/// Sending half of the completion channel, handed to batch managers.
#[derive(Debug, Clone)]
pub struct CompletionNotifier {
  tx: mpsc::UnboundedSender<TaskCompletion>,
}

impl CompletionNotifier {
  /// Deliver a completion. Returns `false` if the receiver is gone.
  pub fn notify(&self, completion: TaskCompletion) -> bool {
    self.tx.send(completion).is_ok()
  }
}

pub fn completion_channel() -> (CompletionNotifier, CompletionReceiver) {
  let (tx, rx) = mpsc::unbounded_channel();
  (CompletionNotifier { tx }, rx)
}
