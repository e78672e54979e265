use thiserror::Error;

/// Rejects a processor build. No partial tree is ever returned.
#[derive(Debug, Error)]
pub enum ConfigurationError {
  #[error("model {model_id}: unknown execution type {execution_type:?}")]
  UnknownExecutionType {
    model_id: String,
    execution_type: String,
  },

  #[error("model {model_id}: no task registered for instance class {instance_class:?}")]
  UnresolvableTask {
    model_id: String,
    instance_class: String,
  },

  #[error("model {model_id}: no condition registered for instance class {instance_class:?}")]
  UnresolvableCondition {
    model_id: String,
    instance_class: String,
  },

  #[error("model {model_id}: leaf node has no instance class")]
  MissingInstanceClass { model_id: String },

  #[error("model {model_id}: leaf node cannot have children")]
  LeafWithChildren { model_id: String },

  #[error("model {model_id}: task nodes are not allowed inside a condition graph")]
  TaskInCondition { model_id: String },

  #[error("model {model_id}: condition nodes are only allowed inside a condition graph")]
  ConditionOutsideGraph { model_id: String },

  #[error("model {model_id}: condition graph nodes cannot carry their own conditions")]
  NestedConditions { model_id: String },
}

/// Why a processor ended in `Failure`. Rendered into the state message.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FailureCause {
  #[error("blocked: {stage}-conditions still unsatisfied after {attempts} attempts")]
  ConditionBlocked { stage: &'static str, attempts: u32 },

  #[error("task execution failed: {message}")]
  TaskExecution { message: String },

  #[error("dispatch failed after {attempts} attempts: {message}")]
  Dispatch { attempts: u32, message: String },

  #[error("quorum not met: {succeeded} succeeded, {required} required")]
  QuorumNotMet { succeeded: usize, required: usize },

  #[error("stopped by request")]
  Stopped,

  #[error("parent concluded before this node finished")]
  Abandoned,
}
