use thiserror::Error;
use weft_processor::ConfigurationError;
use weft_store::StoreError;

#[derive(Debug, Error)]
pub enum EngineError {
  #[error("unknown workflow instance: {0}")]
  UnknownInstance(String),

  #[error("instance {instance_id} has no processor for model {model_id}")]
  UnknownModel {
    instance_id: String,
    model_id: String,
  },

  #[error("workflow rejected: {0}")]
  Configuration(#[from] ConfigurationError),

  #[error("invalid engine configuration: {message}")]
  InvalidConfig { message: String },

  #[error("repository error: {0}")]
  Repository(#[from] StoreError),

  #[error("worker queue is full")]
  QueueFull,

  #[error("engine has shut down")]
  ShutDown,
}
