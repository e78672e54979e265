use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
  #[error("model not found: {0}")]
  ModelNotFound(String),

  #[error("model {from} references unknown model {to}")]
  UnknownReference { from: String, to: String },

  #[error("cycle detected through model {0}")]
  Cycle(String),

  #[error("duplicate model id: {0}")]
  DuplicateModel(String),

  #[error("model {model_id} excuses {child_id}, which is not one of its children")]
  InvalidExcused { model_id: String, child_id: String },

  #[error("invalid model json: {0}")]
  Json(#[from] serde_json::Error),
}
