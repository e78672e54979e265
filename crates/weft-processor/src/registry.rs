use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use weft_metadata::Metadata;

/// Error reported by a task or condition implementation.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct InstanceError {
  pub message: String,
}

impl InstanceError {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
    }
  }
}

/// A unit of work run by a batch manager for a task processor.
///
/// Receives the task's merged metadata and returns the dynamic metadata it
/// produced.
#[async_trait]
pub trait TaskInstance: Send + Sync {
  async fn run(&self, metadata: &Metadata) -> Result<Metadata, InstanceError>;
}

/// A boolean check run for a condition processor.
pub trait ConditionInstance: Send + Sync {
  fn evaluate(&self, metadata: &Metadata) -> Result<bool, InstanceError>;
}

type TaskFactory = Arc<dyn Fn() -> Arc<dyn TaskInstance> + Send + Sync>;
type ConditionFactory = Arc<dyn Fn() -> Arc<dyn ConditionInstance> + Send + Sync>;

/// Processor variant an execution-type tag resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionType {
  Task,
  Condition,
  Sequential,
  Parallel,
}

/// Maps execution-type tags to processor variants and instance-class keys to
/// task and condition factories.
#[derive(Clone)]
pub struct ExecutionTypeRegistry {
  types: HashMap<String, ExecutionType>,
  tasks: HashMap<String, TaskFactory>,
  conditions: HashMap<String, ConditionFactory>,
}

impl Default for ExecutionTypeRegistry {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Debug for ExecutionTypeRegistry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ExecutionTypeRegistry")
      .field("types", &self.types)
      .field("tasks", &self.tasks.keys().collect::<Vec<_>>())
      .field("conditions", &self.conditions.keys().collect::<Vec<_>>())
      .finish()
  }
}

impl ExecutionTypeRegistry {
  /// A registry with the standard tags (`task`, `condition`, `sequential`,
  /// `parallel`) and no instance classes.
  pub fn new() -> Self {
    let types = [
      ("task", ExecutionType::Task),
      ("condition", ExecutionType::Condition),
      ("sequential", ExecutionType::Sequential),
      ("parallel", ExecutionType::Parallel),
    ]
    .into_iter()
    .map(|(tag, ty)| (tag.to_string(), ty))
    .collect();

    Self {
      types,
      tasks: HashMap::new(),
      conditions: HashMap::new(),
    }
  }

  /// Map an additional tag onto a processor variant.
  pub fn register_type(&mut self, tag: impl Into<String>, ty: ExecutionType) {
    self.types.insert(tag.into(), ty);
  }

  pub fn register_task<F>(&mut self, key: impl Into<String>, factory: F)
  where
    F: Fn() -> Arc<dyn TaskInstance> + Send + Sync + 'static,
  {
    self.tasks.insert(key.into(), Arc::new(factory));
  }

  /// Register a shared task instance under `key`.
  pub fn register_task_instance(&mut self, key: impl Into<String>, task: Arc<dyn TaskInstance>) {
    self.register_task(key, move || task.clone());
  }

  pub fn register_condition<F>(&mut self, key: impl Into<String>, factory: F)
  where
    F: Fn() -> Arc<dyn ConditionInstance> + Send + Sync + 'static,
  {
    self.conditions.insert(key.into(), Arc::new(factory));
  }

  pub fn register_condition_instance(
    &mut self,
    key: impl Into<String>,
    condition: Arc<dyn ConditionInstance>,
  ) {
    self.register_condition(key, move || condition.clone());
  }

  pub fn execution_type(&self, tag: &str) -> Option<ExecutionType> {
    self.types.get(tag).copied()
  }

  pub fn has_task(&self, key: &str) -> bool {
    self.tasks.contains_key(key)
  }

  pub fn has_condition(&self, key: &str) -> bool {
    self.conditions.contains_key(key)
  }

  /// Instantiate the task registered under `key`.
  pub fn task(&self, key: &str) -> Option<Arc<dyn TaskInstance>> {
    self.tasks.get(key).map(|factory| factory())
  }

  /// Instantiate the condition registered under `key`.
  pub fn condition(&self, key: &str) -> Option<Arc<dyn ConditionInstance>> {
    self.conditions.get(key).map(|factory| factory())
  }
}

/// Adapter so plain closures can be registered as conditions.
impl<F> ConditionInstance for F
where
  F: Fn(&Metadata) -> Result<bool, InstanceError> + Send + Sync,
{
  fn evaluate(&self, metadata: &Metadata) -> Result<bool, InstanceError> {
    self(metadata)
  }
}
