//! Shared fixtures for the engine integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Semaphore, mpsc};
use weft_engine::{ChannelNotifier, Engine, EngineConfig, ExecutionEvent, RetryPolicy};
use weft_metadata::Metadata;
use weft_model::{ModelSet, WorkflowGraph, WorkflowModel};
use weft_processor::{ExecutionTypeRegistry, InstanceError, TaskInstance};
use weft_resource::{BatchManager, LoadMonitor, LocalBatchManager, completion_channel};
use weft_store::{InMemoryRepository, InstanceRepository};

/// Copies `Input` to `Output`.
pub struct Echo;

#[async_trait]
impl TaskInstance for Echo {
  async fn run(&self, metadata: &Metadata) -> Result<Metadata, InstanceError> {
    let input = metadata.get("Input").unwrap_or("nothing");
    let mut out = Metadata::new();
    out.add("Output", format!("processed {input}"));
    Ok(out)
  }
}

/// Records its static `Name` and how many earlier stamps it could see.
pub struct Stamp;

#[async_trait]
impl TaskInstance for Stamp {
  async fn run(&self, metadata: &Metadata) -> Result<Metadata, InstanceError> {
    let name = metadata.get("Name").unwrap_or("unnamed");
    let seen = metadata.keys().filter(|k| k.starts_with("Seen/")).count();
    let mut out = Metadata::new();
    out.add(format!("Seen/{name}"), "yes");
    out.add(format!("Before/{name}"), seen.to_string());
    Ok(out)
  }
}

pub struct Fail;

#[async_trait]
impl TaskInstance for Fail {
  async fn run(&self, _metadata: &Metadata) -> Result<Metadata, InstanceError> {
    Err(InstanceError::new("boom"))
  }
}

pub struct Forever;

#[async_trait]
impl TaskInstance for Forever {
  async fn run(&self, _metadata: &Metadata) -> Result<Metadata, InstanceError> {
    tokio::time::sleep(Duration::from_secs(3600)).await;
    Ok(Metadata::new())
  }
}

/// Finishes once a permit is added to its semaphore.
pub struct Gated(pub Arc<Semaphore>);

#[async_trait]
impl TaskInstance for Gated {
  async fn run(&self, _metadata: &Metadata) -> Result<Metadata, InstanceError> {
    let permit = self
      .0
      .acquire()
      .await
      .map_err(|e| InstanceError::new(e.to_string()))?;
    permit.forget();
    let mut out = Metadata::new();
    out.add("Gated", "released");
    Ok(out)
  }
}

pub fn registry() -> ExecutionTypeRegistry {
  let mut registry = ExecutionTypeRegistry::new();
  registry.register_task_instance("echo", Arc::new(Echo));
  registry.register_task_instance("stamp", Arc::new(Stamp));
  registry.register_task_instance("fail", Arc::new(Fail));
  registry.register_task_instance("forever", Arc::new(Forever));
  registry.register_condition_instance(
    "never",
    Arc::new(|_: &Metadata| Ok::<_, InstanceError>(false)),
  );
  registry.register_condition_instance(
    "always",
    Arc::new(|_: &Metadata| Ok::<_, InstanceError>(true)),
  );
  registry.register_condition_instance(
    "has-output",
    Arc::new(|m: &Metadata| Ok::<_, InstanceError>(m.contains_key("Output"))),
  );
  registry
}

pub fn config() -> EngineConfig {
  EngineConfig {
    poll_interval_ms: 10,
    ..EngineConfig::new(RetryPolicy::new(3, 1), RetryPolicy::new(3, 1))
  }
}

pub fn graph(models: Vec<WorkflowModel>, root: &str) -> WorkflowGraph {
  ModelSet::from_models(models).unwrap().graph(root).unwrap()
}

pub fn task(id: &str, class: &str) -> WorkflowModel {
  WorkflowModel::new(id, id.to_uppercase(), "task").with_instance_class(class)
}

pub fn metadata(pairs: &[(&str, &str)]) -> Metadata {
  pairs.iter().copied().collect()
}

pub struct Harness {
  pub engine: Engine<ChannelNotifier>,
  pub events: mpsc::UnboundedReceiver<ExecutionEvent>,
  pub repository: Arc<dyn InstanceRepository>,
  pub monitor: Arc<LoadMonitor>,
}

impl Harness {
  /// Engine over a single `local` node with the given capacity and the
  /// in-process batch manager.
  pub fn local(
    registry: ExecutionTypeRegistry,
    config: EngineConfig,
    capacity: u32,
  ) -> (Self, Arc<LocalBatchManager>) {
    Self::local_with_repository(registry, config, capacity, Arc::new(InMemoryRepository::new()))
  }

  pub fn local_with_repository(
    registry: ExecutionTypeRegistry,
    config: EngineConfig,
    capacity: u32,
    repository: Arc<dyn InstanceRepository>,
  ) -> (Self, Arc<LocalBatchManager>) {
    let registry = Arc::new(registry);
    let (completions, receiver) = completion_channel();
    let batch = Arc::new(LocalBatchManager::new(registry.clone(), completions));
    let harness = Self::new(registry, config, capacity, batch.clone(), repository);
    harness.engine.spawn_completion_listener(receiver);
    (harness, batch)
  }

  pub fn new(
    registry: Arc<ExecutionTypeRegistry>,
    config: EngineConfig,
    capacity: u32,
    batch: Arc<dyn BatchManager>,
    repository: Arc<dyn InstanceRepository>,
  ) -> Self {
    let monitor = Arc::new(LoadMonitor::new().with_node("local", capacity));
    let (notifier, events) = ChannelNotifier::channel();
    let engine = Engine::with_notifier(
      config,
      registry,
      monitor.clone(),
      batch,
      repository.clone(),
      notifier,
    )
    .unwrap();
    Self {
      engine,
      events,
      repository,
      monitor,
    }
  }

  /// Collect events until `pred` matches one, which is included last.
  pub async fn wait_for(&mut self, pred: impl Fn(&ExecutionEvent) -> bool) -> Vec<ExecutionEvent> {
    let mut seen = Vec::new();
    loop {
      let event = tokio::time::timeout(Duration::from_secs(5), self.events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed");
      let done = pred(&event);
      seen.push(event);
      if done {
        return seen;
      }
    }
  }

  /// Collect events until the instance completes or fails.
  pub async fn wait_finished(&mut self, instance_id: &str) -> Vec<ExecutionEvent> {
    self
      .wait_for(|event| match event {
        ExecutionEvent::InstanceCompleted { instance_id: id }
        | ExecutionEvent::InstanceFailed { instance_id: id, .. } => id == instance_id,
        _ => false,
      })
      .await
  }
}

/// Index of the first state change of `model_id` into `state`.
pub fn position(events: &[ExecutionEvent], model_id: &str, state: &str) -> Option<usize> {
  events.iter().position(|event| {
    matches!(
      event,
      ExecutionEvent::StateChanged { model_id: m, state: s, .. } if m == model_id && s == state
    )
  })
}

pub fn is_dispatch_of(event: &ExecutionEvent, model_id: &str) -> bool {
  matches!(event, ExecutionEvent::TaskDispatched { model_id: m, .. } if m == model_id)
}
