//! The engine control surface.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use weft_metadata::Metadata;
use weft_model::WorkflowGraph;
use weft_processor::{
  ExecutionTypeRegistry, FailureCause, ProcessorInfo, StateKind, WorkflowProcessor, build,
  reconcile,
};
use weft_resource::{BatchManager, CompletionReceiver, ResourceMonitor, TaskCompletion};
use weft_store::InstanceRepository;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::events::{ExecutionEvent, ExecutionNotifier, NoopNotifier};
use crate::instance::InstanceHandle;
use crate::pool::WorkerPool;

pub(crate) struct Inner<N> {
  pub config: EngineConfig,
  pub registry: Arc<ExecutionTypeRegistry>,
  pub monitor: Arc<dyn ResourceMonitor>,
  pub batch: Arc<dyn BatchManager>,
  pub repository: Arc<dyn InstanceRepository>,
  pub notifier: N,
  pub pool: WorkerPool,
  pub instances: RwLock<HashMap<String, Arc<InstanceHandle>>>,
  pub engine_paused: AtomicBool,
  pub cancel: CancellationToken,
}

/// Workflow engine: owns every in-flight instance and drives it on a worker
/// pool.
///
/// Generic over `N: ExecutionNotifier` to allow different notification
/// strategies. Use `Engine::new()` for an engine with no-op notifications, or
/// `Engine::with_notifier()` to observe events. Cloning is cheap and every
/// clone controls the same engine.
pub struct Engine<N: ExecutionNotifier = NoopNotifier> {
  inner: Arc<Inner<N>>,
}

impl<N: ExecutionNotifier> Clone for Engine<N> {
  fn clone(&self) -> Self {
    Self {
      inner: self.inner.clone(),
    }
  }
}

impl Engine<NoopNotifier> {
  /// Create an engine with no-op notifications.
  pub fn new(
    config: EngineConfig,
    registry: Arc<ExecutionTypeRegistry>,
    monitor: Arc<dyn ResourceMonitor>,
    batch: Arc<dyn BatchManager>,
    repository: Arc<dyn InstanceRepository>,
  ) -> Result<Self, EngineError> {
    Self::with_notifier(config, registry, monitor, batch, repository, NoopNotifier)
  }
}

impl<N: ExecutionNotifier> Engine<N> {
  /// Create an engine with a custom notifier. Must be called from within a
  /// tokio runtime.
  pub fn with_notifier(
    config: EngineConfig,
    registry: Arc<ExecutionTypeRegistry>,
    monitor: Arc<dyn ResourceMonitor>,
    batch: Arc<dyn BatchManager>,
    repository: Arc<dyn InstanceRepository>,
    notifier: N,
  ) -> Result<Self, EngineError> {
    config.validate()?;
    let cancel = CancellationToken::new();
    let pool = WorkerPool::new(config.pool.clone(), cancel.child_token());

    Ok(Self {
      inner: Arc::new(Inner {
        config,
        registry,
        monitor,
        batch,
        repository,
        notifier,
        pool,
        instances: RwLock::new(HashMap::new()),
        engine_paused: AtomicBool::new(false),
        cancel,
      }),
    })
  }

  pub fn config(&self) -> &EngineConfig {
    &self.inner.config
  }

  /// Build a processor tree for `graph` and start driving it. Returns the new
  /// instance id.
  #[instrument(name = "start_workflow", skip(self, graph, metadata), fields(model_id = %graph.id()))]
  pub async fn start_workflow(
    &self,
    graph: &WorkflowGraph,
    metadata: Metadata,
  ) -> Result<String, EngineError> {
    if self.inner.cancel.is_cancelled() {
      return Err(EngineError::ShutDown);
    }

    let instance_id = Uuid::new_v4().to_string();
    let mut tree = build(&instance_id, graph, &self.inner.registry)?;
    tree.dynamic_metadata = metadata;
    self.inner.repository.save(&tree).await?;

    let model_id = tree.model_id.clone();
    let handle = Arc::new(InstanceHandle::new(tree, self.inner.cancel.child_token()));
    self
      .inner
      .instances
      .write()
      .await
      .insert(instance_id.clone(), handle.clone());

    info!(instance_id = %instance_id, "instance_started");
    self.inner.emit(ExecutionEvent::InstanceStarted {
      instance_id: instance_id.clone(),
      model_id,
    });
    self.inner.schedule(&handle);
    Ok(instance_id)
  }

  /// Kill every dispatched job of the instance and fail all of its unfinished
  /// processors.
  #[instrument(name = "stop_workflow", skip(self))]
  pub async fn stop_workflow(&self, instance_id: &str) -> Result<(), EngineError> {
    let handle = self.handle(instance_id).await?;
    handle.stopped.store(true, Ordering::SeqCst);

    let mut driver = handle.driver.lock().await;
    if handle.cancel.is_cancelled() {
      return Ok(());
    }

    let jobs: Vec<(String, String)> = driver.jobs.drain().collect();
    for (job_id, node) in &jobs {
      self.inner.kill(job_id, node).await;
    }

    let inner = &self.inner;
    let reason = FailureCause::Stopped.to_string();
    driver.tree.for_each_mut(|node| {
      if !node.is_condition && !node.is_terminal() {
        node.job_id = None;
        inner.set_state(node, StateKind::Failure, reason.clone());
      }
    });
    driver.retries.clear();

    self.inner.persist(&driver.tree).await;
    self.inner.finish(&handle, &mut driver).await;
    info!(killed = jobs.len(), "instance_stopped");
    Ok(())
  }

  /// Suspend advancement of the instance. Task outcomes that arrive while
  /// paused are still recorded.
  #[instrument(name = "pause_workflow_instance", skip(self))]
  pub async fn pause_workflow_instance(&self, instance_id: &str) -> Result<(), EngineError> {
    let handle = self.handle(instance_id).await?;
    let mut driver = handle.driver.lock().await;
    let root = &mut driver.tree;
    if root.is_terminal() || matches!(root.state.kind, StateKind::Paused { .. }) {
      return Ok(());
    }

    handle.paused.store(true, Ordering::SeqCst);
    let previous = root.state.kind.clone();
    self
      .inner
      .set_state(root, StateKind::paused(previous), "paused by request");
    self.inner.persist(&driver.tree).await;

    info!("instance_paused");
    self.inner.emit(ExecutionEvent::InstancePaused {
      instance_id: instance_id.to_string(),
    });
    Ok(())
  }

  /// Restore the state the root had before it was paused and continue.
  #[instrument(name = "resume_workflow_instance", skip(self))]
  pub async fn resume_workflow_instance(&self, instance_id: &str) -> Result<(), EngineError> {
    let handle = self.handle(instance_id).await?;
    {
      let mut driver = handle.driver.lock().await;
      let root = &mut driver.tree;
      let StateKind::Paused { previous } = root.state.kind.clone() else {
        return Ok(());
      };
      self.inner.set_state(root, *previous, "resumed");
      handle.paused.store(false, Ordering::SeqCst);
      self.inner.persist(&driver.tree).await;
    }

    info!("instance_resumed");
    self.inner.emit(ExecutionEvent::InstanceResumed {
      instance_id: instance_id.to_string(),
    });
    self.inner.schedule(&handle);
    Ok(())
  }

  /// Replace the root's dynamic metadata. Returns `false` if the instance is
  /// not active.
  #[instrument(name = "update_metadata", skip(self, metadata))]
  pub async fn update_metadata(
    &self,
    instance_id: &str,
    metadata: Metadata,
  ) -> Result<bool, EngineError> {
    let Some(handle) = self.inner.instance(instance_id).await else {
      return Ok(false);
    };
    let mut driver = handle.driver.lock().await;
    if handle.cancel.is_cancelled() {
      return Ok(false);
    }
    driver.tree.dynamic_metadata = metadata;
    self.inner.repository.save(&driver.tree).await?;
    Ok(true)
  }

  /// Static and dynamic metadata of the instance's root.
  pub async fn workflow_instance_metadata(&self, instance_id: &str) -> Result<Metadata, EngineError> {
    self.with_tree(instance_id, |tree| Ok(tree.metadata())).await
  }

  /// Static and dynamic metadata of the first processor built from
  /// `model_id`.
  pub async fn workflow_metadata(
    &self,
    instance_id: &str,
    model_id: &str,
  ) -> Result<Metadata, EngineError> {
    self
      .with_tree(instance_id, |tree| {
        find(tree, model_id).map(WorkflowProcessor::metadata)
      })
      .await
  }

  pub async fn processor_info(
    &self,
    instance_id: &str,
    model_id: &str,
  ) -> Result<ProcessorInfo, EngineError> {
    self
      .with_tree(instance_id, |tree| find(tree, model_id).map(|n| n.info.clone()))
      .await
  }

  /// Minutes since the instance was created, or its total run time once
  /// finished.
  pub async fn wall_clock_minutes(&self, instance_id: &str) -> Result<f64, EngineError> {
    self
      .with_tree(instance_id, |tree| Ok(tree.info.wall_clock_minutes(Utc::now())))
      .await
  }

  /// Execution minutes of the most recently started task, or 0.0 if no task
  /// has started.
  pub async fn current_task_wall_clock_minutes(&self, instance_id: &str) -> Result<f64, EngineError> {
    self
      .with_tree(instance_id, |tree| {
        let current = tree
          .nodes()
          .into_iter()
          .filter(|n| n.is_task() && n.info.execution_time.is_some())
          .max_by_key(|n| n.info.execution_time);
        Ok(current.map_or(0.0, |n| n.info.execution_minutes(Utc::now())))
      })
      .await
  }

  /// Copy of the instance's processor tree.
  pub async fn snapshot(&self, instance_id: &str) -> Result<WorkflowProcessor, EngineError> {
    self.with_tree(instance_id, |tree| Ok(tree.clone())).await
  }

  pub async fn describe(&self, instance_id: &str) -> Result<String, EngineError> {
    self.with_tree(instance_id, |tree| Ok(tree.describe())).await
  }

  /// Set the priority of every processor of the instance and of its future
  /// advances.
  pub async fn set_priority(&self, instance_id: &str, priority: i32) -> Result<(), EngineError> {
    let handle = self.handle(instance_id).await?;
    let mut driver = handle.driver.lock().await;
    driver.tree.set_priority(priority);
    handle.priority.store(priority, Ordering::SeqCst);
    self.inner.persist(&driver.tree).await;
    Ok(())
  }

  /// Stop advancing every instance until [`resume_engine`](Self::resume_engine).
  pub fn pause_engine(&self) {
    self.inner.engine_paused.store(true, Ordering::SeqCst);
    info!("engine_paused");
  }

  pub async fn resume_engine(&self) {
    self.inner.engine_paused.store(false, Ordering::SeqCst);
    info!("engine_resumed");
    let handles: Vec<_> = self.inner.instances.read().await.values().cloned().collect();
    for handle in handles {
      self.inner.schedule(&handle);
    }
  }

  pub fn is_engine_paused(&self) -> bool {
    self.inner.engine_paused.load(Ordering::SeqCst)
  }

  /// Ids of the active instances, sorted.
  pub async fn list_instances(&self) -> Vec<String> {
    let mut ids: Vec<String> = self.inner.instances.read().await.keys().cloned().collect();
    ids.sort();
    ids
  }

  pub async fn is_active(&self, instance_id: &str) -> bool {
    self.inner.instance(instance_id).await.is_some()
  }

  /// Record the outcome of a dispatched job. Returns `false` for completions
  /// that match no active job.
  pub async fn complete_task(&self, completion: TaskCompletion) -> bool {
    self.inner.complete_task(completion).await
  }

  /// Feed completions from `receiver` into the engine until it closes or the
  /// engine shuts down.
  pub fn spawn_completion_listener(&self, mut receiver: CompletionReceiver) -> JoinHandle<()> {
    let inner = self.inner.clone();
    tokio::spawn(async move {
      loop {
        tokio::select! {
          _ = inner.cancel.cancelled() => {
            info!("completion_listener_cancelled");
            break;
          }
          completion = receiver.recv() => {
            match completion {
              Some(completion) => {
                inner.complete_task(completion).await;
              }
              None => {
                info!("completion_channel_closed");
                break;
              }
            }
          }
        }
      }
    })
  }

  /// Load every active instance from the repository, reconcile it and resume
  /// driving it. Returns the recovered ids.
  #[instrument(name = "recover", skip(self))]
  pub async fn recover(&self) -> Result<Vec<String>, EngineError> {
    let mut recovered = Vec::new();
    for instance_id in self.inner.repository.list_active().await? {
      if self.inner.instance(&instance_id).await.is_some() {
        continue;
      }
      let Some(mut tree) = self.inner.repository.load(&instance_id).await? else {
        warn!(instance_id = %instance_id, "active_instance_missing");
        continue;
      };

      let reset = reconcile(&mut tree);
      self.inner.repository.save(&tree).await?;

      let handle = Arc::new(InstanceHandle::new(tree, self.inner.cancel.child_token()));
      self
        .inner
        .instances
        .write()
        .await
        .insert(instance_id.clone(), handle.clone());

      info!(instance_id = %instance_id, reset, "instance_recovered");
      self.inner.emit(ExecutionEvent::InstanceRecovered {
        instance_id: instance_id.clone(),
        reset,
      });
      self.inner.schedule(&handle);
      recovered.push(instance_id);
    }
    Ok(recovered)
  }

  /// Stop the worker pool, timers and completion listeners. Instances stay in
  /// the repository and can be recovered later.
  pub fn shutdown(&self) {
    self.inner.cancel.cancel();
    self.inner.pool.shutdown();
    info!("engine_shutdown");
  }

  async fn handle(&self, instance_id: &str) -> Result<Arc<InstanceHandle>, EngineError> {
    self
      .inner
      .instance(instance_id)
      .await
      .ok_or_else(|| EngineError::UnknownInstance(instance_id.to_string()))
  }

  /// Run `f` against the live tree, or the saved one for instances that are
  /// no longer active.
  async fn with_tree<T>(
    &self,
    instance_id: &str,
    f: impl FnOnce(&WorkflowProcessor) -> Result<T, EngineError>,
  ) -> Result<T, EngineError> {
    if let Some(handle) = self.inner.instance(instance_id).await {
      let driver = handle.driver.lock().await;
      return f(&driver.tree);
    }
    match self.inner.repository.load(instance_id).await? {
      Some(tree) => f(&tree),
      None => Err(EngineError::UnknownInstance(instance_id.to_string())),
    }
  }
}

fn find<'a>(tree: &'a WorkflowProcessor, model_id: &str) -> Result<&'a WorkflowProcessor, EngineError> {
  tree.find(model_id).ok_or_else(|| EngineError::UnknownModel {
    instance_id: tree.instance_id.clone(),
    model_id: model_id.to_string(),
  })
}
