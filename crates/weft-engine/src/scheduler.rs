//! Driving processor trees.
//!
//! An advance locks one instance's driver and walks its tree with an
//! explicit stack, moving every processor as far as it can go. Passes repeat
//! until nothing changes; anything that must wait (condition backoff, dispatch
//! backoff, missing capacity) records a deadline and a timer re-schedules the
//! instance once it passes. No worker ever sleeps inside an advance.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use chrono::Utc;
use futures::FutureExt;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;
use weft_metadata::merge;
use weft_processor::{
  FailureCause, ProcessorKind, QuorumStatus, StateKind, WorkflowProcessor, evaluate_condition,
};
use weft_resource::{JobSpec, ResourceError, TaskCompletion, TaskOutcome};

use crate::engine::Inner;
use crate::error::EngineError;
use crate::events::{ExecutionEvent, ExecutionNotifier};
use crate::instance::{InstanceDriver, InstanceHandle};

#[derive(Debug, Clone, Copy)]
enum Stage {
  Pre,
  Post,
}

impl Stage {
  fn name(self) -> &'static str {
    match self {
      Stage::Pre => "pre",
      Stage::Post => "post",
    }
  }
}

enum Gate {
  Open,
  Blocked,
  Exhausted { attempts: u32 },
}

impl<N: ExecutionNotifier> Inner<N> {
  /// Whether advancement of `handle` is currently suspended.
  pub(crate) fn halted(&self, handle: &InstanceHandle) -> bool {
    handle.is_paused()
      || handle.is_stopped()
      || self.engine_paused.load(Ordering::SeqCst)
      || handle.cancel.is_cancelled()
  }

  pub(crate) fn emit(&self, event: ExecutionEvent) {
    self.notifier.notify(event);
  }

  pub(crate) fn set_state(
    &self,
    node: &mut WorkflowProcessor,
    kind: StateKind,
    message: impl Into<String>,
  ) {
    node.transition(kind, message);
    debug!(
      instance_id = %node.instance_id,
      model_id = %node.model_id,
      state = %node.state.kind,
      "processor_state_changed"
    );
    self.emit(ExecutionEvent::StateChanged {
      instance_id: node.instance_id.clone(),
      model_id: node.model_id.clone(),
      state: node.state.kind.to_string(),
      message: node.state.message.clone(),
    });
  }

  pub(crate) async fn instance(&self, instance_id: &str) -> Option<Arc<InstanceHandle>> {
    self.instances.read().await.get(instance_id).cloned()
  }

  pub(crate) async fn persist(&self, tree: &WorkflowProcessor) {
    if let Err(e) = self.repository.save(tree).await {
      error!(instance_id = %tree.instance_id, error = %e, "snapshot_save_failed");
    }
  }

  /// Queue an advance of `handle` unless one is already queued.
  pub(crate) fn schedule(self: &Arc<Self>, handle: &Arc<InstanceHandle>) {
    if handle.cancel.is_cancelled() || handle.scheduled.swap(true, Ordering::SeqCst) {
      return;
    }

    let inner = self.clone();
    let task = handle.clone();
    let job = async move {
      task.scheduled.store(false, Ordering::SeqCst);
      inner.advance(&task).await;
    }
    .boxed();

    match self.pool.submit(handle.priority(), job) {
      Ok(()) => {}
      Err(EngineError::QueueFull) => {
        handle.scheduled.store(false, Ordering::SeqCst);
        warn!(instance_id = %handle.id, "advance_deferred");
        self.schedule_at(handle, Instant::now() + self.config.poll_interval());
      }
      Err(e) => {
        handle.scheduled.store(false, Ordering::SeqCst);
        debug!(instance_id = %handle.id, error = %e, "advance_not_scheduled");
      }
    }
  }

  fn schedule_at(self: &Arc<Self>, handle: &Arc<InstanceHandle>, deadline: Instant) {
    if !handle.arm_timer(deadline) {
      return;
    }
    let inner = self.clone();
    let handle = handle.clone();
    tokio::spawn(async move {
      tokio::select! {
        _ = handle.cancel.cancelled() => {}
        _ = tokio::time::sleep_until(deadline) => {
          handle.disarm_timer(deadline);
          inner.schedule(&handle);
        }
      }
    });
  }

  #[instrument(name = "advance", skip(self, handle), fields(instance_id = %handle.id))]
  pub(crate) async fn advance(self: &Arc<Self>, handle: &Arc<InstanceHandle>) {
    let mut driver = handle.driver.lock().await;
    if handle.cancel.is_cancelled() {
      return;
    }

    let mut dirty = false;
    while !self.halted(handle) && self.advance_once(handle, &mut driver).await {
      dirty = true;
    }
    if dirty {
      self.persist(&driver.tree).await;
    }

    if driver.tree.is_terminal() {
      self.finish(handle, &mut driver).await;
      return;
    }
    if !self.halted(handle)
      && let Some(deadline) = driver.earliest_retry()
    {
      self.schedule_at(handle, deadline);
    }
  }

  /// One walk over the tree. Returns whether any processor changed.
  async fn advance_once(&self, handle: &InstanceHandle, driver: &mut InstanceDriver) -> bool {
    let mut changed = false;
    let mut stack: Vec<Vec<usize>> = vec![Vec::new()];

    while let Some(path) = stack.pop() {
      if self.halted(handle) {
        break;
      }
      let Some(node) = driver.tree.descendant(&path) else {
        continue;
      };
      let is_task = node.is_task();

      match node.state.kind.clone() {
        StateKind::Loaded => {
          // children are admitted by their parent
          if path.is_empty() {
            self.set_state(&mut driver.tree, StateKind::Queued, "admitted");
            changed = true;
            stack.push(path);
          }
        }
        StateKind::Queued => {
          changed |= self.step_queued(driver, &path).await;
        }
        StateKind::WaitingOnResources { .. } if is_task => {
          changed |= self.step_dispatch(driver, &path).await;
        }
        StateKind::Executing if is_task => {
          changed |= self.step_task(driver, &path);
        }
        StateKind::Executing | StateKind::WaitingOnResources { .. } => {
          changed |= self.step_composite(driver, &path);
          if let Some(node) = driver.tree.descendant(&path)
            && !node.is_terminal()
          {
            for (index, child) in node.children().iter().enumerate().rev() {
              if child.state.kind != StateKind::Loaded && !child.is_terminal() {
                let mut child_path = path.clone();
                child_path.push(index);
                stack.push(child_path);
              }
            }
          }
        }
        StateKind::Paused { .. } | StateKind::Success | StateKind::Failure => {}
      }
    }
    changed
  }

  fn backing_off(&self, driver: &InstanceDriver, path: &[usize]) -> bool {
    driver
      .not_before(path)
      .is_some_and(|deadline| Instant::now() < deadline)
  }

  async fn step_queued(&self, driver: &mut InstanceDriver, path: &[usize]) -> bool {
    if self.backing_off(driver, path) {
      return false;
    }
    match self.gate(driver, path, Stage::Pre) {
      Gate::Open => {}
      Gate::Blocked => return true,
      Gate::Exhausted { attempts } => {
        let cause = FailureCause::ConditionBlocked {
          stage: Stage::Pre.name(),
          attempts,
        };
        self.fail_node(driver, path, cause);
        return true;
      }
    }

    let Some(node) = driver.tree.descendant_mut(path) else {
      return false;
    };
    if node.is_task() {
      self.step_dispatch(driver, path).await
    } else {
      self.set_state(node, StateKind::Executing, "executing");
      true
    }
  }

  /// Evaluate the pre- or post-condition sub-tree of the processor at `path`.
  fn gate(&self, driver: &mut InstanceDriver, path: &[usize], stage: Stage) -> Gate {
    let passed = {
      let Some(node) = driver.tree.descendant_mut(path) else {
        return Gate::Open;
      };
      let context = node.metadata();
      let condition = match stage {
        Stage::Pre => node.pre_conditions.as_deref_mut(),
        Stage::Post => node.post_conditions.as_deref_mut(),
      };
      match condition {
        Some(condition) => evaluate_condition(condition, &self.registry, &context),
        None => return Gate::Open,
      }
    };

    let retry = driver.retries.entry(path.to_vec()).or_default();
    if passed {
      retry.not_before = None;
      return Gate::Open;
    }

    let Some(node) = driver.tree.descendant_mut(path) else {
      return Gate::Open;
    };
    node.times_blocked += 1;
    let attempts = match stage {
      Stage::Pre => node.times_blocked,
      Stage::Post => {
        retry.post_attempts += 1;
        retry.post_attempts
      }
    };

    let policy = &self.config.condition_retry;
    if policy.exhausted(attempts) {
      return Gate::Exhausted { attempts };
    }
    retry.not_before = Some(Instant::now() + policy.delay(attempts));
    debug!(
      instance_id = %node.instance_id,
      model_id = %node.model_id,
      stage = stage.name(),
      attempts,
      "conditions_blocked"
    );
    Gate::Blocked
  }

  /// Post-conditions, then success.
  fn conclude(&self, driver: &mut InstanceDriver, path: &[usize], message: String) -> bool {
    if self.backing_off(driver, path) {
      return false;
    }
    match self.gate(driver, path, Stage::Post) {
      Gate::Open => self.succeed_node(driver, path, message),
      Gate::Blocked => {}
      Gate::Exhausted { attempts } => {
        let cause = FailureCause::ConditionBlocked {
          stage: Stage::Post.name(),
          attempts,
        };
        self.fail_node(driver, path, cause);
      }
    }
    true
  }

  /// A task still `Executing` whose remote work already finished is waiting
  /// on its post-conditions.
  fn step_task(&self, driver: &mut InstanceDriver, path: &[usize]) -> bool {
    let Some(node) = driver.tree.descendant(path) else {
      return false;
    };
    if node.job_id.is_some() || node.info.completion_time.is_none() {
      return false;
    }
    self.conclude(driver, path, "task succeeded".to_string())
  }

  fn step_composite(&self, driver: &mut InstanceDriver, path: &[usize]) -> bool {
    let Some(node) = driver.tree.descendant(path) else {
      return false;
    };
    let tally = node.quorum();
    match tally.status() {
      QuorumStatus::Unreachable => {
        let cause = FailureCause::QuorumNotMet {
          succeeded: tally.succeeded,
          required: tally.required,
        };
        self.fail_node(driver, path, cause);
        true
      }
      QuorumStatus::Met => {
        let message = format!(
          "quorum met: {} succeeded, {} required",
          tally.succeeded, tally.required
        );
        self.conclude(driver, path, message)
      }
      QuorumStatus::Pending => self.admit_children(driver, path),
    }
  }

  fn admit_children(&self, driver: &mut InstanceDriver, path: &[usize]) -> bool {
    let Some(node) = driver.tree.descendant_mut(path) else {
      return false;
    };
    let sequential = matches!(node.kind, ProcessorKind::Sequential { .. });
    let mut changed = false;

    let mut admit = Vec::new();
    for (index, child) in node.children().iter().enumerate() {
      if child.is_terminal() {
        continue;
      }
      if child.state.kind == StateKind::Loaded {
        admit.push(index);
      }
      if sequential {
        break;
      }
    }

    let inherited = node.dynamic_metadata.clone();
    for index in admit {
      let child = &mut node.children_mut()[index];
      child.dynamic_metadata = merge(&child.dynamic_metadata, &inherited);
      self.set_state(child, StateKind::Queued, "admitted");
      changed = true;
    }

    let mut active = node
      .children()
      .iter()
      .filter(|c| c.state.kind != StateKind::Loaded && !c.is_terminal())
      .peekable();
    let all_waiting = active.peek().is_some()
      && active.all(|c| matches!(c.state.kind, StateKind::WaitingOnResources { .. }));
    let waiting = matches!(node.state.kind, StateKind::WaitingOnResources { .. });

    if all_waiting && !waiting {
      self.set_state(
        node,
        StateKind::waiting_on(StateKind::Executing),
        "all children waiting on resources",
      );
      changed = true;
    } else if !all_waiting && waiting {
      self.set_state(node, StateKind::Executing, "executing");
      changed = true;
    }
    changed
  }

  async fn step_dispatch(&self, driver: &mut InstanceDriver, path: &[usize]) -> bool {
    if self.backing_off(driver, path) {
      return false;
    }
    let (job, previous) = {
      let Some(node) = driver.tree.descendant(path) else {
        return false;
      };
      let Some(instance_class) = node.instance_class() else {
        return false;
      };
      let job = JobSpec {
        job_id: Uuid::new_v4().to_string(),
        instance_id: node.instance_id.clone(),
        model_id: node.model_id.clone(),
        model_name: node.model_name.clone(),
        instance_class: instance_class.to_string(),
        metadata: node.metadata(),
      };
      (job, node.state.kind.clone())
    };

    let exec_node = match self.acquire_node().await {
      Ok(Some(exec_node)) => exec_node,
      Ok(None) => {
        driver.retries.entry(path.to_vec()).or_default().not_before =
          Some(Instant::now() + self.config.poll_interval());
        if previous != StateKind::Queued {
          return false;
        }
        let Some(node) = driver.tree.descendant_mut(path) else {
          return false;
        };
        self.set_state(
          node,
          StateKind::waiting_on(StateKind::Queued),
          "no execution node has capacity",
        );
        return true;
      }
      Err(e) => return self.dispatch_failed(driver, path, e.to_string()),
    };

    let job_id = job.job_id.clone();
    match self.batch.execute_remotely(job, &exec_node).await {
      Ok(true) => {}
      Ok(false) => {
        self.release(&exec_node).await;
        return self.dispatch_failed(driver, path, format!("node {exec_node} refused the job"));
      }
      Err(e) => {
        self.release(&exec_node).await;
        return self.dispatch_failed(driver, path, e.to_string());
      }
    }

    driver.jobs.insert(job_id.clone(), exec_node.clone());
    driver.retries.remove(path);
    let Some(node) = driver.tree.descendant_mut(path) else {
      return true;
    };
    node.job_id = Some(job_id.clone());
    self.set_state(node, StateKind::Executing, format!("dispatched to {exec_node}"));
    info!(
      instance_id = %node.instance_id,
      model_id = %node.model_id,
      job_id = %job_id,
      node = %exec_node,
      "task_dispatched"
    );
    self.emit(ExecutionEvent::TaskDispatched {
      instance_id: node.instance_id.clone(),
      model_id: node.model_id.clone(),
      job_id,
      node: exec_node,
    });
    true
  }

  /// First node that accepts the task's load.
  async fn acquire_node(&self) -> Result<Option<String>, ResourceError> {
    for node in self.monitor.get_nodes().await? {
      match self.monitor.assign_load(&node, self.config.task_load).await {
        Ok(true) => return Ok(Some(node)),
        Ok(false) => {}
        Err(e) => warn!(node = %node, error = %e, "assign_load_failed"),
      }
    }
    Ok(None)
  }

  pub(crate) async fn release(&self, node: &str) {
    match self.monitor.reduce_load(node, self.config.task_load).await {
      Ok(true) => {}
      Ok(false) => warn!(node, "load_underflow"),
      Err(e) => warn!(node, error = %e, "reduce_load_failed"),
    }
  }

  fn dispatch_failed(&self, driver: &mut InstanceDriver, path: &[usize], message: String) -> bool {
    let policy = &self.config.dispatch_retry;
    let retry = driver.retries.entry(path.to_vec()).or_default();
    retry.dispatch_attempts += 1;
    let attempts = retry.dispatch_attempts;

    if policy.exhausted(attempts) {
      self.fail_node(driver, path, FailureCause::Dispatch { attempts, message });
      return true;
    }
    retry.not_before = Some(Instant::now() + policy.delay(attempts));

    let Some(node) = driver.tree.descendant_mut(path) else {
      return true;
    };
    warn!(
      instance_id = %node.instance_id,
      model_id = %node.model_id,
      attempts,
      error = %message,
      "dispatch_failed"
    );
    let waiting = StateKind::waiting_on(StateKind::Executing);
    if node.state.kind != waiting {
      self.set_state(
        node,
        waiting,
        format!("dispatch attempt {attempts} failed: {message}"),
      );
    }
    true
  }

  pub(crate) fn fail_node(&self, driver: &mut InstanceDriver, path: &[usize], cause: FailureCause) {
    if let Some(node) = driver.tree.descendant_mut(path) {
      warn!(
        instance_id = %node.instance_id,
        model_id = %node.model_id,
        cause = %cause,
        "processor_failed"
      );
      self.set_state(node, StateKind::Failure, cause.to_string());
    }
    driver.forget(path);
  }

  /// Mark the processor successful and hand its pass-through metadata to its
  /// parent.
  fn succeed_node(&self, driver: &mut InstanceDriver, path: &[usize], message: String) {
    let pass = {
      let Some(node) = driver.tree.descendant_mut(path) else {
        return;
      };
      self.set_state(node, StateKind::Success, message);
      node.pass_through_metadata()
    };
    driver.forget(path);
    if let Some((_, parent_path)) = path.split_last()
      && let Some(parent) = driver.tree.descendant_mut(parent_path)
    {
      parent.dynamic_metadata.merge_from(&pass);
    }
  }

  #[instrument(
    name = "complete_task",
    skip(self, completion),
    fields(instance_id = %completion.instance_id, job_id = %completion.job_id)
  )]
  pub(crate) async fn complete_task(self: &Arc<Self>, completion: TaskCompletion) -> bool {
    let Some(handle) = self.instance(&completion.instance_id).await else {
      warn!("completion_for_unknown_instance");
      return false;
    };
    let mut driver = handle.driver.lock().await;
    if handle.cancel.is_cancelled() {
      return false;
    }
    let Some(path) = driver.tree.find_job(&completion.job_id) else {
      warn!("stale_completion");
      return false;
    };

    let exec_node = match driver.jobs.remove(&completion.job_id) {
      Some(exec_node) => Some(exec_node),
      None => self
        .batch
        .get_execution_node(&completion.job_id)
        .await
        .unwrap_or_else(|e| {
          warn!(error = %e, "execution_node_lookup_failed");
          None
        }),
    };
    if let Some(exec_node) = exec_node {
      self.release(&exec_node).await;
    }

    let success = completion.outcome == TaskOutcome::Success;
    let has_post = {
      let Some(node) = driver.tree.descendant_mut(&path) else {
        return false;
      };
      node.job_id = None;
      self.emit(ExecutionEvent::TaskCompleted {
        instance_id: node.instance_id.clone(),
        model_id: node.model_id.clone(),
        job_id: completion.job_id.clone(),
        success,
      });
      if success {
        node.dynamic_metadata.merge_from(&completion.metadata);
      }
      node.post_conditions.is_some()
    };

    match completion.outcome {
      TaskOutcome::Success if has_post => {
        if let Some(node) = driver.tree.descendant_mut(&path) {
          node.info.mark_completed(Utc::now());
        }
      }
      TaskOutcome::Success => {
        info!("task_succeeded");
        self.succeed_node(&mut driver, &path, "task succeeded".to_string());
      }
      TaskOutcome::Failure { message } => {
        self.fail_node(&mut driver, &path, FailureCause::TaskExecution { message });
      }
    }

    self.persist(&driver.tree).await;
    if driver.tree.is_terminal() {
      self.finish(&handle, &mut driver).await;
    } else {
      drop(driver);
      self.schedule(&handle);
    }
    true
  }

  /// Ask the batch manager to kill a job, bounded by the stop timeout, and
  /// release the load it held.
  pub(crate) async fn kill(&self, job_id: &str, node: &str) {
    let kill = self.batch.kill_job(job_id, node);
    match tokio::time::timeout(self.config.stop_timeout(), kill).await {
      Ok(Ok(true)) => info!(job_id, node, "job_killed"),
      Ok(Ok(false)) => debug!(job_id, node, "job_already_finished"),
      Ok(Err(e)) => warn!(job_id, node, error = %e, "kill_failed"),
      Err(_) => warn!(job_id, node, "kill_timed_out"),
    }
    self.release(node).await;
  }

  /// Retire an instance whose root is terminal: kill leftover jobs, fail
  /// every processor left unfinished, emit the final event and drop the
  /// instance from the active set. The repository keeps the archived
  /// snapshot.
  pub(crate) async fn finish(&self, handle: &InstanceHandle, driver: &mut InstanceDriver) {
    if handle.cancel.is_cancelled() {
      return;
    }
    handle.cancel.cancel();

    let jobs: Vec<(String, String)> = driver.jobs.drain().collect();
    for (job_id, node) in &jobs {
      self.kill(job_id, node).await;
    }

    let reason = FailureCause::Abandoned.to_string();
    let mut abandoned = 0;
    driver.tree.for_each_mut(|node| {
      node.job_id = None;
      if !node.is_condition && !node.is_terminal() {
        self.set_state(node, StateKind::Failure, reason.clone());
        abandoned += 1;
      }
    });
    if !jobs.is_empty() || abandoned > 0 {
      debug!(instance_id = %handle.id, killed = jobs.len(), abandoned, "unfinished_processors_failed");
      self.persist(&driver.tree).await;
    }
    driver.retries.clear();
    self.instances.write().await.remove(&handle.id);

    let root = &driver.tree;
    match root.state.kind {
      StateKind::Success => {
        info!(instance_id = %handle.id, "instance_completed");
        self.emit(ExecutionEvent::InstanceCompleted {
          instance_id: handle.id.clone(),
        });
      }
      _ => {
        warn!(instance_id = %handle.id, error = %root.state.message, "instance_failed");
        self.emit(ExecutionEvent::InstanceFailed {
          instance_id: handle.id.clone(),
          error: root.state.message.clone(),
        });
      }
    }
  }
}
