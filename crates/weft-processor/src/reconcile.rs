use tracing::info;

use crate::processor::WorkflowProcessor;
use crate::state::{StateKind, WorkflowState};

pub const RESET_MESSAGE: &str = "reset after restart";

/// Repair a tree loaded after a restart. Returns the number of processors
/// reset.
///
/// Any task caught `Executing`, or waiting on resources while executing, is
/// re-queued with its job id and execution stamps cleared: the process that
/// was tracking its remote job is gone. A paused task gets the same treatment
/// underneath the pause. Composites and conditions are left alone; they
/// recompute from their children.
pub fn reconcile(tree: &mut WorkflowProcessor) -> usize {
  let mut reset = 0;
  tree.for_each_mut(|node| {
    if !node.is_task() || !was_executing(&node.state.kind) {
      return;
    }

    let kind = match &node.state.kind {
      StateKind::Paused { .. } => StateKind::paused(StateKind::Queued),
      _ => StateKind::Queued,
    };
    info!(
      instance_id = %node.instance_id,
      model_id = %node.model_id,
      previous = %node.state.kind,
      "processor_reset"
    );
    node.state = WorkflowState::new(kind, RESET_MESSAGE);
    node.job_id = None;
    node.info.clear_execution();
    reset += 1;
  });
  reset
}

fn was_executing(kind: &StateKind) -> bool {
  match kind {
    StateKind::Executing => true,
    StateKind::WaitingOnResources { previous } => **previous == StateKind::Executing,
    StateKind::Paused { previous } => was_executing(previous),
    _ => false,
  }
}
