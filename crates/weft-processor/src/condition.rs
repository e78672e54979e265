use tracing::warn;
use weft_metadata::{Metadata, merge};

use crate::processor::{ProcessorKind, WorkflowProcessor};
use crate::quorum::QuorumStatus;
use crate::registry::ExecutionTypeRegistry;
use crate::state::{StateKind, WorkflowState};

struct Frame {
  path: Vec<usize>,
  next: usize,
}

enum Step {
  Descend(Vec<usize>),
  Finish,
}

/// Run a condition sub-tree to completion and reduce it to a boolean.
///
/// The tree is reset first, so repeated evaluations start clean. Leaves run
/// their registered check with the leaf's static metadata merged with
/// `context`; a check that errors or is not registered counts as false.
/// Composites apply the usual quorum rules, and sequential composites stop
/// evaluating children once their quorum is unreachable.
pub fn evaluate_condition(
  tree: &mut WorkflowProcessor,
  registry: &ExecutionTypeRegistry,
  context: &Metadata,
) -> bool {
  tree.for_each_mut(|node| {
    node.state = WorkflowState::loaded();
    node.info.clear_execution();
  });

  let mut stack = vec![Frame {
    path: Vec::new(),
    next: 0,
  }];

  while let Some(frame) = stack.last_mut() {
    let Some(node) = tree.descendant_mut(&frame.path) else {
      stack.pop();
      continue;
    };

    let step = match &node.kind {
      ProcessorKind::Condition { instance_class } => {
        let passed = run_check(registry, instance_class, node, context);
        finish(node, passed);
        Step::Finish
      }
      ProcessorKind::Task { .. } => {
        finish(node, false);
        Step::Finish
      }
      ProcessorKind::Sequential { children } | ProcessorKind::Parallel { children } => {
        let sequential = matches!(node.kind, ProcessorKind::Sequential { .. });
        let len = children.len();
        if node.state.kind == StateKind::Loaded {
          node.transition(StateKind::Executing, "");
        }
        let short_circuit = sequential && node.quorum().status() == QuorumStatus::Unreachable;

        if frame.next < len && !short_circuit {
          let mut child = frame.path.clone();
          child.push(frame.next);
          frame.next += 1;
          Step::Descend(child)
        } else {
          let met = node.quorum().status() == QuorumStatus::Met;
          finish(node, met);
          Step::Finish
        }
      }
    };

    match step {
      Step::Descend(path) => stack.push(Frame { path, next: 0 }),
      Step::Finish => {
        stack.pop();
      }
    }
  }

  tree.state.kind == StateKind::Success
}

fn run_check(
  registry: &ExecutionTypeRegistry,
  instance_class: &str,
  node: &WorkflowProcessor,
  context: &Metadata,
) -> bool {
  let Some(check) = registry.condition(instance_class) else {
    warn!(model_id = %node.model_id, instance_class, "condition_not_registered");
    return false;
  };
  let metadata = merge(&node.static_metadata, context);
  match check.evaluate(&metadata) {
    Ok(passed) => passed,
    Err(e) => {
      warn!(model_id = %node.model_id, error = %e, "condition_check_failed");
      false
    }
  }
}

fn finish(node: &mut WorkflowProcessor, passed: bool) {
  if passed {
    node.succeed("");
  } else {
    node.transition(StateKind::Failure, "condition not satisfied");
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;
  use std::sync::atomic::{AtomicUsize, Ordering};

  use weft_model::{ModelSet, WorkflowModel};

  use super::*;
  use crate::builder::build;
  use crate::registry::InstanceError;

  fn registry(calls: Arc<AtomicUsize>) -> ExecutionTypeRegistry {
    let mut registry = ExecutionTypeRegistry::new();
    let counted = calls.clone();
    registry.register_condition_instance(
      "yes",
      Arc::new(move |_: &Metadata| {
        counted.fetch_add(1, Ordering::SeqCst);
        Ok::<_, InstanceError>(true)
      }),
    );
    let counted = calls;
    registry.register_condition_instance(
      "no",
      Arc::new(move |_: &Metadata| {
        counted.fetch_add(1, Ordering::SeqCst);
        Ok::<_, InstanceError>(false)
      }),
    );
    registry.register_condition_instance(
      "boom",
      Arc::new(|_: &Metadata| Err::<bool, _>(InstanceError::new("boom"))),
    );
    registry.register_condition_instance(
      "has-file",
      Arc::new(|met: &Metadata| Ok::<_, InstanceError>(met.contains_key("File"))),
    );
    registry
  }

  /// Build the pre-condition tree of a dummy composite whose pre-condition
  /// is `cond_root`.
  fn condition_tree(models: Vec<WorkflowModel>, cond_root: &str) -> WorkflowProcessor {
    let mut all = models;
    all.push(WorkflowModel::new("owner", "Owner", "parallel").with_pre_conditions(cond_root));
    let set = ModelSet::from_models(all).unwrap();
    let graph = set.graph("owner").unwrap();
    let registry = registry(Arc::new(AtomicUsize::new(0)));
    let tree = build("i", &graph, &registry).unwrap();
    *tree.pre_conditions.unwrap()
  }

  #[test]
  fn test_single_leaf() {
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = registry(calls.clone());
    let mut tree = condition_tree(
      vec![WorkflowModel::new("c", "C", "condition").with_instance_class("yes")],
      "c",
    );
    assert!(evaluate_condition(&mut tree, &registry, &Metadata::new()));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn test_sequential_short_circuits() {
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = registry(calls.clone());
    let mut tree = condition_tree(
      vec![
        WorkflowModel::new("all", "All", "sequential").with_children(["n", "y1", "y2"]),
        WorkflowModel::new("n", "N", "condition").with_instance_class("no"),
        WorkflowModel::new("y1", "Y1", "condition").with_instance_class("yes"),
        WorkflowModel::new("y2", "Y2", "condition").with_instance_class("yes"),
      ],
      "all",
    );

    assert!(!evaluate_condition(&mut tree, &registry, &Metadata::new()));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(tree.children()[1].state.kind, StateKind::Loaded);
  }

  #[test]
  fn test_parallel_quorum() {
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = registry(calls.clone());
    let mut tree = condition_tree(
      vec![
        WorkflowModel::new("any", "Any", "parallel")
          .with_children(["n", "y"])
          .with_min_required(1),
        WorkflowModel::new("n", "N", "condition").with_instance_class("no"),
        WorkflowModel::new("y", "Y", "condition").with_instance_class("yes"),
      ],
      "any",
    );

    assert!(evaluate_condition(&mut tree, &registry, &Metadata::new()));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[test]
  fn test_error_counts_as_false() {
    let registry = registry(Arc::new(AtomicUsize::new(0)));
    let mut tree = condition_tree(
      vec![WorkflowModel::new("c", "C", "condition").with_instance_class("boom")],
      "c",
    );
    assert!(!evaluate_condition(&mut tree, &registry, &Metadata::new()));
  }

  #[test]
  fn test_context_reaches_leaf_and_reevaluation_resets() {
    let registry = registry(Arc::new(AtomicUsize::new(0)));
    let mut tree = condition_tree(
      vec![WorkflowModel::new("c", "C", "condition").with_instance_class("has-file")],
      "c",
    );

    assert!(!evaluate_condition(&mut tree, &registry, &Metadata::new()));
    assert_eq!(tree.state.kind, StateKind::Failure);

    let context: Metadata = [("File", "a.dat")].into_iter().collect();
    assert!(evaluate_condition(&mut tree, &registry, &context));
    assert_eq!(tree.state.kind, StateKind::Success);
  }
}
