use std::collections::BTreeSet;
use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use weft_metadata::{Metadata, merge};

use crate::error::FailureCause;
use crate::info::ProcessorInfo;
use crate::quorum::{ChildOutcome, QuorumTally};
use crate::state::{StateKind, WorkflowState};

/// Metadata key listing dynamic keys that stay local to a processor and are
/// never passed up to its parent.
pub const LOCAL_KEYS: &str = "WorkflowProcessor/Local/Keys";

/// Closed set of processor variants. Composites own their children; leaves
/// hold the registry key of their implementation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessorKind {
  Task { instance_class: String },
  Condition { instance_class: String },
  Sequential { children: Vec<WorkflowProcessor> },
  Parallel { children: Vec<WorkflowProcessor> },
}

/// Live, mutable instance of one workflow graph node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowProcessor {
  pub instance_id: String,
  pub model_id: String,
  pub model_name: String,
  /// Execution-type tag the node was built from.
  pub execution_type: String,
  pub kind: ProcessorKind,
  pub state: WorkflowState,
  pub static_metadata: Metadata,
  pub dynamic_metadata: Metadata,
  pub priority: i32,
  pub min_required_successful: Option<usize>,
  pub excused: BTreeSet<String>,
  pub pre_conditions: Option<Box<WorkflowProcessor>>,
  pub post_conditions: Option<Box<WorkflowProcessor>>,
  pub is_condition: bool,
  pub times_blocked: u32,
  pub info: ProcessorInfo,
  /// Id of the job currently dispatched for this task.
  pub job_id: Option<String>,
}

impl WorkflowProcessor {
  pub fn is_task(&self) -> bool {
    matches!(self.kind, ProcessorKind::Task { .. })
  }

  pub fn is_composite(&self) -> bool {
    matches!(
      self.kind,
      ProcessorKind::Sequential { .. } | ProcessorKind::Parallel { .. }
    )
  }

  pub fn instance_class(&self) -> Option<&str> {
    match &self.kind {
      ProcessorKind::Task { instance_class } | ProcessorKind::Condition { instance_class } => {
        Some(instance_class)
      }
      _ => None,
    }
  }

  pub fn children(&self) -> &[WorkflowProcessor] {
    match &self.kind {
      ProcessorKind::Sequential { children } | ProcessorKind::Parallel { children } => children,
      _ => &[],
    }
  }

  pub fn children_mut(&mut self) -> &mut [WorkflowProcessor] {
    match &mut self.kind {
      ProcessorKind::Sequential { children } | ProcessorKind::Parallel { children } => children,
      _ => &mut [],
    }
  }

  pub fn is_terminal(&self) -> bool {
    self.state.is_terminal()
  }

  /// Move to `kind`, stamping the processor info for the states that carry a
  /// timestamp.
  pub fn transition(&mut self, kind: StateKind, message: impl Into<String>) {
    let now = Utc::now();
    match kind {
      StateKind::Queued => self.info.mark_ready(now),
      StateKind::Executing => self.info.mark_executing(now),
      StateKind::Success | StateKind::Failure => self.info.mark_completed(now),
      _ => {}
    }
    self.state = WorkflowState::new(kind, message);
  }

  pub fn fail(&mut self, cause: FailureCause) {
    self.transition(StateKind::Failure, cause.to_string());
  }

  pub fn succeed(&mut self, message: impl Into<String>) {
    self.transition(StateKind::Success, message);
  }

  /// Static and dynamic metadata merged.
  pub fn metadata(&self) -> Metadata {
    merge(&self.static_metadata, &self.dynamic_metadata)
  }

  /// Dynamic metadata without the keys declared local through [`LOCAL_KEYS`].
  pub fn pass_through_metadata(&self) -> Metadata {
    let mut pass = self.dynamic_metadata.clone();
    pass.remove(LOCAL_KEYS);
    let local = self
      .dynamic_metadata
      .get_all(LOCAL_KEYS)
      .iter()
      .chain(self.static_metadata.get_all(LOCAL_KEYS));
    for key in local {
      pass.remove(key);
    }
    pass
  }

  /// Tally the children against this processor's quorum settings.
  pub fn quorum(&self) -> QuorumTally {
    let outcomes = self.children().iter().map(|child| {
      let outcome = match child.state.kind {
        StateKind::Success => ChildOutcome::Success,
        StateKind::Failure => ChildOutcome::Failure,
        _ => ChildOutcome::Pending,
      };
      (outcome, self.excused.contains(&child.model_id))
    });
    QuorumTally::tally(outcomes, self.min_required_successful)
  }

  /// Child reached by following `path` (child indices) from this node.
  pub fn descendant(&self, path: &[usize]) -> Option<&WorkflowProcessor> {
    let mut node = self;
    for &index in path {
      node = node.children().get(index)?;
    }
    Some(node)
  }

  pub fn descendant_mut(&mut self, path: &[usize]) -> Option<&mut WorkflowProcessor> {
    let mut node = self;
    for &index in path {
      node = node.children_mut().get_mut(index)?;
    }
    Some(node)
  }

  /// Every node in pre-order, condition sub-trees included.
  pub fn nodes(&self) -> Vec<&WorkflowProcessor> {
    let mut out = Vec::new();
    let mut stack = vec![self];
    while let Some(node) = stack.pop() {
      out.push(node);
      if let Some(post) = node.post_conditions.as_deref() {
        stack.push(post);
      }
      stack.extend(node.children().iter().rev());
      if let Some(pre) = node.pre_conditions.as_deref() {
        stack.push(pre);
      }
    }
    out
  }

  /// Apply `f` to every node, condition sub-trees included.
  pub fn for_each_mut(&mut self, mut f: impl FnMut(&mut WorkflowProcessor)) {
    let mut stack = vec![self];
    while let Some(node) = stack.pop() {
      f(node);
      let WorkflowProcessor {
        kind,
        pre_conditions,
        post_conditions,
        ..
      } = node;
      if let Some(pre) = pre_conditions.as_deref_mut() {
        stack.push(pre);
      }
      if let Some(post) = post_conditions.as_deref_mut() {
        stack.push(post);
      }
      if let ProcessorKind::Sequential { children } | ProcessorKind::Parallel { children } = kind {
        stack.extend(children.iter_mut());
      }
    }
  }

  /// First node (pre-order) built from `model_id`, searching children and
  /// condition sub-trees.
  pub fn find(&self, model_id: &str) -> Option<&WorkflowProcessor> {
    self.nodes().into_iter().find(|n| n.model_id == model_id)
  }

  /// Child path of the task currently dispatched as `job_id`.
  pub fn find_job(&self, job_id: &str) -> Option<Vec<usize>> {
    let mut stack = vec![(Vec::new(), self)];
    while let Some((path, node)) = stack.pop() {
      if node.job_id.as_deref() == Some(job_id) {
        return Some(path);
      }
      for (index, child) in node.children().iter().enumerate() {
        let mut child_path = path.clone();
        child_path.push(index);
        stack.push((child_path, child));
      }
    }
    None
  }

  /// Set the priority of every node.
  pub fn set_priority(&mut self, priority: i32) {
    self.for_each_mut(|node| node.priority = priority);
  }

  /// Indented multi-line rendering of the tree.
  pub fn describe(&self) -> String {
    self.to_string()
  }
}

impl fmt::Display for WorkflowProcessor {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut stack = vec![(0usize, "", self)];
    while let Some((depth, label, node)) = stack.pop() {
      write!(
        f,
        "{:indent$}{}{} ({}) [{}] {}",
        "",
        label,
        node.model_id,
        node.model_name,
        node.execution_type,
        node.state,
        indent = depth * 2
      )?;
      if let Some(job) = &node.job_id {
        write!(f, " job={job}")?;
      }
      if node.times_blocked > 0 {
        write!(f, " blocked={}", node.times_blocked)?;
      }
      writeln!(f)?;

      if let Some(post) = node.post_conditions.as_deref() {
        stack.push((depth + 1, "post: ", post));
      }
      for child in node.children().iter().rev() {
        stack.push((depth + 1, "", child));
      }
      if let Some(pre) = node.pre_conditions.as_deref() {
        stack.push((depth + 1, "pre: ", pre));
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn leaf(model_id: &str) -> WorkflowProcessor {
    WorkflowProcessor {
      instance_id: "inst".into(),
      model_id: model_id.into(),
      model_name: model_id.to_uppercase(),
      execution_type: "task".into(),
      kind: ProcessorKind::Task {
        instance_class: "echo".into(),
      },
      state: WorkflowState::loaded(),
      static_metadata: Metadata::new(),
      dynamic_metadata: Metadata::new(),
      priority: 0,
      min_required_successful: None,
      excused: BTreeSet::new(),
      pre_conditions: None,
      post_conditions: None,
      is_condition: false,
      times_blocked: 0,
      info: ProcessorInfo::new(Utc::now()),
      job_id: None,
    }
  }

  fn parallel(model_id: &str, children: Vec<WorkflowProcessor>) -> WorkflowProcessor {
    WorkflowProcessor {
      execution_type: "parallel".into(),
      kind: ProcessorKind::Parallel { children },
      ..leaf(model_id)
    }
  }

  #[test]
  fn test_pass_through_drops_local_keys() {
    let mut node = leaf("a");
    node.dynamic_metadata.add("Output", "x");
    node.dynamic_metadata.add("Scratch", "tmp");
    node.dynamic_metadata.add("Secret", "s");
    node.dynamic_metadata.add(LOCAL_KEYS, "Scratch");
    node.static_metadata.add(LOCAL_KEYS, "Secret");

    let pass = node.pass_through_metadata();
    assert_eq!(pass.get("Output"), Some("x"));
    assert!(!pass.contains_key("Scratch"));
    assert!(!pass.contains_key("Secret"));
    assert!(!pass.contains_key(LOCAL_KEYS));
  }

  #[test]
  fn test_find_searches_conditions() {
    let mut root = parallel("root", vec![leaf("a"), leaf("b")]);
    let mut check = leaf("check");
    check.kind = ProcessorKind::Condition {
      instance_class: "always".into(),
    };
    check.is_condition = true;
    root.children_mut()[1].pre_conditions = Some(Box::new(check));

    assert_eq!(root.find("b").map(|n| n.model_id.as_str()), Some("b"));
    assert!(root.find("check").unwrap().is_condition);
    assert!(root.find("zzz").is_none());
  }

  #[test]
  fn test_find_job_and_descendant() {
    let mut root = parallel("root", vec![leaf("a"), parallel("p", vec![leaf("b")])]);
    root.descendant_mut(&[1, 0]).unwrap().job_id = Some("job-1".into());

    let path = root.find_job("job-1").unwrap();
    assert_eq!(path, vec![1, 0]);
    assert_eq!(root.descendant(&path).unwrap().model_id, "b");
    assert!(root.find_job("job-2").is_none());
    assert!(root.descendant(&[5]).is_none());
  }

  #[test]
  fn test_set_priority_is_recursive() {
    let mut root = parallel("root", vec![leaf("a"), parallel("p", vec![leaf("b")])]);
    root.set_priority(7);
    assert!(root.nodes().iter().all(|n| n.priority == 7));
  }

  #[test]
  fn test_transition_stamps_info() {
    let mut node = leaf("a");
    node.transition(StateKind::Queued, "");
    node.transition(StateKind::Executing, "");
    node.succeed("done");
    assert!(node.info.ready_time.is_some());
    assert!(node.info.execution_time.is_some());
    assert!(node.info.completion_time.is_some());
    assert_eq!(node.state.message, "done");
  }

  #[test]
  fn test_describe() {
    let mut root = parallel("root", vec![leaf("a")]);
    root.children_mut()[0].job_id = Some("j1".into());
    let text = root.describe();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines[0], "root (ROOT) [parallel] Loaded");
    assert_eq!(lines[1], "  a (A) [task] Loaded job=j1");
  }
}
