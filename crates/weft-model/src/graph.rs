use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::model::{ModelSet, WorkflowModel};

/// A model node expanded into a tree with its condition sub-graphs attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowGraph {
  pub model: WorkflowModel,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub pre_conditions: Option<Box<WorkflowGraph>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub post_conditions: Option<Box<WorkflowGraph>>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub children: Vec<WorkflowGraph>,
  /// True for every node of a pre- or post-condition sub-graph.
  #[serde(default)]
  pub is_condition: bool,
}

#[derive(Debug, Clone, Copy)]
enum Slot {
  Root,
  Pre,
  Child,
  Post,
}

struct Frame<'a> {
  model: &'a WorkflowModel,
  slot: Slot,
  is_condition: bool,
  /// References still to resolve, popped from the back.
  pending: Vec<(Slot, &'a str)>,
  pre: Option<WorkflowGraph>,
  post: Option<WorkflowGraph>,
  children: Vec<WorkflowGraph>,
}

impl<'a> Frame<'a> {
  fn new(model: &'a WorkflowModel, slot: Slot, is_condition: bool) -> Self {
    let mut pending = Vec::with_capacity(model.children.len() + 2);
    if let Some(post) = model.post_conditions.as_deref() {
      pending.push((Slot::Post, post));
    }
    for child in model.children.iter().rev() {
      pending.push((Slot::Child, child.as_str()));
    }
    if let Some(pre) = model.pre_conditions.as_deref() {
      pending.push((Slot::Pre, pre));
    }
    Self {
      model,
      slot,
      is_condition,
      pending,
      pre: None,
      post: None,
      children: Vec::new(),
    }
  }

  fn finish(self) -> (Slot, WorkflowGraph) {
    let graph = WorkflowGraph {
      model: self.model.clone(),
      pre_conditions: self.pre.map(Box::new),
      post_conditions: self.post.map(Box::new),
      children: self.children,
      is_condition: self.is_condition,
    };
    (self.slot, graph)
  }
}

impl WorkflowGraph {
  /// A graph made of a single node with no children or conditions.
  pub fn leaf(model: WorkflowModel) -> Self {
    Self {
      model,
      pre_conditions: None,
      post_conditions: None,
      children: Vec::new(),
      is_condition: false,
    }
  }

  /// Expand `root_id` into a tree.
  ///
  /// A model may appear in several branches (each occurrence becomes its own
  /// node), but never inside its own sub-tree. Condition sub-graphs and all of
  /// their descendants are marked `is_condition`.
  pub fn resolve(root_id: &str, models: &ModelSet) -> Result<WorkflowGraph, ModelError> {
    let root = models
      .get(root_id)
      .ok_or_else(|| ModelError::ModelNotFound(root_id.to_string()))?;

    let mut on_path: HashSet<&str> = HashSet::new();
    on_path.insert(root.id.as_str());
    let mut stack = vec![Frame::new(root, Slot::Root, false)];

    while let Some(top) = stack.last_mut() {
      if let Some((slot, reference)) = top.pending.pop() {
        let model = models.get(reference).ok_or_else(|| ModelError::UnknownReference {
          from: top.model.id.clone(),
          to: reference.to_string(),
        })?;
        if !on_path.insert(model.id.as_str()) {
          return Err(ModelError::Cycle(model.id.clone()));
        }
        let is_condition = top.is_condition || matches!(slot, Slot::Pre | Slot::Post);
        stack.push(Frame::new(model, slot, is_condition));
        continue;
      }

      let Some(frame) = stack.pop() else { break };
      on_path.remove(frame.model.id.as_str());
      let (slot, graph) = frame.finish();

      match (slot, stack.last_mut()) {
        (Slot::Root, _) | (_, None) => return Ok(graph),
        (Slot::Pre, Some(parent)) => parent.pre = Some(graph),
        (Slot::Post, Some(parent)) => parent.post = Some(graph),
        (Slot::Child, Some(parent)) => parent.children.push(graph),
      }
    }

    Err(ModelError::ModelNotFound(root_id.to_string()))
  }

  pub fn id(&self) -> &str {
    &self.model.id
  }

  /// Every node of the tree in pre-order, condition sub-graphs included.
  pub fn nodes(&self) -> Vec<&WorkflowGraph> {
    let mut out = Vec::new();
    let mut stack = vec![self];
    while let Some(node) = stack.pop() {
      out.push(node);
      if let Some(post) = &node.post_conditions {
        stack.push(post);
      }
      for child in node.children.iter().rev() {
        stack.push(child);
      }
      if let Some(pre) = &node.pre_conditions {
        stack.push(pre);
      }
    }
    out
  }

  pub fn node_count(&self) -> usize {
    self.nodes().len()
  }
}
