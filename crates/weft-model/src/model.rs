use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use weft_metadata::Metadata;

use crate::error::ModelError;
use crate::graph::WorkflowGraph;

/// Static definition of one workflow node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowModel {
  pub id: String,
  pub name: String,
  /// Execution-type tag, resolved by the processor registry
  /// (e.g. "task", "sequential", "parallel", "condition").
  pub execution_type: String,
  /// Ordered child model ids.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub children: Vec<String>,
  /// Registry key of the task or condition implementation (leaves only).
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub instance_class: Option<String>,
  #[serde(default)]
  pub priority: i32,
  /// Minimum number of non-excused children that must succeed.
  /// `None` means all of them.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub min_required_successful: Option<usize>,
  #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
  pub excused: BTreeSet<String>,
  #[serde(default, skip_serializing_if = "Metadata::is_empty")]
  pub static_metadata: Metadata,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub pre_conditions: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub post_conditions: Option<String>,
}

impl WorkflowModel {
  pub fn new(
    id: impl Into<String>,
    name: impl Into<String>,
    execution_type: impl Into<String>,
  ) -> Self {
    Self {
      id: id.into(),
      name: name.into(),
      execution_type: execution_type.into(),
      children: Vec::new(),
      instance_class: None,
      priority: 0,
      min_required_successful: None,
      excused: BTreeSet::new(),
      static_metadata: Metadata::new(),
      pre_conditions: None,
      post_conditions: None,
    }
  }

  pub fn with_children<I, S>(mut self, children: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.children = children.into_iter().map(Into::into).collect();
    self
  }

  pub fn with_instance_class(mut self, class: impl Into<String>) -> Self {
    self.instance_class = Some(class.into());
    self
  }

  pub fn with_priority(mut self, priority: i32) -> Self {
    self.priority = priority;
    self
  }

  pub fn with_min_required(mut self, min: usize) -> Self {
    self.min_required_successful = Some(min);
    self
  }

  pub fn with_excused(mut self, child_id: impl Into<String>) -> Self {
    self.excused.insert(child_id.into());
    self
  }

  pub fn with_static_metadata(mut self, metadata: Metadata) -> Self {
    self.static_metadata = metadata;
    self
  }

  pub fn with_pre_conditions(mut self, model_id: impl Into<String>) -> Self {
    self.pre_conditions = Some(model_id.into());
    self
  }

  pub fn with_post_conditions(mut self, model_id: impl Into<String>) -> Self {
    self.post_conditions = Some(model_id.into());
    self
  }

  /// Ids of every model this one references, children first.
  pub fn references(&self) -> impl Iterator<Item = &str> {
    self
      .children
      .iter()
      .map(String::as_str)
      .chain(self.pre_conditions.as_deref())
      .chain(self.post_conditions.as_deref())
  }
}

#[derive(Debug, Deserialize, Serialize)]
struct ModelSetDef {
  models: Vec<WorkflowModel>,
}

/// A loaded collection of models, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct ModelSet {
  models: HashMap<String, WorkflowModel>,
}

impl ModelSet {
  /// Build a model set, validating ids and references.
  pub fn from_models(models: impl IntoIterator<Item = WorkflowModel>) -> Result<Self, ModelError> {
    let mut map = HashMap::new();
    for model in models {
      if map.contains_key(&model.id) {
        return Err(ModelError::DuplicateModel(model.id));
      }
      map.insert(model.id.clone(), model);
    }

    for model in map.values() {
      for reference in model.references() {
        if !map.contains_key(reference) {
          return Err(ModelError::UnknownReference {
            from: model.id.clone(),
            to: reference.to_string(),
          });
        }
      }
      if let Some(child_id) = model.excused.iter().find(|e| !model.children.contains(*e)) {
        return Err(ModelError::InvalidExcused {
          model_id: model.id.clone(),
          child_id: child_id.clone(),
        });
      }
    }

    Ok(Self { models: map })
  }

  /// Load from a JSON document of the form `{"models": [...]}`.
  pub fn from_json(json: &str) -> Result<Self, ModelError> {
    let def: ModelSetDef = serde_json::from_str(json)?;
    Self::from_models(def.models)
  }

  pub fn get(&self, model_id: &str) -> Option<&WorkflowModel> {
    self.models.get(model_id)
  }

  pub fn len(&self) -> usize {
    self.models.len()
  }

  pub fn is_empty(&self) -> bool {
    self.models.is_empty()
  }

  pub fn ids(&self) -> impl Iterator<Item = &str> {
    self.models.keys().map(String::as_str)
  }

  /// Resolve a root model into a workflow graph.
  pub fn graph(&self, root_id: &str) -> Result<WorkflowGraph, ModelError> {
    WorkflowGraph::resolve(root_id, self)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_from_json() {
    let set = ModelSet::from_json(
      r#"{
        "models": [
          {"id": "root", "name": "Root", "execution_type": "sequential", "children": ["a"]},
          {
            "id": "a",
            "name": "A",
            "execution_type": "task",
            "instance_class": "echo",
            "priority": 3,
            "static_metadata": {"Product": ["L1"]}
          }
        ]
      }"#,
    )
    .unwrap();

    assert_eq!(set.len(), 2);
    let a = set.get("a").unwrap();
    assert_eq!(a.instance_class.as_deref(), Some("echo"));
    assert_eq!(a.priority, 3);
    assert_eq!(a.static_metadata.get("Product"), Some("L1"));
  }

  #[test]
  fn test_duplicate_model() {
    let result = ModelSet::from_models([
      WorkflowModel::new("a", "A", "task"),
      WorkflowModel::new("a", "A again", "task"),
    ]);
    assert!(matches!(result, Err(ModelError::DuplicateModel(id)) if id == "a"));
  }

  #[test]
  fn test_unknown_reference() {
    let result = ModelSet::from_models([
      WorkflowModel::new("root", "Root", "parallel").with_children(["missing"]),
    ]);
    assert!(matches!(
      result,
      Err(ModelError::UnknownReference { from, to }) if from == "root" && to == "missing"
    ));
  }

  #[test]
  fn test_excused_must_be_child() {
    let result = ModelSet::from_models([
      WorkflowModel::new("root", "Root", "parallel")
        .with_children(["a"])
        .with_excused("b"),
      WorkflowModel::new("a", "A", "task"),
      WorkflowModel::new("b", "B", "task"),
    ]);
    assert!(matches!(result, Err(ModelError::InvalidExcused { .. })));
  }

  #[test]
  fn test_invalid_json() {
    assert!(matches!(
      ModelSet::from_json("{\"models\": 3}"),
      Err(ModelError::Json(_))
    ));
  }
}
