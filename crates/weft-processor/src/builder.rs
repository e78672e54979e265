use chrono::Utc;
use tracing::debug;
use weft_metadata::Metadata;
use weft_model::WorkflowGraph;

use crate::error::ConfigurationError;
use crate::info::ProcessorInfo;
use crate::processor::{ProcessorKind, WorkflowProcessor};
use crate::registry::{ExecutionType, ExecutionTypeRegistry};
use crate::state::WorkflowState;

#[derive(Clone, Copy)]
enum Slot {
  Pre,
  Child,
  Post,
}

struct Frame<'g> {
  graph: &'g WorkflowGraph,
  ty: ExecutionType,
  pending: Vec<(Slot, &'g WorkflowGraph)>,
  pre: Option<WorkflowProcessor>,
  post: Option<WorkflowProcessor>,
  children: Vec<WorkflowProcessor>,
}

/// Compile `graph` into a processor tree for `instance_id`.
///
/// Children are built before their parent and condition sub-graphs share the
/// instance id. Every node starts `Loaded`. Any unresolvable execution type or
/// instance class rejects the whole build.
pub fn build(
  instance_id: &str,
  graph: &WorkflowGraph,
  registry: &ExecutionTypeRegistry,
) -> Result<WorkflowProcessor, ConfigurationError> {
  let created = Utc::now();
  let mut root = open(graph, registry)?;
  let mut stack: Vec<(Slot, Frame<'_>)> = Vec::new();

  loop {
    let top = match stack.last_mut() {
      Some((_, frame)) => frame,
      None => &mut root,
    };
    if let Some((slot, next)) = top.pending.pop() {
      stack.push((slot, open(next, registry)?));
      continue;
    }

    let Some((slot, frame)) = stack.pop() else {
      break;
    };
    let node = close(instance_id, frame, created);
    let parent = match stack.last_mut() {
      Some((_, frame)) => frame,
      None => &mut root,
    };
    match slot {
      Slot::Pre => parent.pre = Some(node),
      Slot::Post => parent.post = Some(node),
      Slot::Child => parent.children.push(node),
    }
  }

  let tree = close(instance_id, root, created);
  debug!(instance_id, nodes = tree.nodes().len(), "processor_tree_built");
  Ok(tree)
}

fn open<'g>(
  graph: &'g WorkflowGraph,
  registry: &ExecutionTypeRegistry,
) -> Result<Frame<'g>, ConfigurationError> {
  let model = &graph.model;
  let ty = registry
    .execution_type(&model.execution_type)
    .ok_or_else(|| ConfigurationError::UnknownExecutionType {
      model_id: model.id.clone(),
      execution_type: model.execution_type.clone(),
    })?;

  validate(graph, ty, registry)?;

  let mut pending = Vec::with_capacity(graph.children.len() + 2);
  if let Some(post) = graph.post_conditions.as_deref() {
    pending.push((Slot::Post, post));
  }
  for child in graph.children.iter().rev() {
    pending.push((Slot::Child, child));
  }
  if let Some(pre) = graph.pre_conditions.as_deref() {
    pending.push((Slot::Pre, pre));
  }

  Ok(Frame {
    graph,
    ty,
    pending,
    pre: None,
    post: None,
    children: Vec::new(),
  })
}

fn validate(
  graph: &WorkflowGraph,
  ty: ExecutionType,
  registry: &ExecutionTypeRegistry,
) -> Result<(), ConfigurationError> {
  let model_id = || graph.model.id.clone();
  let is_leaf = matches!(ty, ExecutionType::Task | ExecutionType::Condition);

  if is_leaf && !graph.children.is_empty() {
    return Err(ConfigurationError::LeafWithChildren {
      model_id: model_id(),
    });
  }
  if graph.is_condition && (graph.pre_conditions.is_some() || graph.post_conditions.is_some()) {
    return Err(ConfigurationError::NestedConditions {
      model_id: model_id(),
    });
  }

  match ty {
    ExecutionType::Task => {
      if graph.is_condition {
        return Err(ConfigurationError::TaskInCondition {
          model_id: model_id(),
        });
      }
      let class = leaf_class(graph)?;
      if !registry.has_task(class) {
        return Err(ConfigurationError::UnresolvableTask {
          model_id: model_id(),
          instance_class: class.to_string(),
        });
      }
    }
    ExecutionType::Condition => {
      if !graph.is_condition {
        return Err(ConfigurationError::ConditionOutsideGraph {
          model_id: model_id(),
        });
      }
      let class = leaf_class(graph)?;
      if !registry.has_condition(class) {
        return Err(ConfigurationError::UnresolvableCondition {
          model_id: model_id(),
          instance_class: class.to_string(),
        });
      }
    }
    ExecutionType::Sequential | ExecutionType::Parallel => {}
  }

  Ok(())
}

fn leaf_class(graph: &WorkflowGraph) -> Result<&str, ConfigurationError> {
  graph
    .model
    .instance_class
    .as_deref()
    .ok_or_else(|| ConfigurationError::MissingInstanceClass {
      model_id: graph.model.id.clone(),
    })
}

fn close(instance_id: &str, frame: Frame<'_>, created: chrono::DateTime<Utc>) -> WorkflowProcessor {
  let model = &frame.graph.model;
  let class = model.instance_class.clone().unwrap_or_default();
  let kind = match frame.ty {
    ExecutionType::Task => ProcessorKind::Task {
      instance_class: class,
    },
    ExecutionType::Condition => ProcessorKind::Condition {
      instance_class: class,
    },
    ExecutionType::Sequential => ProcessorKind::Sequential {
      children: frame.children,
    },
    ExecutionType::Parallel => ProcessorKind::Parallel {
      children: frame.children,
    },
  };

  WorkflowProcessor {
    instance_id: instance_id.to_string(),
    model_id: model.id.clone(),
    model_name: model.name.clone(),
    execution_type: model.execution_type.clone(),
    kind,
    state: WorkflowState::loaded(),
    static_metadata: model.static_metadata.clone(),
    dynamic_metadata: Metadata::new(),
    priority: model.priority,
    min_required_successful: model.min_required_successful,
    excused: model.excused.clone(),
    pre_conditions: frame.pre.map(Box::new),
    post_conditions: frame.post.map(Box::new),
    is_condition: frame.graph.is_condition,
    times_blocked: 0,
    info: ProcessorInfo::new(created),
    job_id: None,
  }
}
