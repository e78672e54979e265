use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;

use crate::error::ResourceError;

/// Per-node load accounting.
#[async_trait]
pub trait ResourceMonitor: Send + Sync {
  async fn get_load(&self, node: &str) -> Result<u32, ResourceError>;

  /// Add `amount` to the node's load if it stays within capacity.
  /// Returns `false` without changing anything otherwise.
  async fn assign_load(&self, node: &str, amount: u32) -> Result<bool, ResourceError>;

  /// Subtract `amount`, flooring at zero. Returns `false` if the floor was hit.
  async fn reduce_load(&self, node: &str, amount: u32) -> Result<bool, ResourceError>;

  async fn get_nodes(&self) -> Result<Vec<String>, ResourceError>;
}

#[derive(Debug)]
struct NodeLoad {
  capacity: u32,
  load: AtomicU32,
}

/// In-process monitor with a fixed set of nodes and an atomic load counter
/// per node.
#[derive(Debug, Default)]
pub struct LoadMonitor {
  nodes: BTreeMap<String, NodeLoad>,
}

impl LoadMonitor {
  pub fn new() -> Self {
    Self::default()
  }

  /// Add a node with the given capacity.
  pub fn with_node(mut self, node: impl Into<String>, capacity: u32) -> Self {
    self.nodes.insert(
      node.into(),
      NodeLoad {
        capacity,
        load: AtomicU32::new(0),
      },
    );
    self
  }

  pub fn capacity(&self, node: &str) -> Option<u32> {
    self.nodes.get(node).map(|n| n.capacity)
  }

  fn node(&self, node: &str) -> Result<&NodeLoad, ResourceError> {
    self
      .nodes
      .get(node)
      .ok_or_else(|| ResourceError::UnknownNode(node.to_string()))
  }
}

#[async_trait]
impl ResourceMonitor for LoadMonitor {
  async fn get_load(&self, node: &str) -> Result<u32, ResourceError> {
    Ok(self.node(node)?.load.load(Ordering::SeqCst))
  }

  async fn assign_load(&self, node: &str, amount: u32) -> Result<bool, ResourceError> {
    let entry = self.node(node)?;
    let assigned = entry
      .load
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
        current
          .checked_add(amount)
          .filter(|next| *next <= entry.capacity)
      })
      .is_ok();
    Ok(assigned)
  }

  async fn reduce_load(&self, node: &str, amount: u32) -> Result<bool, ResourceError> {
    let entry = self.node(node)?;
    let previous = entry
      .load
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
        Some(current.saturating_sub(amount))
      })
      .unwrap_or_else(|current| current);
    Ok(previous >= amount)
  }

  async fn get_nodes(&self) -> Result<Vec<String>, ResourceError> {
    Ok(self.nodes.keys().cloned().collect())
  }
}
