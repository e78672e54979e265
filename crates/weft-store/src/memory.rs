use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use weft_processor::WorkflowProcessor;

use crate::{InstanceRepository, StoreError};

struct Entry {
  active: bool,
  snapshot: String,
}

/// In-memory repository. Snapshots are kept serialized, so a loaded tree
/// never shares state with the one that was saved.
#[derive(Default)]
pub struct InMemoryRepository {
  entries: RwLock<BTreeMap<String, Entry>>,
}

impl InMemoryRepository {
  pub fn new() -> Self {
    Self::default()
  }

  pub async fn len(&self) -> usize {
    self.entries.read().await.len()
  }

  pub async fn is_empty(&self) -> bool {
    self.entries.read().await.is_empty()
  }
}

#[async_trait]
impl InstanceRepository for InMemoryRepository {
  async fn load(&self, instance_id: &str) -> Result<Option<WorkflowProcessor>, StoreError> {
    let entries = self.entries.read().await;
    match entries.get(instance_id) {
      Some(entry) => Ok(Some(serde_json::from_str(&entry.snapshot)?)),
      None => Ok(None),
    }
  }

  async fn save(&self, tree: &WorkflowProcessor) -> Result<(), StoreError> {
    let entry = Entry {
      active: !tree.is_terminal(),
      snapshot: serde_json::to_string(tree)?,
    };
    self
      .entries
      .write()
      .await
      .insert(tree.instance_id.clone(), entry);
    Ok(())
  }

  async fn list_active(&self) -> Result<Vec<String>, StoreError> {
    let entries = self.entries.read().await;
    Ok(
      entries
        .iter()
        .filter(|(_, entry)| entry.active)
        .map(|(id, _)| id.clone())
        .collect(),
    )
  }

  async fn delete(&self, instance_id: &str) -> Result<bool, StoreError> {
    Ok(self.entries.write().await.remove(instance_id).is_some())
  }
}
