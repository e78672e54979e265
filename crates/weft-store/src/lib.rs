//! Weft Store
//!
//! Durable storage for processor trees. The engine saves a snapshot of an
//! instance's whole tree after every change and loads the active ones back
//! at start-up; the repository is its only durability mechanism.
//!
//! The [`InstanceRepository`] trait defines:
//! - Loading and saving snapshots by instance id
//! - Listing instances whose root is not yet terminal
//! - Deleting archived instances

mod memory;
mod sqlite;

pub use memory::InMemoryRepository;
pub use sqlite::{InstanceRecord, SqliteRepository};

use async_trait::async_trait;
use weft_processor::WorkflowProcessor;

/// Error type for repository operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
  /// A database error occurred.
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),

  /// Schema migration failed.
  #[error("migration error: {0}")]
  Migrate(#[from] sqlx::migrate::MigrateError),

  /// A snapshot could not be encoded or decoded.
  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

/// Key-value store of processor tree snapshots, keyed by instance id.
#[async_trait]
pub trait InstanceRepository: Send + Sync {
  /// Load the snapshot of an instance, if one was saved.
  async fn load(&self, instance_id: &str) -> Result<Option<WorkflowProcessor>, StoreError>;

  /// Insert or replace the snapshot of the tree's instance.
  async fn save(&self, tree: &WorkflowProcessor) -> Result<(), StoreError>;

  /// Ids of every saved instance whose root is not terminal.
  async fn list_active(&self) -> Result<Vec<String>, StoreError>;

  /// Remove an instance. Returns `false` if it did not exist.
  async fn delete(&self, instance_id: &str) -> Result<bool, StoreError>;
}
