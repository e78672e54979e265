use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::types::Json;
use sqlx::{FromRow, SqlitePool};
use weft_processor::WorkflowProcessor;

use crate::{InstanceRepository, StoreError};

/// A saved instance as stored in the database.
#[derive(Debug, Clone, FromRow)]
pub struct InstanceRecord {
  pub instance_id: String,
  pub model_id: String,
  pub state: String,
  pub active: bool,
  pub snapshot: Json<WorkflowProcessor>,
  pub updated_at: DateTime<Utc>,
}

/// SQLite-based repository implementation.
pub struct SqliteRepository {
  pool: SqlitePool,
}

impl SqliteRepository {
  /// Create a new SQLite repository with the given connection pool.
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }

  /// Open (creating if needed) a database file and run migrations.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
    let options = SqliteConnectOptions::new()
      .filename(path)
      .create_if_missing(true);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    let repo = Self::new(pool);
    repo.migrate().await?;
    Ok(repo)
  }

  /// Run database migrations.
  pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(&self.pool).await
  }

  /// Every saved instance, most recently updated first.
  pub async fn records(&self) -> Result<Vec<InstanceRecord>, StoreError> {
    let records = sqlx::query_as(
      r#"
      SELECT instance_id, model_id, state, active, snapshot, updated_at
      FROM workflow_instances
      ORDER BY updated_at DESC
      "#,
    )
    .fetch_all(&self.pool)
    .await?;
    Ok(records)
  }
}

#[async_trait]
impl InstanceRepository for SqliteRepository {
  async fn load(&self, instance_id: &str) -> Result<Option<WorkflowProcessor>, StoreError> {
    let record: Option<InstanceRecord> = sqlx::query_as(
      r#"
      SELECT instance_id, model_id, state, active, snapshot, updated_at
      FROM workflow_instances
      WHERE instance_id = ?
      "#,
    )
    .bind(instance_id)
    .fetch_optional(&self.pool)
    .await?;

    Ok(record.map(|r| r.snapshot.0))
  }

  async fn save(&self, tree: &WorkflowProcessor) -> Result<(), StoreError> {
    sqlx::query(
      r#"
      INSERT INTO workflow_instances (instance_id, model_id, state, active, snapshot, updated_at)
      VALUES (?, ?, ?, ?, ?, ?)
      ON CONFLICT(instance_id) DO UPDATE SET
        model_id = excluded.model_id,
        state = excluded.state,
        active = excluded.active,
        snapshot = excluded.snapshot,
        updated_at = excluded.updated_at
      "#,
    )
    .bind(&tree.instance_id)
    .bind(&tree.model_id)
    .bind(tree.state.kind.to_string())
    .bind(!tree.is_terminal())
    .bind(Json(tree))
    .bind(Utc::now())
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn list_active(&self) -> Result<Vec<String>, StoreError> {
    let ids: Vec<(String,)> = sqlx::query_as(
      r#"
      SELECT instance_id
      FROM workflow_instances
      WHERE active = 1
      ORDER BY updated_at ASC
      "#,
    )
    .fetch_all(&self.pool)
    .await?;

    Ok(ids.into_iter().map(|(id,)| id).collect())
  }

  async fn delete(&self, instance_id: &str) -> Result<bool, StoreError> {
    let result = sqlx::query("DELETE FROM workflow_instances WHERE instance_id = ?")
      .bind(instance_id)
      .execute(&self.pool)
      .await?;

    Ok(result.rows_affected() > 0)
  }
}
