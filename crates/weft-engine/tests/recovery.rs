//! Restart behaviour: a fresh engine picks up the saved instances of an
//! engine that went away mid-flight.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use weft_engine::ExecutionEvent;
use weft_metadata::Metadata;
use weft_model::WorkflowModel;
use weft_processor::{RESET_MESSAGE, StateKind};
use weft_resource::{BatchManager, JobSpec, ResourceError};
use weft_store::{InMemoryRepository, InstanceRepository, SqliteRepository};

use common::{Harness, config, graph, is_dispatch_of, registry, task};

/// Accepts every job and never reports back, like a batch manager whose
/// process died with the engine.
#[derive(Default)]
struct BlackHole {
  accepted: Mutex<Vec<String>>,
}

#[async_trait]
impl BatchManager for BlackHole {
  async fn execute_remotely(&self, job: JobSpec, _node: &str) -> Result<bool, ResourceError> {
    self.accepted.lock().await.push(job.job_id);
    Ok(true)
  }

  async fn kill_job(&self, _job_id: &str, _node: &str) -> Result<bool, ResourceError> {
    Ok(false)
  }

  async fn get_execution_node(&self, _job_id: &str) -> Result<Option<String>, ResourceError> {
    Ok(None)
  }
}

#[tokio::test]
async fn test_restart_requeues_and_redispatches() {
  let repository = Arc::new(InMemoryRepository::new());
  let black_hole = Arc::new(BlackHole::default());
  let g = graph(
    vec![
      WorkflowModel::new("pipeline", "Pipeline", "sequential").with_children(["a", "b"]),
      task("a", "echo"),
      task("b", "echo"),
    ],
    "pipeline",
  );

  let mut first = Harness::new(
    Arc::new(registry()),
    config(),
    2,
    black_hole.clone(),
    repository.clone(),
  );
  let id = first.engine.start_workflow(&g, Metadata::new()).await.unwrap();
  first.wait_for(|e| is_dispatch_of(e, "a")).await;
  // waits for the advance that dispatched to release the tree
  first.engine.snapshot(&id).await.unwrap();
  first.engine.shutdown();

  let saved = repository.load(&id).await.unwrap().unwrap();
  let lost_job = saved.find("a").unwrap().job_id.clone().unwrap();
  assert_eq!(black_hole.accepted.lock().await.as_slice(), [lost_job.clone()]);

  let (mut second, _batch) =
    Harness::local_with_repository(registry(), config(), 2, repository.clone());
  let recovered = second.engine.recover().await.unwrap();
  assert_eq!(recovered, vec![id.clone()]);

  let events = second.wait_finished(&id).await;
  assert!(matches!(
    events.first(),
    Some(ExecutionEvent::InstanceRecovered { reset: 1, .. })
  ));
  let redispatched = events
    .iter()
    .find_map(|e| match e {
      ExecutionEvent::TaskDispatched { model_id, job_id, .. } if model_id == "a" => Some(job_id),
      _ => None,
    })
    .unwrap();
  assert_ne!(*redispatched, lost_job);

  let tree = second.engine.snapshot(&id).await.unwrap();
  assert_eq!(tree.state.kind, StateKind::Success);
  assert!(repository.list_active().await.unwrap().is_empty());

  // nothing left to pick up
  assert!(second.engine.recover().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_recovered_tree_is_reconciled_before_driving() {
  let repository = Arc::new(InMemoryRepository::new());
  let g = graph(vec![task("solo", "echo")], "solo");

  let mut first = Harness::new(
    Arc::new(registry()),
    config(),
    1,
    Arc::new(BlackHole::default()),
    repository.clone(),
  );
  let id = first.engine.start_workflow(&g, Metadata::new()).await.unwrap();
  first.wait_for(|e| is_dispatch_of(e, "solo")).await;
  first.engine.snapshot(&id).await.unwrap();
  first.engine.shutdown();

  // pause the recovered engine so the reconciled state can be inspected
  let (second, _batch) = Harness::local_with_repository(registry(), config(), 1, repository.clone());
  second.engine.pause_engine();
  second.engine.recover().await.unwrap();

  let tree = second.engine.snapshot(&id).await.unwrap();
  assert_eq!(tree.state.kind, StateKind::Queued);
  assert_eq!(tree.state.message, RESET_MESSAGE);
  assert!(tree.job_id.is_none());
  assert!(tree.info.execution_time.is_none());
}

#[tokio::test]
async fn test_recovery_through_sqlite() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("weft.db");
  let g = graph(vec![task("solo", "echo")], "solo");

  let id = {
    let repository = Arc::new(SqliteRepository::open(&path).await.unwrap());
    let mut first = Harness::new(
      Arc::new(registry()),
      config(),
      1,
      Arc::new(BlackHole::default()),
      repository,
    );
    let id = first.engine.start_workflow(&g, Metadata::new()).await.unwrap();
    first.wait_for(|e| is_dispatch_of(e, "solo")).await;
    first.engine.snapshot(&id).await.unwrap();
    first.engine.shutdown();
    id
  };

  let repository = Arc::new(SqliteRepository::open(&path).await.unwrap());
  assert_eq!(repository.list_active().await.unwrap(), vec![id.clone()]);

  let (mut second, _batch) = Harness::local_with_repository(registry(), config(), 1, repository);
  assert_eq!(second.engine.recover().await.unwrap(), vec![id.clone()]);
  second.wait_finished(&id).await;

  let tree = second.repository.load(&id).await.unwrap().unwrap();
  assert_eq!(tree.state.kind, StateKind::Success);
  assert_eq!(tree.dynamic_metadata.get("Output"), Some("processed nothing"));
  assert!(second.repository.list_active().await.unwrap().is_empty());
}
