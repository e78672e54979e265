use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tracing::{info, instrument, warn};
use weft_processor::ExecutionTypeRegistry;

use crate::error::ResourceError;
use crate::job::{CompletionNotifier, JobSpec, TaskCompletion};

/// Dispatches jobs to execution nodes.
#[async_trait]
pub trait BatchManager: Send + Sync {
  /// Start `job` on `node` without waiting for it. The outcome is reported
  /// later as a [`TaskCompletion`]. Returns `false` if the node refused it.
  async fn execute_remotely(&self, job: JobSpec, node: &str) -> Result<bool, ResourceError>;

  /// Ask `node` to kill `job_id`. Returns `false` if the job was not running.
  async fn kill_job(&self, job_id: &str, node: &str) -> Result<bool, ResourceError>;

  /// Node the job is running on, if it is still known.
  async fn get_execution_node(&self, job_id: &str) -> Result<Option<String>, ResourceError>;
}

struct RunningJob {
  node: String,
  handle: AbortHandle,
}

/// Runs jobs as tokio tasks in this process, resolving each job's task
/// implementation from the registry.
pub struct LocalBatchManager {
  registry: Arc<ExecutionTypeRegistry>,
  notifier: CompletionNotifier,
  jobs: Arc<Mutex<HashMap<String, RunningJob>>>,
}

impl LocalBatchManager {
  pub fn new(registry: Arc<ExecutionTypeRegistry>, notifier: CompletionNotifier) -> Self {
    Self {
      registry,
      notifier,
      jobs: Arc::new(Mutex::new(HashMap::new())),
    }
  }

  /// Number of jobs currently running.
  pub async fn running(&self) -> usize {
    self.jobs.lock().await.len()
  }
}

#[async_trait]
impl BatchManager for LocalBatchManager {
  #[instrument(
    name = "batch_execute",
    skip(self, job),
    fields(job_id = %job.job_id, instance_id = %job.instance_id, model_id = %job.model_id)
  )]
  async fn execute_remotely(&self, job: JobSpec, node: &str) -> Result<bool, ResourceError> {
    let task = self
      .registry
      .task(&job.instance_class)
      .ok_or_else(|| ResourceError::UnknownTask(job.instance_class.clone()))?;

    // Held across the spawn so the job is registered before it can finish.
    let mut jobs = self.jobs.lock().await;
    let job_id = job.job_id.clone();
    let notifier = self.notifier.clone();
    let registry = self.jobs.clone();

    let handle = tokio::spawn(async move {
      let completion = match task.run(&job.metadata).await {
        Ok(metadata) => {
          info!(job_id = %job.job_id, "job_succeeded");
          TaskCompletion::success(&job, metadata)
        }
        Err(e) => {
          warn!(job_id = %job.job_id, error = %e, "job_failed");
          TaskCompletion::failure(&job, e.message)
        }
      };
      registry.lock().await.remove(&job.job_id);
      if !notifier.notify(completion) {
        warn!(job_id = %job.job_id, "completion_dropped");
      }
    });

    jobs.insert(
      job_id,
      RunningJob {
        node: node.to_string(),
        handle: handle.abort_handle(),
      },
    );
    Ok(true)
  }

  async fn kill_job(&self, job_id: &str, _node: &str) -> Result<bool, ResourceError> {
    match self.jobs.lock().await.remove(job_id) {
      Some(job) => {
        job.handle.abort();
        info!(job_id, node = %job.node, "job_killed");
        Ok(true)
      }
      None => Ok(false),
    }
  }

  async fn get_execution_node(&self, job_id: &str) -> Result<Option<String>, ResourceError> {
    Ok(self.jobs.lock().await.get(job_id).map(|job| job.node.clone()))
  }
}
