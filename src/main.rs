mod builtin;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::info;
use tracing_subscriber::EnvFilter;

use weft_engine::{ChannelNotifier, Engine, EngineConfig, ExecutionEvent, RetryPolicy};
use weft_metadata::Metadata;
use weft_model::ModelSet;
use weft_resource::{LoadMonitor, LocalBatchManager, completion_channel};
use weft_store::{InstanceRepository, SqliteRepository};

const LOCAL_NODE: &str = "local";
const DATABASE_FILE: &str = "weft.db";

/// Weft - a hierarchical workflow engine
#[derive(Parser)]
#[command(name = "weft")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the data directory (default: ~/.weft)
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  /// Path to an engine configuration file (JSON)
  #[arg(long, global = true)]
  config: Option<PathBuf>,

  /// Concurrent tasks the local execution node accepts
  #[arg(long, global = true, default_value_t = 4)]
  capacity: u32,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Start a workflow and drive it to completion
  Run {
    /// Path to the workflow models file (JSON)
    models_file: PathBuf,

    /// Id of the root model to run
    #[arg(long)]
    workflow: String,

    /// Initial metadata entry, repeatable
    #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_entry)]
    entries: Vec<(String, String)>,
  },

  /// Reconcile and resume every unfinished instance in the data directory
  Recover,

  /// Print a stored instance
  Show {
    instance_id: String,

    /// Print the full snapshot as JSON
    #[arg(long)]
    json: bool,
  },
}

struct Options {
  data_dir: PathBuf,
  config: Option<PathBuf>,
  capacity: u32,
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(std::io::stderr)
    .init();

  let data_dir = match cli.data_dir {
    Some(dir) => dir,
    None => dirs::home_dir()
      .context("could not determine home directory")?
      .join(".weft"),
  };
  let options = Options {
    data_dir,
    config: cli.config,
    capacity: cli.capacity,
  };

  let rt = tokio::runtime::Runtime::new()?;
  match cli.command {
    Some(Commands::Run {
      models_file,
      workflow,
      entries,
    }) => rt.block_on(run_workflow(models_file, workflow, entries, options)),
    Some(Commands::Recover) => rt.block_on(recover(options)),
    Some(Commands::Show { instance_id, json }) => {
      rt.block_on(show_instance(instance_id, json, options))
    }
    None => {
      println!("weft - use --help to see available commands");
      Ok(())
    }
  }
}

fn parse_entry(raw: &str) -> Result<(String, String), String> {
  match raw.split_once('=') {
    Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
    _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
  }
}

async fn run_workflow(
  models_file: PathBuf,
  workflow: String,
  entries: Vec<(String, String)>,
  options: Options,
) -> Result<()> {
  let content = tokio::fs::read_to_string(&models_file)
    .await
    .with_context(|| format!("failed to read models file: {}", models_file.display()))?;
  let models = ModelSet::from_json(&content)
    .with_context(|| format!("failed to parse models file: {}", models_file.display()))?;
  let graph = models
    .graph(&workflow)
    .with_context(|| format!("failed to resolve workflow '{workflow}'"))?;

  eprintln!("Loaded {} models", models.len());

  let metadata: Metadata = entries.into_iter().collect();
  let mut host = Host::start(&options).await?;
  let instance_id = host
    .engine
    .start_workflow(&graph, metadata)
    .await
    .context("failed to start workflow")?;

  eprintln!("Started instance: {instance_id}");

  let outcome = host.drive(HashSet::from([instance_id.clone()])).await;
  if outcome.is_ok() {
    print_result(&host.engine, &instance_id).await?;
  }
  host.engine.shutdown();
  outcome
}

async fn recover(options: Options) -> Result<()> {
  let mut host = Host::start(&options).await?;
  let recovered = host
    .engine
    .recover()
    .await
    .context("failed to recover instances")?;

  if recovered.is_empty() {
    eprintln!("Nothing to recover");
    host.engine.shutdown();
    return Ok(());
  }
  eprintln!("Recovered {} instances", recovered.len());

  let outcome = host.drive(recovered.iter().cloned().collect()).await;
  if outcome.is_ok() {
    for instance_id in &recovered {
      print_result(&host.engine, instance_id).await?;
    }
  }
  host.engine.shutdown();
  outcome
}

async fn show_instance(instance_id: String, json: bool, options: Options) -> Result<()> {
  let repository = open_repository(&options.data_dir).await?;
  let tree = repository
    .load(&instance_id)
    .await
    .context("failed to load instance")?
    .with_context(|| format!("instance '{instance_id}' not found"))?;

  if json {
    println!("{}", serde_json::to_string_pretty(&tree)?);
  } else {
    print!("{}", tree.describe());
  }
  Ok(())
}

async fn print_result(engine: &Engine<ChannelNotifier>, instance_id: &str) -> Result<()> {
  let metadata = engine
    .workflow_instance_metadata(instance_id)
    .await
    .with_context(|| format!("failed to read metadata of {instance_id}"))?;
  let output = serde_json::json!({
    "instance_id": instance_id,
    "metadata": metadata,
  });
  println!("{}", serde_json::to_string_pretty(&output)?);
  Ok(())
}

async fn open_repository(data_dir: &Path) -> Result<SqliteRepository> {
  tokio::fs::create_dir_all(data_dir)
    .await
    .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
  SqliteRepository::open(data_dir.join(DATABASE_FILE))
    .await
    .context("failed to open instance store")
}

async fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
  let Some(path) = path else {
    return Ok(EngineConfig::new(
      RetryPolicy::new(5, 500),
      RetryPolicy::new(3, 1000),
    ));
  };
  let content = tokio::fs::read_to_string(path)
    .await
    .with_context(|| format!("failed to read config file: {}", path.display()))?;
  EngineConfig::from_json(&content)
    .with_context(|| format!("failed to parse config file: {}", path.display()))
}

/// An engine wired to the built-in tasks, a single local node and the
/// on-disk store.
struct Host {
  engine: Engine<ChannelNotifier>,
  events: UnboundedReceiver<ExecutionEvent>,
}

impl Host {
  async fn start(options: &Options) -> Result<Self> {
    let repository = open_repository(&options.data_dir).await?;
    let config = load_config(options.config.as_deref()).await?;

    let registry = Arc::new(builtin::registry());
    let monitor = Arc::new(LoadMonitor::new().with_node(LOCAL_NODE, options.capacity));
    let (completions, receiver) = completion_channel();
    let batch = Arc::new(LocalBatchManager::new(registry.clone(), completions));
    let (notifier, events) = ChannelNotifier::channel();

    let engine = Engine::with_notifier(
      config,
      registry,
      monitor,
      batch,
      Arc::new(repository),
      notifier,
    )
    .context("failed to create engine")?;
    engine.spawn_completion_listener(receiver);

    info!(data_dir = %options.data_dir.display(), capacity = options.capacity, "engine_started");
    Ok(Self { engine, events })
  }

  /// Report progress until every instance in `pending` has finished. Fails
  /// if any of them failed or the run was interrupted.
  async fn drive(&mut self, mut pending: HashSet<String>) -> Result<()> {
    let mut failed = Vec::new();
    while !pending.is_empty() {
      let event = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
          bail!("interrupted; run `weft recover` to resume");
        }
        event = self.events.recv() => event,
      };
      let Some(event) = event else {
        bail!("engine stopped before the workflow finished");
      };

      match event {
        ExecutionEvent::StateChanged {
          model_id,
          state,
          message,
          ..
        } => {
          eprintln!("  {model_id}: {state} ({message})");
        }
        ExecutionEvent::InstanceCompleted { instance_id } => {
          eprintln!("Instance {instance_id} succeeded");
          pending.remove(&instance_id);
        }
        ExecutionEvent::InstanceFailed { instance_id, error } => {
          eprintln!("Instance {instance_id} failed: {error}");
          pending.remove(&instance_id);
          failed.push(instance_id);
        }
        _ => {}
      }
    }

    if !failed.is_empty() {
      bail!("{} instance(s) failed: {}", failed.len(), failed.join(", "));
    }
    Ok(())
  }
}
