//! provisiond: worker process for cluster lifecycle tasks.
//!
//! `serve` reads newline-delimited JSON task messages from stdin and runs
//! them on the worker pool until stdin closes. `run <file>` executes a single
//! message and exits non-zero if it did not succeed.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use cloud_api::{CloudClientFactory, CloudClients, OpenStackCloud};
use config_runner::{AnsiblePing, AnsibleRunner};
use engine_config::EngineConfig;
use infra_provisioner::{ScriptInventory, TerraformProvisioner};
use observability::{init_tracing, parse_level, TracingConfig};
use orchestrator_core::{TaskMessage, TaskOutcome, WorkerPool, WorkflowContext};
use state_store_interface::{create_state_store, StateStore, StateStoreConfig};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "provisiond")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Engine configuration file
    #[arg(short, long, env = "PROVISIOND_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Log level, overriding the configuration file
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume task messages from stdin, one JSON object per line
    Serve,

    /// Execute the task message in FILE and exit
    Run {
        file: PathBuf,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)
            .await
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => EngineConfig::load_default()
            .await
            .context("loading default configuration")?,
    };

    if let Commands::Config = cli.command {
        print!("{}", config.to_toml_string()?);
        return Ok(());
    }

    let level_name = cli.log_level.as_deref().unwrap_or(&config.logging.level);
    let level = parse_level(level_name).with_context(|| format!("unknown log level {level_name}"))?;
    init_tracing(
        TracingConfig::new("provisiond")
            .with_level(level)
            .with_json(config.logging.json),
    )?;

    let pool = WorkerPool::new(Arc::new(build_context(config).await?));

    match cli.command {
        Commands::Serve => serve(pool).await,
        Commands::Run { file } => run_once(pool, file).await,
        Commands::Config => Ok(()),
    }
}

async fn build_context(config: EngineConfig) -> anyhow::Result<WorkflowContext> {
    let config = Arc::new(config);

    if let Some(parent) = config.paths.database.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let store = create_state_store(StateStoreConfig::Sqlite {
        path: config.paths.database.clone(),
    })
    .await
    .context("opening state store")?;
    if !store.health_check().await.context("probing state store")? {
        bail!("state store at {} is not usable", config.paths.database.display());
    }

    let factory = Arc::new(CloudClientFactory::new(config.openstack.clone()).context("building cloud client")?);
    let cloud = CloudClients::from_shared(Arc::new(OpenStackCloud::new(factory)));

    let short_timeout = config.tools.short_command_timeout();
    let provisioner = Arc::new(TerraformProvisioner::new(config.clone(), cloud.network.clone()));
    let inventory = Arc::new(ScriptInventory::new(short_timeout));
    let runner = Arc::new(AnsibleRunner::new(config.tools.clone()));
    let ping = Arc::new(AnsiblePing::new(config.tools.ansible.clone(), short_timeout));

    info!(
        clusters_root = %config.paths.clusters_root.display(),
        workers = config.workers.concurrency,
        "Collaborators ready"
    );
    Ok(WorkflowContext::new(store, provisioner, inventory, runner, ping, cloud, config))
}

async fn serve(pool: WorkerPool) -> anyhow::Result<()> {
    let (tx, rx) = mpsc::channel(pool.context().config.workers.queue_capacity);
    let workers = tokio::spawn({
        let pool = pool.clone();
        async move { pool.run(rx).await }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_no = 0u64;
    while let Some(line) = lines.next_line().await.context("reading stdin")? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        match TaskMessage::from_json(&line) {
            Ok(msg) => {
                info!(task_id = %msg.task_id, task = msg.task.name(), "Task received");
                if tx.send(msg).await.is_err() {
                    error!("Worker pool stopped accepting tasks");
                    break;
                }
            }
            Err(e) => warn!(line = line_no, error = %e, "Discarding task message"),
        }
    }
    drop(tx);

    let reports = workers.await.context("worker pool panicked")?;
    let failed = reports.iter().filter(|r| !r.is_success()).count();
    info!(total = reports.len(), failed, "Input closed, all tasks finished");
    Ok(())
}

async fn run_once(pool: WorkerPool, file: PathBuf) -> anyhow::Result<()> {
    let raw = tokio::fs::read_to_string(&file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;
    let msg = TaskMessage::from_json(&raw).with_context(|| format!("parsing {}", file.display()))?;

    let report = pool.execute(msg).await;
    match report.outcome {
        TaskOutcome::Succeeded => {
            info!(task_id = %report.task_id, task = report.task, "Task succeeded");
            Ok(())
        }
        TaskOutcome::Failed(e) => bail!("task {} ({}) failed: {e}", report.task_id, report.task),
        TaskOutcome::Rejected(e) => bail!("task {} ({}) rejected: {e}", report.task_id, report.task),
    }
}
