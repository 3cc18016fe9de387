use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cascade_core::config::AppConfig;
use cascade_core::event::EventBus;
use cascade_core::graph::WorkflowGraph;
use cascade_core::traits::{RunRecordStore, WorkflowStore};
use cascade_core::types::{ChangeStatus, RecordStatus, RunId};

use cascade_engine::{
    fail_run_directly, CascadeOptions, CascadeOrchestrator, CascadeOutcome, ChangeReview,
    HttpNodeExecutor, HttpTransport, OutputRouter, Repositories, RunLogger, SharedCacheSync,
    StalenessReaper,
};
use cascade_store::SqliteStore;

#[derive(Parser)]
#[command(name = "cascade", version, about = "Incremental workflow cascade engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "cascade.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a node and everything downstream of it for one entity
    Run {
        /// Entity the cascade runs for
        entity: String,
        /// Workflow id
        workflow: String,
        /// Start node (omit to run the whole workflow)
        node: Option<String>,
        /// Ignore the execution cache
        #[arg(long)]
        force: bool,
    },
    /// Run a cascade and every workflow its completed nodes trigger
    RunSystem {
        entity: String,
        workflow: String,
        node: String,
        #[arg(long)]
        force: bool,
    },
    /// Cancel a run
    Cancel { run_id: String },
    /// Mark a run failed without a live orchestrator
    FailRun {
        run_id: String,
        #[arg(long, default_value = "Marked as failed by user")]
        message: String,
    },
    /// Show one run record
    Status { run_id: String },
    /// List recent runs for an entity
    Runs {
        entity: String,
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Sweep stale runs once
    Reap,
    /// Run the staleness reaper until interrupted
    Reaper,
    /// Manage workflow definitions
    Workflow {
        #[command(subcommand)]
        action: WorkflowAction,
    },
    /// Review SSOT change plans
    Changes {
        #[command(subcommand)]
        action: ChangeAction,
    },
    /// Shared cache maintenance
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum WorkflowAction {
    /// Import a workflow graph from a JSON file
    Import { path: PathBuf },
    /// List stored workflows
    List,
}

#[derive(Subcommand)]
enum ChangeAction {
    /// List changes
    List {
        #[arg(long)]
        entity: Option<String>,
        /// pending, approved or rejected
        #[arg(long, default_value = "pending")]
        status: String,
    },
    /// Approve a pending change and apply it
    Approve {
        entity: String,
        change_id: String,
        #[arg(long, default_value = "cli")]
        by: String,
    },
    /// Reject a pending change
    Reject {
        entity: String,
        change_id: String,
        #[arg(long, default_value = "cli")]
        by: String,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Rebuild shared caches from the execution records of their producers
    Sync {
        #[arg(required = true)]
        cache_ids: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("cascade=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "cascade", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;

    if let Commands::Config = &cli.command {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let db_path = config.database_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let store = Arc::new(
        SqliteStore::open(&db_path)
            .with_context(|| format!("opening database {}", db_path.display()))?,
    );
    let event_bus = Arc::new(EventBus::default());

    match cli.command {
        Commands::Run {
            entity,
            workflow,
            node,
            force,
        } => {
            let orchestrator = build_orchestrator(&config, store, event_bus.clone())?;
            let (cancel, logger) = start_logger(&config, &event_bus);
            let interrupt = cancel_on_ctrl_c(orchestrator.clone());

            let options = CascadeOptions { force };
            let outcome = match node {
                Some(node) => {
                    orchestrator
                        .force_run_cascade(&entity, &workflow, &node, &options)
                        .await
                }
                None => orchestrator.run_workflow(&entity, &workflow, &options).await,
            };
            interrupt.abort();
            let _ = interrupt.await;
            drop(orchestrator);
            stop_logger(cancel, logger, event_bus).await;

            let outcome = outcome?;
            print_outcome(&outcome);
            if !outcome.success {
                std::process::exit(1);
            }
        }
        Commands::RunSystem {
            entity,
            workflow,
            node,
            force,
        } => {
            let orchestrator = build_orchestrator(&config, store, event_bus.clone())?;
            let (cancel, logger) = start_logger(&config, &event_bus);
            let interrupt = cancel_on_ctrl_c(orchestrator.clone());

            let result = orchestrator
                .run_system_workflows(&entity, &workflow, &node, &CascadeOptions { force })
                .await;
            interrupt.abort();
            let _ = interrupt.await;
            drop(orchestrator);
            stop_logger(cancel, logger, event_bus).await;

            let outcome = result?;
            for cascade in &outcome.cascades {
                println!("[{}]", cascade.run.workflow_id);
                print_outcome(cascade);
            }
            for (workflow_id, error) in &outcome.errors {
                eprintln!("[{}] not started: {}", workflow_id, error);
            }
            if !outcome.success() {
                std::process::exit(1);
            }
        }
        Commands::Cancel { run_id } => {
            // No live orchestrator in this process; the record is the signal
            let run_id = RunId::from_string(&run_id);
            let changed = store
                .finish_run(&run_id, RecordStatus::Cancelled, Some("Cancelled by user".into()))
                .await?;
            if !changed && store.get_run(&run_id).await?.is_none() {
                bail!("Run not found: {}", run_id);
            }
            println!("{}", if changed { "cancelled" } else { "already finished" });
        }
        Commands::FailRun { run_id, message } => {
            let changed =
                fail_run_directly(store.as_ref(), &RunId::from_string(&run_id), &message).await?;
            println!("{}", if changed { "failed" } else { "already finished" });
        }
        Commands::Status { run_id } => {
            let Some(record) = store.get_run(&RunId::from_string(&run_id)).await? else {
                bail!("Run not found: {}", run_id);
            };
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Commands::Runs { entity, limit } => {
            for record in store.list_runs(&entity, limit).await? {
                println!(
                    "{}  {:<10}  {}/{}  {}/{}  {}",
                    record.created_at.format("%Y-%m-%d %H:%M:%S"),
                    record.status.as_str(),
                    record.workflow_id,
                    record.start_node_id,
                    record.progress.current,
                    record.progress.total,
                    record.run_id,
                );
            }
        }
        Commands::Reap => {
            let reaper = StalenessReaper::new(
                config.reaper.clone(),
                store,
                event_bus,
                CancellationToken::new(),
            );
            let reaped = reaper.sweep(chrono::Utc::now()).await?;
            println!("Reaped {} run(s)", reaped.len());
            for run_id in reaped {
                println!("  {}", run_id);
            }
        }
        Commands::Reaper => {
            if !config.reaper.enabled {
                bail!("Reaper is disabled in config ([reaper] enabled = false)");
            }
            let cancel = CancellationToken::new();
            let reaper =
                StalenessReaper::new(config.reaper.clone(), store, event_bus, cancel.clone());
            let shutdown = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Shutting down reaper");
                    shutdown.cancel();
                }
            });
            reaper.run().await;
        }
        Commands::Workflow { action } => match action {
            WorkflowAction::Import { path } => {
                let json = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?;
                let graph = WorkflowGraph::from_json(&json)?;
                // Reject graphs that could never run
                cascade_engine::Topology::build(&graph)?;
                store.save_workflow(&graph).await?;
                println!(
                    "Imported workflow '{}' ({} nodes, {} edges)",
                    graph.id,
                    graph.nodes.len(),
                    graph.edges.len()
                );
            }
            WorkflowAction::List => {
                for graph in store.list_workflows().await? {
                    println!("{:<24} {:>3} nodes  {}", graph.id, graph.nodes.len(), graph.name);
                }
            }
        },
        Commands::Changes { action } => {
            let review = ChangeReview::new(store, event_bus);
            match action {
                ChangeAction::List { entity, status } => {
                    let status: ChangeStatus = status.parse()?;
                    for change in review.list(Some(status), entity.as_deref()).await? {
                        println!(
                            "{}  {:<7} {}  {}.{} = {}",
                            change.change_id,
                            change.action.as_str(),
                            change.entity_id,
                            change.target_domain,
                            change.target_path,
                            change.proposed_value,
                        );
                    }
                }
                ChangeAction::Approve {
                    entity,
                    change_id,
                    by,
                } => {
                    let change = review.approve(&entity, &change_id, &by).await?;
                    println!("Approved {} ({})", change.change_id, change.target_path);
                }
                ChangeAction::Reject {
                    entity,
                    change_id,
                    by,
                } => {
                    let change = review.reject(&entity, &change_id, &by).await?;
                    println!("Rejected {} ({})", change.change_id, change.target_path);
                }
            }
        }
        Commands::Cache { action } => match action {
            CacheAction::Sync { cache_ids } => {
                let workflows = store.list_workflows().await?;
                let sync = SharedCacheSync::new(store.clone(), store);
                for (cache_id, count) in sync.sync(&cache_ids, &workflows).await? {
                    println!("{}: {} entries", cache_id, count);
                }
            }
        },
        // Handled before the store is opened
        Commands::Config | Commands::Completions { .. } => {}
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    let home_config = std::env::var("HOME")
        .ok()
        .map(|h| PathBuf::from(h).join(".cascade").join("config.toml"));
    match home_config {
        Some(path) if path.exists() => {
            info!(path = %path.display(), "Loading config from home directory");
            Ok(AppConfig::load(&path)?)
        }
        _ => {
            warn!("No config file found, using defaults. See cascade.toml.example.");
            Ok(AppConfig::default())
        }
    }
}

fn build_orchestrator(
    config: &AppConfig,
    store: Arc<SqliteStore>,
    event_bus: Arc<EventBus>,
) -> anyhow::Result<Arc<CascadeOrchestrator>> {
    let Some(executor_config) = config.executor.as_ref() else {
        bail!("No [executor] section in config; set executor.endpoint to run cascades");
    };
    let executor = Arc::new(HttpNodeExecutor::new(executor_config)?);
    let transport = Arc::new(HttpTransport::new(config.destinations.webhook_timeout_secs)?);

    let review = Arc::new(ChangeReview::new(store.clone(), event_bus.clone()));
    let router = Arc::new(OutputRouter::new(
        store.clone(),
        store.clone(),
        review,
        transport,
        event_bus.clone(),
    ));

    Ok(Arc::new(CascadeOrchestrator::new(
        &config.engine,
        Repositories::from_store(store),
        executor,
        router,
        event_bus,
    )))
}

fn start_logger(
    config: &AppConfig,
    event_bus: &EventBus,
) -> (CancellationToken, Option<tokio::task::JoinHandle<()>>) {
    let cancel = CancellationToken::new();
    let handle = match &config.log {
        Some(log) if log.enabled => {
            Some(RunLogger::new(config.log_dir(), log.level).spawn(event_bus, cancel.clone()))
        }
        _ => None,
    };
    (cancel, handle)
}

async fn stop_logger(
    cancel: CancellationToken,
    handle: Option<tokio::task::JoinHandle<()>>,
    event_bus: Arc<EventBus>,
) {
    // Once the last sender is gone the logger drains and exits
    drop(event_bus);
    if let Some(handle) = handle {
        if tokio::time::timeout(std::time::Duration::from_secs(2), handle)
            .await
            .is_err()
        {
            cancel.cancel();
        }
    }
}

/// Cancel every run this process drives on Ctrl-C.
fn cancel_on_ctrl_c(orchestrator: Arc<CascadeOrchestrator>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        for run_id in orchestrator.active_runs() {
            warn!(run_id = %run_id, "Interrupted, cancelling run");
            if let Err(e) = orchestrator.cancel_cascade(&run_id).await {
                warn!(run_id = %run_id, error = %e, "Cancel failed");
            }
        }
    })
}

fn print_outcome(outcome: &CascadeOutcome) {
    println!("{}", outcome.message);
    for node in &outcome.nodes {
        let status = format!("{:?}", node.status).to_lowercase();
        match (&node.version, &node.error) {
            (_, Some(error)) => println!("  {:<10} {}  {}", status, node.node_id, error),
            (Some(version), None) => println!("  {:<10} {}  v{}", status, node.node_id, version),
            (None, None) => println!("  {:<10} {}", status, node.node_id),
        }
        for dest in node.destinations.iter().filter(|d| d.is_failure()) {
            println!("    ! {} {:?}", dest.destination_id, dest.status);
        }
    }
    println!("Run: {}", outcome.run.run_id);
}
