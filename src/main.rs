use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use chainflow_core::config::{AppConfig, StorageBackend};
use chainflow_core::graph::GraphDefinition;
use chainflow_core::traits::{GraphStore, RunStore};
use chainflow_core::types::{GraphId, RunRecord, RunStatus, WorkflowState};

use chainflow_engine::{RunLogger, RunManager};
use chainflow_store::{InMemoryGraphStore, InMemoryRunStore, SqliteStore};
use chainflow_tools::ToolRegistry;

#[derive(Parser)]
#[command(name = "chainflow", version, about = "Run chains of workflow steps")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "chainflow.toml", env = "CHAINFLOW_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a graph definition without running it
    Validate {
        /// Graph definition (JSON)
        graph: PathBuf,
    },
    /// Store a graph and run it
    Run {
        /// Graph definition (JSON)
        graph: PathBuf,
        /// Initial state data (JSON object)
        #[arg(long)]
        state: Option<PathBuf>,
        /// Override the configured step ceiling
        #[arg(long)]
        max_steps: Option<usize>,
        /// Run in the background and poll for progress
        #[arg(long)]
        detach: bool,
    },
    /// Review a Python source file with the built-in review chain
    Review {
        /// Source file to review
        source: PathBuf,
        /// Quality score at which the review counts as passed
        #[arg(long)]
        threshold: Option<f64>,
    },
    /// List registered tools
    Tools,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("chainflow=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Commands that need neither config nor storage
    match &cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(*shell, &mut cmd, "chainflow", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Validate { graph } => {
            let definition = read_graph(graph)?;
            definition.validate()?;
            println!(
                "{}: ok ({} nodes, entry '{}')",
                graph.display(),
                definition.nodes.len(),
                definition.entry_node
            );
            return Ok(());
        }
        _ => {}
    }

    let config = AppConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let registry =
        Arc::new(ToolRegistry::with_builtins().with_default_timeout(config.engine.step_timeout_secs));

    if let Commands::Tools = &cli.command {
        for (name, description) in registry.list() {
            println!("{:<24} {}", name, description);
        }
        return Ok(());
    }

    let (graphs, runs) = open_stores(&config)?;
    let manager = RunManager::new(graphs, runs, registry, &config.engine);

    // Spawn RunLogger if logging is enabled
    let log_cancel = CancellationToken::new();
    let mut log_task = None;
    if let Some(log_config) = config.log.as_ref().filter(|l| l.enabled) {
        let logger = RunLogger::new(log_config.log_path(), log_config.level);
        let bus = manager.event_bus().clone();
        let cancel = log_cancel.clone();
        log_task = Some(tokio::spawn(async move {
            logger.run(bus, cancel).await;
        }));
        info!("RunLogger started (level {})", log_config.level);
    }

    let outcome = match cli.command {
        Commands::Run {
            graph,
            state,
            max_steps,
            detach,
        } => {
            let definition = read_graph(&graph)?;
            let initial = match state {
                Some(path) => read_state(&path)?,
                None => WorkflowState::new(),
            };
            let graph_id = manager.create_graph(definition).await?;
            if detach {
                run_detached(&manager, &graph_id, initial, max_steps).await
            } else {
                manager
                    .run_sync(&graph_id, initial, max_steps)
                    .await
                    .map_err(Into::into)
            }
        }
        Commands::Review { source, threshold } => {
            let code = std::fs::read_to_string(&source)
                .with_context(|| format!("reading {}", source.display()))?;
            manager.review(&code, threshold).await.map_err(Into::into)
        }
        Commands::Tools | Commands::Validate { .. } | Commands::Completions { .. } => {
            unreachable!("handled before storage setup")
        }
    };

    // Let the logger drain the final events
    log_cancel.cancel();
    if let Some(task) = log_task {
        task.await.ok();
    }

    let record = outcome?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    if record.status == RunStatus::Failed {
        std::process::exit(1);
    }
    Ok(())
}

/// Start a background run and report progress until it finishes.
async fn run_detached(
    manager: &RunManager,
    graph_id: &GraphId,
    initial: WorkflowState,
    max_steps: Option<usize>,
) -> anyhow::Result<RunRecord> {
    let run_id = manager.run_async(graph_id, initial, max_steps).await?;
    eprintln!("run {} pending", run_id);

    let mut reported = 0;
    loop {
        let record = manager.get_run(&run_id).await?;
        for entry in record.log.iter().skip(reported) {
            match &entry.error {
                Some(error) => eprintln!("  {} failed: {}", entry.node, error),
                None => eprintln!("  {} ({} ms)", entry.node, entry.elapsed_ms),
            }
        }
        reported = record.log.len();
        if record.status.is_terminal() {
            return Ok(record);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn open_stores(config: &AppConfig) -> anyhow::Result<(Arc<dyn GraphStore>, Arc<dyn RunStore>)> {
    match config.storage.backend {
        StorageBackend::Memory => {
            let graphs: Arc<dyn GraphStore> = Arc::new(InMemoryGraphStore::new());
            let runs: Arc<dyn RunStore> = Arc::new(InMemoryRunStore::new());
            Ok((graphs, runs))
        }
        StorageBackend::Sqlite => {
            let path = config.storage.db_path();
            let store = Arc::new(SqliteStore::open(&path)?);
            info!(path = %path.display(), "Using SQLite storage");
            let graphs: Arc<dyn GraphStore> = store.clone();
            let runs: Arc<dyn RunStore> = store;
            Ok((graphs, runs))
        }
    }
}

fn read_graph(path: &Path) -> anyhow::Result<GraphDefinition> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
}

/// Initial state: a JSON object whose entries become the state data.
fn read_state(path: &Path) -> anyhow::Result<WorkflowState> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let value: serde_json::Value =
        serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
    match value {
        serde_json::Value::Object(map) => Ok(WorkflowState::from_map(map.into_iter().collect())),
        _ => {
            warn!(path = %path.display(), "State file is not a JSON object");
            anyhow::bail!("{} must contain a JSON object", path.display())
        }
    }
}
