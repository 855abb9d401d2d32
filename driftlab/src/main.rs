use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use driftlab::database::Database;
use driftlab::llm::HttpLanguageModel;
use driftlab::models::Document;
use driftlab::{RetryPolicy, RunStatus, Strategy, ToolRegistry, WorkflowEngine};

#[derive(Parser)]
#[command(name = "driftlab", about = "Workflow engine for semantic drift experiments")]
struct Cli {
    /// Path to the run database
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a run for an experiment and drive it to the review gate
    Start {
        #[arg(long)]
        experiment: i64,
        /// YAML or JSON file with the document list
        #[arg(long)]
        documents: PathBuf,
        /// Restrict the run to these tools (default: all registered)
        #[arg(long)]
        tools: Vec<String>,
    },
    /// Show a run's status and outputs
    Status { run_id: Uuid },
    /// List runs, optionally filtered
    List {
        #[arg(long)]
        experiment: Option<i64>,
        #[arg(long)]
        status: Option<String>,
    },
    /// Apply a review decision to a suspended run
    Resume {
        run_id: Uuid,
        /// Approve the recommended (or modified) strategy
        #[arg(long)]
        approve: bool,
        #[arg(long)]
        notes: Option<String>,
        /// YAML or JSON file with a reviewer-modified strategy
        #[arg(long)]
        strategy: Option<PathBuf>,
    },
    /// Request cancellation of a run
    Cancel { run_id: Uuid },
    /// Print a run's accumulated stage outputs
    Results { run_id: Uuid },
    /// Export a run's provenance graph as JSON
    ExportProvenance {
        run_id: Uuid,
        /// Write to a file instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".driftlab")
        .join("runs.db")
}

fn load_yaml<T: serde::de::DeserializeOwned>(path: &PathBuf) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    // serde_yaml parses JSON too
    serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let db_path = cli.db.unwrap_or_else(default_db_path);

    let store = Arc::new(Database::open(&db_path)?);
    store.initialize_schema()?;
    let engine = WorkflowEngine::new(
        store,
        Arc::new(HttpLanguageModel::from_env()),
        Arc::new(ToolRegistry::with_builtin_tools()),
        RetryPolicy::default(),
    );

    match cli.command {
        Command::Start {
            experiment,
            documents,
            tools,
        } => {
            let documents: Vec<Document> = load_yaml(&documents)?;
            let run_id = engine.start(experiment, documents, tools).await?;
            let snapshot = engine.status(run_id)?;
            println!("run {} is {}", run_id, snapshot.status);
        }
        Command::Status { run_id } => {
            let snapshot = engine.status(run_id)?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        Command::List { experiment, status } => {
            let status = match status.as_deref() {
                Some(raw) => Some(
                    RunStatus::parse(raw)
                        .with_context(|| format!("unknown status '{raw}'"))?,
                ),
                None => None,
            };
            let runs = engine.list(experiment, status)?;
            for run in runs {
                println!(
                    "{}  experiment {}  {}",
                    run.run_id, run.experiment_id, run.status
                );
            }
        }
        Command::Resume {
            run_id,
            approve,
            notes,
            strategy,
        } => {
            let modified: Option<Strategy> = match strategy {
                Some(path) => Some(load_yaml(&path)?),
                None => None,
            };
            engine.resume(run_id, approve, modified, notes).await?;
            let snapshot = engine.status(run_id)?;
            println!("run {} is {}", run_id, snapshot.status);
        }
        Command::Cancel { run_id } => {
            engine.cancel(run_id)?;
            let snapshot = engine.status(run_id)?;
            println!("run {} is {}", run_id, snapshot.status);
        }
        Command::Results { run_id } => {
            let outputs = engine.results(run_id)?;
            println!("{}", serde_json::to_string_pretty(&outputs)?);
        }
        Command::ExportProvenance { run_id, output } => {
            let graph = engine.export_provenance(run_id)?;
            let rendered = serde_json::to_string_pretty(&graph)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, rendered)
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!("wrote provenance for {} to {}", run_id, path.display());
                }
                None => println!("{rendered}"),
            }
        }
    }

    Ok(())
}
