use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dagrun_core::storage::JsonlEventLog;
use dagrun_core::workflow::{DagExecutor, EnvConditionEvaluator, ProcessCommandRunner, StepGraph};
use dagrun_core::{Run, RunStatus};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

mod config;
mod dag_file;

use config::CliConfig;
use dag_file::DagFile;

#[derive(Parser, Debug)]
#[command(name = "dagrun")]
#[command(about = "Run DAGs of shell steps with retries, preconditions and repeats", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "dagrun.toml", env = "DAGRUN_CONFIG")]
    config: PathBuf,

    /// Data directory for event logs
    #[arg(short, long, default_value = "./data", env = "DAGRUN_DATA_DIR")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute a DAG until it finishes or Ctrl-C is pressed
    Run {
        /// DAG definition file
        dag: PathBuf,
    },
    /// Check a DAG definition without running it
    Validate { dag: PathBuf },
    /// Print every step of a DAG in dependency order
    Show { dag: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dagrun=info,dagrun_core=info".into()),
        )
        .with_target(false)
        .init();

    let args = Args::parse();

    match args.command {
        Command::Run { dag } => {
            let config = CliConfig::load(&args.config, args.data_dir)?;
            run(&config, &dag).await
        }
        Command::Validate { dag } => {
            let spec = DagFile::load(&dag)?;
            let graph = StepGraph::build(&spec).context("Invalid DAG")?;
            println!("{}: {} steps OK", spec.name, graph.len());
            Ok(())
        }
        Command::Show { dag } => {
            let spec = DagFile::load(&dag)?;
            let graph = StepGraph::build(&spec).context("Invalid DAG")?;
            for step in graph.topological_order() {
                println!("{}", step.render());
            }
            Ok(())
        }
    }
}

async fn run(config: &CliConfig, dag: &Path) -> Result<()> {
    let spec = DagFile::load(dag)?;
    tracing::info!("Event log directory: {}", config.event_log_path().display());

    let event_log = Arc::new(
        JsonlEventLog::new(config.event_log_path()).context("Failed to create event log")?,
    );
    let executor = DagExecutor::new(
        config.engine.clone(),
        Arc::new(ProcessCommandRunner::new()),
        Arc::new(EnvConditionEvaluator),
        event_log,
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling run");
            trigger.cancel();
        }
    });

    let run = executor
        .execute_with_cancel(&spec, cancel)
        .await
        .context("Invalid DAG")?;

    print_summary(&run);

    match run.status {
        RunStatus::Succeeded => Ok(()),
        status => Err(anyhow::anyhow!("Run {} finished as {:?}", run.id, status)),
    }
}

fn print_summary(run: &Run) {
    println!("run {} ({})", run.id, run.dag_name);
    for step in &run.steps {
        match &step.error {
            Some(error) => println!("  {:<24} {:<20} {}", step.name, step.status, error),
            None => println!("  {:<24} {}", step.name, step.status),
        }
    }
    for name in run.notifications() {
        tracing::warn!("Error notification requested for step {}", name);
    }
}
