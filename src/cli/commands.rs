//! CLI command definitions for nqs.
//!
//! `run` starts every configured queue with a logging dequeue handler and
//! keeps them running until Ctrl-C. `inspect` opens the configured storages
//! and prints their pending counts without starting any queue.

use std::path::PathBuf;

use clap::Parser;
use serde_json::Value;
use tracing::info;

use crate::config::{Config, StorageFactory};
use crate::registry::Registry;
use crate::scheduler::DequeueHandler;

/// Default configuration file.
const DEFAULT_CONFIG: &str = "./nqs.yaml";

/// Per-key, priority-ordered work queues.
#[derive(Parser)]
#[command(name = "nqs")]
#[command(about = "Run and inspect per-key, priority-ordered work queues")]
#[command(version)]
#[command(
    long_about = "nqs runs named work queues described in a YAML file.\n\nEach queue dequeues per key on a fixed-rate tick, honoring priority, per-key intervals, retries and blocking.\n\nExample usage:\n  nqs run --config ./nqs.yaml\n  nqs inspect --config ./nqs.yaml --json"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Start every configured queue and log dequeued items until Ctrl-C.
    Run(RunArgs),

    /// Print pending item counts for every configured queue.
    Inspect(InspectArgs),
}

/// Arguments for the run command.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Path to the queue configuration file.
    #[arg(short, long, env = "NQS_CONFIG", default_value = DEFAULT_CONFIG)]
    pub config: PathBuf,
}

/// Arguments for the inspect command.
#[derive(Parser, Debug)]
pub struct InspectArgs {
    /// Path to the queue configuration file.
    #[arg(short, long, env = "NQS_CONFIG", default_value = DEFAULT_CONFIG)]
    pub config: PathBuf,

    /// Print counts as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_queues_command(args).await,
        Commands::Inspect(args) => run_inspect_command(args).await,
    }
}

async fn run_queues_command(args: RunArgs) -> anyhow::Result<()> {
    let config = Config::load(&args.config)?;
    let registry = Registry::new();

    let queues = config
        .build_all::<Value, _>(&registry, |_, builder| {
            builder.with_on_dequeue(DequeueHandler::awaited(|item: Value, ctx| async move {
                info!(
                    queue = %ctx.queue.name(),
                    key = %ctx.key,
                    attempt = ctx.attempt,
                    item = %item,
                    "Dequeued item"
                );
                Ok(())
            }))
        })
        .await?;

    info!(
        config = %args.config.display(),
        queues = queues.len(),
        "Queues running, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await?;

    info!("Shutting down queues");
    registry.shutdown_all().await;
    Ok(())
}

async fn run_inspect_command(args: InspectArgs) -> anyhow::Result<()> {
    let config = Config::load(&args.config)?;
    let mut factory = StorageFactory::new();
    let mut report = serde_json::Map::new();

    for queue in &config.queues {
        let storage = factory.open(queue).await?;
        let counts = storage.stored_count().await?;

        if args.json {
            report.insert(queue.name.clone(), serde_json::to_value(&counts)?);
            continue;
        }

        let total: usize = counts.values().sum();
        println!("{} ({}): {} pending", queue.name, storage.kind(), total);

        let mut keys: Vec<_> = counts.into_iter().collect();
        keys.sort();
        for (key, count) in keys {
            println!("  {:<24} {}", key, count);
        }
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(())
}
