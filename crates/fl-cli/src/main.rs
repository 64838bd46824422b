//! `fl`: operator commands over the forgeloop task queue.
//!
//! Every command prints its result as JSON on stdout; logs go to stderr.

mod commands;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use fl_core::config::{Config, LogFormat};
use fl_telemetry::LogOutput;

use commands::{print_json, queue, review, task};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// forgeloop CLI -- inspect and drive the dependency-aware task queue.
#[derive(Parser)]
#[command(name = "fl", version, about)]
struct Cli {
    /// Config file (default: ~/.forgeloop/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Task database, overriding `store.path`.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a task.
    Create(task::CreateArgs),

    /// Mark a task's Definition of Ready as met.
    Ready { key: String },

    /// Add a dependency to a task that has not started.
    Depend { key: String, on: String },

    /// Claim a ready task for an agent.
    Claim { key: String, agent: String },

    /// List claimable tasks, highest priority first.
    Poll(task::PollArgs),

    /// Report progress and move a claimed task along.
    Progress(task::ProgressArgs),

    /// Open a review on a completed task.
    RequestReview(review::RequestArgs),

    /// Record a review verdict.
    SubmitReview(review::SubmitArgs),

    /// Promote blocked tasks whose dependencies are done.
    Unblock {
        /// Only dependents of this task.
        key: Option<String>,
    },

    /// Show tasks and counts by status.
    Queue(queue::QueueArgs),

    /// Show a task with its reviews.
    Show { key: String },

    /// Show the communication log.
    Messages(queue::MessagesArgs),

    /// Print the effective configuration.
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => Config::load().context("failed to load config")?,
    };

    let output = match config.general.log_format {
        LogFormat::Pretty => LogOutput::Pretty,
        LogFormat::Json => LogOutput::Json,
    };
    output.init("fl", &config.general.log_level);

    match cli.command {
        Commands::Config => print!("{}", commands::config::show(&config)?),
        command => run(command, &config, cli.db).await?,
    }
    Ok(())
}

async fn run(command: Commands, config: &Config, db: Option<PathBuf>) -> anyhow::Result<()> {
    let store = commands::open_store(config, db.as_deref()).await?;

    match command {
        Commands::Create(args) => print_json(&task::create(&store, args).await?),
        Commands::Ready { key } => print_json(&store.mark_ready(&key).await?),
        Commands::Depend { key, on } => print_json(&store.add_dependency(&key, &on).await?),
        Commands::Claim { key, agent } => print_json(&task::claim(&store, &key, &agent).await?),
        Commands::Poll(args) => print_json(&task::poll(&store, args).await?),
        Commands::Progress(args) => print_json(&task::progress(&store, args).await?),
        Commands::RequestReview(args) => print_json(&review::request(&store, args).await?),
        Commands::SubmitReview(args) => print_json(&review::submit(&store, args).await?),
        Commands::Unblock { key } => print_json(&queue::unblock(&store, key.as_deref()).await?),
        Commands::Queue(args) => print_json(&queue::queue(&store, args).await?),
        Commands::Show { key } => {
            let task = store.task(&key).await?;
            let reviews = store.reviews_for(&key).await?;
            print_json(&serde_json::json!({"task": task, "reviews": reviews}))
        }
        Commands::Messages(args) => print_json(&queue::messages(&store, args).await?),
        Commands::Config => {
            print!("{}", commands::config::show(config)?);
            Ok(())
        }
    }
}
