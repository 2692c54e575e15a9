//! # tether
//!
//! Inspects and maintains the local tether store.
//!
//! ## Usage
//! ```bash
//! tether status
//! tether queue list --state failed
//! tether queue retry            # failed -> pending, picked up on next app start
//! tether queue clear            # drop completed operations
//! tether queue discard          # drop failed and quarantined operations
//! tether cache keys profile
//! tether cache clear challenge/list
//! tether config show
//!
//! # Point at another file
//! tether --db ./dev.db status
//! ```
//!
//! ## Log Levels
//! - `RUST_LOG=debug` - Show debug messages
//! - Default: `info,tether=debug,sqlx=warn`

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use tether_core::{CacheKeys, OperationState, SyncStatusType};
use tether_db::{Database, DbConfig};
use tether_sync::{CacheManager, SyncError, SyncQueue, SyncResult, TetherConfig};

// =============================================================================
// Arguments
// =============================================================================

#[derive(Debug, Parser)]
#[command(name = "tether", version, about = "Inspect the local tether store")]
struct Cli {
    /// Config file. Defaults to the platform config directory.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite file. Overrides the configured path.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Queue counts and the badge they produce while offline
    Status,

    /// Operation queue
    #[command(subcommand)]
    Queue(QueueCommand),

    /// Cache entries
    #[command(subcommand)]
    Cache(CacheCommand),

    /// Configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Debug, Subcommand)]
enum QueueCommand {
    /// Print operations in replay order
    List {
        /// pending, in_flight, completed or failed
        #[arg(long)]
        state: Option<OperationState>,
    },
    /// Return failed operations to pending
    Retry,
    /// Delete completed operations
    Clear,
    /// Delete failed operations, including quarantined rows
    Discard,
}

#[derive(Debug, Subcommand)]
enum CacheCommand {
    /// List cache keys below `<namespace>/cache/<prefix>`
    Keys { prefix: Option<String> },
    /// Delete cache entries below `<namespace>/cache/<prefix>`
    Clear { prefix: String },
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration as TOML
    Show,
}

// =============================================================================
// Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tether=debug,sqlx=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> SyncResult<()> {
    let mut config = TetherConfig::load(cli.config)?;
    if let Some(db) = cli.db {
        config.app.database_path = Some(db);
    }

    if let Command::Config(ConfigCommand::Show) = cli.command {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let path = config
        .database_path()
        .ok_or_else(|| SyncError::InvalidConfig("no database path could be determined".into()))?;
    debug!(path = %path.display(), "Opening store");
    let db = Database::new(DbConfig::new(path)).await?;

    let result = match cli.command {
        Command::Status => status(&db).await,
        Command::Queue(cmd) => queue(&db, cmd).await,
        Command::Cache(cmd) => cache(&db, &config, cmd).await,
        Command::Config(_) => Ok(()),
    };

    db.close().await;
    result
}

// =============================================================================
// Commands
// =============================================================================

async fn open_queue(db: &Database) -> SyncResult<SyncQueue> {
    let queue = SyncQueue::new(db.operations());
    let report = queue.load().await?;
    for bad in &report.corrupt {
        println!("quarantined {} (seq {}): {}", bad.id, bad.seq, bad.reason);
    }
    Ok(queue)
}

async fn status(db: &Database) -> SyncResult<()> {
    let queue = open_queue(db).await?;
    let counts = queue.counts();
    let failed_with_error = queue
        .get_all()
        .await
        .iter()
        .any(|op| op.state == OperationState::Failed && op.last_error.is_some());

    // Without a connection the app would show this badge.
    let offline = SyncStatusType::derive(false, false, counts, failed_with_error);
    let online = SyncStatusType::derive(true, false, counts, failed_with_error);

    println!("pending:   {}", counts.pending);
    println!("failed:    {}", counts.failed);
    println!("completed: {}", counts.completed);
    println!("status:    {} (online: {})", offline.as_str(), online.as_str());
    Ok(())
}

async fn queue(db: &Database, cmd: QueueCommand) -> SyncResult<()> {
    let queue = open_queue(db).await?;

    match cmd {
        QueueCommand::List { state } => {
            for op in queue.get_all().await {
                if state.map_or(true, |s| s == op.state) {
                    println!("{}", serde_json::to_string(&op)?);
                }
            }
        }
        QueueCommand::Retry => {
            let reset = queue.reset_failed().await?;
            info!(reset, "Failed operations returned to pending");
            println!("{reset} operation(s) returned to pending");
        }
        QueueCommand::Clear => {
            let removed = queue.clear_completed().await?;
            println!("{removed} completed operation(s) removed");
        }
        QueueCommand::Discard => {
            let removed = queue.discard_failed().await?;
            info!(removed, "Failed operations discarded");
            println!("{removed} failed operation(s) removed");
        }
    }
    Ok(())
}

async fn cache(db: &Database, config: &TetherConfig, cmd: CacheCommand) -> SyncResult<()> {
    let cache = CacheManager::new(db.kv(), CacheKeys::new(config.app.namespace.clone()));
    let root = cache.keys().root();

    match cmd {
        CacheCommand::Keys { prefix } => {
            let prefix = format!("{root}{}", prefix.unwrap_or_default());
            for key in cache.entries(&prefix).await? {
                println!("{key}");
            }
        }
        CacheCommand::Clear { prefix } => {
            let removed = cache.clear_by_pattern(&format!("{root}{prefix}")).await?;
            println!("{removed} cache entr(ies) removed");
        }
    }
    Ok(())
}
