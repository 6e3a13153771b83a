//! Stockroom CLI
//!
//! Command-line host for the offline-first catalog engine.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use stockroom_core::{Config, EngineError, StorageError, SyncEngine};

mod commands;
mod logging;
mod output;

use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "stockroom")]
#[command(about = "Stockroom - offline-first catalog client")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Debug logging to stderr (or the configured log file)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show availability, pending changes and cache state
    Status,
    /// Send pending changes to the server
    Sync,
    /// List entities (from the cache when offline)
    #[command(alias = "ls")]
    List {
        /// Page number
        #[arg(short, long, default_value_t = 1)]
        page: u32,
        /// Filter or sort parameter (key=value), repeatable
        #[arg(short, long = "filter")]
        filter: Vec<String>,
    },
    /// Create an entity
    #[command(alias = "add")]
    Create {
        /// Field (key=value), repeatable
        #[arg(short, long = "field", required = true)]
        field: Vec<String>,
    },
    /// Update fields of an entity
    Update {
        /// Entity ID
        id: String,
        /// Field (key=value), repeatable
        #[arg(short, long = "field", required = true)]
        field: Vec<String>,
    },
    /// Delete an entity
    #[command(alias = "rm")]
    Delete {
        /// Entity ID
        id: String,
    },
    /// List changes waiting for the server
    Pending,
    /// Discard every pending change
    ClearPending,
    /// Show locally deleted entities again
    RestoreDeleted,
    /// List everything in the local cache
    Cached {
        /// Maximum number of entities
        #[arg(short, long, default_value_t = 100)]
        limit: usize,
    },
    /// Run in the foreground, syncing whenever the server is reachable
    Watch,
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (server_url, collection, realtime_url, ...)
        key: String,
        /// Configuration value
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));

    let result = run(cli, &output).await;
    if let Some(hint) = result.as_ref().err().and_then(recovery_hint) {
        eprintln!("Hint: {}", hint);
    }
    result
}

/// Suggestion attached to a local storage failure anywhere in the chain
fn recovery_hint(error: &anyhow::Error) -> Option<&'static str> {
    error.chain().find_map(|cause| {
        let storage = cause.downcast_ref::<StorageError>().or_else(|| {
            match cause.downcast_ref::<EngineError>() {
                Some(EngineError::Storage(e)) => Some(e),
                _ => None,
            }
        });
        storage.and_then(StorageError::recovery_suggestion)
    })
}

async fn run(cli: Cli, output: &Output) -> Result<()> {
    // Config commands don't need the engine
    if let Commands::Config { command } = &cli.command {
        return match command.clone() {
            Some(ConfigCommands::Show) | None => commands::config::show(output),
            Some(ConfigCommands::Set { key, value }) => {
                commands::config::set(key, value, output)
            }
        };
    }

    let config = Config::load().context("Failed to load configuration")?;
    logging::init(&config, cli.verbose);

    let engine = SyncEngine::open(config)?;

    let is_manual_sync = matches!(cli.command, Commands::Sync | Commands::Watch);
    let is_local_admin = matches!(
        cli.command,
        Commands::Pending | Commands::ClearPending | Commands::RestoreDeleted | Commands::Cached { .. }
    );

    // Drain pending changes first so the command sees server truth
    if !is_manual_sync && !is_local_admin {
        commands::sync::sync_quiet(&engine).await;
    }

    let result = match cli.command {
        Commands::Status => commands::status::show(&engine, output),
        Commands::Sync => commands::sync::sync(&engine, output).await,
        Commands::List { page, filter } => {
            commands::entity::list(&engine, page, filter, output).await
        }
        Commands::Create { field } => commands::entity::create(&engine, field, output).await,
        Commands::Update { id, field } => {
            commands::entity::update(&engine, id, field, output).await
        }
        Commands::Delete { id } => commands::entity::delete(&engine, id, output).await,
        Commands::Pending => commands::admin::pending(&engine, output),
        Commands::ClearPending => commands::admin::clear_pending(&engine, output),
        Commands::RestoreDeleted => commands::admin::restore_deleted(&engine, output),
        Commands::Cached { limit } => commands::admin::cached(&engine, limit, output),
        Commands::Watch => commands::watch::run(&engine, output).await,
        Commands::Config { .. } => unreachable!(), // Handled above
    };

    engine.shutdown().await;
    result
}
