//! vitalsync CLI
//!
//! Command-line tools for pushing records and managing upload anchors.
//!
//! # Commands
//!
//! - `push` - Upload the records of a JSON file incrementally
//! - `anchors list` - Show the stored anchors of an endpoint
//! - `anchors reset` - Forget every anchor of an endpoint

mod commands;
mod http;
mod source;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// vitalsync command-line upload tools.
#[derive(Parser)]
#[command(name = "vitalsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory holding the anchor store
    #[arg(global = true, short, long)]
    store: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload records that changed since the last successful push
    Push {
        /// Ingestion endpoint URL
        #[arg(short, long)]
        endpoint: String,

        /// Bearer token
        #[arg(short, long)]
        token: String,

        /// JSON file mapping type ids to record arrays
        #[arg(short, long)]
        records: PathBuf,

        /// Maximum records per upload request
        #[arg(long, default_value = "500")]
        records_per_chunk: usize,

        /// Per-request timeout in seconds
        #[arg(long, default_value = "30")]
        timeout: u64,

        /// Print the requests instead of sending them; anchors are not moved
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Inspect or reset upload anchors
    Anchors {
        #[command(subcommand)]
        action: AnchorAction,
    },

    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum AnchorAction {
    /// List the anchors stored for an endpoint
    List {
        /// Ingestion endpoint URL
        #[arg(short, long)]
        endpoint: String,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Delete every anchor of an endpoint; the next push is a full export
    Reset {
        /// Ingestion endpoint URL
        #[arg(short, long)]
        endpoint: String,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Push {
            endpoint,
            token,
            records,
            records_per_chunk,
            timeout,
            dry_run,
        } => {
            let store = cli.store.ok_or("Store path required for push")?;
            commands::push::run(
                &store,
                commands::push::PushOptions {
                    endpoint,
                    token,
                    records,
                    records_per_chunk,
                    timeout_secs: timeout,
                    dry_run,
                },
            )?;
        }
        Commands::Anchors { action } => {
            let store = cli.store.ok_or("Store path required for anchors")?;
            match action {
                AnchorAction::List { endpoint, format } => {
                    commands::anchors::list(&store, &endpoint, &format)?;
                }
                AnchorAction::Reset { endpoint } => {
                    commands::anchors::reset(&store, &endpoint)?;
                }
            }
        }
        Commands::Version => {
            println!("vitalsync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
