//! # Evograph CLI Module
//!
//! This module implements the CLI interface for Evograph.
//!
//! ## Available Commands
//!
//! - `server` - Start the HTTP server
//! - `status` - Show engine status
//! - `submit` - Submit command envelopes from a file or inline JSON
//! - `show` - Print an aggregate's state
//! - `events` - List an aggregate's events
//! - `verify` - Check hash chains
//! - `replay` - Rebuild projections from the log
//! - `export` - Write the log to an archive
//! - `import` - Load an archive into the log
//! - `init` - Create a config file and database

mod commands;

use crate::config::{BackendKind, EvographConfig};
use clap::{Parser, Subcommand};
use evograph_core::EvographError;
use std::path::PathBuf;

pub use commands::*;

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// Evograph - event-sourced graph aggregate engine
///
/// Every change is a command, every command an event in a hash-chained log.
#[derive(Parser, Debug)]
#[command(name = "evograph")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Suppress banner output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to the config file (default: ./evograph.toml if present)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    /// Path to the event database (overrides [storage] path)
    #[arg(short = 'D', long, global = true)]
    pub database: Option<PathBuf>,

    /// Storage backend: "memory" or "redb" (overrides [storage] backend)
    #[arg(short = 'B', long, global = true)]
    pub backend: Option<String>,

    /// Output in JSON format (for programmatic access)
    #[arg(long, global = true)]
    pub json_mode: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start HTTP server
    Server {
        /// Host to bind to (overrides [server] host)
        #[arg(short = 'H', long)]
        host: Option<String>,

        /// Port to bind to (overrides [server] port)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Show engine status
    Status,

    /// Submit command envelopes (one object or an array)
    Submit {
        /// File holding the envelope(s)
        #[arg(short, long, conflicts_with = "json")]
        file: Option<PathBuf>,

        /// Inline envelope JSON
        #[arg(short, long)]
        json: Option<String>,
    },

    /// Print an aggregate's state
    Show {
        /// Aggregate id (UUID)
        aggregate_id: String,
    },

    /// List an aggregate's events
    Events {
        /// Aggregate id (UUID)
        aggregate_id: String,

        /// Only events after this version
        #[arg(short, long, default_value = "0")]
        from: u64,
    },

    /// Verify hash chains (all aggregates when no id is given)
    Verify {
        /// Aggregate id (UUID)
        aggregate_id: Option<String>,
    },

    /// Rebuild every projection from the log
    Replay,

    /// Export the event log to an archive
    Export {
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Import an archive into the event log
    Import {
        /// Input file path
        #[arg(short, long)]
        input: PathBuf,
    },

    /// Write a default config file and create the database
    Init {
        /// Overwrite an existing config file
        #[arg(short, long)]
        force: bool,
    },
}

impl Cli {
    /// Load the config file and apply the storage flags on top.
    pub fn load_config(&self) -> Result<EvographConfig, EvographError> {
        let mut config = match (&self.command, &self.config) {
            // `init` writes the file, so it must not require it
            (Some(Commands::Init { .. }), _) => EvographConfig::default(),
            (_, path) => EvographConfig::load(path.as_deref())?,
        };
        if let Some(database) = &self.database {
            config.storage.path = database.clone();
        }
        if let Some(backend) = &self.backend {
            config.storage.backend = backend.parse::<BackendKind>()?;
        }
        Ok(config)
    }
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Execute the CLI with parsed arguments and resolved config.
pub async fn execute(cli: Cli, config: EvographConfig) -> Result<(), EvographError> {
    let json_mode = cli.json_mode;

    match cli.command {
        Some(Commands::Server { host, port }) => cmd_server(config, host, port).await,
        Some(Commands::Status) | None => cmd_status(&config, json_mode),
        Some(Commands::Submit { file, json }) => {
            cmd_submit(&config, json_mode, file.as_deref(), json.as_deref()).await
        }
        Some(Commands::Show { aggregate_id }) => cmd_show(&config, json_mode, &aggregate_id),
        Some(Commands::Events { aggregate_id, from }) => {
            cmd_events(&config, json_mode, &aggregate_id, from)
        }
        Some(Commands::Verify { aggregate_id }) => {
            cmd_verify(&config, json_mode, aggregate_id.as_deref())
        }
        Some(Commands::Replay) => cmd_replay(&config, json_mode),
        Some(Commands::Export { output }) => cmd_export(&config, &output),
        Some(Commands::Import { input }) => cmd_import(&config, &input),
        Some(Commands::Init { force }) => cmd_init(&config, cli.config.as_deref(), force),
    }
}

// =============================================================================
// TESTS
// =============================================================================
