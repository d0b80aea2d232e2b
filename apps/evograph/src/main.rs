//! # Evograph - Event-Sourced Graph Engine
//!
//! The main binary for the Evograph graph aggregate engine.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    apps/evograph (THE BINARY)                │
//! │                                                              │
//! │   ┌─────────────┐    ┌─────────────┐    ┌────────────────┐   │
//! │   │   CLI       │    │   HTTP API  │    │   Dispatcher   │   │
//! │   │  (clap)     │    │   (axum)    │    │ (tokio tasks)  │   │
//! │   └──────┬──────┘    └──────┬──────┘    └───────┬────────┘   │
//! │          └──────────────────┼───────────────────┘            │
//! │                             ▼                                │
//! │                    ┌─────────────────┐                       │
//! │                    │  evograph-core  │                       │
//! │                    │   (THE LOGIC)   │                       │
//! │                    └─────────────────┘                       │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! # Start the HTTP server
//! evograph server --host 0.0.0.0 --port 8080
//!
//! # CLI operations
//! evograph init
//! evograph submit -f commands.json
//! evograph verify
//! ```

use clap::Parser;
use evograph::{EvographConfig, cli};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LOG_FILTER: &str = "evograph=info,evograph_core=info,tower_http=debug";

// =============================================================================
// APPLICATION ENTRY POINT
// =============================================================================

#[tokio::main]
async fn main() {
    let cli = cli::Cli::parse();

    // Config is needed before logging so that [logging] can shape it.
    let config = match cli.load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    };

    init_tracing(&config);

    if !cli.quiet && !cli.json_mode {
        print_banner();
    }

    if let Err(e) = cli::execute(cli, config).await {
        tracing::error!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Initialize tracing. `EVOGRAPH_LOG_FORMAT` and `RUST_LOG` win over the
/// `[logging]` section; `json` enables machine-parseable output.
fn init_tracing(config: &EvographConfig) {
    let log_format = std::env::var("EVOGRAPH_LOG_FORMAT")
        .ok()
        .or_else(|| config.logging.format.clone())
        .unwrap_or_else(|| "text".to_string());

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        config
            .logging
            .filter
            .as_deref()
            .unwrap_or(DEFAULT_LOG_FILTER)
            .into()
    });

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }
}

/// Print the Evograph startup banner.
fn print_banner() {
    println!(
        r#"
  ███████╗██╗   ██╗ ██████╗  ██████╗ ██████╗  █████╗ ██████╗ ██╗  ██╗
  ██╔════╝██║   ██║██╔═══██╗██╔════╝ ██╔══██╗██╔══██╗██╔══██╗██║  ██║
  █████╗  ██║   ██║██║   ██║██║  ███╗██████╔╝███████║██████╔╝███████║
  ██╔══╝  ╚██╗ ██╔╝██║   ██║██║   ██║██╔══██╗██╔══██║██╔═══╝ ██╔══██║
  ███████╗ ╚████╔╝ ╚██████╔╝╚██████╔╝██║  ██║██║  ██║██║     ██║  ██║
  ╚══════╝  ╚═══╝   ╚═════╝  ╚═════╝ ╚═╝  ╚═╝╚═╝  ╚═╝╚═╝     ╚═╝  ╚═╝

  Event-Sourced Graph Engine v{}

  Commanded • Hash-Chained • Replayable
"#,
        env!("CARGO_PKG_VERSION")
    );
}
