//! # Courier Server
//!
//! Instant messaging server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! courier
//!
//! # Run with custom config
//! courier --config /path/to/courier.toml
//!
//! # Run with environment variables
//! COURIER_PORT=24000 COURIER_HOST=0.0.0.0 courier
//! ```

mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Courier instant messaging server.
#[derive(Debug, Parser)]
#[command(name = "courier")]
#[command(version)]
#[command(about = "Courier instant messaging server")]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::load(cli.config.as_deref())?;

    tracing::info!(
        "Starting Courier node {} on {}:{}",
        config.node_id,
        config.host,
        config.port
    );

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}
