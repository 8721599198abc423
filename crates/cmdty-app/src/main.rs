//! Commodity dashboard data layer - Entry Point
//!
//! Runs the price stream, query cache, offline asset cache and sync queue
//! until Ctrl-C.

use anyhow::Result;
use clap::Parser;
use tracing::info;

/// Commodity dashboard data layer
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (can also be set via CMDTY_CONFIG env var)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Must run before any WS connection
    cmdty_ws::init_crypto();

    let args = Args::parse();

    cmdty_telemetry::init_logging()?;

    info!("Starting cmdty v{}", env!("CARGO_PKG_VERSION"));

    // CLI arg > CMDTY_CONFIG env var > default
    let config_path = args
        .config
        .or_else(|| std::env::var("CMDTY_CONFIG").ok())
        .unwrap_or_else(|| "config/default.toml".to_string());

    info!(config_path = %config_path, "Loading configuration");

    let config = cmdty_app::AppConfig::from_file(&config_path)?;
    info!(
        api_base_url = %config.api_base_url,
        stream_url = %config.stream.url,
        profile = ?config.profile,
        "Configuration loaded"
    );

    let app = cmdty_app::Application::new(config)?;
    app.run().await?;

    Ok(())
}
