mod server;
mod signaling;
mod websocket;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use stagecast_core::{encoder::FfmpegLauncher, logging, Config};

use server::{AppState, StagecastServer};

/// Live media session orchestrator
#[derive(Debug, Parser)]
#[command(name = "stagecast", version, about)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "STAGECAST_CONFIG_PATH")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load configuration
    let config = Config::discover(cli.config.as_deref())?;

    // 1.5. Validate configuration (fail fast on misconfigurations)
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 2. Initialize logging; the guard flushes the file writer on exit
    let _log_guard = logging::init_logging(&config.logging)?;
    info!("Stagecast server starting...");
    info!("HTTP address: {}", config.http_address());
    info!(
        grace_period_secs = config.sfu.producer_grace_period_secs,
        viewer_scope = ?config.sfu.viewer_scope,
        close_replaced_producers = config.sfu.close_replaced_producers,
        "SFU session manager configured"
    );
    info!(
        uploads_dir = %config.recording.uploads_dir.display(),
        encoder = %config.recording.encoder_program,
        "Recording configured"
    );

    // 3. Wire services
    let state = AppState::new(
        &config,
        Arc::new(FfmpegLauncher::new(config.recording.encoder_program.clone())),
        Arc::new(FfmpegLauncher::new(config.relay.encoder_program.clone())),
    );

    // 4. Serve until a shutdown signal
    StagecastServer::new(config, state).start().await
}
