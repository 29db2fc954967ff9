//! LyricLine Server - standalone WebSocket server for the LyricLine
//! live-lyric-follow session protocol.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use lyricline_core::{bootstrap_services, start_server, AppState, NullSttProvider, SttProvider};
use tokio::signal;

use crate::config::ServerConfig;

/// LyricLine Server - headless live-lyric-follow session server.
#[derive(Parser, Debug)]
#[command(name = "lyricline-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "LYRICLINE_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Bind port (overrides config file).
    #[arg(short = 'p', long, env = "LYRICLINE_BIND_PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("LyricLine Server v{}", env!("CARGO_PKG_VERSION"));

    let mut config = ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(port) = args.port {
        config.bind_port = port;
    }

    log::info!(
        "Configuration: bind_port={}, fallback_to_mock_setlist={}",
        config.bind_port,
        config.core.fallback_to_mock_setlist
    );

    // No real STT vendor is wired in yet (spec §1 — the STT vendor is an
    // explicitly out-of-scope external collaborator). Swap this for a real
    // `SttProvider::Streaming`/`SttProvider::Chunk` implementation once one
    // is available.
    let stt_provider = SttProvider::Chunk(Arc::new(NullSttProvider));

    let services = bootstrap_services(config.core, stt_provider).context("Failed to bootstrap services")?;
    log::info!("Services bootstrapped successfully");

    let app_state = AppState::from_services(&services);
    let bind_port = config.bind_port;

    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(app_state, bind_port).await {
            log::error!("Server error: {}", e);
        }
    });

    shutdown_signal().await;
    log::info!("Shutdown signal received, cleaning up...");

    services.shutdown().await;
    server_handle.abort();

    log::info!("Shutdown complete");
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
