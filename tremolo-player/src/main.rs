//! tremolo-player - Main entry point
//!
//! Parses the CLI, merges it with the optional TOML configuration, then
//! drives the service build lifecycle. A lost connection tears the
//! communicator down and rebuilds onto the same model; Ctrl+C or SIGTERM
//! ends the process.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::sync::RwLock;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tremolo_common::config::load_toml_config;
use tremolo_common::model::{run_search_worker, AudioService};
use tremolo_player::build::ServiceBuilder;
use tremolo_player::config::{self, Overrides};
use tremolo_player::status::Outcome;

/// Command-line arguments for tremolo-player
#[derive(Parser, Debug)]
#[command(name = "tremolo-player")]
#[command(about = "Personal audio player with live state replication")]
#[command(version)]
struct Args {
    /// Serve the library to clients on this port
    #[arg(long, value_name = "PORT", conflicts_with = "connect", env = "TREMOLO_PORT")]
    serve: Option<u16>,

    /// Mirror a remote instance at ADDR[:PORT]
    #[arg(long, value_name = "ADDR", env = "TREMOLO_SERVER")]
    connect: Option<String>,

    /// Shuffle the search projection of the source playlist
    #[arg(long)]
    shuffle: bool,

    /// Initial search key for the source playlist
    #[arg(long, value_name = "KEY")]
    search_key: Option<String>,

    /// Initial volume, 0.0 - 1.0
    #[arg(long)]
    volume: Option<f32>,

    /// Initial play state: stopped, playing or paused
    #[arg(long, value_name = "STATE")]
    play_state: Option<String>,

    /// Service data file
    #[arg(long, value_name = "FILE", env = "TREMOLO_DATA_FILE")]
    data_file: Option<PathBuf>,

    /// Media source root feeding the source playlist; may repeat
    #[arg(long = "media-source", value_name = "DIR")]
    media_sources: Vec<String>,

    /// Configuration file (defaults to the platform config directory)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log filter, e.g. "tremolo=trace"
    #[arg(long, env = "TREMOLO_LOG")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let file = load_toml_config(args.config.as_deref()).context("loading configuration file")?;

    let filter = args
        .log_level
        .clone()
        .or_else(|| file.log_level.clone())
        .unwrap_or_else(|| "tremolo=debug".into());
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&filter)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::resolve(
        Overrides {
            serve: args.serve,
            connect: args.connect,
            shuffle: args.shuffle,
            search_key: args.search_key,
            volume: args.volume,
            play_state: args.play_state,
            data_file: args.data_file,
            media_sources: args.media_sources,
        },
        &file,
    )
    .context("resolving launch configuration")?;

    info!("starting tremolo-player in {:?} mode", config.mode);

    let service = Arc::new(RwLock::new(AudioService::new()));
    tokio::spawn(run_search_worker(service.clone()));

    loop {
        let builder = ServiceBuilder::with_service(service.clone(), config.clone());
        let status = builder.status();

        let outcome = tokio::select! {
            outcome = builder.run() => outcome,
            _ = shutdown_signal() => {
                builder.cancel();
                info!("shutdown requested during build");
                return Ok(());
            }
        };
        if outcome != Outcome::Successful {
            info!("build ended: {:?}", outcome);
            return Ok(());
        }
        let Some(result) = status.overall.take_result() else {
            return Ok(());
        };

        match &result.communicator {
            Some(communicator) => {
                tokio::select! {
                    _ = communicator.wait_closed() => {
                        warn!("connection lost, rebuilding");
                        result.player_bridge.abort();
                    }
                    _ = shutdown_signal() => {
                        communicator.close().await;
                        result.player_bridge.abort();
                        info!("shutting down");
                        return Ok(());
                    }
                }
            }
            None => {
                shutdown_signal().await;
                result.player_bridge.abort();
                info!("shutting down");
                return Ok(());
            }
        }
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
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
