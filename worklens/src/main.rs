//! worklensd - the worklens daemon
//!
//! Wires the core pipeline to its producers and runs until SIGINT/SIGTERM.
//! Startup order matters: configuration and redaction rules are validated
//! first (the only fatal errors), then storage, then the pipeline, then the
//! in-process producers that feed it through the same socket external
//! producers use.

mod gitprobe;
mod transport;
mod watcher;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;

use worklens_core::classify::HttpInferenceClient;
use worklens_core::{Config, Database, Pipeline};

#[derive(Parser)]
#[command(name = "worklensd")]
#[command(about = "Background observer for developer activity")]
#[command(version)]
struct Args {
    /// Config file path (default: ~/.config/worklens/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Database path override
    #[arg(long)]
    database: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = match &args.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("failed to load configuration")?;

    // Initialize logging (to file; the daemon owns no terminal)
    let _log_guard =
        worklens_core::logging::init(&config.logging).context("failed to initialize logging")?;

    tracing::info!("worklensd starting up");

    // Open database
    let db_path = args.database.unwrap_or_else(Config::database_path);
    tracing::info!(path = %db_path.display(), "Opening database");
    let db = Arc::new(Database::open(&db_path).context("failed to open database")?);
    db.migrate().context("failed to run database migrations")?;

    // The inference client and the pipeline validate the configuration;
    // an error here is fatal by design.
    let client =
        Arc::new(HttpInferenceClient::new(&config.inference).context("invalid inference config")?);
    let pipeline =
        Pipeline::start(&config, db.clone(), client).context("failed to start pipeline")?;

    // In-process producers feed the same socket external producers use.
    let (producer_tx, producer_rx) = watch::channel(false);
    let socket = config.socket_path();

    let file_watcher = watcher::FileWatcher::new(
        socket.clone(),
        db.clone(),
        config.collectors.clone(),
    );
    let watcher_shutdown = producer_rx.clone();
    let watcher_handle = tokio::task::spawn_blocking(move || file_watcher.run(watcher_shutdown));

    let git_probe = gitprobe::GitProbe::new(socket, db, &config.collectors);
    let probe_handle = tokio::spawn(git_probe.run(producer_rx));

    tracing::info!("worklensd running");

    // Run until SIGINT or SIGTERM
    wait_for_signal().await;
    tracing::info!("Shutdown signal received");

    // Stop producers first so nothing new enters the socket, then let the
    // pipeline flush.
    let _ = producer_tx.send(true);
    let _ = probe_handle.await;
    let _ = watcher_handle.await;
    pipeline.shutdown().await;

    tracing::info!("worklensd stopped");
    Ok(())
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
