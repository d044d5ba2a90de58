//! Pinloom Daemon (`pinloomd`)
//!
//! Headless node that runs the batch-pin aggregation pipeline over an
//! embedded store. A ledger adapter pushes pin events into the pipeline
//! intake; user events come out on the bus.

mod adapters;
mod config;

use adapters::{FsStorage, StaticIdentityResolver};
use clap::Parser;
use config::DaemonConfig;
use pinloom_core::Pipeline;
use pinloom_model::SystemClock;
use pinloom_store::PinStore;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "pinloomd", version, about = "Pinloom Headless Daemon")]
struct Args {
    /// Path to the TOML config file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Override the data directory from the config
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Verbose logging (-v for debug, -vv for trace)
    #[arg(long, short, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    tracing::info!("pinloomd v{} starting...", env!("CARGO_PKG_VERSION"));

    let mut config = DaemonConfig::load(args.config.as_deref())?;
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    std::fs::create_dir_all(&config.data_dir)?;

    let store = Arc::new(
        PinStore::open(config.data_dir.join("pinloom.db"))
            .map_err(|e| anyhow::anyhow!("failed to open store: {}", e))?,
    );
    let storage = Arc::new(FsStorage::new(config.data_dir.join("blobs"))?);
    let identity = Arc::new(StaticIdentityResolver::new(config.identities.clone()));

    let pipeline = Pipeline::start(
        config.core.clone(),
        store,
        storage,
        identity,
        Arc::new(SystemClock),
    );

    // Ledger adapters feed this sender; it stays open for the daemon's
    // lifetime so adapters can attach at any point.
    let _intake = pipeline.intake();

    tracing::info!(data_dir = %config.data_dir.display(), "daemon ready, press Ctrl+C to stop");
    shutdown_signal().await;
    tracing::info!("shutdown signal received...");

    pipeline.shutdown().await;
    tracing::info!("daemon stopped");
    Ok(())
}

fn init_tracing(verbosity: u8) {
    let mut filter = EnvFilter::from_default_env();

    // Only apply defaults if RUST_LOG is not set
    if std::env::var("RUST_LOG").is_err() {
        let level = match verbosity {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        if let Ok(directive) = level.parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for Ctrl+C");
    }
}
