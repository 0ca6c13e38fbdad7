//! Parlor node
//!
//! Opens the ledger, recovers interrupted rounds and keeps the configured
//! tables dealing until Ctrl+C or SIGTERM.

use clap::Parser;
use parlor::config::parse_variants;
use parlor::services::{BroadcastPush, PushReveal, StoreIdentity};
use parlor::storage::RocksStore;
use parlor::{logging, ConfigLoader, EngineServices, RoundEngine};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "parlor")]
#[command(about = "Card-game round engine", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Database directory, overrides the configuration
    #[arg(long)]
    data_dir: Option<String>,

    /// Variants dealt without watchers (comma-separated, e.g. "dt,l7")
    #[arg(long)]
    variant: Option<String>,

    /// Log filter, overrides the configuration
    #[arg(long)]
    log: Option<String>,

    /// Write the effective configuration to this path and exit
    #[arg(long)]
    write_config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let loader = match &args.config {
        Some(path) => ConfigLoader::new().with_path(path),
        None => ConfigLoader::new(),
    };
    let mut config = loader.load()?;
    if let Some(dir) = args.data_dir {
        config.storage.data_directory = dir;
    }
    if let Some(list) = &args.variant {
        config.variants.always_on = parse_variants("--variant", list)?;
    }
    if let Some(filter) = args.log {
        config.logging.filter = filter;
    }
    loader.validate(&config)?;

    if let Some(path) = &args.write_config {
        loader.save(&config, path)?;
        println!("Configuration written to {}", path);
        return Ok(());
    }

    logging::init(&config.logging);
    info!(
        data_directory = %config.storage.data_directory,
        variants = ?config.variants.enabled,
        always_on = ?config.variants.always_on,
        "starting parlor"
    );

    let store = Arc::new(RocksStore::open_with(
        &config.storage.data_directory,
        config.storage.clear_on_start,
    )?);
    let push = BroadcastPush::new(config.cache.push_buffer);
    let push_log = tokio::spawn(log_events(push.clone()));

    let push: Arc<BroadcastPush> = Arc::new(push);
    let engine = RoundEngine::new(
        config,
        EngineServices {
            store: store.clone(),
            cache: store.clone(),
            identity: Arc::new(StoreIdentity::new(store)),
            push: push.clone(),
            reveal: Arc::new(PushReveal::new(push)),
        },
    )?;

    let report = engine.recover().await?;
    if !report.refunded.is_empty() {
        warn!(rounds = ?report.refunded, "rounds refunded during recovery");
    }
    engine.start_always_on().await;

    shutdown_signal().await;

    engine.shutdown().await;
    push_log.abort();
    info!(metrics = ?engine.metrics(), "parlor stopped");
    Ok(())
}

/// Mirrors the event stream into the log
async fn log_events(push: BroadcastPush) {
    let mut events = push.subscribe();
    loop {
        match events.recv().await {
            Ok(event) => debug!(kind = event.kind(), variant = ?event.variant(), "event"),
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "event log lagging"),
            Err(RecvError::Closed) => break,
        }
    }
}

/// Wait for shutdown signal
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
