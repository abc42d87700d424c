//! # Graphvec Worker
//!
//! Main entry point for the embedding worker.
//!
//! Exits with status 0 after a clean shutdown and 1 when startup fails
//! (invalid configuration, missing credentials, broker unreachable).

use anyhow::Context;
use graphvec_config::{AppConfig, ConfigLoader};
use graphvec_core::init_logging;
use graphvec_jobs::{register_metrics, AmqpBroker, OpenAiGenerator, PgEntityStore, Worker};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let config = match ConfigLoader::from_default_location().load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = init_logging(&config.logging) {
        eprintln!("Failed to initialise logging: {e}");
        std::process::exit(1);
    }

    info!("Starting Graphvec embedding worker...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(config).await {
        error!("Worker error: {:#}", e);
        std::process::exit(1);
    }

    info!("Worker shutdown complete");
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
    register_metrics();

    info!(queue = %config.broker.queue_name, prefetch = config.worker.prefetch, "Configuration loaded");

    let generator = OpenAiGenerator::new(&config.generation).context("generation client")?;
    let store = PgEntityStore::connect(&config.store)
        .await
        .context("entity store")?;
    let broker = AmqpBroker::new(config.broker.url.clone());

    let worker = Worker::new(&config, Arc::new(broker), Arc::new(store), Arc::new(generator));

    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    worker.run(token).await.context("broker")?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        () = terminate => {
            info!("Received terminate signal, initiating graceful shutdown...");
        }
    }
}
