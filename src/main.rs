//! Worker process consuming the `celery_default` queue.
//!
//! Configuration comes from the environment (see [`AppConfig::from_env`]),
//! log filtering from `RUST_LOG`.

use std::sync::Arc;

use anyhow::{bail, Context};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use contextgraph_worker::{register_tasks, AppConfig, WorkerApp, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "contextgraph_worker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting contextgraph worker {}", contextgraph_worker::VERSION);

    let config = AppConfig::from_env();
    if config.always_eager {
        bail!("CELERY_ALWAYS_EAGER is set; a worker has nothing to consume");
    }
    info!(
        "Configuration loaded: broker={}, backend={}, cache={}, testing={}",
        config.broker_url, config.result_backend, config.cache_url, config.testing
    );

    let app = WorkerApp::from_config(config)
        .await
        .context("failed to initialise worker app")?;
    register_tasks(&app).await;
    info!("Registered tasks: {:?}", app.registered().await);

    let worker_config = WorkerConfig {
        queues: vec![app.conf().default_queue.clone()],
        ..WorkerConfig::default()
    };
    let worker = Arc::new(app.worker(worker_config)?);

    let stopper = worker.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        stopper.signal_shutdown().await;
    });

    worker.start().await?;

    let stats = worker.get_stats().await;
    info!(
        "Worker stopped: processed={}, succeeded={}, failed={}, retried={}",
        stats.tasks_processed, stats.tasks_successful, stats.tasks_failed, stats.tasks_retried
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
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
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
