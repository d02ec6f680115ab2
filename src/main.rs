//! Transaction sender worker
//!
//! Reads newline-delimited JSON jobs from stdin and sends their transactions.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use tx_sender::chain::ChainManager;
use tx_sender::config::Settings;
use tx_sender::keymanager::HttpKeyManagerClient;
use tx_sender::metrics::MetricsServer;
use tx_sender::state::{HttpJobStatusReporter, JobStatusReporter};
use tx_sender::store;
use tx_sender::tx::{NonceManager, SenderContext, TransactionSigner};
use tx_sender::types::Job;
use tx_sender::worker::{JobDispatcher, Senders};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::load()?;

    // Initialize logging
    init_logging(settings.logging.json);

    info!("Starting tx-sender v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Loaded configuration for {} chains",
        settings.enabled_chains().len()
    );

    let chain_manager = Arc::new(ChainManager::from_settings(&settings)?);
    info!("Chain clients initialized");

    let nonce_store = store::from_config(&settings.nonce).await?;
    let nonce_manager = Arc::new(
        NonceManager::new(nonce_store, settings.sender.max_recovery)
            .with_lock_ttl(Duration::from_secs(settings.nonce.lock_ttl_secs)),
    );
    info!(backend = ?settings.nonce.backend, "Nonce store ready");

    let signer = TransactionSigner::new(
        Arc::new(HttpKeyManagerClient::new(&settings.key_manager.url)),
        settings.multi_tenancy.clone(),
    );
    let reporter: Arc<dyn JobStatusReporter> =
        Arc::new(HttpJobStatusReporter::new(&settings.job_api.url));

    let ctx = Arc::new(SenderContext::new(
        chain_manager,
        nonce_manager.clone(),
        signer,
        reporter.clone(),
        Duration::from_secs(settings.sender.send_timeout_secs),
    ));
    let dispatcher = Arc::new(JobDispatcher::new(
        Senders::new(ctx),
        nonce_manager,
        reporter,
        settings.sender.workers,
    ));

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    let (job_tx, job_rx) = mpsc::channel(settings.sender.workers * 2);
    let reader_handle = tokio::spawn(async move {
        if let Err(e) = read_jobs(job_tx).await {
            error!("Job input error: {}", e);
        }
    });
    let mut dispatcher_handle = tokio::spawn(dispatcher.clone().run(job_rx));

    info!(instance_id = %settings.sender.instance_id, "tx-sender is running");
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping...");
            reader_handle.abort();
            dispatcher.stop().await;
            dispatcher_handle.await??;
        }
        result = &mut dispatcher_handle => {
            result??;
        }
    }

    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("tx-sender stopped");
    Ok(())
}

/// Forward jobs from stdin, one JSON document per line
async fn read_jobs(jobs: mpsc::Sender<Job>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match serde_json::from_str::<Job>(line) {
            Ok(job) => {
                if jobs.send(job).await.is_err() {
                    break;
                }
            }
            Err(e) => warn!("Skipping invalid job: {}", e),
        }
    }

    info!("Job input closed");
    Ok(())
}

fn init_logging(json: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tx_sender=debug,hyper=warn"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
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
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
