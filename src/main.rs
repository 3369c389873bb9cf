//! Bookswap Engine - Atomic booking ownership exchange
//!
//! Runs the swap orchestration engine against the configured ledger network
//! with a metrics endpoint and a periodic expiration sweep.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};

use bookswap_engine::alerts::LogAlertDispatcher;
use bookswap_engine::cache::{
    CacheInvalidationCoordinator, InvalidationMode, NullCacheBackend,
};
use bookswap_engine::config::Settings;
use bookswap_engine::ledger::SandboxLedger;
use bookswap_engine::metrics::{self, MetricsServer};
use bookswap_engine::orchestrator::SwapOrchestrator;
use bookswap_engine::store::{InMemoryStore, TransactionalStore};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("Starting Bookswap Engine v{}", env!("CARGO_PKG_VERSION"));

    let settings = Settings::load()?;
    info!(
        instance_id = %settings.engine.instance_id,
        network = %settings.ledger.network,
        "Loaded configuration"
    );

    let store: Arc<dyn TransactionalStore> = Arc::new(InMemoryStore::new());
    let ledger = Arc::new(SandboxLedger::new(&settings.ledger.operator_account_id));
    let alerts = Arc::new(LogAlertDispatcher);

    let mode = if settings.cache.batched {
        InvalidationMode::Batched {
            delay: Duration::from_millis(settings.cache.batch_delay_ms),
        }
    } else {
        InvalidationMode::Immediate
    };
    let cache = Arc::new(CacheInvalidationCoordinator::new(
        Arc::new(NullCacheBackend),
        mode,
    ));

    let orchestrator = Arc::new(SwapOrchestrator::new(
        store.clone(),
        ledger,
        alerts,
        cache.clone(),
        settings.engine.clone(),
    ));
    info!("Swap orchestrator initialized");

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

    // Periodic sweep: expire stale proposals and drop settled executions
    let sweep_handle = tokio::spawn({
        let orchestrator = orchestrator.clone();
        let store = store.clone();
        let interval = settings.engine.sweep_interval_secs;
        let retention_ms = settings.engine.execution_retention_secs * 1_000;
        async move {
            loop {
                tokio::time::sleep(Duration::from_secs(interval)).await;

                match store.expire_stale_proposals(chrono::Utc::now()).await {
                    Ok(expired) => {
                        if expired > 0 {
                            metrics::record_proposals_expired(expired);
                            info!(expired, "expired stale proposals");
                        }
                    }
                    Err(e) => error!("Proposal expiration sweep failed: {}", e),
                }

                orchestrator.cleanup_expired_executions(retention_ms);
            }
        }
    });

    info!("Bookswap Engine is running");
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Apply any invalidations still sitting in the batch window
    cache.flush().await;

    sweep_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Bookswap Engine stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,bookswap_engine=debug,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

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
