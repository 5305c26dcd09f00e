// Worker host binary entry point

use anyhow::Result;
use common::cache::{build_cache, Cache};
use common::config::Settings;
use common::identity::resolve_host_identity;
use common::shutdown::shutdown_channel;
use common::telemetry;
use common::worker::{CacheResetJob, WorkerHost, WorkerJob};
use std::future::Future;
use std::io;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

const CACHE_RESET_WORKER: &str = "CacheReset";

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        anyhow::anyhow!("Configuration error: {}", e)
    })?;

    telemetry::init_logging(
        &settings.observability.log_level,
        settings.observability.log_format,
        settings.observability.tracing_endpoint.as_deref(),
    )?;

    info!("Starting recurring worker host");

    if let Some(port) = settings.observability.metrics_port {
        telemetry::init_metrics(port)?;
    }

    let host_id = resolve_host_identity(settings.host.host_id.as_deref()).host_id();
    info!(
        host_id = %host_id,
        app_name = %settings.cache.app_name,
        backend = ?settings.cache.backend,
        workers = settings.workers.len(),
        "Configuration loaded"
    );

    let (trigger, shutdown) = shutdown_channel();

    let cache = build_cache(&settings.cache, shutdown.clone())
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to initialize cache");
            anyhow::anyhow!("Cache initialization error: {}", e)
        })?;
    info!("Cache initialized");

    let mut host = WorkerHost::new(cache.clone(), settings.cache.app_name.clone(), host_id);
    for config in &settings.workers {
        let Some(job) = job_for(&settings, &cache, &config.worker_name) else {
            warn!(
                worker_name = %config.worker_name,
                "No job registered for configured worker; skipping"
            );
            continue;
        };
        host.register(config.clone(), job);
    }

    let host_handle = tokio::spawn({
        let trigger = trigger.clone();
        async move {
            host.run_until(shutdown).await;
            trigger.fire();
        }
    });

    info!("Worker host is running. Press Ctrl+C to shutdown gracefully");

    let mut finished = trigger.signal();
    tokio::select! {
        _ = shutdown_requested() => info!("Shutdown signal received, initiating graceful shutdown"),
        _ = finished.cancelled() => info!("No worker left running"),
    }
    trigger.fire();

    info!("Waiting for workers to finish in-flight cycles");
    if let Err(e) = host_handle.await {
        error!(error = %e, "Worker host task failed");
    }

    cache.dispose().await;
    telemetry::shutdown_tracer();
    info!("Worker host shutdown complete");

    Ok(())
}

/// Resolves on Ctrl+C or, on Unix, SIGTERM
async fn shutdown_requested() {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    first_signal(signal::ctrl_c(), terminate).await;
}

/// Resolves when either source fires; a Ctrl+C listener that failed to
/// register never does
async fn first_signal(
    ctrl_c: impl Future<Output = io::Result<()>>,
    terminate: impl Future<Output = ()>,
) {
    let ctrl_c = async {
        if let Err(e) = ctrl_c.await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Job body for a configured worker name
fn job_for(
    settings: &Settings,
    cache: &Cache,
    worker_name: &str,
) -> Option<Arc<dyn WorkerJob>> {
    match worker_name {
        CACHE_RESET_WORKER => Some(Arc::new(CacheResetJob::new(
            cache.clone(),
            settings.cache.app_name.clone(),
            settings.cache_reset.key_pattern.clone(),
        ))),
        _ => None,
    }
}
