// Supervises the recurring workers of one process

use crate::cache::Cache;
use crate::config::WorkerConfig;
use crate::lease::{CacheLeaseStore, LeaseCoordinator, LeaseStore};
use crate::shutdown::ShutdownSignal;
use crate::worker::job::WorkerJob;
use crate::worker::recurring::RecurringWorker;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info, instrument, warn};

/// Owns the workers registered for this process and runs each in its own task
pub struct WorkerHost {
    host_id: String,
    lease_store: Arc<dyn LeaseStore>,
    workers: Vec<Arc<RecurringWorker>>,
}

impl WorkerHost {
    /// Host whose leases live in `cache` under `app_name`
    pub fn new(cache: Cache, app_name: impl Into<String>, host_id: impl Into<String>) -> Self {
        Self::with_lease_store(
            Arc::new(CacheLeaseStore::new(cache, app_name)),
            host_id,
        )
    }

    pub fn with_lease_store(lease_store: Arc<dyn LeaseStore>, host_id: impl Into<String>) -> Self {
        Self {
            host_id: host_id.into(),
            lease_store,
            workers: Vec::new(),
        }
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    /// Add a worker; it starts when the host runs
    pub fn register(&mut self, config: WorkerConfig, job: Arc<dyn WorkerJob>) -> Arc<RecurringWorker> {
        let coordinator = Arc::new(LeaseCoordinator::for_worker(
            &config,
            self.host_id.clone(),
            Arc::clone(&self.lease_store),
        ));
        let worker = Arc::new(RecurringWorker::new(config, coordinator, job));
        self.workers.push(Arc::clone(&worker));
        worker
    }

    pub fn workers(&self) -> &[Arc<RecurringWorker>] {
        &self.workers
    }

    /// Run every worker until `shutdown` fires or all of them have finished.
    ///
    /// On shutdown each worker is stopped, its task awaited and its lease
    /// released. A worker task that panics is logged and does not affect
    /// the others.
    #[instrument(skip(self, shutdown), fields(host_id = %self.host_id, workers = self.workers.len()))]
    pub async fn run_until(&self, mut shutdown: ShutdownSignal) {
        let mut tasks = JoinSet::new();
        for worker in &self.workers {
            let worker = Arc::clone(worker);
            tasks.spawn(async move {
                worker.run().await;
                worker.name().to_string()
            });
        }
        info!("Worker host started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown signal received, stopping workers");
                    break;
                }
                joined = tasks.join_next() => match joined {
                    Some(Ok(name)) => info!(worker_name = %name, "Worker finished"),
                    Some(Err(e)) => error!(error = %e, "Worker task failed"),
                    None => {
                        info!("All workers finished");
                        break;
                    }
                },
            }
        }

        self.shutdown().await;

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Worker task failed during shutdown");
            }
        }
        info!("Worker host stopped");
    }

    /// Stop every worker and release the leases this host holds
    pub async fn shutdown(&self) {
        for worker in &self.workers {
            worker.stop().await;
        }
    }
}
