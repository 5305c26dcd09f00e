// Recurring worker execution loop

use crate::config::WorkerConfig;
use crate::lease::LeaseCoordinator;
use crate::schedule::{self, TriggerPolicy};
use crate::shutdown::{shutdown_channel, ShutdownSignal, ShutdownTrigger};
use crate::telemetry::{self, CycleLabel};
use crate::worker::job::{JobContext, WorkerJob};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

/// What happened during one cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The job body ran to completion
    Executed,
    /// The job body returned an error or panicked
    Failed,
    /// Another host holds the lease, or it could not be read
    SkippedInactive,
    SkippedMaintenance,
    /// A one-shot worker that already made its attempt
    AlreadyCompleted,
}

/// Snapshot of a worker's per-process state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRuntimeState {
    pub is_active: bool,
    pub host_id: String,
    pub one_shot_completed: bool,
}

/// One named worker: lease heartbeat, trigger policy, maintenance gate and job body.
///
/// `run` drives the loop until the worker is stopped; `stop` may be called
/// from any task, any number of times.
pub struct RecurringWorker {
    config: Arc<WorkerConfig>,
    policy: TriggerPolicy,
    coordinator: Arc<LeaseCoordinator>,
    job: Arc<dyn WorkerJob>,
    trigger: ShutdownTrigger,
    shutdown: ShutdownSignal,
    one_shot_completed: AtomicBool,
}

impl RecurringWorker {
    pub fn new(
        config: WorkerConfig,
        coordinator: Arc<LeaseCoordinator>,
        job: Arc<dyn WorkerJob>,
    ) -> Self {
        let policy = TriggerPolicy::from_config(&config);
        let (trigger, shutdown) = shutdown_channel();
        Self {
            config: Arc::new(config),
            policy,
            coordinator,
            job,
            trigger,
            shutdown,
            one_shot_completed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.worker_name
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn policy(&self) -> &TriggerPolicy {
        &self.policy
    }

    pub fn coordinator(&self) -> &Arc<LeaseCoordinator> {
        &self.coordinator
    }

    pub fn runtime_state(&self) -> WorkerRuntimeState {
        WorkerRuntimeState {
            is_active: self.coordinator.is_active(),
            host_id: self.coordinator.host_id().to_string(),
            one_shot_completed: self.one_shot_completed.load(Ordering::SeqCst),
        }
    }

    /// Whether a stop has been requested
    pub fn is_stopping(&self) -> bool {
        self.trigger.is_fired()
    }

    /// Run the worker until it is stopped, or until a one-shot worker has
    /// made its single attempt. Returns immediately when disabled.
    #[instrument(skip(self), fields(worker_name = %self.config.worker_name, host_id = %self.coordinator.host_id()))]
    pub async fn run(&self) {
        if !self.config.is_enabled {
            info!("Worker disabled; not starting");
            return;
        }
        if self.is_stopping() {
            debug!("Worker stopped before it started");
            return;
        }
        if self.config.has_partial_maintenance_window() {
            warn!("Only one maintenance bound is configured; maintenance window is ignored");
        }

        let heartbeat = self
            .coordinator
            .spawn_heartbeat(self.config.heartbeat_period(), self.shutdown.clone());

        let start_delay = self.policy.start_delay();
        info!(
            start_delay_ms = start_delay.as_millis() as u64,
            trigger = ?self.policy.kind(),
            "Worker started"
        );

        let mut shutdown = self.shutdown.clone();
        if self.wait(start_delay, &mut shutdown).await {
            loop {
                self.run_cycle().await;

                let Some(next) = self.policy.interval() else {
                    debug!("One-shot worker finished");
                    break;
                };
                if !self.wait(next, &mut shutdown).await {
                    break;
                }
            }
        }

        // Stop the heartbeat before releasing so it cannot re-claim afterwards
        self.trigger.fire();
        if let Err(e) = heartbeat.await {
            error!(error = %e, "Lease heartbeat task failed");
        }
        self.coordinator.release().await;
        info!("Worker stopped");
    }

    /// Sleep for `delay`; false when the wait was cut short by a stop
    async fn wait(&self, delay: Duration, shutdown: &mut ShutdownSignal) -> bool {
        tokio::select! {
            _ = sleep(delay) => true,
            _ = shutdown.cancelled() => {
                warn!(
                    worker_name = %self.config.worker_name,
                    remaining_wait_ms = delay.as_millis() as u64,
                    "Worker wait cancelled"
                );
                false
            }
        }
    }

    /// One pass of the loop body: ownership check, maintenance gate, job.
    ///
    /// Ownership is read fresh from the cache rather than taken from the
    /// last heartbeat. Job failures and panics are logged and reported as
    /// `Failed`; they never escape.
    #[instrument(skip(self), fields(worker_name = %self.config.worker_name))]
    pub async fn run_cycle(&self) -> CycleOutcome {
        let name = self.config.worker_name.as_str();

        if self.policy.is_one_shot() && self.one_shot_completed.load(Ordering::SeqCst) {
            return CycleOutcome::AlreadyCompleted;
        }

        let ownership = self.coordinator.ownership().await;
        if !ownership.permits_execution() {
            debug!(?ownership, "Not the active host; skipping cycle");
            telemetry::record_cycle(name, CycleLabel::SkippedInactive);
            return CycleOutcome::SkippedInactive;
        }

        if schedule::in_maintenance(&self.config) {
            info!("Inside maintenance window; skipping cycle");
            telemetry::record_cycle(name, CycleLabel::SkippedMaintenance);
            return CycleOutcome::SkippedMaintenance;
        }

        if self.policy.is_one_shot()
            && self
                .one_shot_completed
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
        {
            return CycleOutcome::AlreadyCompleted;
        }

        let ctx = JobContext {
            worker_name: name.to_string(),
            host_id: self.coordinator.host_id().to_string(),
            config: Arc::clone(&self.config),
            shutdown: self.shutdown.clone(),
        };

        let started = Instant::now();
        let result = AssertUnwindSafe(self.job.execute(ctx)).catch_unwind().await;
        let elapsed = started.elapsed();
        telemetry::record_cycle_duration(name, elapsed.as_secs_f64());

        let outcome = match result {
            Ok(Ok(())) => {
                debug!(duration_ms = elapsed.as_millis() as u64, "Job completed");
                CycleOutcome::Executed
            }
            Ok(Err(e)) => {
                error!(error = ?e, duration_ms = elapsed.as_millis() as u64, "Job failed");
                CycleOutcome::Failed
            }
            Err(panic) => {
                error!(panic = %panic_message(&panic), "Job panicked");
                CycleOutcome::Failed
            }
        };

        let label = if outcome == CycleOutcome::Executed {
            CycleLabel::Executed
        } else {
            CycleLabel::Failed
        };
        telemetry::record_cycle(name, label);
        outcome
    }

    /// Request the worker to stop and give up its lease.
    ///
    /// Safe to call repeatedly; only the first call has any effect on the
    /// lease.
    #[instrument(skip(self), fields(worker_name = %self.config.worker_name))]
    pub async fn stop(&self) {
        if self.trigger.fire() {
            info!("Stop requested");
        }
        self.coordinator.release().await;
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use crate::lease::{lease_key, CacheLeaseStore, Lease, LeaseStore};
    use async_trait::async_trait;
    use chrono::{NaiveTime, Utc};
    use std::sync::atomic::AtomicUsize;

    const APP: &str = "App";

    struct Exploding;

    #[async_trait]
    impl WorkerJob for Exploding {
        async fn execute(&self, _ctx: JobContext) -> anyhow::Result<()> {
            panic!("job exploded")
        }
    }

    fn counting_job(counter: Arc<AtomicUsize>) -> Arc<dyn WorkerJob> {
        Arc::new(move |_ctx: JobContext| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), anyhow::Error>(())
            }
        })
    }

    fn worker(
        cache: &Cache,
        host: &str,
        config: WorkerConfig,
        job: Arc<dyn WorkerJob>,
    ) -> Arc<RecurringWorker> {
        let store = Arc::new(CacheLeaseStore::new(cache.clone(), APP));
        let coordinator = Arc::new(LeaseCoordinator::for_worker(&config, host, store));
        Arc::new(RecurringWorker::new(config, coordinator, job))
    }

    fn enabled(name: &str) -> WorkerConfig {
        let mut config = WorkerConfig::new(name);
        config.is_enabled = true;
        config
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_worker_exits_without_touching_lease() {
        let cache = Cache::local();
        let counter = Arc::new(AtomicUsize::new(0));
        let w = worker(&cache, "A", WorkerConfig::new("Sync"), counting_job(counter.clone()));

        w.run().await;

        assert_eq!(counter.load(Ordering::SeqCst), 0);
        let lease: Option<String> = cache.get(APP, &lease_key("Sync")).await.unwrap();
        assert!(lease.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_shot_runs_once_and_releases() {
        let cache = Cache::local();
        let counter = Arc::new(AtomicUsize::new(0));
        let w = worker(&cache, "A", enabled("Once"), counting_job(counter.clone()));

        w.run().await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(w.runtime_state().one_shot_completed);
        assert!(!w.runtime_state().is_active);
        let lease: Option<String> = cache.get(APP, &lease_key("Once")).await.unwrap();
        assert!(lease.is_none());
        assert_eq!(w.run_cycle().await, CycleOutcome::AlreadyCompleted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_worker_keeps_running_until_stopped() {
        let cache = Cache::local();
        let counter = Arc::new(AtomicUsize::new(0));
        let mut config = enabled("Poll");
        config.start_delay_seconds = Some(0);
        config.interval_period_milliseconds = Some(100);
        let w = worker(&cache, "A", config, counting_job(counter.clone()));

        let running = tokio::spawn({
            let w = Arc::clone(&w);
            async move { w.run().await }
        });

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(counter.load(Ordering::SeqCst) >= 3);
        assert!(w.runtime_state().is_active);

        w.stop().await;
        running.await.unwrap();

        let lease: Option<String> = cache.get(APP, &lease_key("Poll")).await.unwrap();
        assert!(lease.is_none());
        w.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_start_delay_skips_job() {
        let cache = Cache::local();
        let counter = Arc::new(AtomicUsize::new(0));
        let mut config = enabled("Slow");
        config.start_delay_seconds = Some(3600);
        let w = worker(&cache, "A", config, counting_job(counter.clone()));

        let running = tokio::spawn({
            let w = Arc::clone(&w);
            async move { w.run().await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        w.stop().await;
        running.await.unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(w.is_stopping());
    }

    #[tokio::test]
    async fn test_cycle_skipped_when_another_host_holds_lease() {
        let cache = Cache::local();
        let store = CacheLeaseStore::new(cache.clone(), APP);
        store
            .store("Sync", &Lease::new("B", Utc::now()))
            .await
            .unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        let w = worker(&cache, "A", enabled("Sync"), counting_job(counter.clone()));

        assert_eq!(w.run_cycle().await, CycleOutcome::SkippedInactive);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cycle_runs_when_lease_vacant_or_owned() {
        let cache = Cache::local();
        let counter = Arc::new(AtomicUsize::new(0));
        let mut config = enabled("Sync");
        config.interval_period_seconds = Some(60);
        let w = worker(&cache, "A", config, counting_job(counter.clone()));

        assert_eq!(w.run_cycle().await, CycleOutcome::Executed);
        w.coordinator().heartbeat().await;
        assert_eq!(w.run_cycle().await, CycleOutcome::Executed);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cycle_skipped_inside_maintenance_window() {
        let cache = Cache::local();
        let counter = Arc::new(AtomicUsize::new(0));
        let mut config = enabled("Sync");
        config.interval_period_seconds = Some(60);
        config.maintenance_start_time_utc = NaiveTime::from_hms_opt(0, 0, 0);
        config.maintenance_end_time_utc = NaiveTime::from_hms_nano_opt(23, 59, 59, 999_999_999);
        let w = worker(&cache, "A", config, counting_job(counter.clone()));

        assert_eq!(w.run_cycle().await, CycleOutcome::SkippedMaintenance);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_partial_maintenance_window_is_ignored() {
        let cache = Cache::local();
        let counter = Arc::new(AtomicUsize::new(0));
        let mut config = enabled("Sync");
        config.interval_period_seconds = Some(60);
        config.maintenance_start_time_utc = NaiveTime::from_hms_opt(0, 0, 0);
        let w = worker(&cache, "A", config, counting_job(counter.clone()));

        assert_eq!(w.run_cycle().await, CycleOutcome::Executed);
    }

    #[tokio::test]
    async fn test_job_error_and_panic_are_contained() {
        let cache = Cache::local();
        let mut config = enabled("Flaky");
        config.interval_period_seconds = Some(60);

        let failing: Arc<dyn WorkerJob> =
            Arc::new(|_ctx: JobContext| async move { Err::<(), _>(anyhow::anyhow!("boom")) });
        let w = worker(&cache, "A", config.clone(), failing);
        assert_eq!(w.run_cycle().await, CycleOutcome::Failed);
        assert_eq!(w.run_cycle().await, CycleOutcome::Failed);

        let w = worker(&cache, "B", config, Arc::new(Exploding));
        assert_eq!(w.run_cycle().await, CycleOutcome::Failed);
    }

    #[tokio::test]
    async fn test_failed_one_shot_is_not_retried() {
        let cache = Cache::local();
        let attempts = Arc::new(AtomicUsize::new(0));
        let job: Arc<dyn WorkerJob> = {
            let attempts = Arc::clone(&attempts);
            Arc::new(move |_ctx: JobContext| {
                let attempts = Arc::clone(&attempts);
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(anyhow::anyhow!("no luck"))
                }
            })
        };
        let w = worker(&cache, "A", enabled("Once"), job);

        assert_eq!(w.run_cycle().await, CycleOutcome::Failed);
        assert_eq!(w.run_cycle().await, CycleOutcome::AlreadyCompleted);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_job_sees_context() {
        let cache = Cache::local();
        let mut config = enabled("Ctx");
        config.interval_period_seconds = Some(60);
        config.days_to_reset_cache = Some(7);

        let job: Arc<dyn WorkerJob> = Arc::new(|ctx: JobContext| async move {
            anyhow::ensure!(ctx.worker_name == "Ctx");
            anyhow::ensure!(ctx.host_id == "host-a");
            anyhow::ensure!(ctx.config.days_to_reset_cache == Some(7));
            anyhow::ensure!(!ctx.is_shutting_down());
            Ok(())
        });
        let w = worker(&cache, "host-a", config, job);
        assert_eq!(w.run_cycle().await, CycleOutcome::Executed);
    }

    #[tokio::test]
    async fn test_stop_without_lease_is_noop() {
        let cache = Cache::local();
        let store = CacheLeaseStore::new(cache.clone(), APP);
        store
            .store("Sync", &Lease::new("B", Utc::now()))
            .await
            .unwrap();
        let w = worker(&cache, "A", enabled("Sync"), counting_job(Arc::default()));

        w.stop().await;
        w.stop().await;

        assert_eq!(store.load("Sync").await.unwrap().unwrap().owner, "B");
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(&payload), "static");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(&payload), "owned");
        let payload: Box<dyn Any + Send> = Box::new(7u32);
        assert_eq!(panic_message(&payload), "non-string panic payload");
    }
}
