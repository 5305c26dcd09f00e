// Job bodies run by recurring workers

use crate::config::WorkerConfig;
use crate::shutdown::ShutdownSignal;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

/// What a job body gets to see about the cycle it runs in
#[derive(Debug, Clone)]
pub struct JobContext {
    pub worker_name: String,
    pub host_id: String,
    pub config: Arc<WorkerConfig>,
    /// Fires when the worker is stopping; long-running bodies should watch it
    pub shutdown: ShutdownSignal,
}

impl JobContext {
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_shutdown()
    }
}

/// The work a recurring worker performs on each cycle.
///
/// Bodies may run twice concurrently across hosts on rare occasions and
/// must tolerate it.
#[async_trait]
pub trait WorkerJob: Send + Sync {
    async fn execute(&self, ctx: JobContext) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> WorkerJob for F
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn execute(&self, ctx: JobContext) -> anyhow::Result<()> {
        (self)(ctx).await
    }
}
