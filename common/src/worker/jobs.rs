// Built-in job bodies

use crate::cache::{Cache, Expiration};
use crate::worker::job::{JobContext, WorkerJob};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};

const LAST_RESET_SUFFIX: &str = ".LastReset";

/// Cache key recording when a worker last reset the cache
pub fn last_reset_key(worker_name: &str) -> String {
    format!("{}{}", worker_name, LAST_RESET_SUFFIX)
}

/// Clears cache entries matching a pattern every `days_to_reset_cache` days.
///
/// Does nothing for workers without `days_to_reset_cache`. The time of the
/// last reset is kept in the cache, so any host may perform the next one.
#[derive(Clone)]
pub struct CacheResetJob {
    cache: Cache,
    app_name: String,
    key_pattern: String,
}

impl CacheResetJob {
    pub fn new(cache: Cache, app_name: impl Into<String>, key_pattern: impl Into<String>) -> Self {
        Self {
            cache,
            app_name: app_name.into(),
            key_pattern: key_pattern.into(),
        }
    }

    /// Reset if due at `now`; returns the number of removed entries
    pub async fn reset_if_due(
        &self,
        worker_name: &str,
        days: u32,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<usize>> {
        let marker = last_reset_key(worker_name);
        let last: Option<DateTime<Utc>> = self.cache.get(&self.app_name, &marker).await?;

        if let Some(last) = last {
            let next_due = last + chrono::Duration::days(i64::from(days));
            if now < next_due {
                debug!(last_reset = %last, next_due = %next_due, "Cache reset not due yet");
                return Ok(None);
            }
        }

        let removed = self
            .cache
            .remove_all(&self.app_name, &self.key_pattern)
            .await?;
        self.cache
            .set(&self.app_name, &marker, &now, Expiration::Never)
            .await?;

        info!(removed, key_pattern = %self.key_pattern, "Cache reset completed");
        Ok(Some(removed))
    }
}

#[async_trait]
impl WorkerJob for CacheResetJob {
    #[instrument(skip(self, ctx), fields(worker_name = %ctx.worker_name))]
    async fn execute(&self, ctx: JobContext) -> anyhow::Result<()> {
        let Some(days) = ctx.config.days_to_reset_cache else {
            debug!("days_to_reset_cache not set; nothing to do");
            return Ok(());
        };

        self.reset_if_due(&ctx.worker_name, days, Utc::now()).await?;
        Ok(())
    }
}
