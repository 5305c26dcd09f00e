// Trigger policy and maintenance window calculation
//
// Pure functions of a worker's configuration and the current UTC time. The
// `*_at` variants take the time explicitly; the plain variants use `Utc::now()`.

use crate::config::WorkerConfig;
use chrono::{DateTime, NaiveTime, Utc};
use std::time::Duration;

/// Start delay used when nothing else is configured
pub const DEFAULT_START_DELAY_SECONDS: u64 = 5;

const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

/// How a worker is re-armed after each cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    /// Fires at the same UTC time of day, every day
    Daily(NaiveTime),
    /// Fires on a fixed period after each cycle
    Every(Duration),
    /// Fires exactly once
    Once,
}

/// Trigger settings resolved from a `WorkerConfig`.
///
/// Precedence: daily start time, then millisecond interval, then second
/// interval; with none of them the worker runs once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerPolicy {
    kind: TriggerKind,
    start_delay: Duration,
}

impl TriggerPolicy {
    pub fn from_config(config: &WorkerConfig) -> Self {
        let kind = if let Some(time) = config.daily_start_time_utc {
            TriggerKind::Daily(time)
        } else if let Some(ms) = config.interval_period_milliseconds {
            TriggerKind::Every(Duration::from_millis(ms))
        } else if let Some(seconds) = config.interval_period_seconds {
            TriggerKind::Every(Duration::from_secs(seconds))
        } else {
            TriggerKind::Once
        };

        Self {
            kind,
            start_delay: Duration::from_secs(
                config
                    .start_delay_seconds
                    .unwrap_or(DEFAULT_START_DELAY_SECONDS),
            ),
        }
    }

    pub fn kind(&self) -> TriggerKind {
        self.kind
    }

    pub fn is_one_shot(&self) -> bool {
        self.kind == TriggerKind::Once
    }

    /// Delay before the first cycle
    pub fn start_delay(&self) -> Duration {
        self.start_delay_at(Utc::now())
    }

    pub fn start_delay_at(&self, now: DateTime<Utc>) -> Duration {
        match self.kind {
            TriggerKind::Daily(time) => until_next_daily(time, now),
            TriggerKind::Every(_) | TriggerKind::Once => self.start_delay,
        }
    }

    /// Wait between cycles, or `None` for a worker that runs once
    pub fn interval(&self) -> Option<Duration> {
        self.interval_at(Utc::now())
    }

    pub fn interval_at(&self, now: DateTime<Utc>) -> Option<Duration> {
        match self.kind {
            TriggerKind::Daily(_) => Some(self.start_delay_at(now)),
            TriggerKind::Every(period) => Some(period),
            TriggerKind::Once => None,
        }
    }
}

/// Time from `now` until the next occurrence of `time` (UTC).
///
/// A time of day equal to the current time counts as already passed, so
/// the result is never zero.
pub fn until_next_daily(time: NaiveTime, now: DateTime<Utc>) -> Duration {
    let current = now.time();
    let mut delta = time.signed_duration_since(current);
    if current >= time {
        delta = delta + chrono::Duration::seconds(SECONDS_PER_DAY);
    }
    delta.to_std().unwrap_or(Duration::ZERO)
}

/// Whether `now` falls inside the inclusive `[start, end]` UTC window.
///
/// Returns false when either bound is unset. Windows spanning midnight
/// (`start > end`) never match.
pub fn is_in_maintenance_window(
    start: Option<NaiveTime>,
    end: Option<NaiveTime>,
    now: NaiveTime,
) -> bool {
    match (start, end) {
        (Some(start), Some(end)) => start <= now && now <= end,
        _ => false,
    }
}

/// Maintenance check for a worker at the current time
pub fn in_maintenance(config: &WorkerConfig) -> bool {
    in_maintenance_at(config, Utc::now())
}

pub fn in_maintenance_at(config: &WorkerConfig, now: DateTime<Utc>) -> bool {
    is_in_maintenance_window(
        config.maintenance_start_time_utc,
        config.maintenance_end_time_utc,
        now.time(),
    )
}
