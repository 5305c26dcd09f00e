// Configuration management with layered configuration (file, env)

use crate::errors::ConfigurationError;
use chrono::NaiveTime;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub cache: CacheSettings,
    #[serde(default)]
    pub host: HostSettings,
    #[serde(default)]
    pub workers: Vec<WorkerConfig>,
    #[serde(default)]
    pub cache_reset: CacheResetSettings,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Namespace prefixed to every key this process reads or writes
    pub app_name: String,
    #[serde(default)]
    pub backend: CacheBackendKind,
    #[serde(default)]
    pub redis_url: String,
    #[serde(default = "default_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,
}

fn default_sweep_interval_seconds() -> u64 {
    60
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    #[default]
    Local,
    Redis,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostSettings {
    /// Overrides the identity derived from the machine hostname
    pub host_id: Option<String>,
}

/// Entries removed by the built-in cache reset job.
///
/// The pattern must name something narrower than the whole namespace, since
/// worker leases live there too.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheResetSettings {
    pub key_pattern: String,
}

impl Default for CacheResetSettings {
    fn default() -> Self {
        Self {
            key_pattern: "Data:".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
    pub metrics_port: Option<u16>,
    pub tracing_endpoint: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Configuration of one named recurring worker.
///
/// Loaded once at startup and shared read-only afterwards. The interval
/// settings are resolved in a fixed order: daily start time, then
/// milliseconds, then seconds; when none is set the worker runs once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub worker_name: String,
    #[serde(default)]
    pub is_enabled: bool,
    pub start_delay_seconds: Option<u64>,
    pub interval_period_seconds: Option<u64>,
    pub interval_period_milliseconds: Option<u64>,
    pub daily_start_time_utc: Option<NaiveTime>,
    #[serde(default = "default_heart_beat_minutes")]
    pub heart_beat_minutes: u32,
    pub maintenance_start_time_utc: Option<NaiveTime>,
    pub maintenance_end_time_utc: Option<NaiveTime>,
    /// Advisory; read by job bodies, never by the coordinator
    pub days_to_reset_cache: Option<u32>,
}

fn default_heart_beat_minutes() -> u32 {
    15
}

impl WorkerConfig {
    /// A disabled worker with every optional setting unset
    pub fn new(worker_name: impl Into<String>) -> Self {
        Self {
            worker_name: worker_name.into(),
            is_enabled: false,
            start_delay_seconds: None,
            interval_period_seconds: None,
            interval_period_milliseconds: None,
            daily_start_time_utc: None,
            heart_beat_minutes: default_heart_beat_minutes(),
            maintenance_start_time_utc: None,
            maintenance_end_time_utc: None,
            days_to_reset_cache: None,
        }
    }

    /// Period of the lease heartbeat
    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_secs(u64::from(self.heart_beat_minutes) * 60)
    }

    /// Age after which another host's lease is considered abandoned
    pub fn stale_lease_threshold(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.heart_beat_minutes) + 1)
    }

    /// Whether exactly one maintenance bound is configured
    pub fn has_partial_maintenance_window(&self) -> bool {
        self.maintenance_start_time_utc.is_some() != self.maintenance_end_time_utc.is_some()
    }
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigurationError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigurationError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Local overrides, not committed to git
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        let settings: Settings = config.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.cache.app_name.is_empty() {
            return Err(invalid("Cache app_name cannot be empty"));
        }
        if self.cache.app_name.contains(':') {
            return Err(invalid("Cache app_name cannot contain ':'"));
        }
        if self.cache.backend == CacheBackendKind::Redis && self.cache.redis_url.is_empty() {
            return Err(invalid("Redis URL cannot be empty when backend is 'redis'"));
        }

        if self
            .cache_reset
            .key_pattern
            .chars()
            .all(|c| c == '*' || c == '?')
        {
            return Err(invalid(
                "cache_reset key_pattern must contain at least one literal character",
            ));
        }

        let mut seen = HashSet::new();
        for worker in &self.workers {
            if worker.worker_name.is_empty() {
                return Err(invalid("Worker name cannot be empty"));
            }
            if !seen.insert(worker.worker_name.as_str()) {
                return Err(invalid(&format!(
                    "Duplicate worker name: {}",
                    worker.worker_name
                )));
            }
            if worker.heart_beat_minutes == 0 {
                return Err(invalid(&format!(
                    "Worker {} heart_beat_minutes must be greater than 0",
                    worker.worker_name
                )));
            }
            if worker.interval_period_milliseconds == Some(0)
                || worker.interval_period_seconds == Some(0)
            {
                return Err(invalid(&format!(
                    "Worker {} interval period must be greater than 0",
                    worker.worker_name
                )));
            }
        }

        Ok(())
    }

    /// Look up a worker's configuration by name
    pub fn worker(&self, worker_name: &str) -> Option<&WorkerConfig> {
        self.workers.iter().find(|w| w.worker_name == worker_name)
    }
}

fn invalid(message: &str) -> ConfigurationError {
    ConfigurationError::Invalid(message.to_string())
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cache: CacheSettings {
                app_name: "platform".to_string(),
                backend: CacheBackendKind::Local,
                redis_url: "redis://localhost:6379".to_string(),
                sweep_interval_seconds: default_sweep_interval_seconds(),
            },
            host: HostSettings::default(),
            workers: Vec::new(),
            cache_reset: CacheResetSettings::default(),
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                log_format: LogFormat::Json,
                metrics_port: None,
                tracing_endpoint: None,
            },
        }
    }
}
