// Telemetry module for structured logging, metrics, and tracing

use crate::config::LogFormat;
use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{RandomIdGenerator, Sampler, TracerProvider},
    Resource,
};
use std::net::SocketAddr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const SERVICE_NAME: &str = "recurring-worker-host";

/// Outcome label for `worker_cycles_total`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleLabel {
    Executed,
    Failed,
    SkippedInactive,
    SkippedMaintenance,
}

impl CycleLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleLabel::Executed => "executed",
            CycleLabel::Failed => "failed",
            CycleLabel::SkippedInactive => "skipped_inactive",
            CycleLabel::SkippedMaintenance => "skipped_maintenance",
        }
    }
}

/// Initialize structured logging
///
/// This function sets up the tracing subscriber with:
/// - JSON or human-readable formatting
/// - Log levels from `RUST_LOG`, falling back to configuration
/// - Optional OpenTelemetry export when an endpoint is configured
#[tracing::instrument(skip_all)]
pub fn init_logging(
    log_level: &str,
    format: LogFormat,
    tracing_endpoint: Option<&str>,
) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {}", e))?;

    let fmt_layer = match format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_filter(env_filter)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_target(false)
            .with_thread_ids(true)
            .with_filter(env_filter)
            .boxed(),
    };

    let registry = tracing_subscriber::registry().with(fmt_layer);

    if let Some(endpoint) = tracing_endpoint {
        let tracer = init_tracer(endpoint)?;
        let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        registry
            .with(telemetry_layer)
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    } else {
        registry
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    }

    tracing::info!(
        log_level = log_level,
        log_format = ?format,
        tracing_endpoint = tracing_endpoint,
        "Structured logging initialized"
    );

    Ok(())
}

/// Initialize OpenTelemetry tracer with OTLP exporter
#[tracing::instrument(skip_all)]
fn init_tracer(endpoint: &str) -> Result<opentelemetry_sdk::trace::Tracer> {
    use opentelemetry_sdk::runtime::Tokio;

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint)
        .build_span_exporter()
        .map_err(|e| anyhow::anyhow!("Failed to build span exporter: {}", e))?;

    let tracer_provider = TracerProvider::builder()
        .with_batch_exporter(exporter, Tokio)
        .with_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::AlwaysOn)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![
                    KeyValue::new("service.name", SERVICE_NAME),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                ])),
        )
        .build();

    global::set_tracer_provider(tracer_provider.clone());
    let tracer = tracer_provider.tracer(SERVICE_NAME);

    tracing::info!(
        endpoint = endpoint,
        "OpenTelemetry tracer initialized with OTLP exporter"
    );

    Ok(tracer)
}

/// Flush remaining spans on graceful shutdown
pub fn shutdown_tracer() {
    global::shutdown_tracer_provider();
}

/// Initialize Prometheus metrics exporter and describe the worker metrics
#[tracing::instrument(skip_all)]
pub fn init_metrics(metrics_port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", metrics_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid metrics port: {}", e))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    describe_counter!(
        "worker_cycles_total",
        "Worker cycles by outcome (executed, failed, skipped_inactive, skipped_maintenance)"
    );
    describe_histogram!(
        "worker_cycle_duration_seconds",
        "Duration of job body executions in seconds"
    );
    describe_gauge!(
        "worker_lease_active",
        "1 when this host holds the worker's lease, 0 otherwise"
    );
    describe_counter!(
        "worker_heartbeat_failures_total",
        "Heartbeats that could not read or write the lease"
    );

    tracing::info!(
        metrics_port = metrics_port,
        metrics_endpoint = format!("http://0.0.0.0:{}/metrics", metrics_port),
        "Prometheus metrics exporter initialized"
    );

    Ok(())
}

#[inline]
pub fn record_cycle(worker_name: &str, outcome: CycleLabel) {
    counter!(
        "worker_cycles_total",
        "worker" => worker_name.to_string(),
        "outcome" => outcome.as_str()
    )
    .increment(1);
}

#[inline]
pub fn record_cycle_duration(worker_name: &str, duration_seconds: f64) {
    histogram!("worker_cycle_duration_seconds", "worker" => worker_name.to_string())
        .record(duration_seconds);
}

#[inline]
pub fn set_lease_active(worker_name: &str, active: bool) {
    gauge!("worker_lease_active", "worker" => worker_name.to_string())
        .set(if active { 1.0 } else { 0.0 });
}

#[inline]
pub fn record_heartbeat_failure(worker_name: &str) {
    counter!("worker_heartbeat_failures_total", "worker" => worker_name.to_string()).increment(1);
}
