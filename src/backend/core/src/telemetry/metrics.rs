//! Prometheus metrics for the job queue.
//!
//! Counters and gauges are emitted through the `metrics` facade wherever the
//! event happens; this module installs the exporter and describes them.
//!
//! | metric                                 | type      | labels                 |
//! |----------------------------------------|-----------|------------------------|
//! | `floodgate_jobs_enqueued_total`        | counter   |                        |
//! | `floodgate_jobs_admitted_total`        | counter   |                        |
//! | `floodgate_jobs_throttled_total`       | counter   | `route`                |
//! | `floodgate_jobs_promoted_total`        | counter   |                        |
//! | `floodgate_jobs_completed_total`       | counter   |                        |
//! | `floodgate_jobs_failed_total`          | counter   |                        |
//! | `floodgate_job_duration_seconds`       | histogram | `outcome`              |
//! | `floodgate_queue_depth`                | gauge     | `queue`, `state`       |
//! | `floodgate_rate_limit_checks_total`    | counter   | `admitted`             |
//! | `floodgate_admission_retries_total`    | counter   |                        |
//! | `floodgate_errors_total`               | counter   | `code`, `category`, .. |

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics collection is enabled
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    /// Address to serve `/metrics` on; render-only when unset
    #[serde(default)]
    pub listen_addr: Option<String>,

    /// Histogram buckets for job durations (in seconds)
    #[serde(default = "default_duration_buckets")]
    pub duration_buckets: Vec<f64>,

    /// Global labels to add to all metrics
    #[serde(default)]
    pub global_labels: HashMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen_addr: None,
            duration_buckets: default_duration_buckets(),
            global_labels: HashMap::new(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_duration_buckets() -> Vec<f64> {
    vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
}

/// Installed recorder.
pub struct MetricsRegistry {
    prometheus_handle: Option<PrometheusHandle>,
}

impl MetricsRegistry {
    /// Render all metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.prometheus_handle
            .as_ref()
            .map(|h| h.render())
            .unwrap_or_default()
    }

    /// Whether metrics can be rendered in-process.
    pub fn can_render(&self) -> bool {
        self.prometheus_handle.is_some()
    }
}

/// Initialize the metrics subsystem.
///
/// With `listen_addr` set the exporter also serves HTTP scrapes, which needs
/// a running Tokio runtime.
pub fn init_metrics(config: &MetricsConfig, service_name: &str) -> anyhow::Result<MetricsRegistry> {
    if !config.enabled {
        return Ok(MetricsRegistry {
            prometheus_handle: None,
        });
    }

    let mut builder = PrometheusBuilder::new()
        .add_global_label("service", service_name)
        .set_buckets(&config.duration_buckets)?;
    for (key, value) in &config.global_labels {
        builder = builder.add_global_label(key, value);
    }

    // The HTTP exporter owns its handle; render() is only available without it.
    let handle = match &config.listen_addr {
        Some(addr) => {
            let addr: SocketAddr = addr.parse()?;
            builder.with_http_listener(addr).install()?;
            None
        }
        None => Some(builder.install_recorder()?),
    };

    register_metric_descriptions();

    tracing::info!(
        service_name = %service_name,
        listen_addr = ?config.listen_addr,
        "Metrics initialized"
    );

    Ok(MetricsRegistry {
        prometheus_handle: handle,
    })
}

fn register_metric_descriptions() {
    describe_counter!("floodgate_jobs_enqueued_total", "Jobs added to a queue");
    describe_counter!("floodgate_jobs_admitted_total", "Jobs moved from waiting to active");
    describe_counter!(
        "floodgate_jobs_throttled_total",
        "Admission attempts rejected by the rate limiter"
    );
    describe_counter!(
        "floodgate_jobs_promoted_total",
        "Delayed jobs returned to waiting"
    );
    describe_counter!("floodgate_jobs_completed_total", "Jobs completed successfully");
    describe_counter!("floodgate_jobs_failed_total", "Jobs that failed");
    describe_histogram!(
        "floodgate_job_duration_seconds",
        "Handler execution time in seconds"
    );
    describe_gauge!("floodgate_queue_depth", "Jobs per container at last count");
    describe_counter!(
        "floodgate_rate_limit_checks_total",
        "Rate limit window checks by verdict"
    );
    describe_counter!(
        "floodgate_admission_retries_total",
        "Admission transactions retried after a conflict"
    );
    describe_counter!("floodgate_errors_total", "Errors by code and category");
}
