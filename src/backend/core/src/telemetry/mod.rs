//! Telemetry: logging and metrics.
//!
//! - **Logging**: Structured JSON/pretty logging through `tracing-subscriber`
//! - **Metrics**: Prometheus exporter for the queue counters and gauges
//!
//! # Example
//!
//! ```rust,no_run
//! use floodgate_core::telemetry::{TelemetryConfig, init_telemetry};
//!
//! let config = TelemetryConfig::default();
//! init_telemetry(&config).expect("Failed to initialize telemetry");
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFormat, LoggingConfig, SpanEventConfig};
pub use metrics::{init_metrics, MetricsConfig, MetricsRegistry};

use serde::Deserialize;

/// Unified telemetry configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    /// Service name attached to metrics
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Environment (development, staging, production)
    #[serde(default = "default_environment")]
    pub environment: String,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            environment: default_environment(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

fn default_service_name() -> String {
    "floodgate".to_string()
}

fn default_environment() -> String {
    std::env::var("FLOODGATE_ENVIRONMENT").unwrap_or_else(|_| "development".to_string())
}

/// Initialize logging and metrics. Call once at startup.
pub fn init_telemetry(config: &TelemetryConfig) -> anyhow::Result<TelemetryHandle> {
    init_logging(&config.logging, &config.environment)?;
    let metrics = init_metrics(&config.metrics, &config.service_name)?;
    Ok(TelemetryHandle { metrics })
}

/// Handle for the installed telemetry stack.
pub struct TelemetryHandle {
    pub metrics: MetricsRegistry,
}

impl TelemetryHandle {
    pub fn shutdown(self) {
        ::tracing::info!("Telemetry shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telemetry_config_defaults() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "floodgate");
        assert!(config.metrics.enabled);
    }
}
