//! Structured logging.
//!
//! JSON in production, pretty output while developing. Worker job spans can
//! be logged on close so every job line carries its run time.

use serde::Deserialize;
use std::collections::HashMap;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Base filter directive, e.g. `info` or `warn,floodgate_core=debug`
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,

    /// Extra `module = level` overrides appended to `level`
    #[serde(default)]
    pub module_levels: HashMap<String, String>,

    /// Add file and line to each event
    #[serde(default)]
    pub include_location: bool,

    #[serde(default)]
    pub span_events: SpanEventConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            module_levels: HashMap::new(),
            include_location: false,
            span_events: SpanEventConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
    Compact,
}

/// Span lifecycle events to emit.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SpanEventConfig {
    #[serde(default)]
    pub on_new: bool,

    /// Emits `time.busy`/`time.idle` for each finished job span
    #[serde(default)]
    pub on_close: bool,
}

impl SpanEventConfig {
    fn fmt_span(&self) -> FmtSpan {
        match (self.on_new, self.on_close) {
            (true, true) => FmtSpan::NEW | FmtSpan::CLOSE,
            (true, false) => FmtSpan::NEW,
            (false, true) => FmtSpan::CLOSE,
            (false, false) => FmtSpan::NONE,
        }
    }
}

fn default_log_level() -> String {
    std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string())
}

/// Combine the base level with the per-module overrides.
pub fn build_filter(config: &LoggingConfig) -> anyhow::Result<EnvFilter> {
    config
        .module_levels
        .iter()
        .try_fold(EnvFilter::try_new(&config.level)?, |filter, (module, level)| {
            Ok(filter.add_directive(format!("{}={}", module, level).parse()?))
        })
}

/// Install the global subscriber.
///
/// JSON output is swapped for pretty output in the `development`
/// environment. Fails on a bad filter or when a subscriber already exists.
pub fn init_logging(config: &LoggingConfig, environment: &str) -> anyhow::Result<()> {
    let filter = build_filter(config)?;
    let format = match (&config.format, environment) {
        (LogFormat::Json, "development") => LogFormat::Pretty,
        (format, _) => format.clone(),
    };

    let layer = fmt::layer()
        .with_span_events(config.span_events.fmt_span())
        .with_file(config.include_location)
        .with_line_number(config.include_location);
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry.with(layer.json()).try_init()?,
        LogFormat::Pretty => registry.with(layer.pretty()).try_init()?,
        LogFormat::Compact => registry.with(layer.compact()).try_init()?,
    }

    Ok(())
}
