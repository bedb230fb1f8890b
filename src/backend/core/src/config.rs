//! Configuration management.
//!
//! Values are layered: an optional file, then `FLOODGATE__*` environment
//! variables (`FLOODGATE__LIMITER__MAX=10`, `FLOODGATE__QUEUE__NAME=emails`).

use serde::Deserialize;

use crate::error::Result;
use crate::jobs::{PromoterConfig, QueueConfig, RateLimitSettings, WorkerConfig};
use crate::telemetry::TelemetryConfig;

const ENV_PREFIX: &str = "FLOODGATE";
const ENV_SEPARATOR: &str = "__";

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Redis connection
    #[serde(default)]
    pub redis: RedisConfig,

    /// Queue identity and admission retry policy
    #[serde(default)]
    pub queue: QueueConfig,

    /// Rate limit; absent means every job is admitted
    #[serde(default)]
    pub limiter: Option<RateLimitSettings>,

    /// Delayed promoter
    #[serde(default)]
    pub promoter: PromoterConfig,

    /// Worker pool
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Logging and metrics
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Keep jobs in process memory instead of Redis
    #[serde(default)]
    pub in_memory: bool,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            in_memory: false,
        }
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(environment())
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with environment overrides.
    pub fn from_file(path: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(environment())
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject a limiter section that would fail at queue construction.
    pub fn validate(&self) -> Result<()> {
        if let Some(settings) = &self.limiter {
            crate::jobs::RateLimit::from_settings(settings)?;
        }
        Ok(())
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .separator(ENV_SEPARATOR)
        .try_parsing(true)
}
