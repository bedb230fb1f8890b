#![allow(clippy::result_large_err)]
//! # Floodgate Core
//!
//! Rate-limited admission for a shared, persistent job queue.
//!
//! ## Architecture
//!
//! - **Rate Limiter**: Fixed-window counters, global or partitioned by a payload field
//! - **Job Store**: Waiting, active, delayed, completed and failed containers with atomic moves
//! - **Dispatcher**: The fetch-next-job transaction workers call concurrently
//! - **Delayed Promoter**: Returns throttled jobs to waiting when their window resets
//! - **Telemetry**: Structured logging and Prometheus metrics

pub mod config;
pub mod error;
pub mod jobs;
pub mod telemetry;

pub use error::{ErrorCode, ErrorDetails, ErrorSeverity, FloodgateError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::{ErrorCode, FloodgateError, Result};
    pub use crate::jobs::{
        Admission, DelayedPromoter, Job, JobCounts, JobHandler, JobId, JobQueue, JobState,
        JobStore, JobWorker, PromoterConfig, QueueConfig, QueueEvent, RateLimit,
        RateLimitSettings, RateLimiter, ThrottleRoute, WorkerConfig,
    };
}
