//! Rate-limited job queue.
//!
//! This module provides the admission-control core of the queue:
//!
//! - **Limiter**: Fixed-window rate limits, global or per payload group
//! - **Store**: Waiting / active / delayed / completed / failed containers
//! - **Dispatcher**: The atomic fetch-next-job transaction
//! - **Promoter**: Returns delayed jobs to waiting once their window resets
//! - **Worker**: Concurrent job execution with graceful shutdown
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐ add  ┌──────────────────────────────────────────────┐
//! │ Producer │─────▶│                  Job Store                    │
//! └──────────┘      │  waiting ─▶ active ─▶ completed / failed      │
//!                   │     ▲  │                                      │
//!                   │     │  └──▶ delayed (throttled, by reset time)│
//!                   └─────┼──────────┬───────────────────────────────┘
//!                         │          │ promote_due
//!            fetch_next   │   ┌──────┴──────┐
//!  ┌────────┐  ┌──────────┴─┐ │  Delayed    │
//!  │ Worker │─▶│ Dispatcher │ │  Promoter   │
//!  └────────┘  │ + Limiter  │ └─────────────┘
//!              └────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use floodgate_core::jobs::{JobQueue, QueueConfig, RateLimitSettings};
//!
//! let limit = RateLimitSettings {
//!     max: Some(10),
//!     duration: Some(1_000),
//!     group_key: Some("tenant".into()),
//!     bounce_back: false,
//! };
//! let queue = Arc::new(JobQueue::new(QueueConfig::named("emails"), Some(limit))?);
//! let promoter = queue.promoter(PromoterConfig::default()).start();
//!
//! queue.add(json!({ "tenant": "acme", "to": "ops@acme.test" })).await?;
//! let worker = JobWorker::new(WorkerConfig::default(), Arc::new(MyHandler)).start(queue.clone());
//! ```

pub mod dispatcher;
pub mod events;
pub mod job;
pub mod limiter;
pub mod promoter;
pub mod queue;
pub mod redis_store;
pub mod store;
pub mod worker;

pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use events::{EventBus, QueueEvent};
pub use job::{Job, JobCounts, JobId, JobState};
pub use limiter::{
    rate_limit_key, InMemoryWindowStore, RateLimit, RateLimitBuilder, RateLimitSettings,
    RateLimitVerdict, RateLimiter, RedisWindowStore, WindowCount, WindowCounterStore,
};
pub use promoter::{DelayedPromoter, PromoterConfig, PromoterHandle};
pub use queue::{JobQueue, JobQueueBuilder, QueueConfig};
pub use redis_store::{QueueKeys, RedisJobStore};
pub use store::{Admission, InMemoryJobStore, JobStore, ThrottleRoute};
pub use worker::{JobHandler, JobWorker, WorkerConfig, WorkerHandle, WorkerStats};
