//! Rate-limited job queue.

use chrono::Utc;
use metrics::gauge;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, Notify};
use tracing::info;

use super::dispatcher::{Dispatcher, DispatcherConfig};
use super::events::{EventBus, QueueEvent};
use super::job::{Job, JobCounts, JobId, JobState};
use super::limiter::{
    InMemoryWindowStore, RateLimitSettings, RateLimiter, RedisWindowStore, WindowCounterStore,
};
use super::promoter::{DelayedPromoter, PromoterConfig};
use super::redis_store::RedisJobStore;
use super::store::{Admission, InMemoryJobStore, JobStore};
use crate::error::Result;

/// Configuration for a job queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Queue name, part of every storage key
    #[serde(default = "default_name")]
    pub name: String,

    /// Key namespace shared by all queues
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Buffered events per subscriber before it starts lagging
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Admission retry policy
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
}

fn default_name() -> String {
    "default".to_string()
}

fn default_prefix() -> String {
    "floodgate".to_string()
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            prefix: default_prefix(),
            event_capacity: default_event_capacity(),
            dispatcher: DispatcherConfig::default(),
        }
    }
}

impl QueueConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// `{prefix}:{name}:limiter`
    pub fn limiter_prefix(&self) -> String {
        format!("{}:{}:limiter", self.prefix, self.name)
    }
}

/// Builder wiring a queue to its storage.
pub struct JobQueueBuilder {
    config: QueueConfig,
    store: Option<Arc<dyn JobStore>>,
    window_store: Option<Arc<dyn WindowCounterStore>>,
    rate_limit: Option<RateLimitSettings>,
}

impl JobQueueBuilder {
    /// Use a custom job store.
    pub fn store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use a custom window counter store for the limiter.
    pub fn window_store(mut self, store: Arc<dyn WindowCounterStore>) -> Self {
        self.window_store = Some(store);
        self
    }

    /// Keep jobs and window counters in Redis.
    pub fn redis(self, client: redis::Client) -> Self {
        let store = RedisJobStore::new(client.clone(), &self.config.prefix, &self.config.name);
        self.store(Arc::new(store))
            .window_store(Arc::new(RedisWindowStore::new(client)))
    }

    /// Gate admission with a rate limit.
    pub fn rate_limit(mut self, settings: RateLimitSettings) -> Self {
        self.rate_limit = Some(settings);
        self
    }

    /// Validate the configuration and build the queue.
    pub fn build(self) -> Result<JobQueue> {
        let limiter = match &self.rate_limit {
            Some(settings) => {
                let window_store = self
                    .window_store
                    .unwrap_or_else(|| Arc::new(InMemoryWindowStore::new()));
                Some(RateLimiter::new(
                    settings,
                    self.config.limiter_prefix(),
                    window_store,
                )?)
            }
            None => None,
        };
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryJobStore::new()));

        let events = EventBus::new(self.config.event_capacity);
        let dispatcher = Dispatcher::new(
            store.clone(),
            limiter,
            events.clone(),
            self.config.dispatcher.clone(),
        );

        info!(
            queue = %self.config.name,
            rate_limited = dispatcher.limiter().is_some(),
            "Job queue created"
        );

        Ok(JobQueue {
            config: self.config,
            store,
            dispatcher,
            events,
            wake: Arc::new(Notify::new()),
        })
    }
}

/// A named queue: producers add jobs, workers fetch and settle them.
pub struct JobQueue {
    config: QueueConfig,
    store: Arc<dyn JobStore>,
    dispatcher: Dispatcher,
    events: EventBus,
    wake: Arc<Notify>,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("config", &self.config)
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

impl JobQueue {
    pub fn builder(config: QueueConfig) -> JobQueueBuilder {
        JobQueueBuilder {
            config,
            store: None,
            window_store: None,
            rate_limit: None,
        }
    }

    /// Create an in-memory queue, optionally rate limited.
    ///
    /// Fails on incomplete limiter settings before any job is accepted.
    pub fn new(config: QueueConfig, rate_limit: Option<RateLimitSettings>) -> Result<Self> {
        let builder = Self::builder(config);
        match rate_limit {
            Some(settings) => builder.rate_limit(settings).build(),
            None => builder.build(),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn limiter(&self) -> Option<&RateLimiter> {
        self.dispatcher.limiter()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Signal fired when new work may be available.
    pub fn wake_signal(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Enqueue a payload.
    pub async fn add(&self, payload: serde_json::Value) -> Result<Job> {
        let job = self.store.enqueue(payload, Utc::now()).await?;
        self.events.publish(QueueEvent::Enqueued {
            job_id: job.id,
            timestamp: job.enqueued_at,
        });
        self.wake.notify_one();
        Ok(job)
    }

    pub async fn try_admit(&self) -> Result<Admission> {
        self.dispatcher.try_admit().await
    }

    pub async fn fetch_next(&self) -> Result<Option<Job>> {
        self.dispatcher.fetch_next().await
    }

    /// Mark an active job completed.
    pub async fn complete(&self, id: JobId) -> Result<Job> {
        let job = self.store.complete(id, Utc::now()).await?;
        self.events.publish(QueueEvent::Completed {
            job_id: id,
            timestamp: job.finished_at.unwrap_or_else(Utc::now),
        });
        Ok(job)
    }

    /// Mark an active job failed.
    pub async fn fail(&self, id: JobId, reason: &str) -> Result<Job> {
        let job = self.store.fail(id, reason, Utc::now()).await?;
        self.events.publish(QueueEvent::Failed {
            job_id: id,
            reason: reason.to_string(),
            timestamp: job.finished_at.unwrap_or_else(Utc::now),
        });
        Ok(job)
    }

    pub async fn get(&self, id: JobId) -> Result<Option<Job>> {
        self.store.get(id).await
    }

    /// Point-in-time container sizes; also refreshes the depth gauges.
    pub async fn counts(&self) -> Result<JobCounts> {
        let counts = self.store.counts().await?;
        for state in [
            JobState::Waiting,
            JobState::Active,
            JobState::Delayed,
            JobState::Completed,
            JobState::Failed,
        ] {
            gauge!(
                "floodgate_queue_depth",
                "queue" => self.config.name.clone(),
                "state" => state.as_str()
            )
            .set(counts.get(state) as f64);
        }
        Ok(counts)
    }

    /// Build a promoter bound to this queue's store and wake signal.
    pub fn promoter(&self, config: PromoterConfig) -> DelayedPromoter {
        DelayedPromoter::new(
            self.store.clone(),
            self.events.clone(),
            self.wake.clone(),
            config,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use serde_json::json;

    fn limit(max: Option<u64>, duration: Option<u64>) -> RateLimitSettings {
        RateLimitSettings {
            max,
            duration,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_in_memory_queue_lifecycle() {
        let queue = JobQueue::new(QueueConfig::named("emails"), None).unwrap();
        let mut events = queue.subscribe();

        let job = queue.add(json!({"to": "a@example.com"})).await.unwrap();
        let fetched = queue.fetch_next().await.unwrap().unwrap();
        assert_eq!(fetched.id, job.id);
        assert_eq!(fetched.state, JobState::Active);

        queue.complete(job.id).await.unwrap();
        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.total(), 1);

        assert!(matches!(events.recv().await.unwrap(), QueueEvent::Enqueued { .. }));
        assert!(matches!(events.recv().await.unwrap(), QueueEvent::Admitted { .. }));
        assert!(matches!(events.recv().await.unwrap(), QueueEvent::Completed { .. }));
    }

    #[test]
    fn test_new_rejects_incomplete_limiter() {
        let err = JobQueue::new(QueueConfig::default(), Some(limit(Some(1), None))).unwrap_err();
        assert_eq!(err.code(), ErrorCode::MissingConfiguration);

        let err = JobQueue::new(QueueConfig::default(), Some(limit(None, Some(1000)))).unwrap_err();
        assert_eq!(err.code(), ErrorCode::MissingConfiguration);

        assert!(JobQueue::new(QueueConfig::default(), Some(limit(Some(1), Some(1000)))).is_ok());
    }

    #[test]
    fn test_limiter_prefix() {
        let queue =
            JobQueue::new(QueueConfig::named("emails"), Some(limit(Some(1), Some(1000)))).unwrap();
        assert_eq!(queue.limiter().unwrap().key_prefix(), "floodgate:emails:limiter");
    }

    #[tokio::test]
    async fn test_fail_records_reason() {
        let queue = JobQueue::new(QueueConfig::default(), None).unwrap();
        let job = queue.add(json!({})).await.unwrap();
        queue.fetch_next().await.unwrap();

        let failed = queue.fail(job.id, "smtp timeout").await.unwrap();
        assert_eq!(failed.state, JobState::Failed);
        assert_eq!(failed.failed_reason.as_deref(), Some("smtp timeout"));

        let stored = queue.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored, failed);
    }

    #[tokio::test]
    async fn test_complete_unknown_job() {
        let queue = JobQueue::new(QueueConfig::default(), None).unwrap();
        let err = queue.complete(JobId(42)).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::JobNotFound);
    }
}
