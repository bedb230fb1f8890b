//! Job worker for concurrent job execution.

use async_trait::async_trait;
use futures::FutureExt;
use metrics::histogram;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::Instrument;

use super::job::Job;
use super::queue::JobQueue;
use super::store::{Admission, ThrottleRoute};

/// User code run for each admitted job.
///
/// Returning `Err` fails the job with the error's display text as reason.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: &Job) -> anyhow::Result<()>;
}

/// Configuration for the job worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Maximum concurrent job executions
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Idle wait between fetches when the queue is empty (milliseconds)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Time allowed for in-flight jobs on shutdown (seconds)
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    /// Worker name/identifier
    #[serde(default = "default_worker_name")]
    pub name: String,
}

fn default_concurrency() -> usize {
    4
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

fn default_worker_name() -> String {
    "floodgate-worker".to_string()
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            name: default_worker_name(),
        }
    }
}

/// Statistics for the job worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    /// Total jobs processed
    pub processed: Arc<AtomicU64>,
    /// Total jobs succeeded
    pub succeeded: Arc<AtomicU64>,
    /// Total jobs failed
    pub failed: Arc<AtomicU64>,
    /// Currently running jobs
    pub active: Arc<AtomicU64>,
    /// Fetches that came back throttled
    pub throttled: Arc<AtomicU64>,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    pub fn throttled(&self) -> u64 {
        self.throttled.load(Ordering::Relaxed)
    }
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    stats: WorkerStats,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Signal the worker to shut down gracefully.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Shut down and wait for in-flight jobs to settle.
    pub async fn stop(self) {
        self.shutdown();
        let _ = self.task.await;
    }

    /// Get worker statistics.
    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }
}

/// Job worker that processes jobs from a queue.
pub struct JobWorker {
    config: WorkerConfig,
    handler: Arc<dyn JobHandler>,
    stats: WorkerStats,
}

impl JobWorker {
    /// Create a new job worker.
    pub fn new(config: WorkerConfig, handler: Arc<dyn JobHandler>) -> Self {
        Self {
            config,
            handler,
            stats: WorkerStats::new(),
        }
    }

    /// Start the worker, returning a handle for control.
    pub fn start(self, queue: Arc<JobQueue>) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = self.stats.clone();
        let task = tokio::spawn(self.run(queue, shutdown_rx));

        WorkerHandle {
            shutdown: shutdown_tx,
            stats,
            task,
        }
    }

    async fn run(self, queue: Arc<JobQueue>, mut shutdown_rx: watch::Receiver<bool>) {
        let config = self.config;
        let concurrency = config.concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let poll_interval = Duration::from_millis(config.poll_interval_ms.max(1));
        let wake = queue.wake_signal();

        tracing::info!(
            worker = %config.name,
            queue = %queue.name(),
            concurrency,
            "Job worker started"
        );

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            // Register before fetching so a wake-up between an empty fetch
            // and the wait is not lost.
            let notified = wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match queue.try_admit().await {
                Ok(Admission::Admitted(job)) => {
                    let handler = self.handler.clone();
                    let queue = queue.clone();
                    let stats = self.stats.clone();
                    let span = tracing::info_span!("job", job_id = %job.id, queue = %queue.name());
                    tokio::spawn(
                        async move {
                            let _permit = permit;
                            execute(handler, queue, stats, job).await;
                        }
                        .instrument(span),
                    );
                }
                Ok(Admission::Throttled { route, .. }) => {
                    drop(permit);
                    self.stats.throttled.fetch_add(1, Ordering::Relaxed);
                    if route == ThrottleRoute::Requeued {
                        // Bounced jobs sit at the waiting tail; poll again right away.
                        tokio::task::yield_now().await;
                    }
                }
                Ok(Admission::Empty) => {
                    drop(permit);
                    tokio::select! {
                        _ = notified.as_mut() => {}
                        _ = tokio::time::sleep(poll_interval) => {}
                        _ = shutdown_rx.changed() => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    e.log();
                    tokio::select! {
                        _ = tokio::time::sleep(poll_interval) => {}
                        _ = shutdown_rx.changed() => {}
                    }
                }
            }
        }

        tracing::info!(worker = %config.name, "Worker shutting down");

        let drain = semaphore.acquire_many(concurrency as u32);
        match tokio::time::timeout(Duration::from_secs(config.shutdown_timeout_secs), drain).await {
            Ok(_) => tracing::info!(worker = %config.name, "Worker stopped"),
            Err(_) => tracing::warn!(
                worker = %config.name,
                active = self.stats.active(),
                "Worker stopped with jobs still running"
            ),
        };
    }
}

async fn execute(handler: Arc<dyn JobHandler>, queue: Arc<JobQueue>, stats: WorkerStats, job: Job) {
    stats.active.fetch_add(1, Ordering::Relaxed);
    let started = Instant::now();
    let outcome = match AssertUnwindSafe(handler.handle(&job)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(anyhow::anyhow!("handler panicked: {}", panic_message(&*panic))),
    };
    stats.active.fetch_sub(1, Ordering::Relaxed);
    stats.processed.fetch_add(1, Ordering::Relaxed);

    histogram!(
        "floodgate_job_duration_seconds",
        "outcome" => if outcome.is_ok() { "completed" } else { "failed" }
    )
    .record(started.elapsed().as_secs_f64());

    let (settled, counter) = match outcome {
        Ok(()) => (queue.complete(job.id).await, &stats.succeeded),
        Err(e) => (queue.fail(job.id, &format!("{:#}", e)).await, &stats.failed),
    };

    match settled {
        Ok(_) => {
            counter.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => e.log(),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&'static str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::queue::QueueConfig;
    use serde_json::json;

    struct FailOdd;

    #[async_trait]
    impl JobHandler for FailOdd {
        async fn handle(&self, job: &Job) -> anyhow::Result<()> {
            if job.payload["n"].as_u64().unwrap_or(0) % 2 == 1 {
                anyhow::bail!("odd input");
            }
            Ok(())
        }
    }

    #[test]
    fn test_worker_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.poll_interval_ms, 500);
    }

    #[test]
    fn test_worker_stats() {
        let stats = WorkerStats::new();
        assert_eq!(stats.processed(), 0);
        assert_eq!(stats.succeeded(), 0);
        assert_eq!(stats.failed(), 0);
        assert_eq!(stats.active(), 0);

        stats.processed.fetch_add(1, Ordering::Relaxed);
        assert_eq!(stats.processed(), 1);
    }

    #[tokio::test]
    async fn test_worker_settles_every_job() {
        let queue = Arc::new(JobQueue::new(QueueConfig::default(), None).unwrap());
        for n in 0..6 {
            queue.add(json!({ "n": n })).await.unwrap();
        }

        let config = WorkerConfig {
            concurrency: 2,
            poll_interval_ms: 20,
            ..Default::default()
        };
        let handle = JobWorker::new(config, Arc::new(FailOdd)).start(queue.clone());

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let counts = queue.counts().await.unwrap();
                if counts.completed + counts.failed == 6 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let stats = handle.stats().clone();
        handle.stop().await;
        assert_eq!(stats.succeeded(), 3);
        assert_eq!(stats.failed(), 3);

        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.failed, 3);
        assert_eq!(counts.total(), 6);
    }

    struct PanicOnTwo;

    #[async_trait]
    impl JobHandler for PanicOnTwo {
        async fn handle(&self, job: &Job) -> anyhow::Result<()> {
            if job.payload["n"] == 2 {
                panic!("handler bug");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_panicking_handler_fails_its_job() {
        let queue = Arc::new(JobQueue::new(QueueConfig::default(), None).unwrap());
        let mut jobs = Vec::new();
        for n in 0..4 {
            jobs.push(queue.add(json!({ "n": n })).await.unwrap());
        }

        let config = WorkerConfig {
            concurrency: 2,
            poll_interval_ms: 20,
            ..Default::default()
        };
        let handle = JobWorker::new(config, Arc::new(PanicOnTwo)).start(queue.clone());

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let counts = queue.counts().await.unwrap();
                if counts.completed + counts.failed == 4 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let stats = handle.stats().clone();
        handle.stop().await;

        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.active, 0);
        assert_eq!(counts.completed, 3);
        assert_eq!(counts.failed, 1);
        assert_eq!(stats.failed(), 1);
        assert_eq!(stats.active(), 0);

        let failed = queue.get(jobs[2].id).await.unwrap().unwrap();
        assert_eq!(failed.failed_reason.as_deref(), Some("handler panicked: handler bug"));
    }

    #[tokio::test]
    async fn test_idle_worker_wakes_on_add() {
        let queue = Arc::new(JobQueue::new(QueueConfig::default(), None).unwrap());
        let config = WorkerConfig {
            concurrency: 1,
            poll_interval_ms: 60_000,
            ..Default::default()
        };
        let handle = JobWorker::new(config, Arc::new(FailOdd)).start(queue.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.add(json!({ "n": 2 })).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while queue.counts().await.unwrap().completed < 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        handle.stop().await;
    }
}
