//! Integration tests for rate-limited admission.
//!
//! Tests cover:
//! - Limiter configuration validation at queue construction
//! - Single-key admission bound under concurrent fetches
//! - Throttled job routing (bounce-back vs delayed)
//! - Job conservation across containers
//! - Delayed promotion liveness
//! - Worker busy-poll under bounce-back

use async_trait::async_trait;
use floodgate_core::error::ErrorCode;
use floodgate_core::jobs::{
    Admission, Job, JobHandler, JobQueue, JobState, JobWorker, PromoterConfig, QueueConfig,
    QueueEvent, RateLimitSettings, ThrottleRoute, WorkerConfig,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;

fn limit(max: u64, duration: u64, bounce_back: bool) -> RateLimitSettings {
    RateLimitSettings {
        max: Some(max),
        duration: Some(duration),
        group_key: None,
        bounce_back,
    }
}

async fn queue_with_jobs(settings: RateLimitSettings, jobs: usize) -> Arc<JobQueue> {
    let queue = Arc::new(JobQueue::new(QueueConfig::named("admission"), Some(settings)).unwrap());
    for n in 0..jobs {
        queue.add(json!({ "n": n })).await.unwrap();
    }
    queue
}

async fn concurrent_fetches(queue: &Arc<JobQueue>, fetches: usize) -> usize {
    let mut handles = Vec::new();
    for _ in 0..fetches {
        let queue = queue.clone();
        handles.push(tokio::spawn(async move { queue.fetch_next().await.unwrap() }));
    }
    futures::future::join_all(handles)
        .await
        .into_iter()
        .filter(|r| r.as_ref().unwrap().is_some())
        .count()
}

// ============================================================================
// Configuration Tests
// ============================================================================

#[test]
fn test_limiter_requires_max_and_duration() {
    let only_max = RateLimitSettings {
        max: Some(1),
        ..Default::default()
    };
    let err = JobQueue::new(QueueConfig::default(), Some(only_max)).unwrap_err();
    assert_eq!(err.code(), ErrorCode::MissingConfiguration);
    assert!(err.is_configuration());

    let only_duration = RateLimitSettings {
        duration: Some(1000),
        ..Default::default()
    };
    let err = JobQueue::new(QueueConfig::default(), Some(only_duration)).unwrap_err();
    assert_eq!(err.code(), ErrorCode::MissingConfiguration);

    assert_ok!(JobQueue::new(QueueConfig::default(), Some(limit(1, 1000, false))));
}

#[test]
fn test_unlimited_queue_has_no_limiter() {
    let queue = JobQueue::new(QueueConfig::default(), None).unwrap();
    assert!(queue.limiter().is_none());
}

// ============================================================================
// Single-Key Admission Bound
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_key_bound_with_delay() {
    let queue = queue_with_jobs(limit(1, 1000, false), 4).await;

    assert_eq!(concurrent_fetches(&queue, 4).await, 1);

    let counts = queue.counts().await.unwrap();
    assert_eq!(counts.active, 1);
    assert_eq!(counts.delayed, 3);
    assert_eq!(counts.waiting, 0);
    assert_eq!(counts.total(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_key_bound_with_bounce_back() {
    let queue = queue_with_jobs(limit(1, 1000, true), 4).await;

    assert_eq!(concurrent_fetches(&queue, 4).await, 1);

    let counts = queue.counts().await.unwrap();
    assert_eq!(counts.active, 1);
    assert_eq!(counts.waiting, 3);
    assert_eq!(counts.delayed, 0);
    assert_eq!(counts.total(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_double_admission_under_contention() {
    let queue = queue_with_jobs(limit(3, 60_000, false), 50).await;

    let mut handles = Vec::new();
    for _ in 0..16 {
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            let mut admitted = Vec::new();
            for _ in 0..10 {
                if let Some(job) = queue.fetch_next().await.unwrap() {
                    admitted.push(job.id);
                }
            }
            admitted
        }));
    }

    let mut admitted: Vec<_> = futures::future::join_all(handles)
        .await
        .into_iter()
        .flat_map(|r| r.unwrap())
        .collect();
    admitted.sort();
    admitted.dedup();
    assert_eq!(admitted.len(), 3);

    let counts = queue.counts().await.unwrap();
    assert_eq!(counts.active, 3);
    assert_eq!(counts.delayed, 47);
    assert_eq!(counts.total(), 50);
}

#[tokio::test]
async fn test_admissions_follow_fifo_within_a_key() {
    let queue = queue_with_jobs(limit(2, 60_000, false), 4).await;

    let first = queue.fetch_next().await.unwrap().unwrap();
    let second = queue.fetch_next().await.unwrap().unwrap();
    assert_eq!(first.payload["n"], 0);
    assert_eq!(second.payload["n"], 1);
}

// ============================================================================
// Throttle Routing
// ============================================================================

#[tokio::test]
async fn test_delayed_job_carries_window_reset() {
    let queue = queue_with_jobs(limit(1, 1000, false), 2).await;

    assert!(matches!(assert_ok!(queue.try_admit().await), Admission::Admitted(_)));
    let (job_id, reset_at) = match queue.try_admit().await.unwrap() {
        Admission::Throttled {
            job_id,
            route: ThrottleRoute::Delayed,
            reset_at,
            ..
        } => (job_id, reset_at),
        other => panic!("expected delayed throttle, got {:?}", other),
    };

    let job = queue.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Delayed);
    assert_eq!(job.delayed_until, Some(reset_at));
    assert!(job.failed_reason.is_none());
}

#[tokio::test]
async fn test_bounced_job_goes_to_tail() {
    let queue = queue_with_jobs(limit(1, 60_000, true), 3).await;

    queue.fetch_next().await.unwrap().unwrap();
    match queue.try_admit().await.unwrap() {
        Admission::Throttled { route, .. } => assert_eq!(route, ThrottleRoute::Requeued),
        other => panic!("expected bounce, got {:?}", other),
    }

    // Job 1 was bounced behind job 2
    let head = queue.store().pop_candidate().await.unwrap().unwrap();
    assert_eq!(head.payload["n"], 2);
}

#[tokio::test]
async fn test_throttling_never_fails_jobs() {
    let queue = queue_with_jobs(limit(1, 60_000, false), 10).await;
    for _ in 0..10 {
        queue.fetch_next().await.unwrap();
    }
    let counts = queue.counts().await.unwrap();
    assert_eq!(counts.failed, 0);
    assert_eq!(counts.active + counts.delayed, 10);
}

// ============================================================================
// Conservation
// ============================================================================

#[tokio::test]
async fn test_counts_are_conserved_through_lifecycle() {
    let queue = queue_with_jobs(limit(2, 60_000, false), 6).await;

    let a = queue.fetch_next().await.unwrap().unwrap();
    let b = queue.fetch_next().await.unwrap().unwrap();
    assert!(queue.fetch_next().await.unwrap().is_none());
    assert_eq!(queue.counts().await.unwrap().total(), 6);

    queue.complete(a.id).await.unwrap();
    queue.fail(b.id, "handler error").await.unwrap();

    let counts = queue.counts().await.unwrap();
    assert_eq!(counts.completed, 1);
    assert_eq!(counts.failed, 1);
    assert_eq!(counts.delayed, 1);
    assert_eq!(counts.waiting, 3);
    assert_eq!(counts.total(), 6);

    let err = queue.complete(a.id).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidStateTransition);
}

// ============================================================================
// Promotion
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_delayed_jobs_are_promoted_after_reset() {
    let queue = queue_with_jobs(limit(1, 200, false), 3).await;
    let mut events = queue.subscribe();

    assert_eq!(concurrent_fetches(&queue, 3).await, 1);
    assert_eq!(queue.counts().await.unwrap().delayed, 2);

    let promoter = queue
        .promoter(PromoterConfig { poll_interval_ms: 20 })
        .start();
    tokio::time::sleep(Duration::from_millis(400)).await;

    let counts = queue.counts().await.unwrap();
    assert_eq!(counts.delayed, 0);
    assert_eq!(counts.waiting, 2);

    // The reset window admits the next job again
    assert!(queue.fetch_next().await.unwrap().is_some());
    promoter.stop().await;

    let mut saw_promotion = false;
    while let Ok(event) = events.try_recv() {
        if let QueueEvent::Promoted { count, .. } = event {
            assert!(count >= 1);
            saw_promotion = true;
        }
    }
    assert!(saw_promotion);
}

// ============================================================================
// Workers
// ============================================================================

struct Noop;

#[async_trait]
impl JobHandler for Noop {
    async fn handle(&self, _job: &Job) -> anyhow::Result<()> {
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_bounce_back_worker_drains_queue() {
    let queue = queue_with_jobs(limit(2, 300, true), 6).await;
    let worker = JobWorker::new(
        WorkerConfig {
            concurrency: 2,
            poll_interval_ms: 20,
            ..Default::default()
        },
        Arc::new(Noop),
    )
    .start(queue.clone());

    let drained = tokio::time::timeout(Duration::from_secs(5), async {
        while queue.counts().await.unwrap().completed < 6 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(drained.is_ok());
    assert!(worker.stats().throttled() > 0);
    worker.stop().await;

    let counts = queue.counts().await.unwrap();
    assert_eq!(counts.completed, 6);
    assert_eq!(counts.delayed, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_delayed_worker_drains_queue_with_promoter() {
    let queue = queue_with_jobs(limit(2, 300, false), 6).await;
    let promoter = queue.promoter(PromoterConfig::default()).start();
    let worker = JobWorker::new(
        WorkerConfig {
            concurrency: 4,
            poll_interval_ms: 1_000,
            ..Default::default()
        },
        Arc::new(Noop),
    )
    .start(queue.clone());

    let drained = tokio::time::timeout(Duration::from_secs(5), async {
        while queue.counts().await.unwrap().completed < 6 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(drained.is_ok());

    worker.stop().await;
    promoter.stop().await;
}
