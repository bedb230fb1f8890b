//! Timing tests for per-group rate limiting.
//!
//! Four groups share one queue with a limit of one job per second per
//! group. Each group drains on its own schedule: roughly one completion
//! per second per group, with the groups running in parallel.

use async_trait::async_trait;
use floodgate_core::jobs::{
    Job, JobHandler, JobQueue, JobWorker, PromoterConfig, QueueConfig, RateLimitSettings,
    WorkerConfig,
};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

const GROUPS: usize = 4;
const JOBS_PER_GROUP: usize = 5;

/// Records when each job of each group finished.
#[derive(Default)]
struct CompletionRecorder {
    completions: Mutex<HashMap<String, Vec<Instant>>>,
}

#[async_trait]
impl JobHandler for CompletionRecorder {
    async fn handle(&self, job: &Job) -> anyhow::Result<()> {
        let group = job.payload["group"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("job without group"))?
            .to_string();
        self.completions
            .lock()
            .entry(group)
            .or_default()
            .push(Instant::now());
        Ok(())
    }
}

fn grouped_limit(bounce_back: bool) -> RateLimitSettings {
    RateLimitSettings {
        max: Some(1),
        duration: Some(1_000),
        group_key: Some("group".to_string()),
        bounce_back,
    }
}

async fn run_grouped_drain(bounce_back: bool) -> (Duration, HashMap<String, Vec<Instant>>) {
    let queue = Arc::new(
        JobQueue::new(QueueConfig::named("grouped"), Some(grouped_limit(bounce_back))).unwrap(),
    );
    for n in 0..JOBS_PER_GROUP {
        for g in 0..GROUPS {
            queue
                .add(json!({ "group": format!("group-{}", g), "n": n }))
                .await
                .unwrap();
        }
    }

    let recorder = Arc::new(CompletionRecorder::default());
    let started = Instant::now();
    let promoter = queue
        .promoter(PromoterConfig { poll_interval_ms: 20 })
        .start();
    let worker = JobWorker::new(
        WorkerConfig {
            concurrency: 8,
            poll_interval_ms: 50,
            ..Default::default()
        },
        recorder.clone(),
    )
    .start(queue.clone());

    let total = (GROUPS * JOBS_PER_GROUP) as u64;
    let drained = tokio::time::timeout(Duration::from_secs(15), async {
        while queue.counts().await.unwrap().completed < total {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(drained.is_ok(), "queue did not drain");

    let last = recorder
        .completions
        .lock()
        .values()
        .flat_map(|times| times.iter().copied())
        .max()
        .unwrap();

    worker.stop().await;
    promoter.stop().await;

    let counts = queue.counts().await.unwrap();
    assert_eq!(counts.completed, total);
    assert_eq!(counts.failed, 0);
    assert_eq!(counts.total(), total);

    let completions = recorder.completions.lock().clone();
    (last - started, completions)
}

fn assert_group_spacing(completions: &HashMap<String, Vec<Instant>>) {
    assert_eq!(completions.len(), GROUPS);
    for (group, times) in completions {
        assert_eq!(times.len(), JOBS_PER_GROUP, "group {}", group);
        for pair in times.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(
                gap >= Duration::from_millis(900) && gap <= Duration::from_millis(2_100),
                "group {} spacing {:?}",
                group,
                gap
            );
        }
    }
}

// ============================================================================
// Delayed Routing
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_groups_drain_in_parallel_with_delay() {
    let (elapsed, completions) = run_grouped_drain(false).await;

    assert_group_spacing(&completions);
    assert!(elapsed >= Duration::from_millis(4_000), "drained in {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(7_500), "drained in {:?}", elapsed);
}

// ============================================================================
// Bounce-Back Routing
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_groups_drain_in_parallel_with_bounce_back() {
    let (elapsed, completions) = run_grouped_drain(true).await;

    assert_group_spacing(&completions);
    assert!(elapsed >= Duration::from_millis(4_000), "drained in {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(7_500), "drained in {:?}", elapsed);
}

// ============================================================================
// Mixed Payloads
// ============================================================================

#[tokio::test]
async fn test_jobs_without_group_share_global_window() {
    let queue = JobQueue::new(QueueConfig::named("mixed"), Some(grouped_limit(false))).unwrap();

    queue.add(json!({ "group": "a" })).await.unwrap();
    queue.add(json!({ "other": 1 })).await.unwrap();
    queue.add(json!({ "group": null })).await.unwrap();
    queue.add(json!({ "group": "b" })).await.unwrap();

    let mut admitted = Vec::new();
    for _ in 0..4 {
        if let Some(job) = queue.fetch_next().await.unwrap() {
            admitted.push(job.payload);
        }
    }

    // "a", the first ungrouped job and "b" each open their own window
    assert_eq!(admitted.len(), 3);
    assert_eq!(admitted[1], json!({ "other": 1 }));

    let counts = queue.counts().await.unwrap();
    assert_eq!(counts.active, 3);
    assert_eq!(counts.delayed, 1);
}
