//! Delayed job promotion.
//!
//! Throttled jobs parked in the delayed set carry the reset time of the
//! window that rejected them. The promoter moves them back to the waiting
//! tail once that time has passed, then wakes idle workers.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::events::{EventBus, QueueEvent};
use super::store::JobStore;
use crate::error::Result;

/// Configuration for the delayed promoter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PromoterConfig {
    /// Upper bound on the sleep between promotion cycles (milliseconds)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    100
}

impl Default for PromoterConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl PromoterConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Background loop feeding delayed jobs back into the waiting sequence.
pub struct DelayedPromoter {
    store: Arc<dyn JobStore>,
    events: EventBus,
    wake: Arc<Notify>,
    config: PromoterConfig,
}

impl DelayedPromoter {
    pub fn new(
        store: Arc<dyn JobStore>,
        events: EventBus,
        wake: Arc<Notify>,
        config: PromoterConfig,
    ) -> Self {
        Self {
            store,
            events,
            wake,
            config,
        }
    }

    /// Promote everything that is due now. Returns the number of jobs moved.
    pub async fn promote_once(&self) -> Result<u64> {
        let now = Utc::now();
        let promoted = self.store.promote_due(now).await?;
        if promoted > 0 {
            self.events.publish(QueueEvent::Promoted {
                count: promoted,
                timestamp: now,
            });
            self.wake.notify_waiters();
        }
        Ok(promoted)
    }

    /// How long to sleep before the next cycle.
    async fn next_delay(&self) -> Result<Duration> {
        let poll = self.config.poll_interval();
        let Some(release_at) = self.store.next_release_at().await? else {
            return Ok(poll);
        };
        let until = (release_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO)
            .max(Duration::from_millis(1));
        Ok(until.min(poll))
    }

    async fn cycle(&self) -> Result<Duration> {
        self.promote_once().await?;
        self.next_delay().await
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_interval_ms = self.config.poll_interval_ms,
            "Delayed promoter started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let delay = match self.cycle().await {
                Ok(delay) => delay,
                Err(e) => {
                    e.log();
                    self.config.poll_interval()
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        debug!("Delayed promoter stopped");
    }

    /// Spawn the loop onto the runtime.
    pub fn start(self) -> PromoterHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(shutdown_rx));
        PromoterHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

/// Handle for a running promoter.
pub struct PromoterHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PromoterHandle {
    /// Signal the loop to stop without waiting for it.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Signal the loop to stop and wait for it to exit.
    pub async fn stop(self) {
        self.shutdown();
        let _ = self.task.await;
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::InMemoryJobStore;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    async fn store_with_delayed(delays_ms: &[i64]) -> Arc<InMemoryJobStore> {
        let store = Arc::new(InMemoryJobStore::new());
        let now = Utc::now();
        for delay in delays_ms {
            store.enqueue(json!({}), now).await.unwrap();
            let job = store.pop_candidate().await.unwrap().unwrap();
            store
                .schedule_delayed(job.id, now + ChronoDuration::milliseconds(*delay))
                .await
                .unwrap();
        }
        store
    }

    #[test]
    fn test_config_default() {
        let config = PromoterConfig::default();
        assert_eq!(config.poll_interval_ms, 100);
        assert_eq!(config.poll_interval(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_promote_once_only_moves_due_jobs() {
        let store = store_with_delayed(&[-10, 60_000]).await;
        let promoter = DelayedPromoter::new(
            store.clone(),
            EventBus::default(),
            Arc::new(Notify::new()),
            PromoterConfig::default(),
        );

        assert_eq!(promoter.promote_once().await.unwrap(), 1);
        let counts = store.counts().await.unwrap();
        assert_eq!(counts.waiting, 1);
        assert_eq!(counts.delayed, 1);
    }

    #[tokio::test]
    async fn test_next_delay_is_capped_by_poll_interval() {
        let store = store_with_delayed(&[60_000]).await;
        let promoter = DelayedPromoter::new(
            store,
            EventBus::default(),
            Arc::new(Notify::new()),
            PromoterConfig { poll_interval_ms: 50 },
        );
        assert_eq!(promoter.next_delay().await.unwrap(), Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_running_promoter_releases_jobs() {
        let store = store_with_delayed(&[50, 120]).await;
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let handle = DelayedPromoter::new(
            store.clone(),
            events,
            Arc::new(Notify::new()),
            PromoterConfig { poll_interval_ms: 20 },
        )
        .start();

        tokio::time::sleep(Duration::from_millis(400)).await;
        handle.stop().await;

        let counts = store.counts().await.unwrap();
        assert_eq!(counts.delayed, 0);
        assert_eq!(counts.waiting, 2);
        assert!(matches!(rx.recv().await.unwrap(), QueueEvent::Promoted { .. }));
    }

    #[tokio::test]
    async fn test_stop_returns_promptly() {
        let store = Arc::new(InMemoryJobStore::new());
        let handle = DelayedPromoter::new(
            store,
            EventBus::default(),
            Arc::new(Notify::new()),
            PromoterConfig { poll_interval_ms: 60_000 },
        )
        .start();

        tokio::time::timeout(Duration::from_secs(1), handle.stop())
            .await
            .unwrap();
    }
}
