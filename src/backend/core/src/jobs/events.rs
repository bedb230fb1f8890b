//! Queue lifecycle events.

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::job::JobId;
use super::store::ThrottleRoute;

/// Lifecycle events published by a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    Enqueued {
        job_id: JobId,
        timestamp: DateTime<Utc>,
    },
    Admitted {
        job_id: JobId,
        timestamp: DateTime<Utc>,
    },
    Throttled {
        job_id: JobId,
        key: String,
        #[serde(with = "route_serde")]
        route: ThrottleRoute,
        reset_at: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },
    Promoted {
        count: u64,
        timestamp: DateTime<Utc>,
    },
    Completed {
        job_id: JobId,
        timestamp: DateTime<Utc>,
    },
    Failed {
        job_id: JobId,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl QueueEvent {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Enqueued { timestamp, .. }
            | Self::Admitted { timestamp, .. }
            | Self::Throttled { timestamp, .. }
            | Self::Promoted { timestamp, .. }
            | Self::Completed { timestamp, .. }
            | Self::Failed { timestamp, .. } => *timestamp,
        }
    }

    /// Job the event refers to; `None` for promotion batches.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            Self::Enqueued { job_id, .. }
            | Self::Admitted { job_id, .. }
            | Self::Throttled { job_id, .. }
            | Self::Completed { job_id, .. }
            | Self::Failed { job_id, .. } => Some(*job_id),
            Self::Promoted { .. } => None,
        }
    }
}

mod route_serde {
    use super::ThrottleRoute;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(route: &ThrottleRoute, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(route.as_str())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<ThrottleRoute, D::Error> {
        match String::deserialize(d)?.as_str() {
            "requeued" => Ok(ThrottleRoute::Requeued),
            "delayed" => Ok(ThrottleRoute::Delayed),
            other => Err(serde::de::Error::unknown_variant(other, &["requeued", "delayed"])),
        }
    }
}

/// Broadcast fan-out of queue events.
///
/// Publishing never blocks; slow subscribers observe `Lagged` and skip ahead.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<QueueEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.sender.subscribe()
    }

    /// Log, count and broadcast an event.
    pub fn publish(&self, event: QueueEvent) {
        match &event {
            QueueEvent::Enqueued { job_id, .. } => {
                counter!("floodgate_jobs_enqueued_total").increment(1);
                debug!(job_id = %job_id, "Job enqueued");
            }
            QueueEvent::Admitted { job_id, .. } => {
                counter!("floodgate_jobs_admitted_total").increment(1);
                debug!(job_id = %job_id, "Job admitted");
            }
            QueueEvent::Throttled {
                job_id,
                key,
                route,
                reset_at,
                ..
            } => {
                counter!("floodgate_jobs_throttled_total", "route" => route.as_str()).increment(1);
                debug!(
                    job_id = %job_id,
                    key = %key,
                    route = route.as_str(),
                    reset_at = %reset_at,
                    "Job throttled"
                );
            }
            QueueEvent::Promoted { count, .. } => {
                counter!("floodgate_jobs_promoted_total").increment(*count);
                debug!(count, "Delayed jobs promoted");
            }
            QueueEvent::Completed { job_id, .. } => {
                counter!("floodgate_jobs_completed_total").increment(1);
                info!(job_id = %job_id, "Job completed");
            }
            QueueEvent::Failed { job_id, reason, .. } => {
                counter!("floodgate_jobs_failed_total").increment(1);
                warn!(job_id = %job_id, reason = %reason, "Job failed");
            }
        }

        // No receivers is not an error
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
