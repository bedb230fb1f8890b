//! Fetch-next-job admission.
//!
//! The dispatcher delegates the pop/check/route transaction to the store's
//! [`JobStore::admit_next`] and adds the bits that sit outside it: bounded
//! retry on transaction conflicts and event publication.

use chrono::Utc;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::events::{EventBus, QueueEvent};
use super::job::Job;
use super::limiter::RateLimiter;
use super::store::{Admission, JobStore};
use crate::error::{ErrorCode, FloodgateError, Result};

/// Retry policy for admission transactions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Attempts per fetch before a conflict is surfaced
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base backoff between attempts (milliseconds), multiplied by attempt number
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_retry_backoff_ms() -> u64 {
    5
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

/// Admission gate shared by every worker of a queue.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    limiter: Option<RateLimiter>,
    events: EventBus,
    config: DispatcherConfig,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("limiter", &self.limiter)
            .field("config", &self.config)
            .finish()
    }
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        limiter: Option<RateLimiter>,
        events: EventBus,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            limiter,
            events,
            config,
        }
    }

    pub fn limiter(&self) -> Option<&RateLimiter> {
        self.limiter.as_ref()
    }

    /// Run one admission transaction and report what happened.
    pub async fn try_admit(&self) -> Result<Admission> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let now = Utc::now();

            match self.store.admit_next(self.limiter.as_ref(), now).await {
                Ok(admission) => {
                    self.publish(&admission);
                    return Ok(admission);
                }
                Err(e) if e.code() == ErrorCode::TransactionConflict => {
                    if attempt >= max_attempts {
                        return Err(FloodgateError::with_internal(
                            ErrorCode::AdmissionRetriesExhausted,
                            "Admission kept conflicting with concurrent workers",
                            format!("gave up after {} attempts", attempt),
                        )
                        .with_source(e));
                    }
                    counter!("floodgate_admission_retries_total").increment(1);
                    debug!(attempt, "Admission conflicted, retrying");
                    let backoff = self.config.retry_backoff_ms * attempt as u64;
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
                Err(e) => {
                    warn!(error = %e, "Admission failed");
                    return Err(e);
                }
            }
        }
    }

    /// The admitted job, or `None` when the queue was empty or the head was
    /// throttled.
    pub async fn fetch_next(&self) -> Result<Option<Job>> {
        Ok(self.try_admit().await?.into_job())
    }

    fn publish(&self, admission: &Admission) {
        let timestamp = Utc::now();
        match admission {
            Admission::Admitted(job) => self.events.publish(QueueEvent::Admitted {
                job_id: job.id,
                timestamp,
            }),
            Admission::Throttled {
                job_id,
                key,
                route,
                reset_at,
            } => self.events.publish(QueueEvent::Throttled {
                job_id: *job_id,
                key: key.clone(),
                route: *route,
                reset_at: *reset_at,
                timestamp,
            }),
            Admission::Empty => {}
        }
    }
}
