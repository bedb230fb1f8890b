//! Job containers and their atomic transitions.
//!
//! A job lives in exactly one container at a time:
//!
//! ```text
//!   enqueue ──▶ Waiting ──admit──▶ Active ──complete──▶ Completed
//!                 ▲  │                 │
//!        promote  │  │ throttle        └────fail──────▶ Failed
//!                 │  ▼
//!               Delayed
//! ```
//!
//! Jobs handed out by [`JobStore::pop_candidate`] are *claimed*: they have
//! left the waiting sequence but are still counted as waiting until the
//! caller routes them with `activate`, `requeue_waiting` or
//! `schedule_delayed`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use tokio::sync::Mutex;

use super::job::{from_millis, Job, JobCounts, JobId, JobState};
use super::limiter::RateLimiter;
use crate::error::{FloodgateError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Admission Outcome
// ═══════════════════════════════════════════════════════════════════════════════

/// Where a throttled job was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleRoute {
    /// Put back at the waiting tail (bounce-back policy)
    Requeued,
    /// Parked in the delayed set until the window resets
    Delayed,
}

impl ThrottleRoute {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requeued => "requeued",
            Self::Delayed => "delayed",
        }
    }
}

/// Result of one admission transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// The waiting head became active
    Admitted(Job),
    /// The waiting head was over its limit and was rerouted
    Throttled {
        job_id: JobId,
        key: String,
        route: ThrottleRoute,
        reset_at: DateTime<Utc>,
    },
    /// Nothing was waiting
    Empty,
}

impl Admission {
    /// The admitted job, if any.
    pub fn into_job(self) -> Option<Job> {
        match self {
            Self::Admitted(job) => Some(job),
            _ => None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Store Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Storage backend for queue containers.
///
/// Every method is atomic with respect to concurrent callers. On error no
/// container has been modified.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Assign an id and append a new job to the waiting tail.
    async fn enqueue(&self, payload: serde_json::Value, now: DateTime<Utc>) -> Result<Job>;

    /// Claim the waiting head.
    async fn pop_candidate(&self) -> Result<Option<Job>>;

    /// Move a claimed job to the active set.
    async fn activate(&self, id: JobId) -> Result<Job>;

    /// Move a claimed job back to the waiting tail.
    async fn requeue_waiting(&self, id: JobId) -> Result<()>;

    /// Move a claimed job to the delayed set, released at `release_at`.
    async fn schedule_delayed(&self, id: JobId, release_at: DateTime<Utc>) -> Result<()>;

    /// Move every delayed job with a release time `<= now` to the waiting
    /// tail, in release order. Returns the number of jobs moved.
    async fn promote_due(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Move an active job to the completed records.
    async fn complete(&self, id: JobId, now: DateTime<Utc>) -> Result<Job>;

    /// Move an active job to the failed records.
    async fn fail(&self, id: JobId, reason: &str, now: DateTime<Utc>) -> Result<Job>;

    /// Point-in-time container sizes.
    async fn counts(&self) -> Result<JobCounts>;

    /// Look up a job by id.
    async fn get(&self, id: JobId) -> Result<Option<Job>>;

    /// Earliest release time in the delayed set.
    async fn next_release_at(&self) -> Result<Option<DateTime<Utc>>>;

    /// Pop the waiting head, check it against `gate` and route it, all as one
    /// indivisible step. Without a gate every popped job is admitted.
    async fn admit_next(&self, gate: Option<&RateLimiter>, now: DateTime<Utc>) -> Result<Admission>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Backend
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct StoreState {
    last_id: u64,
    jobs: HashMap<JobId, Job>,
    waiting: VecDeque<JobId>,
    claimed: HashSet<JobId>,
    active: HashSet<JobId>,
    /// Keyed by (release ms, insertion sequence)
    delayed: BTreeMap<(i64, u64), JobId>,
    delayed_seq: u64,
    completed: Vec<JobId>,
    failed: Vec<JobId>,
}

impl StoreState {
    fn job_mut(&mut self, id: JobId) -> Result<&mut Job> {
        self.jobs
            .get_mut(&id)
            .ok_or_else(|| FloodgateError::job_not_found(id))
    }

    fn take_claimed(&mut self, id: JobId, to: JobState) -> Result<()> {
        if self.claimed.remove(&id) {
            return Ok(());
        }
        let from = self.job_mut(id)?.state;
        Err(FloodgateError::invalid_state_transition(id, from, to))
    }

    fn mark_active(&mut self, id: JobId) -> Result<Job> {
        self.active.insert(id);
        let job = self.job_mut(id)?;
        job.state = JobState::Active;
        job.delayed_until = None;
        Ok(job.clone())
    }

    fn mark_waiting(&mut self, id: JobId) -> Result<()> {
        self.waiting.push_back(id);
        let job = self.job_mut(id)?;
        job.state = JobState::Waiting;
        job.delayed_until = None;
        Ok(())
    }

    fn mark_delayed(&mut self, id: JobId, release_at: DateTime<Utc>) -> Result<()> {
        self.delayed_seq += 1;
        let seq = self.delayed_seq;
        self.delayed.insert((release_at.timestamp_millis(), seq), id);
        let job = self.job_mut(id)?;
        job.state = JobState::Delayed;
        job.delayed_until = Some(release_at);
        Ok(())
    }

    fn finish(
        &mut self,
        id: JobId,
        to: JobState,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        let from = self.job_mut(id)?.state;
        if !self.active.remove(&id) {
            return Err(FloodgateError::invalid_state_transition(id, from, to));
        }
        match to {
            JobState::Failed => self.failed.push(id),
            _ => self.completed.push(id),
        }
        let job = self.job_mut(id)?;
        job.state = to;
        job.finished_at = Some(now);
        job.failed_reason = reason.map(str::to_string);
        Ok(job.clone())
    }

    fn counts(&self) -> JobCounts {
        JobCounts {
            waiting: (self.waiting.len() + self.claimed.len()) as u64,
            active: self.active.len() as u64,
            delayed: self.delayed.len() as u64,
            completed: self.completed.len() as u64,
            failed: self.failed.len() as u64,
        }
    }
}

/// In-process job store for tests, development and single-process queues.
///
/// One async mutex guards every container, so each operation (including the
/// rate-limit check inside [`JobStore::admit_next`]) is observed atomically.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    state: Mutex<StoreState>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, payload: serde_json::Value, now: DateTime<Utc>) -> Result<Job> {
        let mut state = self.state.lock().await;
        state.last_id += 1;
        let job = Job::new(JobId(state.last_id), payload, now);
        state.jobs.insert(job.id, job.clone());
        state.waiting.push_back(job.id);
        Ok(job)
    }

    async fn pop_candidate(&self) -> Result<Option<Job>> {
        let mut state = self.state.lock().await;
        let Some(id) = state.waiting.pop_front() else {
            return Ok(None);
        };
        state.claimed.insert(id);
        Ok(state.jobs.get(&id).cloned())
    }

    async fn activate(&self, id: JobId) -> Result<Job> {
        let mut state = self.state.lock().await;
        state.take_claimed(id, JobState::Active)?;
        state.mark_active(id)
    }

    async fn requeue_waiting(&self, id: JobId) -> Result<()> {
        let mut state = self.state.lock().await;
        state.take_claimed(id, JobState::Waiting)?;
        state.mark_waiting(id)
    }

    async fn schedule_delayed(&self, id: JobId, release_at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        state.take_claimed(id, JobState::Delayed)?;
        state.mark_delayed(id, release_at)
    }

    async fn promote_due(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock().await;
        let cutoff = (now.timestamp_millis(), u64::MAX);
        let due: Vec<(i64, u64)> = state.delayed.range(..=cutoff).map(|(k, _)| *k).collect();

        for slot in &due {
            if let Some(id) = state.delayed.remove(slot) {
                state.mark_waiting(id)?;
            }
        }
        Ok(due.len() as u64)
    }

    async fn complete(&self, id: JobId, now: DateTime<Utc>) -> Result<Job> {
        let mut state = self.state.lock().await;
        state.finish(id, JobState::Completed, None, now)
    }

    async fn fail(&self, id: JobId, reason: &str, now: DateTime<Utc>) -> Result<Job> {
        let mut state = self.state.lock().await;
        state.finish(id, JobState::Failed, Some(reason), now)
    }

    async fn counts(&self) -> Result<JobCounts> {
        Ok(self.state.lock().await.counts())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.state.lock().await.jobs.get(&id).cloned())
    }

    async fn next_release_at(&self) -> Result<Option<DateTime<Utc>>> {
        let state = self.state.lock().await;
        Ok(state
            .delayed
            .keys()
            .next()
            .map(|(release_ms, _)| from_millis(*release_ms)))
    }

    async fn admit_next(&self, gate: Option<&RateLimiter>, now: DateTime<Utc>) -> Result<Admission> {
        let mut state = self.state.lock().await;
        let Some(id) = state.waiting.pop_front() else {
            return Ok(Admission::Empty);
        };

        let Some(limiter) = gate else {
            return state.mark_active(id).map(Admission::Admitted);
        };

        let job = match state.jobs.get(&id) {
            Some(job) => job.clone(),
            None => return Err(FloodgateError::job_not_found(id)),
        };
        let key = limiter.derive_key(&job);
        let verdict = match limiter.check_at(&key, now.timestamp_millis()).await {
            Ok(verdict) => verdict,
            Err(e) => {
                state.waiting.push_front(id);
                return Err(e);
            }
        };

        if verdict.admitted {
            return state.mark_active(id).map(Admission::Admitted);
        }

        let route = if limiter.limit().bounce_back() {
            state.mark_waiting(id)?;
            ThrottleRoute::Requeued
        } else {
            state.mark_delayed(id, verdict.reset_at)?;
            ThrottleRoute::Delayed
        };

        Ok(Admission::Throttled {
            job_id: id,
            key,
            route,
            reset_at: verdict.reset_at,
        })
    }
}
