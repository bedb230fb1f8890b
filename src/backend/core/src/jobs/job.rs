//! Job records and lifecycle states.
//!
//! This module provides the core data model of the queue:
//!
//! - **JobId**: Monotonically assigned identifier
//! - **JobState**: The container a job currently lives in
//! - **Job**: Payload plus lifecycle timestamps
//! - **JobCounts**: Point-in-time container sizes

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{ErrorCode, FloodgateError};

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a job, assigned by the store in enqueue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for JobId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job State
// ═══════════════════════════════════════════════════════════════════════════════

/// Lifecycle state of a job. Each state corresponds to exactly one container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// In the FIFO waiting sequence
    Waiting,
    /// Admitted and handed to a worker
    Active,
    /// Throttled and parked until its release time
    Delayed,
    /// Finished successfully
    Completed,
    /// Finished with a failure reason
    Failed,
}

impl JobState {
    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Delayed => "delayed",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = FloodgateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "active" => Ok(Self::Active),
            "delayed" => Ok(Self::Delayed),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(FloodgateError::new(
                ErrorCode::CorruptRecord,
                format!("Unknown job state: {}", other),
            )),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job
// ═══════════════════════════════════════════════════════════════════════════════

/// A job and its lifecycle bookkeeping.
///
/// The payload never changes after enqueue; only the store's transition
/// operations touch `state` and the timestamp fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier
    pub id: JobId,
    /// Opaque structured payload
    pub payload: serde_json::Value,
    /// Current state
    pub state: JobState,
    /// When the job was first enqueued
    pub enqueued_at: DateTime<Utc>,
    /// Release time while the job is delayed
    pub delayed_until: Option<DateTime<Utc>>,
    /// When the job reached a terminal state
    pub finished_at: Option<DateTime<Utc>>,
    /// Failure reason (failed jobs only)
    pub failed_reason: Option<String>,
}

impl Job {
    /// Create a freshly enqueued job.
    pub fn new(id: JobId, payload: serde_json::Value, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            id,
            payload,
            state: JobState::Waiting,
            enqueued_at,
            delayed_until: None,
            finished_at: None,
            failed_reason: None,
        }
    }

    /// Extract the rate-limit group value from the payload.
    ///
    /// Strings are used verbatim, booleans as `true`/`false` and whole
    /// numbers in plain decimal, so `7` and `7.0` share a window. Fractional
    /// numbers, numbers outside ±2^53, `null`, a missing field or a nested
    /// object/array yield `None` and the job falls back to the global key.
    ///
    /// The Redis admission script derives the same text.
    pub fn group_value(&self, field: &str) -> Option<String> {
        match self.payload.get(field)? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => whole_number_text(n),
            serde_json::Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}

// Largest magnitude a double (and so Redis Lua) holds exactly.
const MAX_EXACT_GROUP_NUMBER: f64 = 9_007_199_254_740_992.0;

fn whole_number_text(n: &serde_json::Number) -> Option<String> {
    if let Some(v) = n.as_i64() {
        return ((v as f64).abs() < MAX_EXACT_GROUP_NUMBER).then(|| v.to_string());
    }
    let v = n.as_f64()?;
    (v.fract() == 0.0 && v.abs() < MAX_EXACT_GROUP_NUMBER).then(|| (v as i64).to_string())
}

/// Convert epoch milliseconds to a UTC timestamp, clamping invalid values.
pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Counts
// ═══════════════════════════════════════════════════════════════════════════════

/// Sizes of every container, taken at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: u64,
    pub active: u64,
    pub delayed: u64,
    pub completed: u64,
    pub failed: u64,
}

impl JobCounts {
    /// Total number of jobs across all containers.
    pub fn total(&self) -> u64 {
        self.waiting + self.active + self.delayed + self.completed + self.failed
    }

    /// Count for a single state.
    pub fn get(&self, state: JobState) -> u64 {
        match state {
            JobState::Waiting => self.waiting,
            JobState::Active => self.active,
            JobState::Delayed => self.delayed,
            JobState::Completed => self.completed,
            JobState::Failed => self.failed,
        }
    }
}
