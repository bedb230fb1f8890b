//! Fixed-window rate limiting for job admission.
//!
//! Features:
//! - Fixed window counters keyed by rate-limit key
//! - Optional per-group partitioning driven by a payload field
//! - Atomic check-and-increment against a pluggable window counter store
//! - In-memory store (per-key locks) and Redis store (single Lua script)
//!
//! # Example
//!
//! ```rust,ignore
//! use floodgate_core::jobs::limiter::{RateLimit, RateLimiter};
//!
//! let limit = RateLimit::builder().max(10).duration_ms(1_000).group_key("tenant").build()?;
//! let limiter = RateLimiter::in_memory(limit, "floodgate:emails:limiter");
//! let verdict = limiter.check(&limiter.derive_key(&job)).await?;
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::counter;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::job::{from_millis, Job};
use super::redis_store::SharedConnection;
use crate::error::{FloodgateError, Result};

const WINDOW_CHECK_LUA: &str = include_str!("lua/window_check.lua");

/// Longest accepted window (one year). Keeps `now + duration` and the delayed
/// set scores far from integer and Lua double limits.
pub const MAX_WINDOW_MS: u64 = 365 * 24 * 60 * 60 * 1000;

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════════════════════════

/// Raw limiter options as they arrive from the config loader.
///
/// Both `max` and `duration` must be present; use [`RateLimit::from_settings`]
/// to validate before building a limiter.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitSettings {
    /// Maximum admissions per window
    #[serde(default)]
    pub max: Option<u64>,

    /// Window length in milliseconds
    #[serde(default)]
    pub duration: Option<u64>,

    /// Payload field used to partition windows
    #[serde(default, alias = "groupKey")]
    pub group_key: Option<String>,

    /// Requeue throttled jobs at the waiting tail instead of delaying them
    #[serde(default, alias = "bounceBack")]
    pub bounce_back: bool,
}

/// A validated rate limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimit {
    max: u64,
    duration: Duration,
    group_key: Option<String>,
    bounce_back: bool,
}

impl RateLimit {
    /// Validate raw settings.
    ///
    /// Fails with `MissingConfiguration` when `max` or `duration` is absent and
    /// with `InvalidConfiguration` when either is zero or `duration` exceeds
    /// [`MAX_WINDOW_MS`].
    pub fn from_settings(settings: &RateLimitSettings) -> Result<Self> {
        let max = settings
            .max
            .ok_or_else(|| FloodgateError::missing_configuration("max"))?;
        let duration = settings
            .duration
            .ok_or_else(|| FloodgateError::missing_configuration("duration"))?;

        if max == 0 {
            return Err(FloodgateError::invalid_configuration(
                "Rate limiter `max` must be greater than zero",
            ));
        }
        if duration == 0 {
            return Err(FloodgateError::invalid_configuration(
                "Rate limiter `duration` must be greater than zero",
            ));
        }
        if duration > MAX_WINDOW_MS {
            return Err(FloodgateError::invalid_configuration(format!(
                "Rate limiter `duration` must be at most {} ms",
                MAX_WINDOW_MS
            ))
            .with_context("duration", duration));
        }
        if let Some(field) = &settings.group_key {
            if field.trim().is_empty() {
                return Err(FloodgateError::invalid_configuration(
                    "Rate limiter `group_key` must not be empty",
                ));
            }
        }

        Ok(Self {
            max,
            duration: Duration::from_millis(duration),
            group_key: settings.group_key.clone(),
            bounce_back: settings.bounce_back,
        })
    }

    /// Create a new builder.
    pub fn builder() -> RateLimitBuilder {
        RateLimitBuilder::default()
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration.as_millis() as u64
    }

    pub fn group_key(&self) -> Option<&str> {
        self.group_key.as_deref()
    }

    pub fn bounce_back(&self) -> bool {
        self.bounce_back
    }
}

/// Builder for a validated rate limit.
#[derive(Debug, Default)]
pub struct RateLimitBuilder {
    settings: RateLimitSettings,
}

impl RateLimitBuilder {
    pub fn max(mut self, max: u64) -> Self {
        self.settings.max = Some(max);
        self
    }

    pub fn duration_ms(mut self, ms: u64) -> Self {
        self.settings.duration = Some(ms);
        self
    }

    pub fn group_key(mut self, field: impl Into<String>) -> Self {
        self.settings.group_key = Some(field.into());
        self
    }

    pub fn bounce_back(mut self, enabled: bool) -> Self {
        self.settings.bounce_back = enabled;
        self
    }

    pub fn build(self) -> Result<RateLimit> {
        RateLimit::from_settings(&self.settings)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Window Counter Store
// ═══════════════════════════════════════════════════════════════════════════════

/// Counter state observed by one increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Counter value after the increment
    pub count: u64,
    /// Epoch milliseconds at which the current window ends
    pub expires_at_ms: i64,
}

/// Durable, atomically incrementable window counters.
#[async_trait]
pub trait WindowCounterStore: Send + Sync {
    /// Increment the counter for `key`, starting a fresh window of
    /// `duration_ms` first if none exists or the previous one has expired.
    ///
    /// Must be a single atomic step with respect to every other caller.
    async fn increment(&self, key: &str, duration_ms: u64, now_ms: i64) -> Result<WindowCount>;
}

#[derive(Debug)]
struct WindowEntry {
    count: u64,
    expires_at_ms: i64,
}

impl WindowEntry {
    fn hit(&mut self, duration_ms: u64, now_ms: i64) -> WindowCount {
        if now_ms >= self.expires_at_ms {
            self.count = 0;
            self.expires_at_ms = now_ms.saturating_add(i64::try_from(duration_ms).unwrap_or(i64::MAX));
        }
        self.count += 1;
        WindowCount {
            count: self.count,
            expires_at_ms: self.expires_at_ms,
        }
    }
}

/// In-process window counters.
///
/// The map shard is only read-locked on the hot path; the per-key mutex makes
/// each increment atomic while leaving other keys unblocked. Expired windows
/// are swept at most once per window duration, so one entry per group value
/// ever seen does not accumulate.
#[derive(Debug, Default)]
pub struct InMemoryWindowStore {
    windows: DashMap<String, Mutex<WindowEntry>>,
    next_sweep_ms: AtomicI64,
}

impl InMemoryWindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Synchronous increment, used directly by the in-memory job store while
    /// it holds its own state lock.
    pub fn increment_now(&self, key: &str, duration_ms: u64, now_ms: i64) -> WindowCount {
        self.maybe_sweep(duration_ms, now_ms);

        if let Some(entry) = self.windows.get(key) {
            let count = entry.lock().hit(duration_ms, now_ms);
            return count;
        }
        let entry = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| {
                Mutex::new(WindowEntry {
                    count: 0,
                    expires_at_ms: i64::MIN,
                })
            });
        let count = entry.lock().hit(duration_ms, now_ms);
        count
    }

    // Must run while no map reference is held: retain write-locks every shard.
    fn maybe_sweep(&self, duration_ms: u64, now_ms: i64) {
        let due = self.next_sweep_ms.load(Ordering::Relaxed);
        if now_ms < due {
            return;
        }
        let next = now_ms.saturating_add(i64::try_from(duration_ms).unwrap_or(i64::MAX));
        if self
            .next_sweep_ms
            .compare_exchange(due, next, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            let removed = self.cleanup_expired(now_ms);
            if removed > 0 {
                debug!(removed, remaining = self.windows.len(), "Expired rate limit windows swept");
            }
        }
    }

    /// Drop windows that ended before `now_ms`.
    pub fn cleanup_expired(&self, now_ms: i64) -> usize {
        let before = self.windows.len();
        self.windows
            .retain(|_, entry| entry.get_mut().expires_at_ms > now_ms);
        before - self.windows.len()
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

#[async_trait]
impl WindowCounterStore for InMemoryWindowStore {
    async fn increment(&self, key: &str, duration_ms: u64, now_ms: i64) -> Result<WindowCount> {
        Ok(self.increment_now(key, duration_ms, now_ms))
    }
}

/// Redis-backed window counters (`INCR` + `PEXPIRE` in one script).
pub struct RedisWindowStore {
    conn: SharedConnection,
    script: redis::Script,
}

impl RedisWindowStore {
    pub fn new(client: redis::Client) -> Self {
        Self {
            conn: SharedConnection::new(client, "rate limiter"),
            script: redis::Script::new(WINDOW_CHECK_LUA),
        }
    }
}

#[async_trait]
impl WindowCounterStore for RedisWindowStore {
    async fn increment(&self, key: &str, duration_ms: u64, now_ms: i64) -> Result<WindowCount> {
        let mut conn = self.conn.get().await?;
        let (count, expires_at_ms): (u64, i64) = self
            .script
            .key(key)
            .arg(duration_ms)
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(WindowCount {
            count,
            expires_at_ms,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Rate Limiter
// ═══════════════════════════════════════════════════════════════════════════════

/// Outcome of a single admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitVerdict {
    /// Whether the job may become active
    pub admitted: bool,
    /// Admissions counted in the current window, including this one
    pub count: u64,
    /// Configured limit
    pub limit: u64,
    /// When the current window ends
    pub reset_at: DateTime<Utc>,
}

impl RateLimitVerdict {
    /// Build a verdict from a raw window observation.
    pub fn from_window(window: WindowCount, limit: u64) -> Self {
        Self {
            admitted: window.count <= limit,
            count: window.count,
            limit,
            reset_at: from_millis(window.expires_at_ms),
        }
    }

    /// Remaining admissions in the current window.
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.count)
    }
}

/// Rate limiter bound to one queue.
#[derive(Clone)]
pub struct RateLimiter {
    limit: RateLimit,
    key_prefix: String,
    store: Arc<dyn WindowCounterStore>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("limit", &self.limit)
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

impl RateLimiter {
    /// Create a limiter from raw settings, failing fast on incomplete config.
    pub fn new(
        settings: &RateLimitSettings,
        key_prefix: impl Into<String>,
        store: Arc<dyn WindowCounterStore>,
    ) -> Result<Self> {
        let limit = RateLimit::from_settings(settings)?;
        Ok(Self::with_limit(limit, key_prefix, store))
    }

    /// Create a limiter from an already validated limit.
    pub fn with_limit(
        limit: RateLimit,
        key_prefix: impl Into<String>,
        store: Arc<dyn WindowCounterStore>,
    ) -> Self {
        Self {
            limit,
            key_prefix: key_prefix.into(),
            store,
        }
    }

    /// Create a limiter with process-local window counters.
    pub fn in_memory(limit: RateLimit, key_prefix: impl Into<String>) -> Self {
        Self::with_limit(limit, key_prefix, Arc::new(InMemoryWindowStore::new()))
    }

    pub fn limit(&self) -> &RateLimit {
        &self.limit
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    /// Compute the rate-limit key for a job.
    pub fn derive_key(&self, job: &Job) -> String {
        let group = self
            .limit
            .group_key()
            .and_then(|field| job.group_value(field));
        rate_limit_key(&self.key_prefix, group.as_deref())
    }

    /// Atomically count one admission attempt against `key`.
    pub async fn check(&self, key: &str) -> Result<RateLimitVerdict> {
        self.check_at(key, Utc::now().timestamp_millis()).await
    }

    /// Same as [`check`](Self::check) with an explicit clock reading.
    pub async fn check_at(&self, key: &str, now_ms: i64) -> Result<RateLimitVerdict> {
        let window = self
            .store
            .increment(key, self.limit.duration_ms(), now_ms)
            .await?;
        let verdict = RateLimitVerdict::from_window(window, self.limit.max);

        record_check(verdict.admitted);
        debug!(
            key = %key,
            count = verdict.count,
            limit = verdict.limit,
            admitted = verdict.admitted,
            "Rate limit checked"
        );

        Ok(verdict)
    }
}

/// Join the prefix and an optional group value into a rate-limit key.
pub fn rate_limit_key(prefix: &str, group: Option<&str>) -> String {
    match group {
        Some(group) => format!("{}.{}", prefix, group),
        None => prefix.to_string(),
    }
}

pub(crate) fn record_check(admitted: bool) {
    counter!(
        "floodgate_rate_limit_checks_total",
        "admitted" => admitted.to_string()
    )
    .increment(1);
}
