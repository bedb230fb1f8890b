//! Redis-backed job store.
//!
//! Key layout for queue `emails` under prefix `floodgate`:
//!
//! | key                              | type   | contents                       |
//! |----------------------------------|--------|--------------------------------|
//! | `floodgate:emails:id`            | string | last assigned job id           |
//! | `floodgate:emails:wait`          | list   | waiting ids, head first        |
//! | `floodgate:emails:claimed`       | set    | popped, not yet routed         |
//! | `floodgate:emails:active`        | set    | active ids                     |
//! | `floodgate:emails:delayed`       | zset   | delayed ids by release score   |
//! | `floodgate:emails:delayed:seq`   | string | delayed insertion counter      |
//! | `floodgate:emails:completed`     | list   | completed ids                  |
//! | `floodgate:emails:failed`        | list   | failed ids                     |
//! | `floodgate:emails:job:{id}`      | hash   | job record                     |
//! | `floodgate:emails:limiter[.grp]` | string | window counters (PEXPIRE'd)    |
//!
//! Delayed scores are `release_ms * 4096 + (seq % 4096)` so jobs released in
//! the same millisecond keep insertion order.
//!
//! Every mutation is one Lua script, which Redis runs without interleaving.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::Script;
use std::collections::HashMap;
use tokio::sync::OnceCell;
use tracing::{debug, info_span, Instrument};

use super::job::{from_millis, Job, JobCounts, JobId, JobState};
use super::limiter::{record_check, RateLimiter};
use super::store::{Admission, JobStore, ThrottleRoute};
use crate::error::{ErrorCode, FloodgateError, Result};

const ENQUEUE_LUA: &str = include_str!("lua/enqueue.lua");
const POP_CANDIDATE_LUA: &str = include_str!("lua/pop_candidate.lua");
const ROUTE_CLAIMED_LUA: &str = include_str!("lua/route_claimed.lua");
const PROMOTE_DUE_LUA: &str = include_str!("lua/promote_due.lua");
const FINISH_LUA: &str = include_str!("lua/finish.lua");
const ADMIT_NEXT_LUA: &str = include_str!("lua/admit_next.lua");

const DELAYED_SEQ_SPAN: f64 = 4096.0;

/// One reconnecting Redis connection, opened on first use and shared by
/// every call after that.
pub(crate) struct SharedConnection {
    client: redis::Client,
    manager: OnceCell<ConnectionManager>,
    purpose: &'static str,
}

impl SharedConnection {
    pub(crate) fn new(client: redis::Client, purpose: &'static str) -> Self {
        Self {
            client,
            manager: OnceCell::new(),
            purpose,
        }
    }

    pub(crate) fn client(&self) -> &redis::Client {
        &self.client
    }

    /// A handle onto the shared connection. A failed connect leaves the cell
    /// empty so the next call tries again.
    pub(crate) async fn get(&self) -> Result<ConnectionManager> {
        let manager = self
            .manager
            .get_or_try_init(|| ConnectionManager::new(self.client.clone()))
            .await
            .map_err(|e| {
                FloodgateError::with_internal(
                    ErrorCode::StorageUnavailable,
                    format!("Failed to get Redis connection for {}", self.purpose),
                    e.to_string(),
                )
            })?;
        Ok(manager.clone())
    }
}

/// Fully qualified keys for one queue.
#[derive(Debug, Clone)]
pub struct QueueKeys {
    base: String,
    id: String,
    wait: String,
    claimed: String,
    active: String,
    delayed: String,
    delayed_seq: String,
    completed: String,
    failed: String,
    job_prefix: String,
}

impl QueueKeys {
    pub fn new(prefix: &str, queue: &str) -> Self {
        let base = format!("{}:{}", prefix, queue);
        Self {
            id: format!("{}:id", base),
            wait: format!("{}:wait", base),
            claimed: format!("{}:claimed", base),
            active: format!("{}:active", base),
            delayed: format!("{}:delayed", base),
            delayed_seq: format!("{}:delayed:seq", base),
            completed: format!("{}:completed", base),
            failed: format!("{}:failed", base),
            job_prefix: format!("{}:job:", base),
            base,
        }
    }

    /// `{prefix}:{queue}`
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Default prefix for this queue's rate-limit keys.
    pub fn limiter(&self) -> String {
        format!("{}:limiter", self.base)
    }

    pub fn job(&self, id: JobId) -> String {
        format!("{}{}", self.job_prefix, id)
    }
}

/// Job store persisted in Redis.
///
/// When a [`RateLimiter`] is passed to [`JobStore::admit_next`], its window
/// counters are kept in Redis under the limiter's key prefix regardless of
/// the limiter's own counter store.
pub struct RedisJobStore {
    conn: SharedConnection,
    keys: QueueKeys,
    enqueue_script: Script,
    pop_candidate_script: Script,
    route_claimed_script: Script,
    promote_due_script: Script,
    finish_script: Script,
    admit_next_script: Script,
}

impl std::fmt::Debug for RedisJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisJobStore")
            .field("keys", &self.keys.base)
            .finish()
    }
}

impl RedisJobStore {
    /// Create a store for `queue` with keys under `prefix`.
    pub fn new(client: redis::Client, prefix: &str, queue: &str) -> Self {
        Self {
            conn: SharedConnection::new(client, "job store"),
            keys: QueueKeys::new(prefix, queue),
            enqueue_script: Script::new(ENQUEUE_LUA),
            pop_candidate_script: Script::new(POP_CANDIDATE_LUA),
            route_claimed_script: Script::new(ROUTE_CLAIMED_LUA),
            promote_due_script: Script::new(PROMOTE_DUE_LUA),
            finish_script: Script::new(FINISH_LUA),
            admit_next_script: Script::new(ADMIT_NEXT_LUA),
        }
    }

    /// Open a client for `url` and create the store.
    pub fn open(url: &str, prefix: &str, queue: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| {
            FloodgateError::with_internal(
                ErrorCode::InvalidConfiguration,
                "Invalid Redis URL",
                e.to_string(),
            )
        })?;
        Ok(Self::new(client, prefix, queue))
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    pub fn client(&self) -> &redis::Client {
        self.conn.client()
    }

    async fn get_conn(&self) -> Result<ConnectionManager> {
        self.conn.get().await
    }

    /// Delete every key belonging to this queue, including limiter windows.
    ///
    /// Uses `KEYS`; intended for tests and tooling.
    pub async fn obliterate(&self) -> Result<u64> {
        let mut conn = self.get_conn().await?;
        let found: Vec<String> = redis::cmd("KEYS")
            .arg(format!("{}:*", self.keys.base))
            .query_async(&mut conn)
            .await?;
        if found.is_empty() {
            return Ok(0);
        }
        let removed: u64 = redis::cmd("DEL").arg(&found).query_async(&mut conn).await?;
        Ok(removed)
    }

    async fn load(&self, conn: &mut ConnectionManager, id: JobId) -> Result<Option<Job>> {
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.keys.job(id))
            .query_async(conn)
            .await?;
        if fields.is_empty() {
            return Ok(None);
        }
        parse_job(id, &fields).map(Some)
    }

    async fn load_existing(&self, conn: &mut ConnectionManager, id: JobId) -> Result<Job> {
        self.load(conn, id)
            .await?
            .ok_or_else(|| FloodgateError::job_not_found(id))
    }

    async fn route_claimed(&self, id: JobId, to: JobState, release_ms: i64) -> Result<()> {
        let mut conn = self.get_conn().await?;
        let outcome: i64 = self
            .route_claimed_script
            .key(&self.keys.claimed)
            .key(&self.keys.active)
            .key(&self.keys.wait)
            .key(&self.keys.delayed)
            .key(&self.keys.delayed_seq)
            .arg(&self.keys.job_prefix)
            .arg(id.0)
            .arg(to.as_str())
            .arg(release_ms)
            .invoke_async(&mut conn)
            .await?;
        self.check_outcome(&mut conn, outcome, id, to).await
    }

    async fn check_outcome(
        &self,
        conn: &mut ConnectionManager,
        outcome: i64,
        id: JobId,
        to: JobState,
    ) -> Result<()> {
        match outcome {
            1 => Ok(()),
            -1 => Err(FloodgateError::job_not_found(id)),
            _ => {
                let current = self.load_existing(conn, id).await?;
                Err(FloodgateError::invalid_state_transition(id, current.state, to))
            }
        }
    }

    async fn finish(
        &self,
        id: JobId,
        to: JobState,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        let mut conn = self.get_conn().await?;
        let target = match to {
            JobState::Failed => &self.keys.failed,
            _ => &self.keys.completed,
        };
        let outcome: i64 = self
            .finish_script
            .key(&self.keys.active)
            .key(target)
            .arg(&self.keys.job_prefix)
            .arg(id.0)
            .arg(to.as_str())
            .arg(now.timestamp_millis())
            .arg(reason)
            .invoke_async(&mut conn)
            .await?;
        self.check_outcome(&mut conn, outcome, id, to).await?;
        self.load_existing(&mut conn, id).await
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn enqueue(&self, payload: serde_json::Value, now: DateTime<Utc>) -> Result<Job> {
        let span = info_span!("redis_store_enqueue", queue = %self.keys.base);
        async move {
            let data = serde_json::to_string(&payload)?;
            let mut conn = self.get_conn().await?;
            let id: u64 = self
                .enqueue_script
                .key(&self.keys.id)
                .key(&self.keys.wait)
                .arg(&self.keys.job_prefix)
                .arg(&data)
                .arg(now.timestamp_millis())
                .invoke_async(&mut conn)
                .await?;

            debug!(queue = %self.keys.base, job_id = id, "Job enqueued");
            Ok(Job::new(JobId(id), payload, from_millis(now.timestamp_millis())))
        }
        .instrument(span)
        .await
    }

    async fn pop_candidate(&self) -> Result<Option<Job>> {
        let mut conn = self.get_conn().await?;
        let id: Option<u64> = self
            .pop_candidate_script
            .key(&self.keys.wait)
            .key(&self.keys.claimed)
            .invoke_async(&mut conn)
            .await?;
        match id {
            Some(id) => self.load_existing(&mut conn, JobId(id)).await.map(Some),
            None => Ok(None),
        }
    }

    async fn activate(&self, id: JobId) -> Result<Job> {
        self.route_claimed(id, JobState::Active, 0).await?;
        let mut conn = self.get_conn().await?;
        self.load_existing(&mut conn, id).await
    }

    async fn requeue_waiting(&self, id: JobId) -> Result<()> {
        self.route_claimed(id, JobState::Waiting, 0).await
    }

    async fn schedule_delayed(&self, id: JobId, release_at: DateTime<Utc>) -> Result<()> {
        self.route_claimed(id, JobState::Delayed, release_at.timestamp_millis())
            .await
    }

    async fn promote_due(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut conn = self.get_conn().await?;
        let moved: u64 = self
            .promote_due_script
            .key(&self.keys.delayed)
            .key(&self.keys.wait)
            .arg(&self.keys.job_prefix)
            .arg(now.timestamp_millis())
            .invoke_async(&mut conn)
            .await?;
        Ok(moved)
    }

    async fn complete(&self, id: JobId, now: DateTime<Utc>) -> Result<Job> {
        self.finish(id, JobState::Completed, "", now).await
    }

    async fn fail(&self, id: JobId, reason: &str, now: DateTime<Utc>) -> Result<Job> {
        self.finish(id, JobState::Failed, reason, now).await
    }

    async fn counts(&self) -> Result<JobCounts> {
        let mut conn = self.get_conn().await?;
        let (wait, claimed, active, delayed, completed, failed): (u64, u64, u64, u64, u64, u64) =
            redis::pipe()
                .atomic()
                .cmd("LLEN")
                .arg(&self.keys.wait)
                .cmd("SCARD")
                .arg(&self.keys.claimed)
                .cmd("SCARD")
                .arg(&self.keys.active)
                .cmd("ZCARD")
                .arg(&self.keys.delayed)
                .cmd("LLEN")
                .arg(&self.keys.completed)
                .cmd("LLEN")
                .arg(&self.keys.failed)
                .query_async(&mut conn)
                .await?;

        Ok(JobCounts {
            waiting: wait + claimed,
            active,
            delayed,
            completed,
            failed,
        })
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        let mut conn = self.get_conn().await?;
        self.load(&mut conn, id).await
    }

    async fn next_release_at(&self) -> Result<Option<DateTime<Utc>>> {
        let mut conn = self.get_conn().await?;
        let head: Vec<(String, f64)> = redis::cmd("ZRANGE")
            .arg(&self.keys.delayed)
            .arg(0)
            .arg(0)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;
        Ok(head
            .first()
            .map(|(_, score)| from_millis((score / DELAYED_SEQ_SPAN).floor() as i64)))
    }

    async fn admit_next(&self, gate: Option<&RateLimiter>, now: DateTime<Utc>) -> Result<Admission> {
        let mut conn = self.get_conn().await?;
        let mut invocation = self.admit_next_script.key(&self.keys.wait);
        invocation
            .key(&self.keys.active)
            .key(&self.keys.delayed)
            .key(&self.keys.delayed_seq)
            .arg(&self.keys.job_prefix)
            .arg(now.timestamp_millis());

        match gate {
            Some(limiter) => {
                let limit = limiter.limit();
                invocation
                    .arg("1")
                    .arg(limiter.key_prefix())
                    .arg(limit.max())
                    .arg(limit.duration_ms())
                    .arg(limit.group_key().unwrap_or(""))
                    .arg(if limit.bounce_back() { "1" } else { "0" });
            }
            None => {
                invocation.arg("0").arg("").arg(0).arg(0).arg("").arg("0");
            }
        }

        let (outcome, id, key, reset_ms): (i64, u64, String, i64) =
            invocation.invoke_async(&mut conn).await?;
        let id = JobId(id);

        if gate.is_some() && outcome != 0 {
            record_check(outcome == 1);
        }

        match outcome {
            0 => Ok(Admission::Empty),
            1 => self.load_existing(&mut conn, id).await.map(Admission::Admitted),
            2 | 3 => Ok(Admission::Throttled {
                job_id: id,
                key,
                route: if outcome == 2 {
                    ThrottleRoute::Requeued
                } else {
                    ThrottleRoute::Delayed
                },
                reset_at: from_millis(reset_ms),
            }),
            other => Err(FloodgateError::new(
                ErrorCode::ScriptError,
                format!("Unexpected admission outcome {}", other),
            )),
        }
    }
}

fn parse_millis(fields: &HashMap<String, String>, name: &str, id: JobId) -> Result<Option<DateTime<Utc>>> {
    match fields.get(name) {
        None => Ok(None),
        Some(raw) if raw.is_empty() => Ok(None),
        Some(raw) => raw
            .parse::<i64>()
            .map(|ms| Some(from_millis(ms)))
            .map_err(|_| FloodgateError::corrupt_record(id, format!("invalid {}: {}", name, raw))),
    }
}

fn parse_job(id: JobId, fields: &HashMap<String, String>) -> Result<Job> {
    let data = fields
        .get("data")
        .ok_or_else(|| FloodgateError::corrupt_record(id, "missing data"))?;
    let payload: serde_json::Value = serde_json::from_str(data)?;
    let state: JobState = fields
        .get("state")
        .ok_or_else(|| FloodgateError::corrupt_record(id, "missing state"))?
        .parse()?;
    let enqueued_at = parse_millis(fields, "enqueued_at", id)?
        .ok_or_else(|| FloodgateError::corrupt_record(id, "missing enqueued_at"))?;

    Ok(Job {
        id,
        payload,
        state,
        enqueued_at,
        delayed_until: parse_millis(fields, "delayed_until", id)?,
        finished_at: parse_millis(fields, "finished_at", id)?,
        failed_reason: fields.get("failed_reason").cloned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_keys_layout() {
        let keys = QueueKeys::new("floodgate", "emails");
        assert_eq!(keys.base(), "floodgate:emails");
        assert_eq!(keys.wait, "floodgate:emails:wait");
        assert_eq!(keys.delayed_seq, "floodgate:emails:delayed:seq");
        assert_eq!(keys.job(JobId(7)), "floodgate:emails:job:7");
        assert_eq!(keys.limiter(), "floodgate:emails:limiter");
    }

    #[test]
    fn test_parse_job_hash() {
        let mut fields = HashMap::new();
        fields.insert("data".to_string(), r#"{"tenant":"acme"}"#.to_string());
        fields.insert("state".to_string(), "delayed".to_string());
        fields.insert("enqueued_at".to_string(), "1700000000000".to_string());
        fields.insert("delayed_until".to_string(), "1700000001000".to_string());

        let job = parse_job(JobId(3), &fields).unwrap();
        assert_eq!(job.state, JobState::Delayed);
        assert_eq!(job.group_value("tenant").as_deref(), Some("acme"));
        assert_eq!(
            job.delayed_until.map(|t| t.timestamp_millis()),
            Some(1_700_000_001_000)
        );
        assert!(job.finished_at.is_none());
    }

    #[test]
    fn test_parse_job_rejects_corrupt_hash() {
        let mut fields = HashMap::new();
        fields.insert("state".to_string(), "waiting".to_string());
        let err = parse_job(JobId(1), &fields).unwrap_err();
        assert_eq!(err.code(), ErrorCode::CorruptRecord);

        fields.insert("data".to_string(), "{}".to_string());
        fields.insert("enqueued_at".to_string(), "yesterday".to_string());
        let err = parse_job(JobId(1), &fields).unwrap_err();
        assert_eq!(err.code(), ErrorCode::CorruptRecord);
    }
}
