//! Redis-backed queue store.
//!
//! ## Layout
//!
//! Per queue, under `{prefix}:{queue}`:
//! - `:wait` list of visible job ids (LPUSH on enqueue, RPOPLPUSH on lease)
//! - `:active` list of leased job ids
//! - `:delayed` sorted set scored by visibility time (ms)
//! - `:completed` / `:failed` sorted sets scored by finish time (ms)
//! - `:paused` flag key
//! - `:job:{id}` hash holding the job record, including its lease deadline
//!
//! Every transition that reads then writes runs as one Lua script, so a lease taken by
//! `dequeue` is exclusive across processes sharing the same Redis.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::Script;
use serde_json::Value as JsonValue;
use tracing::{debug, instrument, warn};

use courier_core::{JobId, SharedClock, SystemClock};

use super::r#trait::{
    ensure_held, ensure_purgeable, validate_max_attempts, LeaseSettings, QueueStore, StoreError,
};
use crate::jobs::types::{
    saturating_after, BackoffKind, BackoffPolicy, Job, JobOptions, JobState, LeaseToken,
    NackOutcome, QueueStats, StalledReport, STALLED_REASON,
};

/// Default key prefix.
pub const DEFAULT_PREFIX: &str = "courier";

// Every script receives the same KEYS layout:
// 1 wait, 2 active, 3 delayed, 4 completed, 5 failed, 6 paused
// and ARGV[1] = job key prefix, ARGV[2] = now (ms).
// Settling scripts take ARGV[3] = job id and ARGV[4] = lease attempt.
macro_rules! queue_script {
    ($body:literal) => {
        concat!(
            r#"
local function promote()
  local due = redis.call("ZRANGEBYSCORE", KEYS[3], "-inf", ARGV[2])
  for _, id in ipairs(due) do
    local key = ARGV[1] .. id
    redis.call("ZREM", KEYS[3], id)
    redis.call("LPUSH", KEYS[1], id)
    redis.call("HSET", key, "state", "waiting")
    redis.call("HDEL", key, "delay_until")
  end
end
"#,
            $body
        )
    };
}

const DEQUEUE: &str = queue_script!(
    r#"
if redis.call("EXISTS", KEYS[6]) == 1 then return false end
promote()
while true do
  local id = redis.call("RPOPLPUSH", KEYS[1], KEYS[2])
  if not id then return false end
  local key = ARGV[1] .. id
  if redis.call("HGET", key, "state") == "waiting" then
    redis.call("HSET", key, "state", "active", "processed_at", ARGV[2], "lease_expires_at", ARGV[3])
    redis.call("HINCRBY", key, "attempts_made", 1)
    return redis.call("HGETALL", key)
  end
  redis.call("LREM", KEYS[2], 1, id)
end
"#
);

const EXTEND_LEASE: &str = queue_script!(
    r#"
local key = ARGV[1] .. ARGV[3]
local state = redis.call("HGET", key, "state")
if not state then return "missing" end
if state ~= "active" or redis.call("HGET", key, "attempts_made") ~= ARGV[4] then
  return "lease_lost"
end
redis.call("HSET", key, "lease_expires_at", ARGV[5])
return "ok"
"#
);

const ACK: &str = queue_script!(
    r#"
local key = ARGV[1] .. ARGV[3]
local state = redis.call("HGET", key, "state")
if not state then return "missing" end
local same_attempt = redis.call("HGET", key, "attempts_made") == ARGV[4]
if state == "completed" and same_attempt then return "noop" end
if state ~= "active" or not same_attempt then return "lease_lost" end
redis.call("LREM", KEYS[2], 1, ARGV[3])
redis.call("ZADD", KEYS[4], ARGV[2], ARGV[3])
redis.call("HSET", key, "state", "completed", "finished_at", ARGV[2])
redis.call("HDEL", key, "lease_expires_at")
if ARGV[5] == "" then
  redis.call("HDEL", key, "return_value")
else
  redis.call("HSET", key, "return_value", ARGV[5])
end
return "ok"
"#
);

// The outcome was computed from a read of the job; the attempt check keeps it valid.
const NACK: &str = queue_script!(
    r#"
local key = ARGV[1] .. ARGV[3]
local state = redis.call("HGET", key, "state")
if not state then return "missing" end
if state ~= "active" or redis.call("HGET", key, "attempts_made") ~= ARGV[4] then
  return "lease_lost"
end
redis.call("LREM", KEYS[2], 1, ARGV[3])
redis.call("HDEL", key, "lease_expires_at")
redis.call("HSET", key, "failed_reason", ARGV[7])
if ARGV[5] == "retry" then
  redis.call("ZADD", KEYS[3], ARGV[6], ARGV[3])
  redis.call("HSET", key, "state", "delayed", "delay_until", ARGV[6])
else
  redis.call("ZADD", KEYS[5], ARGV[2], ARGV[3])
  redis.call("HSET", key, "state", "failed", "finished_at", ARGV[2])
end
return "ok"
"#
);

const RECOVER_STALLED: &str = queue_script!(
    r#"
local requeued, failed = {}, {}
local now = tonumber(ARGV[2])
for _, id in ipairs(redis.call("LRANGE", KEYS[2], 0, -1)) do
  local key = ARGV[1] .. id
  local lease = tonumber(redis.call("HGET", key, "lease_expires_at"))
  if redis.call("HGET", key, "state") == "active" and lease and lease <= now then
    local stalled = redis.call("HINCRBY", key, "stalled_count", 1)
    local attempts = tonumber(redis.call("HGET", key, "attempts_made"))
    local max = tonumber(redis.call("HGET", key, "max_attempts"))
    redis.call("LREM", KEYS[2], 1, id)
    redis.call("HDEL", key, "lease_expires_at")
    if stalled > tonumber(ARGV[3]) or attempts >= max then
      redis.call("ZADD", KEYS[5], ARGV[2], id)
      redis.call("HSET", key, "state", "failed", "finished_at", ARGV[2], "failed_reason", ARGV[4])
      table.insert(failed, id)
    else
      redis.call("RPUSH", KEYS[1], id)
      redis.call("HSET", key, "state", "waiting")
      table.insert(requeued, id)
    end
  end
end
return {requeued, failed}
"#
);

const DRAIN: &str = queue_script!(
    r#"
local removed = 0
local ids = redis.call("LRANGE", KEYS[1], 0, -1)
for _, id in ipairs(redis.call("ZRANGE", KEYS[3], 0, -1)) do
  table.insert(ids, id)
end
for _, id in ipairs(ids) do
  local key = ARGV[1] .. id
  local state = redis.call("HGET", key, "state")
  if state == "waiting" or state == "delayed" then
    redis.call("DEL", key)
    removed = removed + 1
  end
end
redis.call("DEL", KEYS[1], KEYS[3])
return removed
"#
);

const PURGE: &str = queue_script!(
    r#"
local set = KEYS[4]
if ARGV[3] == "failed" then set = KEYS[5] end
local ids = redis.call("ZRANGE", set, 0, -1)
for _, id in ipairs(ids) do
  redis.call("DEL", ARGV[1] .. id)
end
redis.call("DEL", set)
return #ids
"#
);

const STATS: &str = queue_script!(
    r#"
promote()
return {
  redis.call("LLEN", KEYS[1]),
  redis.call("LLEN", KEYS[2]),
  redis.call("ZCARD", KEYS[4]),
  redis.call("ZCARD", KEYS[5]),
  redis.call("ZCARD", KEYS[3]),
  redis.call("EXISTS", KEYS[6])
}
"#
);

struct Scripts {
    dequeue: Script,
    extend_lease: Script,
    ack: Script,
    nack: Script,
    recover_stalled: Script,
    drain: Script,
    purge: Script,
    stats: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            dequeue: Script::new(DEQUEUE),
            extend_lease: Script::new(EXTEND_LEASE),
            ack: Script::new(ACK),
            nack: Script::new(NACK),
            recover_stalled: Script::new(RECOVER_STALLED),
            drain: Script::new(DRAIN),
            purge: Script::new(PURGE),
            stats: Script::new(STATS),
        }
    }
}

struct QueueKeys {
    wait: String,
    active: String,
    delayed: String,
    completed: String,
    failed: String,
    paused: String,
    job_prefix: String,
}

impl QueueKeys {
    fn new(prefix: &str, queue: &str) -> Self {
        let base = format!("{prefix}:{queue}");
        Self {
            wait: format!("{base}:wait"),
            active: format!("{base}:active"),
            delayed: format!("{base}:delayed"),
            completed: format!("{base}:completed"),
            failed: format!("{base}:failed"),
            paused: format!("{base}:paused"),
            job_prefix: format!("{base}:job:"),
        }
    }

    fn job(&self, id: impl std::fmt::Display) -> String {
        format!("{}{id}", self.job_prefix)
    }

    /// Start a script invocation with the shared KEYS layout and the first two ARGVs.
    fn invoke<'a>(&self, script: &'a Script, now: DateTime<Utc>) -> redis::ScriptInvocation<'a> {
        let mut invocation = script.prepare_invoke();
        invocation
            .key(&self.wait)
            .key(&self.active)
            .key(&self.delayed)
            .key(&self.completed)
            .key(&self.failed)
            .key(&self.paused)
            .arg(&self.job_prefix)
            .arg(now.timestamp_millis());
        invocation
    }
}

/// Queue store shared by every worker process pointing at the same Redis.
#[derive(Clone)]
pub struct RedisQueueStore {
    conn: ConnectionManager,
    prefix: String,
    clock: SharedClock,
    lease: LeaseSettings,
    scripts: std::sync::Arc<Scripts>,
}

impl std::fmt::Debug for RedisQueueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisQueueStore")
            .field("prefix", &self.prefix)
            .field("lease", &self.lease)
            .finish_non_exhaustive()
    }
}

fn unavailable(err: redis::RedisError) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

impl RedisQueueStore {
    /// Connect to Redis.
    ///
    /// * `redis_url` - e.g. "redis://localhost:6379/0"
    /// * `prefix` - key namespace shared by cooperating workers
    pub async fn connect(
        redis_url: impl AsRef<str>,
        prefix: impl Into<String>,
        lease: LeaseSettings,
    ) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(unavailable)?;
        let conn = ConnectionManager::new(client).await.map_err(unavailable)?;

        Ok(Self {
            conn,
            prefix: prefix.into(),
            clock: SystemClock::shared(),
            lease,
            scripts: std::sync::Arc::new(Scripts::load()),
        })
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn keys(&self, queue: &str) -> QueueKeys {
        QueueKeys::new(&self.prefix, queue)
    }

    async fn load_job(&self, keys: &QueueKeys, queue: &str, id: &str) -> Result<Option<Job>, StoreError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(keys.job(id))
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;

        if fields.is_empty() {
            return Ok(None);
        }
        decode_job(queue, &fields).map(Some)
    }

    async fn load_all(&self, keys: &QueueKeys, queue: &str, ids: &[String]) -> Result<Vec<Job>, StoreError> {
        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = self.load_job(keys, queue, id).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }
}

fn millis(at: DateTime<Utc>) -> String {
    at.timestamp_millis().to_string()
}

fn encode_job(job: &Job) -> Result<Vec<(&'static str, String)>, StoreError> {
    let payload =
        serde_json::to_string(&job.payload).map_err(|e| StoreError::Serialization(e.to_string()))?;

    let mut fields = vec![
        ("id", job.id.to_string()),
        ("job_type", job.job_type.clone()),
        ("payload", payload),
        ("state", job.state.as_str().to_string()),
        ("attempts_made", job.attempts_made.to_string()),
        ("max_attempts", job.max_attempts.to_string()),
        ("backoff_kind", job.backoff.kind.as_str().to_string()),
        ("backoff_ms", job.backoff.base_delay.as_millis().to_string()),
        ("created_at", millis(job.created_at)),
        ("stalled_count", job.stalled_count.to_string()),
    ];
    if let Some(at) = job.delay_until {
        fields.push(("delay_until", millis(at)));
    }
    Ok(fields)
}

fn decode_job(queue: &str, fields: &HashMap<String, String>) -> Result<Job, StoreError> {
    let corrupt = |name: &str| StoreError::Serialization(format!("job field `{name}` missing or malformed"));

    let text = |name: &str| fields.get(name).map(String::as_str).ok_or_else(|| corrupt(name));
    fn parse<T: FromStr>(raw: &str) -> Option<T> {
        raw.parse().ok()
    }
    let number = |name: &str| text(name).and_then(|raw| parse::<u64>(raw).ok_or_else(|| corrupt(name)));
    let instant = |name: &str| -> Result<Option<DateTime<Utc>>, StoreError> {
        match fields.get(name) {
            None => Ok(None),
            Some(raw) => parse::<i64>(raw)
                .and_then(DateTime::from_timestamp_millis)
                .map(Some)
                .ok_or_else(|| corrupt(name)),
        }
    };
    let json = |name: &str| -> Result<Option<JsonValue>, StoreError> {
        fields
            .get(name)
            .map(|raw| serde_json::from_str(raw).map_err(|e| StoreError::Serialization(e.to_string())))
            .transpose()
    };

    let id: JobId = parse(text("id")?).ok_or_else(|| corrupt("id"))?;
    let state: JobState = parse(text("state")?).ok_or_else(|| corrupt("state"))?;
    let kind: BackoffKind = parse(text("backoff_kind")?).ok_or_else(|| corrupt("backoff_kind"))?;

    Ok(Job {
        id,
        queue_name: queue.to_string(),
        job_type: text("job_type")?.to_string(),
        payload: json("payload")?.ok_or_else(|| corrupt("payload"))?,
        state,
        attempts_made: u32::try_from(number("attempts_made")?).map_err(|_| corrupt("attempts_made"))?,
        max_attempts: u32::try_from(number("max_attempts")?).map_err(|_| corrupt("max_attempts"))?,
        backoff: BackoffPolicy {
            kind,
            base_delay: Duration::from_millis(number("backoff_ms")?),
        },
        delay_until: instant("delay_until")?,
        created_at: instant("created_at")?.ok_or_else(|| corrupt("created_at"))?,
        processed_at: instant("processed_at")?,
        finished_at: instant("finished_at")?,
        failed_reason: fields.get("failed_reason").cloned(),
        return_value: json("return_value")?,
        stalled_count: u32::try_from(number("stalled_count")?).map_err(|_| corrupt("stalled_count"))?,
        lease_expires_at: instant("lease_expires_at")?,
    })
}

fn pairs_to_map(flat: Vec<String>) -> HashMap<String, String> {
    let mut map = HashMap::with_capacity(flat.len() / 2);
    let mut it = flat.into_iter();
    while let (Some(k), Some(v)) = (it.next(), it.next()) {
        map.insert(k, v);
    }
    map
}

/// Map a settling script's non-"ok" reply onto the store error it stands for.
fn rejected(reply: &str, lease: LeaseToken) -> StoreError {
    match reply {
        "missing" => StoreError::NotFound(lease.job_id),
        "lease_lost" => StoreError::LeaseLost(lease),
        other => StoreError::Serialization(format!("unexpected script reply: {other}")),
    }
}

#[async_trait::async_trait]
impl QueueStore for RedisQueueStore {
    #[instrument(skip(self, payload, options), fields(prefix = %self.prefix), err)]
    async fn enqueue(
        &self,
        queue: &str,
        job_type: &str,
        payload: JsonValue,
        options: JobOptions,
    ) -> Result<JobId, StoreError> {
        let max_attempts = validate_max_attempts(&options)?;
        let now = self.clock.now();
        let job = Job::new(JobId::new(), queue, job_type, payload, max_attempts, &options, now)?;
        let keys = self.keys(queue);
        let id = job.id.to_string();

        let mut pipe = redis::pipe();
        pipe.atomic().hset_multiple(keys.job(&id), &encode_job(&job)?).ignore();
        match job.delay_until {
            Some(at) => {
                pipe.zadd(&keys.delayed, &id, at.timestamp_millis()).ignore();
            }
            None => {
                pipe.lpush(&keys.wait, &id).ignore();
            }
        }

        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await.map_err(unavailable)?;

        debug!(job_id = %job.id, state = %job.state, "job enqueued");
        Ok(job.id)
    }

    #[instrument(skip(self), fields(prefix = %self.prefix), err)]
    async fn dequeue(&self, queue: &str) -> Result<Option<Job>, StoreError> {
        let now = self.clock.now();
        let keys = self.keys(queue);
        let lease_until = saturating_after(now, self.lease.stalled_interval);

        let mut invocation = keys.invoke(&self.scripts.dequeue, now);
        invocation.arg(lease_until.timestamp_millis());

        let mut conn = self.conn.clone();
        let reply: Option<Vec<String>> =
            invocation.invoke_async(&mut conn).await.map_err(unavailable)?;

        reply
            .map(|flat| decode_job(queue, &pairs_to_map(flat)))
            .transpose()
    }

    #[instrument(skip(self), fields(prefix = %self.prefix), err)]
    async fn extend_lease(&self, queue: &str, lease: LeaseToken) -> Result<(), StoreError> {
        let now = self.clock.now();
        let keys = self.keys(queue);
        let lease_until = saturating_after(now, self.lease.stalled_interval);

        let mut invocation = keys.invoke(&self.scripts.extend_lease, now);
        invocation
            .arg(lease.job_id.to_string())
            .arg(lease.attempt)
            .arg(lease_until.timestamp_millis());

        let mut conn = self.conn.clone();
        let reply: String = invocation.invoke_async(&mut conn).await.map_err(unavailable)?;
        match reply.as_str() {
            "ok" => Ok(()),
            other => Err(rejected(other, lease)),
        }
    }

    #[instrument(skip(self, result), fields(prefix = %self.prefix), err)]
    async fn ack(
        &self,
        queue: &str,
        lease: LeaseToken,
        result: Option<JsonValue>,
    ) -> Result<(), StoreError> {
        let now = self.clock.now();
        let keys = self.keys(queue);
        let return_value = match result {
            Some(value) => serde_json::to_string(&value)
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            None => String::new(),
        };

        let mut invocation = keys.invoke(&self.scripts.ack, now);
        invocation
            .arg(lease.job_id.to_string())
            .arg(lease.attempt)
            .arg(return_value);

        let mut conn = self.conn.clone();
        let reply: String = invocation.invoke_async(&mut conn).await.map_err(unavailable)?;
        match reply.as_str() {
            "ok" | "noop" => Ok(()),
            other => Err(rejected(other, lease)),
        }
    }

    #[instrument(skip(self, error), fields(prefix = %self.prefix), err)]
    async fn nack(
        &self,
        queue: &str,
        lease: LeaseToken,
        error: &str,
    ) -> Result<NackOutcome, StoreError> {
        let now = self.clock.now();
        let keys = self.keys(queue);

        let job = self
            .load_job(&keys, queue, &lease.job_id.to_string())
            .await?
            .ok_or(StoreError::NotFound(lease.job_id))?;
        ensure_held(&job, lease)?;

        let outcome = job.failure_outcome(now);
        let (kind, score) = match outcome {
            NackOutcome::Retry {
                next_visible_at, ..
            } => ("retry", next_visible_at),
            NackOutcome::Failed { .. } => ("failed", now),
        };

        let mut invocation = keys.invoke(&self.scripts.nack, now);
        invocation
            .arg(lease.job_id.to_string())
            .arg(lease.attempt)
            .arg(kind)
            .arg(score.timestamp_millis())
            .arg(error);

        let mut conn = self.conn.clone();
        let reply: String = invocation.invoke_async(&mut conn).await.map_err(unavailable)?;
        match reply.as_str() {
            "ok" => Ok(outcome),
            other => Err(rejected(other, lease)),
        }
    }

    #[instrument(skip(self), fields(prefix = %self.prefix), err)]
    async fn recover_stalled(&self, queue: &str) -> Result<StalledReport, StoreError> {
        let now = self.clock.now();
        let keys = self.keys(queue);

        let mut invocation = keys.invoke(&self.scripts.recover_stalled, now);
        invocation
            .arg(self.lease.max_stalled_count)
            .arg(STALLED_REASON);

        let mut conn = self.conn.clone();
        let (requeued, failed): (Vec<String>, Vec<String>) =
            invocation.invoke_async(&mut conn).await.map_err(unavailable)?;

        if !failed.is_empty() {
            warn!(count = failed.len(), "stalled jobs failed");
        }

        Ok(StalledReport {
            requeued: self.load_all(&keys, queue, &requeued).await?,
            failed: self.load_all(&keys, queue, &failed).await?,
        })
    }

    #[instrument(skip(self), fields(prefix = %self.prefix), err)]
    async fn pause(&self, queue: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(self.keys(queue).paused)
            .arg(1)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    #[instrument(skip(self), fields(prefix = %self.prefix), err)]
    async fn resume(&self, queue: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("DEL")
            .arg(self.keys(queue).paused)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    #[instrument(skip(self), fields(prefix = %self.prefix), err)]
    async fn drain(&self, queue: &str) -> Result<u64, StoreError> {
        let keys = self.keys(queue);
        let mut conn = self.conn.clone();
        keys.invoke(&self.scripts.drain, self.clock.now())
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)
    }

    #[instrument(skip(self), fields(prefix = %self.prefix), err)]
    async fn purge(&self, queue: &str, state: JobState) -> Result<u64, StoreError> {
        ensure_purgeable(state)?;
        let keys = self.keys(queue);

        let mut invocation = keys.invoke(&self.scripts.purge, self.clock.now());
        invocation.arg(state.as_str());

        let mut conn = self.conn.clone();
        invocation.invoke_async(&mut conn).await.map_err(unavailable)
    }

    #[instrument(skip(self), fields(prefix = %self.prefix), err)]
    async fn stats(&self, queue: &str) -> Result<QueueStats, StoreError> {
        let keys = self.keys(queue);
        let mut conn = self.conn.clone();
        let (waiting, active, completed, failed, delayed, paused): (u64, u64, u64, u64, u64, u64) =
            keys.invoke(&self.scripts.stats, self.clock.now())
                .invoke_async(&mut conn)
                .await
                .map_err(unavailable)?;

        Ok(QueueStats {
            waiting,
            active,
            completed,
            failed,
            delayed,
            paused: paused == 1,
        })
    }

    #[instrument(skip(self), fields(prefix = %self.prefix), err)]
    async fn get(&self, queue: &str, job_id: JobId) -> Result<Option<Job>, StoreError> {
        self.load_job(&self.keys(queue), queue, &job_id.to_string()).await
    }

    fn lease_settings(&self) -> LeaseSettings {
        self.lease
    }
}
