//! Redis-backed queue for distributed workers.
//!
//! Data layout:
//! - `gyre:queue:jobs:{id}`       hash with the job fields
//! - `gyre:queue:pending`         zset, score `-priority * 1e12 + available_at`
//! - `gyre:queue:running`         zset, score = lease deadline (unix seconds)
//! - `gyre:queue:by_ref:{kind}:{ref}` list of job ids in creation order
//! - `gyre:queue:stats`           hash of terminal-status counters
//!
//! Claims and lease reclaims run as Lua scripts so concurrent workers can
//! never double-claim a job.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use std::time::Duration;

use super::{EnqueueRequest, JobQueue, QueueStats};
use crate::models::{generate_id, Job, JobKind, JobStatus};
use crate::{GyreError, Result};

const KEY_JOBS: &str = "gyre:queue:jobs";
const KEY_PENDING: &str = "gyre:queue:pending";
const KEY_RUNNING: &str = "gyre:queue:running";
const KEY_BY_REF: &str = "gyre:queue:by_ref";
const KEY_STATS: &str = "gyre:queue:stats";

// Scans the head of the pending zset and claims the first job whose
// available_at has passed. The zset score interleaves priority and
// availability, so the head is ordered by (priority desc, available_at asc);
// the per-job check keeps delayed jobs invisible regardless of priority.
const DEQUEUE_SCRIPT: &str = r#"
local candidates = redis.call('ZRANGE', KEYS[1], 0, 49)
for _, job_id in ipairs(candidates) do
    local job_key = KEYS[3] .. ':' .. job_id
    local avail = tonumber(redis.call('HGET', job_key, 'available_ts') or '0')
    if avail <= tonumber(ARGV[1]) then
        redis.call('ZREM', KEYS[1], job_id)
        redis.call('ZADD', KEYS[2], ARGV[3], job_id)
        redis.call('HSET', job_key, 'status', 'running', 'locked_by', ARGV[2], 'locked_at', ARGV[1])
        redis.call('HINCRBY', job_key, 'attempts', 1)
        return job_id
    end
end
return nil
"#;

// Moves lease-expired jobs from the running zset back to pending, keeping
// their priority. Attempts already counted the crashed claim.
const RECLAIM_SCRIPT: &str = r#"
local expired = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 10)
local reclaimed = 0
for _, job_id in ipairs(expired) do
    local job_key = KEYS[3] .. ':' .. job_id
    if redis.call('EXISTS', job_key) == 1 then
        local priority = tonumber(redis.call('HGET', job_key, 'priority') or '0')
        local score = -priority * 1e12 + tonumber(ARGV[1])
        redis.call('ZREM', KEYS[1], job_id)
        redis.call('ZADD', KEYS[2], score, job_id)
        redis.call('HSET', job_key, 'status', 'queued', 'locked_by', '', 'locked_at', '')
        reclaimed = reclaimed + 1
    else
        redis.call('ZREM', KEYS[1], job_id)
    end
end
return reclaimed
"#;

fn now_secs() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1e6
}

fn score(priority: i32, available_at_secs: f64) -> f64 {
    -(priority as f64) * 1e12 + available_at_secs
}

fn secs_to_datetime(secs: f64) -> DateTime<Utc> {
    Utc.timestamp_micros((secs * 1e6) as i64)
        .single()
        .unwrap_or_else(Utc::now)
}

pub struct RedisQueue {
    conn: MultiplexedConnection,
    dequeue_script: Script,
    reclaim_script: Script,
}

impl RedisQueue {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            conn,
            dequeue_script: Script::new(DEQUEUE_SCRIPT),
            reclaim_script: Script::new(RECLAIM_SCRIPT),
        })
    }

    fn conn(&self) -> MultiplexedConnection {
        self.conn.clone()
    }

    fn job_key(job_id: &str) -> String {
        format!("{KEY_JOBS}:{job_id}")
    }

    fn by_ref_key(kind: JobKind, ref_id: &str) -> String {
        format!("{KEY_BY_REF}:{}:{ref_id}", kind.as_str())
    }

    async fn load(&self, job_id: &str) -> Result<Option<Job>> {
        let mut conn = self.conn();
        let data: std::collections::HashMap<String, String> =
            conn.hgetall(Self::job_key(job_id)).await?;
        if data.is_empty() {
            return Ok(None);
        }
        Ok(Some(job_from_hash(&data)?))
    }
}

fn job_from_hash(data: &std::collections::HashMap<String, String>) -> Result<Job> {
    let field = |name: &str| -> Result<&String> {
        data.get(name)
            .ok_or_else(|| GyreError::Queue(format!("job hash missing field '{name}'")))
    };
    let parse_ts = |value: Option<&String>| -> Option<DateTime<Utc>> {
        value
            .filter(|v| !v.is_empty())
            .and_then(|v| v.parse::<f64>().ok())
            .map(secs_to_datetime)
    };

    let kind = field("kind")?.parse::<JobKind>().map_err(GyreError::Queue)?;
    let status = field("status")?
        .parse::<JobStatus>()
        .map_err(GyreError::Queue)?;
    let payload = data
        .get("payload")
        .and_then(|p| serde_json::from_str(p).ok())
        .unwrap_or(serde_json::Value::Object(Default::default()));

    Ok(Job {
        id: field("id")?.clone(),
        kind,
        ref_id: field("ref_id")?.clone(),
        status,
        payload,
        attempts: data.get("attempts").and_then(|v| v.parse().ok()).unwrap_or(0),
        max_attempts: data
            .get("max_attempts")
            .and_then(|v| v.parse().ok())
            .unwrap_or(1),
        priority: data.get("priority").and_then(|v| v.parse().ok()).unwrap_or(0),
        available_at: parse_ts(data.get("available_ts")).unwrap_or_else(Utc::now),
        locked_at: parse_ts(data.get("locked_at")),
        locked_by: data.get("locked_by").filter(|v| !v.is_empty()).cloned(),
        last_error: data.get("last_error").filter(|v| !v.is_empty()).cloned(),
        created_at: parse_ts(data.get("created_ts")).unwrap_or_else(Utc::now),
        updated_at: parse_ts(data.get("updated_ts")).unwrap_or_else(Utc::now),
    })
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<Job> {
        let mut conn = self.conn();
        let job_id = generate_id();
        let now = now_secs();
        let available_at = now + request.delay.as_secs_f64();
        let max_attempts = request.max_attempts.max(1);

        let fields: Vec<(&str, String)> = vec![
            ("id", job_id.clone()),
            ("kind", request.kind.as_str().to_string()),
            ("ref_id", request.ref_id.clone()),
            ("status", JobStatus::Queued.as_str().to_string()),
            ("payload", serde_json::to_string(&request.payload)?),
            ("attempts", "0".to_string()),
            ("max_attempts", max_attempts.to_string()),
            ("priority", request.priority.to_string()),
            ("available_ts", available_at.to_string()),
            ("locked_at", String::new()),
            ("locked_by", String::new()),
            ("last_error", String::new()),
            ("created_ts", now.to_string()),
            ("updated_ts", now.to_string()),
        ];

        redis::pipe()
            .atomic()
            .hset_multiple(Self::job_key(&job_id), &fields)
            .zadd(KEY_PENDING, &job_id, score(request.priority, available_at))
            .rpush(Self::by_ref_key(request.kind, &request.ref_id), &job_id)
            .query_async::<()>(&mut conn)
            .await?;

        self.load(&job_id)
            .await?
            .ok_or_else(|| GyreError::Queue(format!("job not found after insert: {job_id}")))
    }

    async fn dequeue(&self, worker_id: &str, visibility_timeout: Duration) -> Result<Option<Job>> {
        let mut conn = self.conn();
        let now = now_secs();
        let lease_deadline = now + visibility_timeout.as_secs_f64();

        let _: i64 = self
            .reclaim_script
            .key(KEY_RUNNING)
            .key(KEY_PENDING)
            .key(KEY_JOBS)
            .arg(now)
            .invoke_async(&mut conn)
            .await?;

        let job_id: Option<String> = self
            .dequeue_script
            .key(KEY_PENDING)
            .key(KEY_RUNNING)
            .key(KEY_JOBS)
            .arg(now)
            .arg(worker_id)
            .arg(lease_deadline)
            .invoke_async(&mut conn)
            .await?;

        match job_id {
            Some(id) => self.load(&id).await,
            None => Ok(None),
        }
    }

    async fn complete(&self, job_id: &str) -> Result<()> {
        let mut conn = self.conn();
        redis::pipe()
            .atomic()
            .zrem(KEY_RUNNING, job_id)
            .hset(Self::job_key(job_id), "status", JobStatus::Succeeded.as_str())
            .hset(Self::job_key(job_id), "locked_by", "")
            .hset(Self::job_key(job_id), "locked_at", "")
            .hset(Self::job_key(job_id), "last_error", "")
            .hset(Self::job_key(job_id), "updated_ts", now_secs().to_string())
            .hincr(KEY_STATS, "succeeded", 1)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn fail(
        &self,
        job_id: &str,
        error: &str,
        retry: bool,
        retry_delay: Duration,
    ) -> Result<()> {
        let Some(job) = self.load(job_id).await? else {
            return Ok(());
        };
        let mut conn = self.conn();
        let now = now_secs();

        if retry && job.attempts < job.max_attempts {
            let available_at = now + retry_delay.as_secs_f64();
            redis::pipe()
                .atomic()
                .zrem(KEY_RUNNING, job_id)
                .zadd(KEY_PENDING, job_id, score(job.priority, available_at))
                .hset(Self::job_key(job_id), "status", JobStatus::Queued.as_str())
                .hset(Self::job_key(job_id), "available_ts", available_at.to_string())
                .hset(Self::job_key(job_id), "locked_by", "")
                .hset(Self::job_key(job_id), "locked_at", "")
                .hset(Self::job_key(job_id), "last_error", error)
                .hset(Self::job_key(job_id), "updated_ts", now.to_string())
                .query_async::<()>(&mut conn)
                .await?;
        } else {
            redis::pipe()
                .atomic()
                .zrem(KEY_RUNNING, job_id)
                .zrem(KEY_PENDING, job_id)
                .hset(Self::job_key(job_id), "status", JobStatus::Failed.as_str())
                .hset(Self::job_key(job_id), "locked_by", "")
                .hset(Self::job_key(job_id), "locked_at", "")
                .hset(Self::job_key(job_id), "last_error", error)
                .hset(Self::job_key(job_id), "updated_ts", now.to_string())
                .hincr(KEY_STATS, "failed", 1)
                .query_async::<()>(&mut conn)
                .await?;
        }
        Ok(())
    }

    async fn cancel(&self, job_id: &str, reason: Option<&str>) -> Result<()> {
        let Some(job) = self.load(job_id).await? else {
            return Ok(());
        };
        if job.status.is_terminal() {
            return Ok(());
        }
        let mut conn = self.conn();
        redis::pipe()
            .atomic()
            .zrem(KEY_PENDING, job_id)
            .zrem(KEY_RUNNING, job_id)
            .hset(Self::job_key(job_id), "status", JobStatus::Canceled.as_str())
            .hset(Self::job_key(job_id), "locked_by", "")
            .hset(Self::job_key(job_id), "locked_at", "")
            .hset(Self::job_key(job_id), "last_error", reason.unwrap_or(""))
            .hset(Self::job_key(job_id), "updated_ts", now_secs().to_string())
            .hincr(KEY_STATS, "canceled", 1)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<Option<Job>> {
        self.load(job_id).await
    }

    async fn get_latest_by_ref(&self, kind: JobKind, ref_id: &str) -> Result<Option<Job>> {
        let mut conn = self.conn();
        let ids: Vec<String> = conn.lrange(Self::by_ref_key(kind, ref_id), -1, -1).await?;
        match ids.into_iter().next() {
            Some(id) => self.load(&id).await,
            None => Ok(None),
        }
    }

    async fn cancel_queued_by_ref(&self, kind: JobKind, ref_id: &str) -> Result<bool> {
        let mut conn = self.conn();
        let ids: Vec<String> = conn.lrange(Self::by_ref_key(kind, ref_id), 0, -1).await?;
        let mut any = false;
        for id in ids {
            if let Some(job) = self.load(&id).await? {
                if job.status == JobStatus::Queued {
                    self.cancel(&id, None).await?;
                    any = true;
                }
            }
        }
        Ok(any)
    }

    async fn extend_visibility(&self, job_id: &str, additional: Duration) -> Result<bool> {
        let Some(job) = self.load(job_id).await? else {
            return Ok(false);
        };
        if job.status != JobStatus::Running {
            return Ok(false);
        }
        let mut conn = self.conn();
        let deadline = now_secs() + additional.as_secs_f64();
        let _: i64 = redis::cmd("ZADD")
            .arg(KEY_RUNNING)
            .arg("XX")
            .arg(deadline)
            .arg(job_id)
            .query_async(&mut conn)
            .await?;
        Ok(true)
    }

    async fn fail_all_running(&self, error: &str) -> Result<u64> {
        let mut conn = self.conn();
        let ids: Vec<String> = conn.zrange(KEY_RUNNING, 0, -1).await?;
        let count = ids.len() as u64;
        for id in &ids {
            redis::pipe()
                .atomic()
                .zrem(KEY_RUNNING, id)
                .hset(Self::job_key(id), "status", JobStatus::Failed.as_str())
                .hset(Self::job_key(id), "locked_by", "")
                .hset(Self::job_key(id), "locked_at", "")
                .hset(Self::job_key(id), "last_error", error)
                .hset(Self::job_key(id), "updated_ts", now_secs().to_string())
                .hincr(KEY_STATS, "failed", 1)
                .query_async::<()>(&mut conn)
                .await?;
        }
        Ok(count)
    }

    async fn stats(&self) -> Result<QueueStats> {
        let mut conn = self.conn();
        let queued: u64 = conn.zcard(KEY_PENDING).await?;
        let running: u64 = conn.zcard(KEY_RUNNING).await?;
        let counters: std::collections::HashMap<String, u64> = conn.hgetall(KEY_STATS).await?;

        let mut by_kind = std::collections::HashMap::new();
        let mut active: Vec<String> = conn.zrange(KEY_PENDING, 0, -1).await?;
        let running_ids: Vec<String> = conn.zrange(KEY_RUNNING, 0, -1).await?;
        active.extend(running_ids);
        for id in active {
            let kind: Option<String> = conn.hget(Self::job_key(&id), "kind").await?;
            if let Some(kind) = kind {
                *by_kind.entry(kind).or_insert(0) += 1;
            }
        }

        Ok(QueueStats {
            queued,
            running,
            succeeded: counters.get("succeeded").copied().unwrap_or(0),
            failed: counters.get("failed").copied().unwrap_or(0),
            canceled: counters.get("canceled").copied().unwrap_or(0),
            by_kind,
        })
    }
}
