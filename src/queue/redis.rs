//! Redis-backed queue
//!
//! Layout under `queue:<name>:`
//!
//! | key | type | contents |
//! |---|---|---|
//! | `id` | string | id counter |
//! | `job:<id>` | hash | `name`, `payload`, `attempts`, `reason`, `failed_at` |
//! | `wait` | list | ready ids (push left, pop right) |
//! | `active` | zset | reserved ids scored by lease expiry (ms) |
//! | `delayed` | zset | ids scored by due time (ms) |
//! | `failed` | zset | ids scored by failure time (ms) |
//!
//! A reservation is a lease. When a consumer dies before settling a job, the
//! lease expires and the next `reserve` moves the job back to `wait`, counting
//! the lost attempt.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::Script;
use tracing::trace;

use super::{FailedJob, Job, JobQueue, QueueCounts};
use crate::store::RedisClient;
use crate::{Error, Result};

/// Interval between polls while the queue is empty
const POLL_STEP: Duration = Duration::from_millis(100);

/// Requeue stalled jobs, promote due delayed jobs, then lease the next ready
/// id in `active`.
///
/// KEYS: wait, delayed, active. ARGV: now (ms), job key prefix, lease (ms).
const RESERVE_SCRIPT: &str = r"
local now = tonumber(ARGV[1])
local stalled = redis.call('ZRANGEBYSCORE', KEYS[3], 0, now)
for _, id in ipairs(stalled) do
  redis.call('ZREM', KEYS[3], id)
  redis.call('HINCRBY', ARGV[2] .. id, 'attempts', 1)
  redis.call('LPUSH', KEYS[1], id)
end
local due = redis.call('ZRANGEBYSCORE', KEYS[2], 0, now)
for _, id in ipairs(due) do
  redis.call('ZREM', KEYS[2], id)
  redis.call('LPUSH', KEYS[1], id)
end
local id = redis.call('RPOP', KEYS[1])
if not id then
  return nil
end
redis.call('ZADD', KEYS[3], now + tonumber(ARGV[3]), id)
local job = redis.call('HMGET', ARGV[2] .. id, 'name', 'payload', 'attempts')
return {id, job[1] or '', job[2] or '', job[3] or '0'}
";

/// Delete failed jobs scored at or before a cutoff.
///
/// KEYS: failed. ARGV: cutoff (ms), job key prefix.
const PRUNE_SCRIPT: &str = r"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], 0, ARGV[1])
for _, id in ipairs(ids) do
  redis.call('DEL', ARGV[2] .. id)
end
redis.call('ZREMRANGEBYSCORE', KEYS[1], 0, ARGV[1])
return #ids
";

/// Redis [`JobQueue`]
pub struct RedisQueue {
    client: RedisClient,
    prefix: String,
    lease: Duration,
}

impl RedisQueue {
    /// Queue `name` on the shared connection; reserved jobs not settled
    /// within `lease` are re-delivered
    #[must_use]
    pub fn new(client: RedisClient, name: &str, lease: Duration) -> Self {
        Self {
            client,
            prefix: format!("queue:{name}:"),
            lease,
        }
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}{suffix}", self.prefix)
    }

    fn job_prefix(&self) -> String {
        self.key("job:")
    }

    fn job_key(&self, id: &str) -> String {
        format!("{}{id}", self.job_prefix())
    }

    fn ensure_removed(removed: u64, id: &str) -> Result<()> {
        if removed == 0 {
            return Err(Error::Queue(format!("job {id} is not active")));
        }
        Ok(())
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn submit(&self, name: &str, payload: String) -> Result<String> {
        let mut conn = self.client.connection();
        let id: u64 = redis::cmd("INCR").arg(self.key("id")).query_async(&mut conn).await?;
        let id = id.to_string();

        let _: () = redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(self.job_key(&id))
            .arg("name")
            .arg(name)
            .arg("payload")
            .arg(&payload)
            .arg("attempts")
            .arg(0)
            .ignore()
            .cmd("LPUSH")
            .arg(self.key("wait"))
            .arg(&id)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(id)
    }

    async fn reserve(&self, wait: Duration) -> Result<Option<Job>> {
        let deadline = tokio::time::Instant::now() + wait;
        let script = Script::new(RESERVE_SCRIPT);
        loop {
            let mut conn = self.client.connection();
            let reserved: Option<(String, String, String, String)> = script
                .key(self.key("wait"))
                .key(self.key("delayed"))
                .key(self.key("active"))
                .arg(Utc::now().timestamp_millis())
                .arg(self.job_prefix())
                .arg(u64::try_from(self.lease.as_millis()).unwrap_or(u64::MAX / 2))
                .invoke_async(&mut conn)
                .await?;

            if let Some((id, name, payload, attempts)) = reserved {
                trace!(id, "Reserved job");
                return Ok(Some(Job {
                    id,
                    name,
                    payload,
                    attempts: attempts.parse().unwrap_or(0),
                }));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_STEP.min(deadline - now)).await;
        }
    }

    async fn ack(&self, job: &Job) -> Result<()> {
        let mut conn = self.client.connection();
        let (removed,): (u64,) = redis::pipe()
            .atomic()
            .cmd("ZREM")
            .arg(self.key("active"))
            .arg(&job.id)
            .cmd("DEL")
            .arg(self.job_key(&job.id))
            .ignore()
            .query_async(&mut conn)
            .await?;
        Self::ensure_removed(removed, &job.id)
    }

    async fn retry(&self, job: &Job, delay: Duration) -> Result<()> {
        let due = Utc::now().timestamp_millis()
            + i64::try_from(delay.as_millis()).unwrap_or(i64::MAX / 2);
        let mut conn = self.client.connection();
        let (removed,): (u64,) = redis::pipe()
            .atomic()
            .cmd("ZREM")
            .arg(self.key("active"))
            .arg(&job.id)
            .cmd("HINCRBY")
            .arg(self.job_key(&job.id))
            .arg("attempts")
            .arg(1)
            .ignore()
            .cmd("ZADD")
            .arg(self.key("delayed"))
            .arg(due)
            .arg(&job.id)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Self::ensure_removed(removed, &job.id)
    }

    async fn fail(&self, job: &Job, reason: &str) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let mut conn = self.client.connection();
        let (removed,): (u64,) = redis::pipe()
            .atomic()
            .cmd("ZREM")
            .arg(self.key("active"))
            .arg(&job.id)
            .cmd("HINCRBY")
            .arg(self.job_key(&job.id))
            .arg("attempts")
            .arg(1)
            .ignore()
            .cmd("HSET")
            .arg(self.job_key(&job.id))
            .arg("reason")
            .arg(reason)
            .arg("failed_at")
            .arg(now)
            .ignore()
            .cmd("ZADD")
            .arg(self.key("failed"))
            .arg(now)
            .arg(&job.id)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Self::ensure_removed(removed, &job.id)
    }

    async fn prune(&self, retention: Duration) -> Result<u64> {
        let cutoff = Utc::now().timestamp_millis()
            - i64::try_from(retention.as_millis()).unwrap_or(i64::MAX / 2);
        let mut conn = self.client.connection();
        let pruned: u64 = Script::new(PRUNE_SCRIPT)
            .key(self.key("failed"))
            .arg(cutoff)
            .arg(self.job_prefix())
            .invoke_async(&mut conn)
            .await?;
        Ok(pruned)
    }

    async fn counts(&self) -> Result<QueueCounts> {
        let mut conn = self.client.connection();
        let (waiting, delayed, active, failed): (u64, u64, u64, u64) = redis::pipe()
            .cmd("LLEN")
            .arg(self.key("wait"))
            .cmd("ZCARD")
            .arg(self.key("delayed"))
            .cmd("ZCARD")
            .arg(self.key("active"))
            .cmd("ZCARD")
            .arg(self.key("failed"))
            .query_async(&mut conn)
            .await?;
        Ok(QueueCounts {
            waiting,
            delayed,
            active,
            failed,
        })
    }

    async fn failed(&self, limit: usize) -> Result<Vec<FailedJob>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.client.connection();
        let ids: Vec<String> = redis::cmd("ZREVRANGE")
            .arg(self.key("failed"))
            .arg(0)
            .arg(limit - 1)
            .query_async(&mut conn)
            .await?;

        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            let (attempts, reason, failed_at): (Option<u32>, Option<String>, Option<i64>) =
                redis::cmd("HMGET")
                    .arg(self.job_key(&id))
                    .arg("attempts")
                    .arg("reason")
                    .arg("failed_at")
                    .query_async(&mut conn)
                    .await?;
            jobs.push(FailedJob {
                id,
                attempts: attempts.unwrap_or(0),
                reason: reason.unwrap_or_default(),
                failed_at: failed_at
                    .and_then(DateTime::from_timestamp_millis)
                    .unwrap_or_else(Utc::now),
            });
        }
        Ok(jobs)
    }
}
