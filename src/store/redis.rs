//! Redis-backed stores
//!
//! One [`ConnectionManager`] is shared by the response cache, the rate-limit
//! windows and the log queue. It reconnects on its own after a dropped
//! connection; individual commands issued while disconnected fail and are
//! handled by each caller's fault policy.

use std::time::Duration;

use async_trait::async_trait;
use redis::{Client, Script, aio::ConnectionManager};
use tracing::debug;

use super::{KvStore, SlideOutcome, SlideRequest, WindowStore};
use crate::{Error, Result};

/// Keys returned per SCAN round-trip
const SCAN_COUNT: usize = 100;

/// Purge, count and conditionally record in one server-side step.
///
/// Returns `{admitted, count, oldest}` where `oldest` is the timestamp of the
/// oldest surviving entry when rejected.
const SLIDE_SCRIPT: &str = r"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local member = ARGV[4]
local expiry = tonumber(ARGV[5])

redis.call('ZREMRANGEBYSCORE', key, 0, now - window)
local count = redis.call('ZCARD', key)
if count >= limit then
  local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
  local ts = now
  if oldest[2] then
    ts = tonumber(oldest[2])
  end
  return {0, count, ts}
end

redis.call('ZADD', key, now, member)
redis.call('EXPIRE', key, expiry)
return {1, count, now}
";

/// Shared Redis connection
#[derive(Clone)]
pub struct RedisClient {
    conn: ConnectionManager,
}

impl RedisClient {
    /// Connect to `url` (`redis://` or `rediss://`)
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url)
            .map_err(|e| Error::Config(format!("Invalid Redis URL: {e}")))?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    /// A handle on the managed connection; cheap to clone
    pub(crate) fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }

    /// Round-trip a PING
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.connection();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl KvStore for RedisClient {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.connection();
        let seconds = ttl.as_secs().max(1);
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(seconds)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection();
        let removed: u64 = redis::cmd("DEL").arg(keys).query_async(&mut conn).await?;
        Ok(removed)
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.connection();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        // SCAN may return a key more than once
        keys.sort_unstable();
        keys.dedup();
        debug!(pattern, matched = keys.len(), "Scanned key space");
        Ok(keys)
    }
}

#[async_trait]
impl WindowStore for RedisClient {
    async fn slide(&self, request: &SlideRequest) -> Result<SlideOutcome> {
        let mut conn = self.connection();
        let (admitted, count, oldest): (i64, u64, i64) = Script::new(SLIDE_SCRIPT)
            .key(&request.key)
            .arg(request.now_ms)
            .arg(request.window_ms)
            .arg(request.limit)
            .arg(&request.member)
            .arg(request.expiry.as_secs().max(1))
            .invoke_async(&mut conn)
            .await?;

        let admitted = admitted == 1;
        Ok(SlideOutcome {
            admitted,
            count,
            oldest_ms: (!admitted).then_some(oldest),
        })
    }
}
