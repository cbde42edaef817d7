//! Redis buckets for `ratewindow` (companion crate).
//!
//! Each bucket is one sorted set: score = timestamp (ms), member = `"{name}:{random id}"`, one
//! member per weight unit. Admission is a single Lua script that counts every rate's window and
//! inserts only when all of them have room, so concurrent clients never interleave a check with
//! someone else's insert.
//!
//! Bring your own connection: [`RedisBucket`] takes a `ConnectionManager` for the async face,
//! [`SyncRedisBucket`] a blocking `redis::Connection` for the thread face.

use async_trait::async_trait;
use rand::Rng;
use ratewindow::bucket::BucketId;
use ratewindow::rate::validate_rate_list;
use ratewindow::{AsyncBucket, AsyncClock, Bucket, Clock, LimiterError, Rate, RateItem, SystemClock};
use redis::aio::ConnectionManager;
use redis::{ErrorKind, RedisError, Script, ScriptInvocation};
use std::sync::Mutex;
use tracing::{debug, warn};

/// `KEYS[1]` = bucket; `ARGV` = `now, weight, member prefix, limit_1, interval_1, ...`.
/// Returns -1 after inserting, or the 0-based index of the first rate without room.
const PUT_SCRIPT: &str = r#"
local bucket = KEYS[1]
local now = tonumber(ARGV[1])
local weight = tonumber(ARGV[2])
local member = ARGV[3]
for i = 4, #ARGV, 2 do
    local limit = tonumber(ARGV[i])
    local interval = tonumber(ARGV[i + 1])
    local count = redis.call('ZCOUNT', bucket, '(' .. (now - interval), '+inf')
    if limit - count < weight then
        return (i - 4) / 2
    end
end
for j = 1, weight do
    redis.call('ZADD', bucket, now, member .. j)
end
return -1
"#;

fn map_err(err: RedisError) -> LimiterError {
    let transient = err.is_io_error()
        || err.is_timeout()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || matches!(err.kind(), ErrorKind::TryAgain | ErrorKind::BusyLoadingError);
    if transient {
        LimiterError::transient(err)
    } else {
        LimiterError::fatal(err)
    }
}

/// Everything both bucket flavors share: key, rates, script and the last failing rate.
#[derive(Debug)]
struct Keyspace {
    id: BucketId,
    key: String,
    rates: Vec<Rate>,
    script: Script,
    failing: Mutex<Option<Rate>>,
}

impl Keyspace {
    fn new(key: String, rates: Vec<Rate>) -> Result<Self, LimiterError> {
        validate_rate_list(&rates)?;
        if key.is_empty() {
            return Err(LimiterError::InvalidConfig("redis bucket key must not be empty".into()));
        }
        Ok(Self { id: BucketId::next(), key, rates, script: Script::new(PUT_SCRIPT), failing: Mutex::new(None) })
    }

    fn put_invocation(&self, item: &RateItem) -> ScriptInvocation<'_> {
        let unique: u64 = rand::rng().random();
        let mut invocation = self.script.prepare_invoke();
        invocation
            .key(&self.key)
            .arg(item.timestamp())
            .arg(item.weight())
            .arg(format!("{}:{:016x}", item.name(), unique));
        for rate in &self.rates {
            invocation.arg(rate.limit()).arg(rate.interval());
        }
        invocation
    }

    /// Record the script's verdict; returns whether the item was admitted.
    fn settle(&self, code: i64) -> Result<bool, LimiterError> {
        let failing = match code {
            -1 => None,
            idx => Some(*self.rates.get(idx as usize).ok_or_else(|| {
                LimiterError::fatal(format!("admission script returned unknown rate index {}", idx))
            })?),
        };
        *self.failing.lock().unwrap_or_else(|e| e.into_inner()) = failing;
        Ok(failing.is_none())
    }

    fn clear_failing(&self) {
        *self.failing.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn failing(&self) -> Option<Rate> {
        *self.failing.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn leak_bound(&self, now: i64) -> i64 {
        now - self.rates.iter().map(|r| r.interval()).max().unwrap_or(0)
    }

    fn peek_cmd(&self, index: u64) -> redis::Cmd {
        let mut cmd = redis::cmd("ZREVRANGE");
        cmd.arg(&self.key).arg(index).arg(index).arg("WITHSCORES");
        cmd
    }

    fn leak_cmd(&self, now: i64) -> redis::Cmd {
        let mut cmd = redis::cmd("ZREMRANGEBYSCORE");
        cmd.arg(&self.key).arg("-inf").arg(self.leak_bound(now));
        cmd
    }

    fn logged_leak(&self, removed: u64) -> u64 {
        if removed > 0 {
            debug!(target: "ratewindow::redis", key = %self.key, removed, "leaked expired members");
        }
        removed
    }
}

fn to_item(row: Option<(String, f64)>) -> Result<Option<RateItem>, LimiterError> {
    row.map(|(member, score)| {
        let name = member.rsplit_once(':').map(|(name, _)| name).unwrap_or(&member);
        RateItem::new(name, score as i64, 1)
    })
    .transpose()
}

/// Async bucket over a `ConnectionManager` (reconnects transparently).
#[derive(Clone)]
pub struct RedisBucket {
    space: std::sync::Arc<Keyspace>,
    conn: ConnectionManager,
}

impl std::fmt::Debug for RedisBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBucket")
            .field("key", &self.space.key)
            .field("rates", &self.space.rates)
            .field("conn", &"<redis::aio::ConnectionManager>")
            .finish()
    }
}

impl RedisBucket {
    pub fn new(conn: ConnectionManager, key: impl Into<String>, rates: Vec<Rate>) -> Result<Self, LimiterError> {
        Ok(Self { space: std::sync::Arc::new(Keyspace::new(key.into(), rates)?), conn })
    }

    /// Open a client for `url` and wrap it in a connection manager.
    pub async fn connect(url: &str, key: impl Into<String>, rates: Vec<Rate>) -> Result<Self, LimiterError> {
        let client = redis::Client::open(url).map_err(map_err)?;
        let conn = ConnectionManager::new(client).await.map_err(map_err)?;
        Self::new(conn, key, rates)
    }

    pub fn key(&self) -> &str {
        &self.space.key
    }
}

#[async_trait]
impl AsyncBucket for RedisBucket {
    fn id(&self) -> BucketId {
        self.space.id
    }

    fn rates(&self) -> &[Rate] {
        &self.space.rates
    }

    async fn put(&self, item: &RateItem) -> Result<bool, LimiterError> {
        let mut conn = self.conn.clone();
        let code: i64 = self.space.put_invocation(item).invoke_async(&mut conn).await.map_err(map_err)?;
        self.space.settle(code)
    }

    async fn count(&self) -> Result<u64, LimiterError> {
        let mut conn = self.conn.clone();
        redis::cmd("ZCARD").arg(&self.space.key).query_async(&mut conn).await.map_err(map_err)
    }

    async fn peek(&self, index: u64) -> Result<Option<RateItem>, LimiterError> {
        let mut conn = self.conn.clone();
        let rows: Vec<(String, f64)> = self.space.peek_cmd(index).query_async(&mut conn).await.map_err(map_err)?;
        to_item(rows.into_iter().next())
    }

    async fn leak(&self, now: i64) -> Result<u64, LimiterError> {
        let mut conn = self.conn.clone();
        let removed: u64 = self.space.leak_cmd(now).query_async(&mut conn).await.map_err(map_err)?;
        Ok(self.space.logged_leak(removed))
    }

    async fn flush(&self) -> Result<(), LimiterError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL").arg(&self.space.key).query_async(&mut conn).await.map_err(map_err)?;
        self.space.clear_failing();
        Ok(())
    }

    fn failing_rate(&self) -> Option<Rate> {
        self.space.failing()
    }
}

/// Blocking bucket over a single `redis::Connection`, for the thread face.
pub struct SyncRedisBucket {
    space: Keyspace,
    conn: Mutex<redis::Connection>,
}

impl std::fmt::Debug for SyncRedisBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncRedisBucket")
            .field("key", &self.space.key)
            .field("rates", &self.space.rates)
            .field("conn", &"<redis::Connection>")
            .finish()
    }
}

impl SyncRedisBucket {
    pub fn new(conn: redis::Connection, key: impl Into<String>, rates: Vec<Rate>) -> Result<Self, LimiterError> {
        Ok(Self { space: Keyspace::new(key.into(), rates)?, conn: Mutex::new(conn) })
    }

    pub fn connect(url: &str, key: impl Into<String>, rates: Vec<Rate>) -> Result<Self, LimiterError> {
        let conn = redis::Client::open(url).and_then(|c| c.get_connection()).map_err(map_err)?;
        Self::new(conn, key, rates)
    }

    pub fn key(&self) -> &str {
        &self.space.key
    }

    fn query<T: redis::FromRedisValue>(&self, cmd: &redis::Cmd) -> Result<T, LimiterError> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        cmd.query(&mut *conn).map_err(map_err)
    }
}

impl Bucket for SyncRedisBucket {
    fn id(&self) -> BucketId {
        self.space.id
    }

    fn rates(&self) -> &[Rate] {
        &self.space.rates
    }

    fn put(&self, item: &RateItem) -> Result<bool, LimiterError> {
        let code: i64 = {
            let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
            self.space.put_invocation(item).invoke(&mut *conn).map_err(map_err)?
        };
        self.space.settle(code)
    }

    fn count(&self) -> Result<u64, LimiterError> {
        self.query(redis::cmd("ZCARD").arg(&self.space.key))
    }

    fn peek(&self, index: u64) -> Result<Option<RateItem>, LimiterError> {
        let rows: Vec<(String, f64)> = self.query(&self.space.peek_cmd(index))?;
        to_item(rows.into_iter().next())
    }

    fn leak(&self, now: i64) -> Result<u64, LimiterError> {
        let removed: u64 = self.query(&self.space.leak_cmd(now))?;
        Ok(self.space.logged_leak(removed))
    }

    fn flush(&self) -> Result<(), LimiterError> {
        let _: i64 = self.query(redis::cmd("DEL").arg(&self.space.key))?;
        self.space.clear_failing();
        Ok(())
    }

    fn failing_rate(&self) -> Option<Rate> {
        self.space.failing()
    }
}

/// Clock read from the Redis server (`TIME`), in epoch milliseconds.
///
/// Falls back to a local [`SystemClock`] when the command fails.
#[derive(Clone)]
pub struct RedisClock {
    conn: ConnectionManager,
    fallback: std::sync::Arc<SystemClock>,
}

impl std::fmt::Debug for RedisClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisClock").field("conn", &"<redis::aio::ConnectionManager>").finish()
    }
}

impl RedisClock {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn, fallback: std::sync::Arc::new(SystemClock::new()) }
    }
}

#[async_trait]
impl AsyncClock for RedisClock {
    async fn now_millis(&self) -> i64 {
        let mut conn = self.conn.clone();
        let time: Result<(i64, i64), RedisError> = redis::cmd("TIME").query_async(&mut conn).await;
        match time {
            Ok((secs, micros)) => secs * 1_000 + micros / 1_000,
            Err(err) => {
                warn!(target: "ratewindow::redis", error = %err, "redis TIME failed; using local time");
                self.fallback.now_millis()
            }
        }
    }
}
