use super::{AdmitOutcome, StateStore, StoreError, StoreResult};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::time::Duration;
use uuid::Uuid;

/// Admit script (§4.1 "Remote back-end"): remove expired members, count,
/// and conditionally add — all in one round trip so the decision is
/// atomic under concurrent callers for the same key. Mirrors the
/// ZREMRANGEBYSCORE / ZADD NX / ZCOUNT / EXPIRE sequence used by Redis
/// sliding-window limiters (see DESIGN.md), folded into a single EVAL so
/// no WATCH/MULTI/EXEC round trip is needed.
const ADMIT_SCRIPT: &str = r#"
local key = KEYS[1]
local now_ms = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])
local max = tonumber(ARGV[3])
local member = ARGV[4]
local ttl_secs = tonumber(ARGV[5])

redis.call('ZREMRANGEBYSCORE', key, '-inf', now_ms - window_ms)
local pre_count = redis.call('ZCARD', key)

if pre_count < max then
    redis.call('ZADD', key, now_ms, member)
    redis.call('EXPIRE', key, ttl_secs)
    return {1, pre_count, pre_count + 1}
else
    return {0, pre_count, pre_count}
end
"#;

const ACTIVE_IP_SCRIPT: &str = r#"
local key = KEYS[1]
local member = ARGV[1]
local now_ms = tonumber(ARGV[2])
local window_ms = tonumber(ARGV[3])
local ttl_secs = tonumber(ARGV[4])

redis.call('ZREMRANGEBYSCORE', key, '-inf', now_ms - window_ms)
redis.call('ZADD', key, now_ms, member)
redis.call('EXPIRE', key, ttl_secs)
return redis.call('ZCARD', key)
"#;

/// Read-only counterpart of `ACTIVE_IP_SCRIPT` for the periodic hysteresis
/// sweep (§5): prunes expired members and counts, without adding one.
const ACTIVE_IP_COUNT_SCRIPT: &str = r#"
local key = KEYS[1]
local now_ms = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])

redis.call('ZREMRANGEBYSCORE', key, '-inf', now_ms - window_ms)
return redis.call('ZCARD', key)
"#;

/// Bound on the admit-script retry loop (§4.1 / §5): one retry for
/// transport-class errors, never for timeouts or business-logic results.
const ADMIT_TRANSPORT_RETRIES: u32 = 1;
const ADMIT_RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Remote `StateStore` back-end (§4.1 "Remote back-end"): ordered sets keyed
/// per identity, scored by millisecond timestamp, admitted via a
/// server-side atomic script. Flags are plain Redis strings with `SET ...
/// EX`. Every call is wrapped in the timeouts from §5 ("Store scalar ops
/// 300 ms; Store admit script 500 ms").
pub struct RemoteStore {
    conn: ConnectionManager,
    admit_script: Script,
    active_ip_script: Script,
    active_ip_count_script: Script,
    admit_timeout: Duration,
    scalar_timeout: Duration,
}

impl RemoteStore {
    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            admit_script: Script::new(ADMIT_SCRIPT),
            active_ip_script: Script::new(ACTIVE_IP_SCRIPT),
            active_ip_count_script: Script::new(ACTIVE_IP_COUNT_SCRIPT),
            admit_timeout: Duration::from_millis(500),
            scalar_timeout: Duration::from_millis(300),
        })
    }

    fn map_err(e: redis::RedisError) -> StoreError {
        if e.is_timeout() {
            StoreError::Timeout
        } else {
            StoreError::Transport(e.to_string())
        }
    }

    async fn with_timeout<T, F>(&self, timeout: Duration, fut: F) -> StoreResult<T>
    where
        F: std::future::Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(timeout, fut).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(Self::map_err(e)),
            Err(_) => Err(StoreError::Timeout),
        }
    }
}

#[async_trait]
impl StateStore for RemoteStore {
    async fn sliding_window_admit(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        max: u64,
    ) -> StoreResult<AdmitOutcome> {
        // Unique member suffix so two events at the same millisecond both
        // survive in the ordered set (§4.2 "Numeric semantics").
        let member = format!("{now_ms}:{}", Uuid::new_v4());
        let ttl_secs = (window_ms / 1000).max(1) + 5;

        let mut conn = self.conn.clone();
        let mut attempt = 0u32;
        let values: Vec<i64> = loop {
            let result: StoreResult<Vec<i64>> = self
                .with_timeout(
                    self.admit_timeout,
                    self.admit_script
                        .key(key)
                        .arg(now_ms)
                        .arg(window_ms)
                        .arg(max)
                        .arg(&member)
                        .arg(ttl_secs)
                        .invoke_async(&mut conn),
                )
                .await;

            match result {
                Ok(values) => break values,
                Err(StoreError::Transport(msg)) if attempt < ADMIT_TRANSPORT_RETRIES => {
                    attempt += 1;
                    tracing::warn!(error = %msg, attempt, "admission: admit-script transport error, retrying");
                    tokio::time::sleep(ADMIT_RETRY_BASE_DELAY * attempt).await;
                    continue;
                }
                Err(e) => return Err(e),
            }
        };

        let (admitted, pre, post) = (values[0], values[1], values[2]);
        Ok(AdmitOutcome {
            admitted: admitted == 1,
            pre_count: pre.max(0) as u64,
            post_count: post.max(0) as u64,
        })
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        self.with_timeout(self.scalar_timeout, conn.get(key)).await
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let secs = ttl.as_secs().max(1);
        self.with_timeout(
            self.scalar_timeout,
            conn.set_ex(key, value, secs),
        )
        .await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: StoreResult<i64> = self.with_timeout(self.scalar_timeout, conn.del(key)).await;
        Ok(())
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        self.with_timeout(self.scalar_timeout, conn.exists(key)).await
    }

    async fn track_active_ip(
        &self,
        key: &str,
        member: &str,
        now_ms: u64,
        window: Duration,
    ) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        let ttl_secs = window.as_secs().max(1) + 5;
        let count: i64 = self
            .with_timeout(
                self.admit_timeout,
                self.active_ip_script
                    .key(key)
                    .arg(member)
                    .arg(now_ms)
                    .arg(window.as_millis() as u64)
                    .arg(ttl_secs)
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn active_ip_count(&self, key: &str, now_ms: u64, window: Duration) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        let count: i64 = self
            .with_timeout(
                self.scalar_timeout,
                self.active_ip_count_script
                    .key(key)
                    .arg(now_ms)
                    .arg(window.as_millis() as u64)
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: String = self
            .with_timeout(self.scalar_timeout, redis::cmd("PING").query_async(&mut conn))
            .await?;
        Ok(())
    }
}
