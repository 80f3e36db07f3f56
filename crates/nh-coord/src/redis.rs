//! Redis coordination backend.
//!
//! Every read-then-write is a single server-side Lua script, so each
//! operation is one atomic round trip regardless of how many workers race
//! on a key.

use async_trait::async_trait;
use chrono::Utc;
use nh_common::DelayedMessage;
use redis::aio::ConnectionManager;
use tracing::{debug, warn};

use crate::{
    CoordError, CoordHealth, IdempotencyState, IdempotencyStore, LockAcquire, RateDecision,
    RateLimiter, RateLimits, Result, ScheduledEntry, ScheduledQueue,
};

const IDEM_PREFIX: &str = "nh:idem:";
const BUCKET_PREFIX: &str = "nh:bucket:";
const SCHED_QUEUE_KEY: &str = "nh:sched:queue";
const CLAIM_PREFIX: &str = "nh:sched:claim:";

/// Acquire-or-reject in one round trip. ARGV[1] = processing TTL ms.
const TRY_ACQUIRE_SCRIPT: &str = r#"
    local v = redis.call("GET", KEYS[1])
    if not v then
        redis.call("SET", KEYS[1], "processing", "PX", ARGV[1])
        return "acquired_fresh"
    end
    if v == "failed" then
        redis.call("SET", KEYS[1], "processing", "PX", ARGV[1])
        return "acquired_retry"
    end
    return "rejected"
"#;

/// Lazy refill + take. ARGV = max_tokens, refill_rate (tokens/sec), now_ms.
/// Returns {allowed, retry_after_ms}.
const TOKEN_BUCKET_SCRIPT: &str = r#"
    local b = redis.call("HMGET", KEYS[1], "tokens", "last_refill")
    local max = tonumber(ARGV[1])
    local rate = tonumber(ARGV[2])
    local now = tonumber(ARGV[3])
    local tokens = tonumber(b[1])
    local last = tonumber(b[2])
    if not tokens or not last then
        tokens = max
        last = now
    end
    local elapsed = now - last
    if elapsed > 0 then
        tokens = math.min(max, tokens + elapsed * rate / 1000.0)
    end
    if tokens >= 1 then
        redis.call("HSET", KEYS[1], "tokens", tostring(tokens - 1), "last_refill", tostring(now))
        return {1, 0}
    end
    redis.call("HSET", KEYS[1], "tokens", tostring(tokens), "last_refill", tostring(now))
    local wait = math.ceil((1 - tokens) / rate * 1000)
    return {0, wait}
"#;

/// Remove entry + claim iff the claim is still ours.
/// KEYS = claim key, queue key; ARGV = worker_id, member.
const CONFIRM_SCRIPT: &str = r#"
    if redis.call("GET", KEYS[1]) == ARGV[1] then
        redis.call("ZREM", KEYS[2], ARGV[2])
        redis.call("DEL", KEYS[1])
        return 1
    end
    return 0
"#;

/// Delete the claim iff it is still ours.
const RELEASE_SCRIPT: &str = r#"
    if redis.call("GET", KEYS[1]) == ARGV[1] then
        redis.call("DEL", KEYS[1])
        return 1
    end
    return 0
"#;

/// Swap an entry for its updated form at a new score, dropping any claim.
/// KEYS = claim key, queue key; ARGV = old member, new member, score.
const RE_ADD_SCRIPT: &str = r#"
    redis.call("DEL", KEYS[1])
    redis.call("ZREM", KEYS[2], ARGV[1])
    redis.call("ZADD", KEYS[2], ARGV[3], ARGV[2])
    return 1
"#;

/// Redis coordination backend configuration.
#[derive(Debug, Clone)]
pub struct RedisCoordConfig {
    pub url: String,
    /// TTL of the `processing` idempotency lock.
    pub processing_ttl_ms: u64,
    /// TTL of delivered/failed de-dup records.
    pub idempotency_ttl_ms: u64,
    /// TTL of scheduled-queue claims.
    pub claim_ttl_ms: u64,
    /// Identity written into claim keys.
    pub worker_id: String,
}

impl Default for RedisCoordConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            processing_ttl_ms: 60_000,
            idempotency_ttl_ms: 86_400_000,
            claim_ttl_ms: 30_000,
            worker_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// Redis-backed implementation of every coordination contract.
#[derive(Clone)]
pub struct RedisCoord {
    conn: ConnectionManager,
    config: RedisCoordConfig,
    limits: RateLimits,
}

impl RedisCoord {
    pub async fn connect(config: RedisCoordConfig, limits: RateLimits) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| CoordError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| CoordError::Connection(e.to_string()))?;
        Ok(Self {
            conn,
            config,
            limits,
        })
    }

    fn idem_key(notification_id: &str) -> String {
        format!("{}{}", IDEM_PREFIX, notification_id)
    }

    fn bucket_key(channel: &str) -> String {
        format!("{}{}", BUCKET_PREFIX, channel)
    }

    fn claim_key(notification_id: &str) -> String {
        format!("{}{}", CLAIM_PREFIX, notification_id)
    }
}

#[async_trait]
impl IdempotencyStore for RedisCoord {
    async fn try_acquire(&self, notification_id: &str) -> Result<LockAcquire> {
        let mut conn = self.conn.clone();
        let result: String = redis::Script::new(TRY_ACQUIRE_SCRIPT)
            .key(Self::idem_key(notification_id))
            .arg(self.config.processing_ttl_ms)
            .invoke_async(&mut conn)
            .await?;

        let acquire = match result.as_str() {
            "acquired_fresh" => LockAcquire::AcquiredFresh,
            "acquired_retry" => LockAcquire::AcquiredRetry,
            _ => LockAcquire::Rejected,
        };
        debug!(
            notification_id = %notification_id,
            outcome = ?acquire,
            "Processing lock attempt"
        );
        Ok(acquire)
    }

    async fn set_delivered(&self, notification_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(Self::idem_key(notification_id))
            .arg("delivered")
            .arg("PX")
            .arg(self.config.idempotency_ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_failed(&self, notification_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(Self::idem_key(notification_id))
            .arg("failed")
            .arg("PX")
            .arg(self.config.idempotency_ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, notification_id: &str) -> Result<Option<IdempotencyState>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(Self::idem_key(notification_id))
            .query_async(&mut conn)
            .await?;
        Ok(value.as_deref().and_then(IdempotencyState::parse))
    }
}

#[async_trait]
impl RateLimiter for RedisCoord {
    async fn consume(&self, channel: &str) -> Result<RateDecision> {
        let (max_tokens, refill_rate) = self.limits.for_channel(channel);
        let now_ms = Utc::now().timestamp_millis();

        let mut conn = self.conn.clone();
        let result: Vec<i64> = redis::Script::new(TOKEN_BUCKET_SCRIPT)
            .key(Self::bucket_key(channel))
            .arg(max_tokens)
            .arg(refill_rate)
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await?;

        let allowed = result.first().copied().unwrap_or(0) == 1;
        let retry_after_ms = result.get(1).copied().unwrap_or(0).max(0) as u64;

        if !allowed {
            debug!(
                channel = %channel,
                retry_after_ms = retry_after_ms,
                "Rate limit exceeded"
            );
        }
        Ok(RateDecision {
            allowed,
            retry_after_ms,
        })
    }
}

#[async_trait]
impl ScheduledQueue for RedisCoord {
    async fn add(&self, message: &DelayedMessage) -> Result<()> {
        let member = serde_json::to_string(message)?;
        let score = message.scheduled_at.timestamp_millis();

        let mut conn = self.conn.clone();
        let _: () = redis::cmd("ZADD")
            .arg(SCHED_QUEUE_KEY)
            .arg(score)
            .arg(&member)
            .query_async(&mut conn)
            .await?;

        debug!(
            notification_id = %message.notification_id,
            scheduled_at = %message.scheduled_at,
            "Scheduled entry added"
        );
        Ok(())
    }

    async fn claim_due(&self, limit: u32) -> Result<Vec<ScheduledEntry>> {
        let now_ms = Utc::now().timestamp_millis();
        let mut conn = self.conn.clone();

        let members: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(SCHED_QUEUE_KEY)
            .arg("-inf")
            .arg(now_ms)
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await?;

        let mut claimed = Vec::new();
        for member in members {
            let message: DelayedMessage = match serde_json::from_str(&member) {
                Ok(m) => m,
                Err(e) => {
                    // Unparseable entries can never be processed; drop them
                    warn!(error = %e, "Removing malformed scheduled entry");
                    let _: () = redis::cmd("ZREM")
                        .arg(SCHED_QUEUE_KEY)
                        .arg(&member)
                        .query_async(&mut conn)
                        .await?;
                    continue;
                }
            };

            // SET NX: the claim goes to exactly one worker
            let acquired: Option<String> = redis::cmd("SET")
                .arg(Self::claim_key(&message.notification_id))
                .arg(&self.config.worker_id)
                .arg("NX")
                .arg("PX")
                .arg(self.config.claim_ttl_ms)
                .query_async(&mut conn)
                .await?;

            if acquired.is_some() {
                claimed.push(ScheduledEntry { member, message });
            }
        }

        Ok(claimed)
    }

    async fn confirm_processed(&self, entry: &ScheduledEntry) -> Result<bool> {
        let mut conn = self.conn.clone();
        let result: i32 = redis::Script::new(CONFIRM_SCRIPT)
            .key(Self::claim_key(&entry.message.notification_id))
            .key(SCHED_QUEUE_KEY)
            .arg(&self.config.worker_id)
            .arg(&entry.member)
            .invoke_async(&mut conn)
            .await?;

        if result != 1 {
            warn!(
                notification_id = %entry.message.notification_id,
                "Claim lost before confirm"
            );
        }
        Ok(result == 1)
    }

    async fn release_claim(&self, notification_id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let result: i32 = redis::Script::new(RELEASE_SCRIPT)
            .key(Self::claim_key(notification_id))
            .arg(&self.config.worker_id)
            .invoke_async(&mut conn)
            .await?;
        Ok(result == 1)
    }

    async fn re_add(
        &self,
        entry: &ScheduledEntry,
        updated: &DelayedMessage,
        delay_ms: u64,
    ) -> Result<()> {
        let new_member = serde_json::to_string(updated)?;
        let score = Utc::now().timestamp_millis() + delay_ms as i64;

        let mut conn = self.conn.clone();
        let _: i32 = redis::Script::new(RE_ADD_SCRIPT)
            .key(Self::claim_key(&entry.message.notification_id))
            .key(SCHED_QUEUE_KEY)
            .arg(&entry.member)
            .arg(&new_member)
            .arg(score)
            .invoke_async(&mut conn)
            .await?;

        debug!(
            notification_id = %updated.notification_id,
            delay_ms = delay_ms,
            poller_retries = updated.poller_retries,
            "Scheduled entry re-added"
        );
        Ok(())
    }

    async fn len(&self) -> Result<u64> {
        let mut conn = self.conn.clone();
        let count: u64 = redis::cmd("ZCARD")
            .arg(SCHED_QUEUE_KEY)
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl CoordHealth for RedisCoord {
    async fn ping(&self) -> bool {
        let mut conn = self.conn.clone();
        let result: ::redis::RedisResult<String> =
            redis::cmd("PING").query_async(&mut conn).await;
        result.is_ok()
    }
}
