//! Coordination store contracts: idempotency locks, token-bucket rate
//! limits, and the scheduled-delivery queue.
//!
//! Every multi-step read-then-write here is atomic against the backend.
//! The Redis implementation uses server-side scripts; the in-process
//! implementation holds one lock across each operation. Either way the
//! pre/post conditions hold under concurrent workers.

use async_trait::async_trait;
use nh_common::DelayedMessage;
use std::collections::HashMap;
use thiserror::Error;

pub mod memory;
pub mod redis;

pub use memory::{MemoryCoord, MemoryCoordConfig};
pub use self::redis::{RedisCoord, RedisCoordConfig};

#[derive(Error, Debug)]
pub enum CoordError {
    #[error("Redis error: {0}")]
    Redis(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Connection error: {0}")]
    Connection(String),
}

impl From<::redis::RedisError> for CoordError {
    fn from(e: ::redis::RedisError) -> Self {
        CoordError::Redis(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CoordError>;

// ============================================================================
// Idempotency store
// ============================================================================

/// Logical state of a notification's idempotency record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdempotencyState {
    Processing,
    Delivered,
    Failed,
}

impl IdempotencyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdempotencyState::Processing => "processing",
            IdempotencyState::Delivered => "delivered",
            IdempotencyState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "processing" => Some(IdempotencyState::Processing),
            "delivered" => Some(IdempotencyState::Delivered),
            "failed" => Some(IdempotencyState::Failed),
            _ => None,
        }
    }
}

/// Outcome of a processing-lock acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAcquire {
    /// No record existed; this is the first attempt.
    AcquiredFresh,
    /// A `failed` record was overwritten; this is a retry attempt.
    AcquiredRetry,
    /// Another worker is processing, or the notification already delivered.
    Rejected,
}

/// Per-notification delivery lock with a short processing lease and a long
/// delivered/failed de-dup window.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Atomically acquire the processing lock for a notification.
    async fn try_acquire(&self, notification_id: &str) -> Result<LockAcquire>;

    /// Record terminal delivery with the long TTL.
    async fn set_delivered(&self, notification_id: &str) -> Result<()>;

    /// Record terminal failure with the long TTL. Also releases the
    /// processing lock so a scheduled retry can re-acquire.
    async fn set_failed(&self, notification_id: &str) -> Result<()>;

    /// Current state, if any record exists. Used by the reconciler.
    async fn get(&self, notification_id: &str) -> Result<Option<IdempotencyState>>;
}

// ============================================================================
// Rate limiter
// ============================================================================

/// Result of a token-bucket take attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// When not allowed: how long until a token will be available.
    pub retry_after_ms: u64,
}

/// Per-channel rate limits: `(max_tokens, refill_rate tokens/sec)`.
#[derive(Debug, Clone, Default)]
pub struct RateLimits {
    limits: HashMap<String, (u32, f64)>,
    default: (u32, f64),
}

impl RateLimits {
    pub fn new(default_max_tokens: u32, default_refill_rate: f64) -> Self {
        Self {
            limits: HashMap::new(),
            default: (default_max_tokens, default_refill_rate),
        }
    }

    pub fn set(&mut self, channel: impl Into<String>, max_tokens: u32, refill_rate: f64) {
        self.limits.insert(channel.into(), (max_tokens, refill_rate));
    }

    pub fn for_channel(&self, channel: &str) -> (u32, f64) {
        self.limits.get(channel).copied().unwrap_or(self.default)
    }
}

/// Token bucket refilled continuously at the channel's refill rate.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Atomically refill and take one token for the channel.
    async fn consume(&self, channel: &str) -> Result<RateDecision>;
}

/// Retry delay for a bucket with `tokens` available at `refill_rate`/s.
pub(crate) fn retry_after_ms(tokens_available: f64, refill_rate: f64) -> u64 {
    ((1.0 - tokens_available) / refill_rate * 1000.0).ceil().max(0.0) as u64
}

// ============================================================================
// Scheduled queue
// ============================================================================

/// A claimed scheduled-queue entry. `member` is the exact serialized form
/// stored in the queue; confirm and re-add address the entry by it.
#[derive(Debug, Clone)]
pub struct ScheduledEntry {
    pub member: String,
    pub message: DelayedMessage,
}

/// Time-ordered queue with two-phase claim/confirm semantics.
///
/// An entry is removed only after its downstream publish is acknowledged;
/// a worker that dies mid-processing loses its claim to the TTL and another
/// worker retakes the entry.
#[async_trait]
pub trait ScheduledQueue: Send + Sync {
    /// Insert with score = `message.scheduled_at`.
    async fn add(&self, message: &DelayedMessage) -> Result<()>;

    /// Claim up to `limit` due entries for this worker. Entries remain in
    /// the queue; only the claim key marks them taken.
    async fn claim_due(&self, limit: u32) -> Result<Vec<ScheduledEntry>>;

    /// Remove an entry and its claim, iff this worker still holds the
    /// claim. Returns false if the claim was lost.
    async fn confirm_processed(&self, entry: &ScheduledEntry) -> Result<bool>;

    /// Release the claim without removing the entry, allowing immediate
    /// retake by any worker.
    async fn release_claim(&self, notification_id: &str) -> Result<bool>;

    /// Replace an entry with an updated message scheduled `delay_ms` from
    /// now, deleting any claim.
    async fn re_add(
        &self,
        entry: &ScheduledEntry,
        updated: &DelayedMessage,
        delay_ms: u64,
    ) -> Result<()>;

    /// Number of entries in the queue (diagnostics).
    async fn len(&self) -> Result<u64>;
}

// ============================================================================
// Health
// ============================================================================

/// Liveness probe for the coordination store; the reconciler refuses to run
/// against an unhealthy backend.
#[async_trait]
pub trait CoordHealth: Send + Sync {
    async fn ping(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_after_ms() {
        // Empty bucket at 0.5 tokens/sec: 2s to the next token
        assert_eq!(retry_after_ms(0.0, 0.5), 2000);
        // Half a token available: 1s more
        assert_eq!(retry_after_ms(0.5, 0.5), 1000);
        // 1 token/sec
        assert_eq!(retry_after_ms(0.0, 1.0), 1000);
    }

    #[test]
    fn test_rate_limits_fallback() {
        let mut limits = RateLimits::new(100, 10.0);
        limits.set("email", 1, 0.5);
        assert_eq!(limits.for_channel("email"), (1, 0.5));
        assert_eq!(limits.for_channel("sms"), (100, 10.0));
    }

    #[test]
    fn test_idempotency_state_parse() {
        assert_eq!(
            IdempotencyState::parse("processing"),
            Some(IdempotencyState::Processing)
        );
        assert_eq!(IdempotencyState::parse("bogus"), None);
        for state in [
            IdempotencyState::Processing,
            IdempotencyState::Delivered,
            IdempotencyState::Failed,
        ] {
            assert_eq!(IdempotencyState::parse(state.as_str()), Some(state));
        }
    }
}
