//! In-process coordination backend for embedded runs and tests.
//!
//! One mutex guards all state, so every operation is trivially atomic.
//! TTLs are honored by checking expiry on read.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use nh_common::DelayedMessage;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::{
    CoordHealth, IdempotencyState, IdempotencyStore, LockAcquire, RateDecision, RateLimiter,
    RateLimits, Result, ScheduledEntry, ScheduledQueue,
};

#[derive(Debug, Clone)]
struct IdemRecord {
    state: IdempotencyState,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Bucket {
    tokens: f64,
    last_refill_ms: i64,
}

#[derive(Debug, Clone)]
struct Claim {
    worker_id: String,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct CoordState {
    idem: HashMap<String, IdemRecord>,
    buckets: HashMap<String, Bucket>,
    /// (score epoch-ms, member) pairs, scanned in score order.
    queue: Vec<(i64, String)>,
    claims: HashMap<String, Claim>,
}

/// In-process coordination backend configuration.
#[derive(Debug, Clone)]
pub struct MemoryCoordConfig {
    pub processing_ttl_ms: u64,
    pub idempotency_ttl_ms: u64,
    pub claim_ttl_ms: u64,
    pub worker_id: String,
}

impl Default for MemoryCoordConfig {
    fn default() -> Self {
        Self {
            processing_ttl_ms: 60_000,
            idempotency_ttl_ms: 86_400_000,
            claim_ttl_ms: 30_000,
            worker_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// Mutex-guarded implementation of every coordination contract.
#[derive(Clone)]
pub struct MemoryCoord {
    state: Arc<Mutex<CoordState>>,
    config: MemoryCoordConfig,
    limits: RateLimits,
}

impl MemoryCoord {
    pub fn new(config: MemoryCoordConfig, limits: RateLimits) -> Self {
        Self {
            state: Arc::new(Mutex::new(CoordState::default())),
            config,
            limits,
        }
    }

    /// A second handle over the same state acting as a different worker.
    /// Lets tests exercise claim contention without a second process.
    pub fn for_worker(&self, worker_id: impl Into<String>) -> Self {
        let mut clone = self.clone();
        clone.config.worker_id = worker_id.into();
        clone
    }

    fn live_state(record: &IdemRecord, now: DateTime<Utc>) -> Option<IdempotencyState> {
        (record.expires_at > now).then_some(record.state)
    }
}

#[async_trait]
impl IdempotencyStore for MemoryCoord {
    async fn try_acquire(&self, notification_id: &str) -> Result<LockAcquire> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let current = state
            .idem
            .get(notification_id)
            .and_then(|r| Self::live_state(r, now));

        let acquire = match current {
            None => LockAcquire::AcquiredFresh,
            Some(IdempotencyState::Failed) => LockAcquire::AcquiredRetry,
            Some(_) => return Ok(LockAcquire::Rejected),
        };

        state.idem.insert(
            notification_id.to_string(),
            IdemRecord {
                state: IdempotencyState::Processing,
                expires_at: now + ChronoDuration::milliseconds(self.config.processing_ttl_ms as i64),
            },
        );
        Ok(acquire)
    }

    async fn set_delivered(&self, notification_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.idem.insert(
            notification_id.to_string(),
            IdemRecord {
                state: IdempotencyState::Delivered,
                expires_at: Utc::now()
                    + ChronoDuration::milliseconds(self.config.idempotency_ttl_ms as i64),
            },
        );
        Ok(())
    }

    async fn set_failed(&self, notification_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.idem.insert(
            notification_id.to_string(),
            IdemRecord {
                state: IdempotencyState::Failed,
                expires_at: Utc::now()
                    + ChronoDuration::milliseconds(self.config.idempotency_ttl_ms as i64),
            },
        );
        Ok(())
    }

    async fn get(&self, notification_id: &str) -> Result<Option<IdempotencyState>> {
        let now = Utc::now();
        let state = self.state.lock();
        Ok(state
            .idem
            .get(notification_id)
            .and_then(|r| Self::live_state(r, now)))
    }
}

#[async_trait]
impl RateLimiter for MemoryCoord {
    async fn consume(&self, channel: &str) -> Result<RateDecision> {
        let (max_tokens, refill_rate) = self.limits.for_channel(channel);
        let now_ms = Utc::now().timestamp_millis();

        let mut state = self.state.lock();
        let bucket = state
            .buckets
            .entry(channel.to_string())
            .or_insert_with(|| Bucket {
                tokens: max_tokens as f64,
                last_refill_ms: now_ms,
            });

        let elapsed = (now_ms - bucket.last_refill_ms).max(0) as f64;
        bucket.tokens = (bucket.tokens + elapsed * refill_rate / 1000.0).min(max_tokens as f64);
        bucket.last_refill_ms = now_ms;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(RateDecision {
                allowed: true,
                retry_after_ms: 0,
            })
        } else {
            Ok(RateDecision {
                allowed: false,
                retry_after_ms: crate::retry_after_ms(bucket.tokens, refill_rate),
            })
        }
    }
}

#[async_trait]
impl ScheduledQueue for MemoryCoord {
    async fn add(&self, message: &DelayedMessage) -> Result<()> {
        let member = serde_json::to_string(message)?;
        let score = message.scheduled_at.timestamp_millis();
        let mut state = self.state.lock();
        state.queue.push((score, member));
        state.queue.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(())
    }

    async fn claim_due(&self, limit: u32) -> Result<Vec<ScheduledEntry>> {
        let now = Utc::now();
        let now_ms = now.timestamp_millis();
        let mut state = self.state.lock();

        let due: Vec<String> = state
            .queue
            .iter()
            .filter(|(score, _)| *score <= now_ms)
            .take(limit as usize)
            .map(|(_, member)| member.clone())
            .collect();

        let mut claimed = Vec::new();
        for member in due {
            let message: DelayedMessage = match serde_json::from_str(&member) {
                Ok(m) => m,
                Err(_) => {
                    state.queue.retain(|(_, m)| m != &member);
                    continue;
                }
            };

            let claim_live = state
                .claims
                .get(&message.notification_id)
                .map(|c| c.expires_at > now)
                .unwrap_or(false);
            if claim_live {
                continue;
            }

            state.claims.insert(
                message.notification_id.clone(),
                Claim {
                    worker_id: self.config.worker_id.clone(),
                    expires_at: now + ChronoDuration::milliseconds(self.config.claim_ttl_ms as i64),
                },
            );
            claimed.push(ScheduledEntry { member, message });
        }

        Ok(claimed)
    }

    async fn confirm_processed(&self, entry: &ScheduledEntry) -> Result<bool> {
        let now = Utc::now();
        let mut state = self.state.lock();

        let owns = state
            .claims
            .get(&entry.message.notification_id)
            .map(|c| c.worker_id == self.config.worker_id && c.expires_at > now)
            .unwrap_or(false);
        if !owns {
            return Ok(false);
        }

        state.queue.retain(|(_, m)| m != &entry.member);
        state.claims.remove(&entry.message.notification_id);
        Ok(true)
    }

    async fn release_claim(&self, notification_id: &str) -> Result<bool> {
        let mut state = self.state.lock();
        let owns = state
            .claims
            .get(notification_id)
            .map(|c| c.worker_id == self.config.worker_id)
            .unwrap_or(false);
        if owns {
            state.claims.remove(notification_id);
        }
        Ok(owns)
    }

    async fn re_add(
        &self,
        entry: &ScheduledEntry,
        updated: &DelayedMessage,
        delay_ms: u64,
    ) -> Result<()> {
        let new_member = serde_json::to_string(updated)?;
        let score = Utc::now().timestamp_millis() + delay_ms as i64;

        let mut state = self.state.lock();
        state.claims.remove(&entry.message.notification_id);
        state.queue.retain(|(_, m)| m != &entry.member);
        state.queue.push((score, new_member));
        state.queue.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(())
    }

    async fn len(&self) -> Result<u64> {
        Ok(self.state.lock().queue.len() as u64)
    }
}

#[async_trait]
impl CoordHealth for MemoryCoord {
    async fn ping(&self) -> bool {
        true
    }
}
