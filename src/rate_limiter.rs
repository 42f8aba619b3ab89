//! Shared write-bandwidth limiter.
//!
//! Partitions of one node may share a [`RateLimiter`] so that their combined
//! storage writes stay under a node-wide byte rate. The driver asks for quota
//! before every write batch and sleeps for the returned delay when denied.
//!
//! [`TokenBucketLimiter`] is the in-process implementation:
//!
//! - Starts with a full bucket of `burst` bytes, refilled at `rate` bytes/s
//! - Tokens are refilled on demand; there is no background task
//! - A request larger than the whole bucket is granted once the bucket is full,
//!   driving it negative, so oversized batches are delayed but never starved

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;

/// Answer to a quota request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaGrant {
    Granted,
    Denied(Duration),
}

#[async_trait::async_trait]
pub trait RateLimiter: Send + Sync {
    /// Asks for `bytes` of write bandwidth.
    async fn request_quota(&self, bytes: u64) -> QuotaGrant;
}

/// Grants every request.
#[derive(Debug, Default)]
pub struct Unlimited;

#[async_trait::async_trait]
impl RateLimiter for Unlimited {
    async fn request_quota(&self, _bytes: u64) -> QuotaGrant {
        QuotaGrant::Granted
    }
}

#[derive(Debug)]
struct Refill {
    last: Instant,
    rate: f64,
}

/// Token bucket over bytes, with the balance kept in milli-bytes.
#[derive(Debug)]
pub struct TokenBucketLimiter {
    tokens: AtomicI64,
    capacity: i64,
    refill: RwLock<Refill>,
}

impl TokenBucketLimiter {
    pub fn new(bytes_per_second: u64, burst: u64) -> Self {
        let capacity = (burst.max(1) as i64).saturating_mul(1000);
        Self {
            tokens: AtomicI64::new(capacity),
            capacity,
            refill: RwLock::new(Refill {
                last: Instant::now(),
                rate: bytes_per_second.max(1) as f64,
            }),
        }
    }

    /// Current rate in bytes per second.
    pub async fn rate(&self) -> f64 {
        self.refill.read().await.rate
    }

    /// Changes the refill rate; tokens earned so far are kept.
    pub async fn set_rate(&self, bytes_per_second: u64) {
        self.refill_tokens().await;
        self.refill.write().await.rate = bytes_per_second.max(1) as f64;
    }

    /// Bytes currently available; negative while an oversized grant is paid off.
    pub fn available(&self) -> f64 {
        self.tokens.load(Ordering::Acquire) as f64 / 1000.0
    }

    async fn refill_tokens(&self) {
        let mut refill = self.refill.write().await;
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(refill.last);
        let earned = (refill.rate * elapsed.as_secs_f64() * 1000.0) as i64;
        if earned == 0 {
            return;
        }
        refill.last = now;

        let capacity = self.capacity;
        let _ = self
            .tokens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_add(earned).min(capacity))
            });
    }

    /// Time until the bucket holds `needed` milli-bytes again.
    async fn wait_for(&self, needed: i64) -> Duration {
        let rate = self.refill.read().await.rate;
        let missing = needed - self.tokens.load(Ordering::Acquire);
        let secs = missing.max(0) as f64 / (rate * 1000.0);
        Duration::from_secs_f64(secs).max(Duration::from_millis(1))
    }
}

#[async_trait::async_trait]
impl RateLimiter for TokenBucketLimiter {
    async fn request_quota(&self, bytes: u64) -> QuotaGrant {
        self.refill_tokens().await;

        let cost = (bytes as i64).saturating_mul(1000);
        // Oversized requests wait for a full bucket instead of the whole cost.
        let needed = cost.min(self.capacity);
        let granted = self
            .tokens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current >= needed).then(|| current - cost)
            })
            .is_ok();

        if granted {
            QuotaGrant::Granted
        } else {
            let delay = self.wait_for(needed).await;
            tracing::debug!(bytes, delay_ms = delay.as_millis() as u64, "Write quota denied");
            QuotaGrant::Denied(delay)
        }
    }
}
