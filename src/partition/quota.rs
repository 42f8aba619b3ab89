//! Sliding-window write quota.
//!
//! The window is divided into a fixed number of equal buckets. Admitted bytes
//! are added to the bucket covering the current time; buckets that fall out of
//! the window are evicted lazily on every query. Reservations hold budget for
//! multi-part writes until they are consumed, released or time out.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::config::QuotaConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    Admitted,
    Throttled(Duration),
}

#[derive(Debug)]
struct Bucket {
    index: u64,
    bytes: u64,
}

#[derive(Debug)]
struct Reservation {
    bytes: u64,
    expires_at: Instant,
}

#[derive(Debug)]
pub struct WriteQuotaTracker {
    budget: Option<u64>,
    window: Duration,
    bucket_width: Duration,
    bucket_count: u64,
    reservation_timeout: Duration,
    origin: Instant,
    buckets: VecDeque<Bucket>,
    reservations: HashMap<u64, Reservation>,
    last_admission: Instant,
}

impl WriteQuotaTracker {
    pub fn new(config: &QuotaConfig, now: Instant) -> Self {
        let bucket_count = config.buckets.max(1) as u64;
        Self {
            budget: config.window_budget(),
            window: config.window,
            bucket_width: config.window / bucket_count as u32,
            bucket_count,
            reservation_timeout: config.reservation_timeout,
            origin: now,
            buckets: VecDeque::new(),
            reservations: HashMap::new(),
            last_admission: now,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.budget.is_some()
    }

    /// Bytes admitted or reserved within the current window.
    pub fn used(&mut self, now: Instant) -> u64 {
        self.evict(now);
        self.admitted() + self.reserved()
    }

    /// Admits `bytes` if the window has room for them.
    pub fn try_admit(&mut self, bytes: u64, now: Instant) -> QuotaDecision {
        let decision = self.check(bytes, now);
        if decision == QuotaDecision::Admitted {
            self.record(bytes, now);
        }
        decision
    }

    /// Holds `bytes` of budget under `cookie` until consumed or released.
    pub fn reserve(&mut self, cookie: u64, bytes: u64, now: Instant) -> QuotaDecision {
        let decision = self.check(bytes, now);
        if decision == QuotaDecision::Admitted && self.is_enabled() {
            self.last_admission = now;
            self.reservations.insert(
                cookie,
                Reservation {
                    bytes,
                    expires_at: now + self.reservation_timeout,
                },
            );
        }
        decision
    }

    /// Returns the budget held by `cookie`.
    pub fn release(&mut self, cookie: u64) -> bool {
        self.reservations.remove(&cookie).is_some()
    }

    /// Converts a reservation into `bytes` of admitted writes. Bytes beyond
    /// the reserved amount must fit the window like any other write; when
    /// they don't, the reservation is kept. Returns `None` if the reservation
    /// does not exist (or expired).
    pub fn consume(&mut self, cookie: u64, bytes: u64, now: Instant) -> Option<QuotaDecision> {
        self.evict(now);
        let reservation = self.reservations.remove(&cookie)?;
        if bytes > reservation.bytes {
            // With the reservation removed, checking all of `bytes` checks the excess.
            if let QuotaDecision::Throttled(retry_after) = self.check(bytes, now) {
                self.reservations.insert(cookie, reservation);
                return Some(QuotaDecision::Throttled(retry_after));
            }
        }
        self.record(bytes, now);
        Some(QuotaDecision::Admitted)
    }

    /// Earliest reservation expiry, for timely release.
    pub fn next_expiry(&self) -> Option<Instant> {
        self.reservations.values().map(|r| r.expires_at).min()
    }

    fn check(&mut self, bytes: u64, now: Instant) -> QuotaDecision {
        let budget = match self.budget {
            Some(budget) => budget,
            None => return QuotaDecision::Admitted,
        };
        self.evict(now);

        let used = self.admitted() + self.reserved();
        if used + bytes <= budget {
            return QuotaDecision::Admitted;
        }

        if bytes > budget {
            // Larger than a whole window: needs a full quiet window.
            let quiet_since = now.saturating_duration_since(self.last_admission);
            if used == 0 && quiet_since >= self.window {
                return QuotaDecision::Admitted;
            }
            let quiet_left = self.window.saturating_sub(quiet_since);
            let drained = self.time_until_freed(used, now);
            return QuotaDecision::Throttled(at_least_1ms(quiet_left.max(drained)));
        }

        let excess = used + bytes - budget;
        QuotaDecision::Throttled(at_least_1ms(self.time_until_freed(excess, now)))
    }

    fn record(&mut self, bytes: u64, now: Instant) {
        if !self.is_enabled() {
            return;
        }
        self.last_admission = now;
        let index = self.bucket_index(now);
        match self.buckets.back_mut() {
            Some(bucket) if bucket.index == index => bucket.bytes += bytes,
            _ => self.buckets.push_back(Bucket { index, bytes }),
        }
    }

    /// Time until at least `bytes` of the current usage leave the window.
    fn time_until_freed(&self, bytes: u64, now: Instant) -> Duration {
        if bytes == 0 {
            return Duration::ZERO;
        }
        let mut freed = 0;
        for bucket in &self.buckets {
            freed += bucket.bytes;
            if freed >= bytes {
                return self.bucket_expiry(bucket.index).saturating_duration_since(now);
            }
        }
        // The rest is held by reservations.
        let reservation = self
            .reservations
            .values()
            .map(|r| r.expires_at)
            .min()
            .map(|at| at.saturating_duration_since(now));
        let last_bucket = self
            .buckets
            .back()
            .map(|b| self.bucket_expiry(b.index).saturating_duration_since(now))
            .unwrap_or_default();
        reservation.unwrap_or(self.bucket_width).max(last_bucket)
    }

    fn evict(&mut self, now: Instant) {
        let current = self.bucket_index(now);
        while let Some(bucket) = self.buckets.front() {
            if bucket.index + self.bucket_count <= current {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
        self.reservations.retain(|_, r| r.expires_at > now);
    }

    fn bucket_index(&self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.origin);
        (elapsed.as_nanos() / self.bucket_width.as_nanos().max(1)) as u64
    }

    fn bucket_expiry(&self, index: u64) -> Instant {
        self.origin + self.bucket_width * (index + self.bucket_count) as u32
    }

    fn admitted(&self) -> u64 {
        self.buckets.iter().map(|b| b.bytes).sum()
    }

    fn reserved(&self) -> u64 {
        self.reservations.values().map(|r| r.bytes).sum()
    }
}

fn at_least_1ms(d: Duration) -> Duration {
    d.max(Duration::from_millis(1))
}
