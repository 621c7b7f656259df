//! Per-key token buckets guarding high-frequency driver updates.
//!
//! The bucket table sits behind a read-mostly lock; each bucket has its own
//! mutex so concurrent drivers never contend on one another's refill.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

use crate::config::RateLimitConfig;

pub const LOCATION_UPDATE: &str = "location_update";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    pub driver_id: Uuid,
    pub operation: &'static str,
}

impl RateLimitKey {
    pub fn new(driver_id: Uuid, operation: &'static str) -> Self {
        Self {
            driver_id,
            operation,
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: u32,
    last_refill: Instant,
    last_used: Instant,
}

impl Bucket {
    fn full(capacity: u32, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
            last_used: now,
        }
    }

    fn refill(&mut self, capacity: u32, period: Duration, now: Instant) {
        if self.tokens >= capacity {
            self.last_refill = now;
            return;
        }

        let elapsed = now.saturating_duration_since(self.last_refill);
        let earned = (elapsed.as_nanos() / period.as_nanos().max(1)) as u32;
        if earned == 0 {
            return;
        }

        self.tokens = self.tokens.saturating_add(earned).min(capacity);
        if self.tokens >= capacity {
            self.last_refill = now;
        } else {
            // keep the fractional progress toward the next token
            self.last_refill += period * earned;
        }
    }
}

pub struct RateLimiter {
    buckets: RwLock<HashMap<RateLimitKey, Arc<Mutex<Bucket>>>>,
    capacity: u32,
    refill_period: Duration,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            capacity: config.capacity.max(1),
            refill_period: config.refill_period,
        }
    }

    /// Non-blocking admission check. Denied callers should drop the work,
    /// not wait for a token.
    pub fn allow(&self, key: RateLimitKey, n: u32) -> bool {
        self.allow_at(key, n, Instant::now())
    }

    pub fn allow_at(&self, key: RateLimitKey, n: u32, now: Instant) -> bool {
        let bucket = self.bucket(key, now);
        let mut bucket = bucket.lock();
        bucket.refill(self.capacity, self.refill_period, now);
        bucket.last_used = now;

        if bucket.tokens >= n {
            bucket.tokens -= n;
            true
        } else {
            false
        }
    }

    /// Restores a key to full capacity, e.g. after a driver comes online.
    pub fn reset(&self, key: RateLimitKey) {
        let now = Instant::now();
        if let Some(bucket) = self.buckets.read().get(&key) {
            *bucket.lock() = Bucket::full(self.capacity, now);
        }
    }

    /// Drops buckets untouched for longer than `max_idle`.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        self.evict_idle_at(max_idle, Instant::now())
    }

    pub fn evict_idle_at(&self, max_idle: Duration, now: Instant) -> usize {
        let mut buckets = self.buckets.write();
        let before = buckets.len();
        buckets.retain(|_, bucket| now.saturating_duration_since(bucket.lock().last_used) <= max_idle);
        before - buckets.len()
    }

    pub fn refill_period(&self) -> Duration {
        self.refill_period
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.read().len()
    }

    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration, max_idle: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let evicted = self.evict_idle(max_idle);
                if evicted > 0 {
                    debug!(evicted, remaining = self.bucket_count(), "evicted idle rate-limit buckets");
                }
            }
        })
    }

    fn bucket(&self, key: RateLimitKey, now: Instant) -> Arc<Mutex<Bucket>> {
        if let Some(bucket) = self.buckets.read().get(&key) {
            return bucket.clone();
        }

        self.buckets
            .write()
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(Bucket::full(self.capacity, now))))
            .clone()
    }
}
