//! Per-owner admission control.
//!
//! Both limiters keep one entry per owner key in a [`DashMap`]. All work for
//! a key happens while holding that entry's shard lock, which makes
//! check-and-record atomic per key while different keys proceed in parallel.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::{
    clock::{to_chrono, Clock, SystemClock},
    config::RateLimitConfig,
};

/// Admission control consulted on every submission
pub trait RateLimiter: Send + Sync {
    /// Record one admission for `owner_key` if it is within its limit
    fn check_and_record(&self, owner_key: &str) -> bool;

    /// Admissions still available to `owner_key` right now
    fn remaining(&self, owner_key: &str) -> u32;

    /// Forget all history for `owner_key`
    fn reset(&self, owner_key: &str);

    /// Drop keys with no live history; returns how many were dropped
    fn prune_idle(&self) -> usize;

    /// Number of keys currently tracked
    fn tracked_keys(&self) -> usize;
}

/// Sliding-window limiter: at most `limit` admissions in any trailing `window`
pub struct SlidingWindowLimiter {
    windows: DashMap<String, VecDeque<DateTime<Utc>>>,
    limit: u32,
    window: chrono::Duration,
    clock: Arc<dyn Clock>,
}

impl SlidingWindowLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self::with_clock(limit, window, Arc::new(SystemClock))
    }

    pub fn from_config(config: &RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self::with_clock(config.max_requests_per_window, config.window(), clock)
    }

    pub fn with_clock(limit: u32, window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: DashMap::new(),
            limit,
            window: to_chrono(window),
            clock,
        }
    }

    /// [`check_and_record`](RateLimiter::check_and_record) at an explicit instant
    pub fn check_and_record_at(&self, owner_key: &str, now: DateTime<Utc>) -> bool {
        let mut history = self.windows.entry(owner_key.to_string()).or_default();
        self.purge(&mut history, now);

        if history.len() >= self.limit as usize {
            return false;
        }

        history.push_back(now);
        true
    }

    /// Drop timestamps that have left the window ending at `now`
    fn purge(&self, history: &mut VecDeque<DateTime<Utc>>, now: DateTime<Utc>) {
        while let Some(oldest) = history.front() {
            if now - *oldest >= self.window {
                history.pop_front();
            } else {
                break;
            }
        }
    }
}

impl RateLimiter for SlidingWindowLimiter {
    fn check_and_record(&self, owner_key: &str) -> bool {
        self.check_and_record_at(owner_key, self.clock.now())
    }

    fn remaining(&self, owner_key: &str) -> u32 {
        let now = self.clock.now();
        match self.windows.get_mut(owner_key) {
            Some(mut history) => {
                self.purge(&mut history, now);
                self.limit.saturating_sub(history.len() as u32)
            }
            None => self.limit,
        }
    }

    fn reset(&self, owner_key: &str) {
        self.windows.remove(owner_key);
    }

    fn prune_idle(&self) -> usize {
        let now = self.clock.now();
        let before = self.windows.len();
        self.windows.retain(|_, history| {
            self.purge(history, now);
            !history.is_empty()
        });
        before.saturating_sub(self.windows.len())
    }

    fn tracked_keys(&self) -> usize {
        self.windows.len()
    }
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_update: DateTime<Utc>,
}

/// Token bucket: bursts of up to `burst` admissions, refilled at `rate_per_second`
pub struct TokenBucketLimiter {
    buckets: DashMap<String, Bucket>,
    rate_per_second: f64,
    burst: u32,
    clock: Arc<dyn Clock>,
}

impl TokenBucketLimiter {
    pub fn new(rate_per_second: f64, burst: u32) -> Self {
        Self::with_clock(rate_per_second, burst, Arc::new(SystemClock))
    }

    pub fn with_clock(rate_per_second: f64, burst: u32, clock: Arc<dyn Clock>) -> Self {
        Self {
            buckets: DashMap::new(),
            rate_per_second,
            burst,
            clock,
        }
    }

    fn refill(&self, bucket: &mut Bucket, now: DateTime<Utc>) {
        let elapsed = (now - bucket.last_update).num_milliseconds().max(0) as f64 / 1000.0;
        bucket.tokens = (bucket.tokens + elapsed * self.rate_per_second).min(f64::from(self.burst));
        bucket.last_update = now;
    }

    fn full(&self, now: DateTime<Utc>) -> Bucket {
        Bucket {
            tokens: f64::from(self.burst),
            last_update: now,
        }
    }
}

impl RateLimiter for TokenBucketLimiter {
    fn check_and_record(&self, owner_key: &str) -> bool {
        let now = self.clock.now();
        let mut bucket = self
            .buckets
            .entry(owner_key.to_string())
            .or_insert_with(|| self.full(now));
        self.refill(&mut bucket, now);

        if bucket.tokens < 1.0 {
            return false;
        }

        bucket.tokens -= 1.0;
        true
    }

    fn remaining(&self, owner_key: &str) -> u32 {
        let now = self.clock.now();
        match self.buckets.get_mut(owner_key) {
            Some(mut bucket) => {
                self.refill(&mut bucket, now);
                bucket.tokens.floor() as u32
            }
            None => self.burst,
        }
    }

    fn reset(&self, owner_key: &str) {
        self.buckets.remove(owner_key);
    }

    fn prune_idle(&self) -> usize {
        let now = self.clock.now();
        let before = self.buckets.len();
        // A full bucket behaves exactly like an absent one
        self.buckets.retain(|_, bucket| {
            self.refill(bucket, now);
            bucket.tokens < f64::from(self.burst)
        });
        before.saturating_sub(self.buckets.len())
    }

    fn tracked_keys(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn sliding(limit: u32, window_secs: u64) -> (SlidingWindowLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let limiter =
            SlidingWindowLimiter::with_clock(limit, Duration::from_secs(window_secs), clock.clone());
        (limiter, clock)
    }

    #[test]
    fn test_rejects_over_limit() {
        let (limiter, _clock) = sliding(10, 60);

        let allowed = (0..15).filter(|_| limiter.check_and_record("user_123")).count();
        assert_eq!(allowed, 10);
        assert_eq!(limiter.remaining("user_123"), 0);
    }

    #[test]
    fn test_window_slides() {
        let (limiter, clock) = sliding(2, 60);

        assert!(limiter.check_and_record("u1"));
        clock.advance(Duration::from_secs(30));
        assert!(limiter.check_and_record("u1"));
        assert!(!limiter.check_and_record("u1"));

        // First admission leaves the window, exactly one slot frees up
        clock.advance(Duration::from_secs(30));
        assert_eq!(limiter.remaining("u1"), 1);
        assert!(limiter.check_and_record("u1"));
        assert!(!limiter.check_and_record("u1"));
    }

    #[test]
    fn test_keys_are_independent() {
        let (limiter, _clock) = sliding(1, 60);

        assert!(limiter.check_and_record("a"));
        assert!(limiter.check_and_record("b"));
        assert!(!limiter.check_and_record("a"));
        assert_eq!(limiter.remaining("c"), 1);
    }

    #[test]
    fn test_reset_and_prune() {
        let (limiter, clock) = sliding(5, 60);

        limiter.check_and_record("a");
        limiter.check_and_record("b");
        limiter.reset("a");
        assert_eq!(limiter.remaining("a"), 5);
        assert_eq!(limiter.tracked_keys(), 1);

        clock.advance(Duration::from_secs(61));
        limiter.check_and_record("c");
        assert_eq!(limiter.prune_idle(), 1);
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[test]
    fn test_concurrent_same_key_never_exceeds_limit() {
        let (limiter, _clock) = sliding(50, 60);
        let limiter = Arc::new(limiter);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || (0..25).filter(|_| limiter.check_and_record("hot")).count())
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 50);
    }

    #[test]
    fn test_token_bucket_burst_then_refill() {
        let clock = Arc::new(ManualClock::starting_now());
        let limiter = TokenBucketLimiter::with_clock(2.0, 5, clock.clone());

        let allowed = (0..7).filter(|_| limiter.check_and_record("user_789")).count();
        assert_eq!(allowed, 5);

        clock.advance(Duration::from_secs(1));
        assert_eq!(limiter.remaining("user_789"), 2);
        assert!(limiter.check_and_record("user_789"));

        clock.advance(Duration::from_secs(10));
        assert_eq!(limiter.prune_idle(), 1);
        assert_eq!(limiter.remaining("user_789"), 5);
    }
}
