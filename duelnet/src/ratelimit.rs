//! Per-user request limits.
//!
//! Token buckets keyed by an arbitrary string (user id, or `user:battle` for
//! per-battle cooldowns). A cooldown is a bucket holding a single token.
//!
//! # Example
//!
//! ```rust,ignore
//! use duelnet::ratelimit::{RateLimiter, RateLimitConfig};
//!
//! let limiter = RateLimiter::new(RateLimitConfig::per_minute(30));
//! if !limiter.check("user123").allowed {
//!     // reject with RATE_LIMITED
//! }
//! ```

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::config::LimitsConfig;

/// Rate limit configuration
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    /// Requests allowed per window, also the burst size.
    pub max_requests: u32,
    pub window: Duration,
}

impl RateLimitConfig {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }

    pub fn per_minute(max_requests: u32) -> Self {
        Self::new(max_requests, Duration::from_secs(60))
    }

    /// One request per `interval`.
    pub fn cooldown(interval: Duration) -> Self {
        Self::new(1, interval)
    }

    fn rate(&self) -> f64 {
        self.max_requests as f64 / self.window.as_secs_f64().max(f64::EPSILON)
    }
}

/// Token bucket state for a single key
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(initial_tokens: f64, now: Instant) -> Self {
        Self {
            tokens: initial_tokens,
            last_update: now,
        }
    }

    fn refill(&mut self, rate: f64, burst: f64, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(burst);
        self.last_update = now;
    }

    /// Try to consume a token, returns true if successful
    fn try_consume(&mut self, rate: f64, burst: f64, now: Instant) -> bool {
        self.refill(rate, burst, now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn until_next_token(&self, rate: f64) -> Duration {
        if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / rate)
        }
    }
}

/// Result of a rate limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitResult {
    pub allowed: bool,
    /// Whole tokens left after this check
    pub remaining: u32,
    /// Wait before the next request would be allowed
    pub retry_after: Duration,
}

impl RateLimitResult {
    pub fn retry_after_ms(&self) -> u64 {
        self.retry_after.as_millis() as u64
    }
}

/// Token bucket rate limiter
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<String, TokenBucket>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    pub fn check(&self, key: &str) -> RateLimitResult {
        self.check_at(key, Instant::now())
    }

    pub fn check_at(&self, key: &str, now: Instant) -> RateLimitResult {
        let rate = self.config.rate();
        let burst = self.config.max_requests as f64;

        let mut bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::new(burst, now));

        let allowed = bucket.try_consume(rate, burst, now);
        RateLimitResult {
            allowed,
            remaining: bucket.tokens as u32,
            retry_after: if allowed {
                Duration::ZERO
            } else {
                bucket.until_next_token(rate)
            },
        }
    }

    /// Drop buckets idle for longer than `max_age`.
    pub fn cleanup(&self, max_age: Duration) {
        let now = Instant::now();
        self.buckets
            .retain(|_, bucket| now.saturating_duration_since(bucket.last_update) < max_age);
    }

    pub fn key_count(&self) -> usize {
        self.buckets.len()
    }
}

/// Rate-limited client operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitedOp {
    Run,
    Submit,
    Sledge,
}

/// One limiter per operation.
pub struct OperationRateLimiter {
    run: RateLimiter,
    submit: RateLimiter,
    sledge: RateLimiter,
}

impl OperationRateLimiter {
    pub fn new(limits: &LimitsConfig) -> Self {
        Self {
            run: RateLimiter::new(RateLimitConfig::per_minute(limits.runs_per_minute)),
            submit: RateLimiter::new(RateLimitConfig::per_minute(limits.submits_per_minute)),
            sledge: RateLimiter::new(RateLimitConfig::cooldown(Duration::from_secs(
                limits.sledge_cooldown_secs,
            ))),
        }
    }

    fn limiter(&self, op: LimitedOp) -> &RateLimiter {
        match op {
            LimitedOp::Run => &self.run,
            LimitedOp::Submit => &self.submit,
            LimitedOp::Sledge => &self.sledge,
        }
    }

    pub fn check(&self, op: LimitedOp, key: &str) -> RateLimitResult {
        self.limiter(op).check(key)
    }

    pub fn cleanup(&self, max_age: Duration) {
        self.run.cleanup(max_age);
        self.submit.cleanup(max_age);
        self.sledge.cleanup(max_age);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_then_limited() {
        let limiter = RateLimiter::new(RateLimitConfig::per_minute(3));
        let now = Instant::now();

        for _ in 0..3 {
            assert!(limiter.check_at("user1", now).allowed);
        }
        let result = limiter.check_at("user1", now);
        assert!(!result.allowed);
        assert!((19_990..=20_010).contains(&result.retry_after_ms()));
    }

    #[test]
    fn test_refill_over_time() {
        let limiter = RateLimiter::new(RateLimitConfig::per_minute(60));
        let now = Instant::now();
        for _ in 0..60 {
            limiter.check_at("user1", now);
        }
        assert!(!limiter.check_at("user1", now).allowed);
        assert!(limiter.check_at("user1", now + Duration::from_secs(1)).allowed);
    }

    #[test]
    fn test_cooldown() {
        let limiter = RateLimiter::new(RateLimitConfig::cooldown(Duration::from_secs(60)));
        let now = Instant::now();

        assert!(limiter.check_at("alice:b1", now).allowed);
        let blocked = limiter.check_at("alice:b1", now + Duration::from_secs(15));
        assert!(!blocked.allowed);
        assert!((44_990..=45_010).contains(&blocked.retry_after_ms()));

        // Separate battles have separate cooldowns.
        assert!(limiter.check_at("alice:b2", now).allowed);
        assert!(limiter.check_at("alice:b1", now + Duration::from_secs(61)).allowed);
    }

    #[test]
    fn test_operations_are_independent() {
        let limits = LimitsConfig {
            runs_per_minute: 1,
            submits_per_minute: 1,
            ..Default::default()
        };
        let limiter = OperationRateLimiter::new(&limits);

        assert!(limiter.check(LimitedOp::Run, "alice").allowed);
        assert!(!limiter.check(LimitedOp::Run, "alice").allowed);
        assert!(limiter.check(LimitedOp::Submit, "alice").allowed);
        assert!(limiter.check(LimitedOp::Run, "bob").allowed);
    }

    #[test]
    fn test_cleanup() {
        let limiter = RateLimiter::new(RateLimitConfig::per_minute(10));
        limiter.check("user1");
        limiter.check("user2");
        assert_eq!(limiter.key_count(), 2);

        limiter.cleanup(Duration::ZERO);
        assert_eq!(limiter.key_count(), 0);
    }
}
