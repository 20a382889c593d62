//! Resilience utilities: backoff and rate limiting.
//!
//! - [`Backoff`]: exponential delay with optional jitter, shared by the
//!   endpoint pool's redial loop and the connector's per-message retries
//! - [`RateLimiter`]: token bucket that caps a connector's publish rate
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() {
//! use message_replicator::resilience::{Backoff, RateLimiter, RateLimitConfig};
//! use std::time::Duration;
//!
//! let backoff = Backoff::deterministic(Duration::from_millis(100), Duration::from_secs(5));
//! assert_eq!(backoff.delay_for_attempt(3), Duration::from_millis(400));
//!
//! let limiter = RateLimiter::new(RateLimitConfig { per_second: 500, burst: 50 });
//! let throttled = limiter.acquire().await;
//! # }
//! ```

use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use rand::Rng;
use std::num::NonZeroU32;
use std::time::Duration;

/// Exponential backoff schedule.
///
/// `jitter` is the fraction of each delay that is randomized in both
/// directions: `0.2` turns a 1s delay into something in `[0.8s, 1.2s]`.
/// Zero jitter gives a reproducible schedule.
///
/// # Schedule (initial 500ms, factor 2.0, max 30s)
///
/// ```text
/// Attempt  Delay
/// -------  -----
/// 1        500ms
/// 2        1s
/// 3        2s
/// ...
/// 7+       30s (cap)
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
            jitter: 0.2,
        }
    }
}

impl Backoff {
    /// Doubling backoff without jitter.
    pub fn deterministic(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            factor: 2.0,
            jitter: 0.0,
        }
    }

    /// Un-jittered delay for a given attempt number (1-indexed).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return std::cmp::min(self.initial_delay, self.max_delay);
        }

        let exponent = (attempt - 1).min(i32::MAX as u32) as i32;
        let multiplier = self.factor.max(1.0).powi(exponent);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }

        Duration::from_secs_f64(delay_secs)
    }

    /// Delay for a given attempt number (1-indexed), jitter applied.
    ///
    /// Never exceeds `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return base;
        }

        let spread = (rand::rng().random::<f64>() - 0.5) * 2.0 * jitter;
        let secs = base.as_secs_f64() * (1.0 + spread);
        std::cmp::min(Duration::from_secs_f64(secs.max(0.0)), self.max_delay)
    }
}

// =============================================================================
// Rate Limiting
// =============================================================================

/// Publish rate cap for one connector: `per_second` sustained, `burst` at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub per_second: u32,
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_second: 1000,
            burst: 100,
        }
    }
}

/// Token bucket in front of a connector's publishes.
///
/// Keeps a reconnecting connector from flooding its destination with the
/// backlog it buffered while paused. Zero rates are raised to one.
pub struct RateLimiter {
    bucket: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let per_second = NonZeroU32::new(config.per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(config.burst).unwrap_or(NonZeroU32::MIN);
        Self {
            bucket: GovLimiter::direct(Quota::per_second(per_second).allow_burst(burst)),
            config,
        }
    }

    /// Take one publish permit, waiting for the bucket to refill if empty.
    ///
    /// Returns `true` if the caller had to wait. Cancel-safe.
    pub async fn acquire(&self) -> bool {
        if self.bucket.check().is_ok() {
            return false;
        }
        self.bucket.until_ready().await;
        true
    }

    /// Take a permit only if one is available now.
    pub fn try_acquire(&self) -> bool {
        self.bucket.check().is_ok()
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("per_second", &self.config.per_second)
            .field("burst", &self.config.burst)
            .finish()
    }
}
