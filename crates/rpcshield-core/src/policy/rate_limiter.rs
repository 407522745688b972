//! Token bucket rate limiter.
//!
//! Models a token bucket: tokens accrue at `refill_rate` tokens/second up to
//! `capacity`. Each request consumes a whole number of tokens. If too few
//! tokens are available, `consume` returns `false` immediately; the bucket
//! never waits for tokens to accumulate.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::config::MethodLimit;

/// Token bucket configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimiterConfig {
    /// Maximum tokens in the bucket.
    pub capacity: f64,
    /// Token refill rate (tokens per second).
    pub refill_rate: f64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            capacity: 200.0,
            refill_rate: 100.0,
        }
    }
}

impl From<MethodLimit> for RateLimiterConfig {
    fn from(limit: MethodLimit) -> Self {
        Self {
            capacity: limit.burst,
            refill_rate: limit.rps,
        }
    }
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Thread-safe token bucket. Starts full.
pub struct TokenBucket {
    config: RateLimiterConfig,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            state: Mutex::new(BucketState {
                tokens: config.capacity,
                last_refill: Instant::now(),
            }),
            config,
        }
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Try to withdraw `n` tokens.
    ///
    /// Refill and withdrawal happen under one lock acquisition. Returns
    /// `true` if the tokens were withdrawn; on `false` the balance is left
    /// as refilled.
    pub fn consume(&self, n: u32) -> bool {
        let cost = f64::from(n);
        let mut state = self.lock();
        self.refill(&mut state);

        if state.tokens >= cost {
            state.tokens -= cost;
            true
        } else {
            false
        }
    }

    /// Returns the estimated wait time before `n` tokens are available.
    pub fn wait_time(&self, n: u32) -> Duration {
        let deficit = f64::from(n) - self.available();
        if deficit <= 0.0 {
            Duration::ZERO
        } else if self.config.refill_rate <= 0.0 || f64::from(n) > self.config.capacity {
            Duration::MAX
        } else {
            Duration::try_from_secs_f64(deficit / self.config.refill_rate).unwrap_or(Duration::MAX)
        }
    }

    /// Returns currently available tokens.
    ///
    /// Read-only: projects the refill without storing it, so inspecting a
    /// bucket does not reset its idle time.
    pub fn available(&self) -> f64 {
        let state = self.lock();
        self.projected(&state, Instant::now())
    }

    /// Time of the last refill, i.e. the last time the bucket was used.
    pub fn last_refill(&self) -> Instant {
        self.lock().last_refill
    }

    /// Returns `true` if the bucket has not been touched for `window`.
    pub fn is_idle(&self, window: Duration) -> bool {
        self.last_refill().elapsed() > window
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        state.tokens = self.projected(state, now);
        state.last_refill = now;
    }

    fn projected(&self, state: &BucketState, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        let new_tokens = elapsed * self.config.refill_rate;
        (state.tokens + new_tokens).min(self.config.capacity)
    }

    fn lock(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("capacity", &self.config.capacity)
            .field("refill_rate", &self.config.refill_rate)
            .field("available", &self.available())
            .finish()
    }
}
