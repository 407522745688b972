//! Per-client, per-method token buckets.
//!
//! Buckets are created on first use of a (client, method) pair with the
//! method's configured limits and evicted once idle for `stale_after`.
//! Cleanup can run lazily from the request path ([`KeyedRateLimiter::maybe_cleanup`])
//! or on a background task ([`KeyedRateLimiter::spawn_cleanup`]).

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::{MethodLimit, RateLimitConfig};
use crate::metadata::{Metadata, CLIENT_ID_KEY};
use crate::policy::rate_limiter::TokenBucket;
use crate::registry::KeyedRegistry;

/// Compound bucket key: caller identity × full method path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub client: String,
    pub method: String,
}

impl BucketKey {
    pub fn new(client: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            client: client.into(),
            method: method.into(),
        }
    }
}

/// Admission decision for one request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    Allowed { remaining: f64 },
    Denied { limit_rps: f64 },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

/// Rate-limiting key for a caller: `client:<id>` from the `x-client-id`
/// metadata entry, or `default` when the caller is anonymous.
pub fn client_key<M: Metadata + ?Sized>(metadata: &M) -> String {
    match metadata.get(CLIENT_ID_KEY) {
        Some(id) if !id.is_empty() => format!("client:{id}"),
        _ => "default".to_string(),
    }
}

/// Bare method name: the last `/`-separated segment of a method path.
///
/// `"/pkg.ExampleService/GetExample"` → `"GetExample"`.
pub fn method_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Registry of token buckets keyed by (client, method).
#[derive(Debug)]
pub struct KeyedRateLimiter {
    config: RateLimitConfig,
    buckets: KeyedRegistry<BucketKey, TokenBucket>,
    last_cleanup: Mutex<Instant>,
}

impl KeyedRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: KeyedRegistry::new(),
            last_cleanup: Mutex::new(Instant::now()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Limits applied to `method`: the per-method override if one exists,
    /// else the defaults.
    pub fn limit_for(&self, method: &str) -> MethodLimit {
        self.config
            .method_limits
            .get(method_name(method))
            .copied()
            .unwrap_or_else(|| self.config.default_limit())
    }

    /// Bucket for (client_key, method), created on first use.
    pub fn bucket(&self, client_key: &str, method: &str) -> Arc<TokenBucket> {
        let key = BucketKey::new(client_key, method);
        if let Some(existing) = self.buckets.get(&key) {
            return existing;
        }
        let limit = self.limit_for(method);
        let (bucket, created) = self
            .buckets
            .get_or_create_with_flag(key, |_| TokenBucket::new(limit.into()));
        if created {
            tracing::debug!(
                client_key,
                method,
                rps = limit.rps,
                burst = limit.burst,
                "Created new rate limit bucket"
            );
        }
        bucket
    }

    /// Try to admit one request.
    pub fn check(&self, client_key: &str, method: &str) -> Decision {
        self.check_cost(client_key, method, 1)
    }

    /// Try to admit a request costing `tokens`.
    pub fn check_cost(&self, client_key: &str, method: &str, tokens: u32) -> Decision {
        let bucket = self.bucket(client_key, method);
        if bucket.consume(tokens) {
            let remaining = bucket.available();
            tracing::debug!(client_key, method, remaining, "Request allowed by rate limiter");
            Decision::Allowed { remaining }
        } else {
            let limit_rps = bucket.config().refill_rate;
            tracing::warn!(client_key, method, limit_rps, "Rate limit exceeded");
            Decision::Denied { limit_rps }
        }
    }

    /// Evict buckets idle for longer than `stale_after`. Buckets currently
    /// held by a caller are kept. Returns the number evicted.
    pub fn cleanup_stale(&self) -> usize {
        let stale_after = self.config.stale_after;
        let evicted = self
            .buckets
            .evict_unused(|_, bucket| bucket.is_idle(stale_after));
        for key in &evicted {
            tracing::debug!(
                client_key = %key.client,
                method = %key.method,
                "Cleaned up unused rate limit bucket"
            );
        }
        evicted.len()
    }

    /// Run [`cleanup_stale`](Self::cleanup_stale) if `cleanup_interval` has
    /// passed since the last pass. Cheap enough to call on every request.
    pub fn maybe_cleanup(&self) -> usize {
        {
            let mut last = self.last_cleanup.lock().unwrap_or_else(PoisonError::into_inner);
            if last.elapsed() < self.config.cleanup_interval {
                return 0;
            }
            *last = Instant::now();
        }
        self.cleanup_stale()
    }

    /// Spawn a task that runs cleanup every `period`.
    ///
    /// The task holds only a weak reference and exits once the limiter is
    /// dropped.
    pub fn spawn_cleanup(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self);
        drop(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(limiter) = weak.upgrade() else {
                    tracing::debug!("Rate limiter dropped, stopping cleanup task");
                    break;
                };
                let evicted = limiter.cleanup_stale();
                if evicted > 0 {
                    tracing::debug!(evicted, remaining = limiter.len(), "Rate limit cleanup pass");
                }
            }
        })
    }

    /// Number of live buckets.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}
