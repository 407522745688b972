//! Entry point for an RPC interceptor chain.
//!
//! ```text
//! Inbound call → [RequestContext] → [KeyedRateLimiter] → [CircuitBreaker] → handler
//! ```
//!
//! A rate-limit denial rejects the call before any breaker is consulted.
//! The correlation context is bound for the whole call regardless of the
//! outcome.

use std::future::Future;
use std::sync::Arc;

use tracing::Instrument;

use crate::config::ShieldConfig;
use crate::context::RequestContext;
use crate::error::GuardError;
use crate::metadata::Metadata;
use crate::policy::breakers::BreakerRegistry;
use crate::policy::keyed_limiter::{client_key, Decision, KeyedRateLimiter};

/// What the interceptor knows about an inbound call.
#[derive(Clone, Copy)]
pub struct InboundCall<'a> {
    /// Full method path, e.g. `/pkg.ExampleService/GetExample`.
    pub method: &'a str,
    pub metadata: &'a (dyn Metadata + Sync),
}

impl<'a> InboundCall<'a> {
    pub fn new(method: &'a str, metadata: &'a (dyn Metadata + Sync)) -> Self {
        Self { method, metadata }
    }
}

/// Rate limiter and breaker registry shared by every call of a server.
#[derive(Debug)]
pub struct ResilienceGuard {
    limiter: Arc<KeyedRateLimiter>,
    breakers: BreakerRegistry,
}

impl ResilienceGuard {
    pub fn new(config: &ShieldConfig) -> Self {
        Self::from_parts(
            KeyedRateLimiter::new(config.rate_limit.clone()),
            BreakerRegistry::new(config.circuit_breaker.clone()),
        )
    }

    pub fn from_parts(limiter: KeyedRateLimiter, breakers: BreakerRegistry) -> Self {
        Self {
            limiter: Arc::new(limiter),
            breakers,
        }
    }

    pub fn limiter(&self) -> &Arc<KeyedRateLimiter> {
        &self.limiter
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    /// Rate-limit admission for one call.
    pub fn admit<E>(&self, client_key: &str, method: &str) -> Result<(), GuardError<E>> {
        match self.limiter.check(client_key, method) {
            Decision::Allowed { .. } => Ok(()),
            Decision::Denied { limit_rps } => Err(GuardError::RateLimited {
                client_key: client_key.to_string(),
                method: method.to_string(),
                limit_rps,
            }),
        }
    }

    /// Run `op` as the handler of `call`, protected by the breaker for
    /// `dependency`.
    ///
    /// `op` runs inside the call's correlation scope, so outbound calls it
    /// makes can use [`RequestContext::inject`].
    pub async fn handle<F, Fut, T, E>(
        &self,
        call: InboundCall<'_>,
        dependency: &str,
        op: F,
    ) -> Result<T, GuardError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let ctx = RequestContext::from_metadata(call.metadata);
        let span = ctx.span(call.method);
        let client_key = client_key(call.metadata);
        let method = call.method;

        let guarded = async move {
            self.limiter.maybe_cleanup();
            self.admit::<E>(&client_key, method)?;

            let breaker = self.breakers.get(dependency);
            let result = breaker.call(op).await;
            if let Err(e) = &result {
                if e.is_open() {
                    tracing::warn!(breaker = %breaker.name(), "Call rejected, circuit open");
                }
            }
            result.map_err(GuardError::Circuit)
        };

        ctx.scope(guarded.instrument(span)).await
    }
}
