//! Policy engine — admission and isolation for inbound RPC calls.
//!
//! The policy stack (applied in order):
//! ```text
//! Request → [KeyedRateLimiter] → [CircuitBreaker] → handler
//! ```

pub mod breakers;
pub mod circuit_breaker;
pub mod keyed_limiter;
pub mod rate_limiter;

pub use breakers::BreakerRegistry;
pub use circuit_breaker::{CircuitBreaker, CircuitState, CircuitStats};
pub use keyed_limiter::{client_key, method_name, BucketKey, Decision, KeyedRateLimiter};
pub use rate_limiter::{RateLimiterConfig, TokenBucket};
