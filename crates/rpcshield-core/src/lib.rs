//! rpcshield-core — resilience primitives for RPC servers.
//!
//! # Overview
//!
//! The core is an in-process state/counter library that an RPC interceptor
//! chain calls around every inbound request:
//!
//! - [`TokenBucket`] — continuously refilling admission budget
//! - [`CircuitBreaker`] — three-state guard around a protected call
//! - [`KeyedRegistry`] — one lazily created instance per key
//! - [`BreakerRegistry`] / [`KeyedRateLimiter`] — the two registry flavors
//!   (per dependency, per client × method)
//! - [`RequestContext`] — correlation id scoped to one call
//! - [`ResilienceGuard`] — all of the above composed in interceptor order
//!
//! State is local to the process. Nothing is persisted or coordinated
//! across nodes.

pub mod config;
pub mod context;
pub mod error;
pub mod guard;
pub mod metadata;
pub mod policy;
pub mod registry;
pub mod telemetry;

pub use config::{CircuitBreakerConfig, MethodLimit, RateLimitConfig, ShieldConfig};
pub use context::{ensure_context, RequestContext};
pub use error::{CircuitError, ConfigError, GuardError, StatusCode};
pub use guard::{InboundCall, ResilienceGuard};
pub use metadata::Metadata;
pub use policy::{
    BreakerRegistry, CircuitBreaker, CircuitState, CircuitStats, KeyedRateLimiter, TokenBucket,
};
pub use registry::KeyedRegistry;
pub use telemetry::{init_tracing, LogConfig};
