//! Error taxonomy for the resilience core.

use std::fmt;

use thiserror::Error;

/// Errors returned by [`CircuitBreaker::call`](crate::policy::CircuitBreaker::call)
/// and its variants.
///
/// `E` is the protected operation's own error type; it is carried unchanged
/// in [`CircuitError::Operation`].
#[derive(Debug, Error)]
pub enum CircuitError<E> {
    /// The breaker rejected the call without running the operation.
    #[error("Circuit breaker '{breaker}' is open")]
    Open { breaker: String },

    /// The operation did not complete within the breaker's `call_timeout`.
    #[error("Circuit breaker '{breaker}': operation timed out after {ms}ms")]
    Timeout { breaker: String, ms: u64 },

    /// The operation ran and failed.
    #[error(transparent)]
    Operation(E),
}

impl<E> CircuitError<E> {
    /// Returns `true` if the call was rejected without running.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    /// Returns the wrapped operation error, if this is one.
    pub fn into_operation(self) -> Option<E> {
        match self {
            Self::Operation(e) => Some(e),
            _ => None,
        }
    }

    /// Map the operation error, keeping breaker-originated variants intact.
    pub fn map_operation<F, E2>(self, f: F) -> CircuitError<E2>
    where
        F: FnOnce(E) -> E2,
    {
        match self {
            Self::Open { breaker } => CircuitError::Open { breaker },
            Self::Timeout { breaker, ms } => CircuitError::Timeout { breaker, ms },
            Self::Operation(e) => CircuitError::Operation(f(e)),
        }
    }

    /// Transport status this error should surface as.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Open { .. } => StatusCode::Unavailable,
            Self::Timeout { .. } => StatusCode::DeadlineExceeded,
            Self::Operation(_) => StatusCode::Internal,
        }
    }
}

/// Errors surfaced by [`ResilienceGuard`](crate::guard::ResilienceGuard).
#[derive(Debug, Error)]
pub enum GuardError<E> {
    /// The caller's token bucket had no capacity left.
    #[error("Rate limit exceeded for {client_key} on {method} (limit: {limit_rps} requests per second)")]
    RateLimited {
        client_key: String,
        method: String,
        limit_rps: f64,
    },

    /// The circuit breaker rejected the call or the operation failed.
    #[error(transparent)]
    Circuit(#[from] CircuitError<E>),
}

impl<E> GuardError<E> {
    /// Returns `true` if the call was rejected before reaching the breaker.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Returns the wrapped operation error, if this is one.
    pub fn into_operation(self) -> Option<E> {
        match self {
            Self::Circuit(e) => e.into_operation(),
            Self::RateLimited { .. } => None,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::RateLimited { .. } => StatusCode::ResourceExhausted,
            Self::Circuit(e) => e.status_code(),
        }
    }
}

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("environment variable {var}: cannot parse {value:?}")]
    Env { var: &'static str, value: String },

    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// RPC status codes the transport maps resilience outcomes onto.
///
/// Names follow the gRPC canonical codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    ResourceExhausted,
    Unavailable,
    DeadlineExceeded,
    Internal,
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResourceExhausted => write!(f, "RESOURCE_EXHAUSTED"),
            Self::Unavailable => write!(f, "UNAVAILABLE"),
            Self::DeadlineExceeded => write!(f, "DEADLINE_EXCEEDED"),
            Self::Internal => write!(f, "INTERNAL"),
        }
    }
}
