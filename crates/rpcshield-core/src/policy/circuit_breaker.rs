//! Three-state circuit breaker: Closed → Open → Half-Open.
//!
//! State transitions:
//! - `Closed` → `Open`:      failure count reaches `failure_threshold`
//! - `Open` → `Half-Open`:   a call arrives after `reset_timeout` has elapsed
//!   since the last failure; that call is admitted as a trial
//! - `Half-Open` → `Closed`: `success_threshold` consecutive successes
//! - `Half-Open` → `Open`:   any failure
//!
//! The breaker never retries. It admits or rejects, then records the outcome.
//! Admission and recording each take the breaker's own lock briefly; the
//! protected operation always runs with no lock held.

use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::config::CircuitBreakerConfig;
use crate::error::CircuitError;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// All requests rejected until `reset_timeout` has elapsed.
    Open,
    /// Probing recovery; calls run and a single failure reopens.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Point-in-time view of a breaker, for admin and health endpoints.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub failure_threshold: u32,
    pub reset_timeout_secs: f64,
    /// Seconds since the most recent recorded failure.
    pub since_last_failure_secs: Option<f64>,
    /// Number of times the breaker has entered `Open`.
    pub times_opened: u64,
}

/// Result of a protected call, as seen by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    /// An error the caller chose not to count.
    Ignored,
}

struct CircuitInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
    times_opened: u64,
}

impl CircuitInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure: None,
            times_opened: 0,
        }
    }
}

/// Thread-safe circuit breaker guarding one dependency.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<CircuitInner>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker in `Closed` state.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(CircuitInner::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Run `op` through the breaker.
    ///
    /// Every error from `op` counts as a failure. If the returned future is
    /// dropped before `op` completes, the call is recorded as a failure.
    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_filtered(op, |_| true).await
    }

    /// Like [`call`](Self::call), but only errors for which
    /// `counts_as_failure` returns `true` are recorded. Other errors are
    /// returned without touching the breaker state.
    pub async fn call_filtered<F, Fut, T, E, P>(
        &self,
        op: F,
        counts_as_failure: P,
    ) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnOnce(&E) -> bool,
    {
        let pending = self.admit::<E>()?;

        let result = match self.config.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, op()).await {
                Ok(result) => result,
                Err(_) => {
                    pending.finish(Outcome::Failure);
                    return Err(CircuitError::Timeout {
                        breaker: self.name.clone(),
                        ms: whole_millis(limit),
                    });
                }
            },
            None => op().await,
        };

        pending.settle(result, counts_as_failure)
    }

    /// Synchronous variant of [`call`](Self::call) for plain threads.
    ///
    /// `call_timeout` is not enforced here. A panic inside `op` is recorded
    /// as a failure before it propagates.
    pub fn call_blocking<F, T, E>(&self, op: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        let pending = self.admit::<E>()?;
        let result = op();
        pending.settle(result, |_| true)
    }

    /// Returns `true` and claims admission if a call may proceed now.
    ///
    /// For callers driving the breaker by hand; pair every `true` with
    /// [`record_success`](Self::record_success) or
    /// [`record_failure`](Self::record_failure).
    pub fn try_acquire(&self) -> bool {
        self.check_admission()
    }

    /// Record a successful request.
    pub fn record_success(&self) {
        self.record(Outcome::Success);
    }

    /// Record a failed request.
    pub fn record_failure(&self) {
        self.record(Outcome::Failure);
    }

    /// Current state. Does not perform the `Open` → `Half-Open` transition;
    /// only an arriving call does that.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn is_closed(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    pub fn is_half_open(&self) -> bool {
        self.state() == CircuitState::HalfOpen
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    /// Time of the most recent recorded failure.
    pub fn last_failure_time(&self) -> Option<Instant> {
        self.lock().last_failure
    }

    pub fn stats(&self) -> CircuitStats {
        let inner = self.lock();
        CircuitStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            failure_threshold: self.config.failure_threshold,
            reset_timeout_secs: self.config.reset_timeout.as_secs_f64(),
            since_last_failure_secs: inner.last_failure.map(|t| t.elapsed().as_secs_f64()),
            times_opened: inner.times_opened,
        }
    }

    /// Force the breaker back to `Closed` with all counters cleared.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.last_failure = None;
        tracing::info!(breaker = %self.name, "Circuit breaker manually reset");
    }

    fn admit<E>(&self) -> Result<PendingCall<'_>, CircuitError<E>> {
        if self.check_admission() {
            Ok(PendingCall {
                breaker: self,
                settled: false,
            })
        } else {
            Err(CircuitError::Open {
                breaker: self.name.clone(),
            })
        }
    }

    fn check_admission(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map_or(true, |t| t.elapsed() >= self.config.reset_timeout);
                if elapsed {
                    inner.state = CircuitState::HalfOpen;
                    inner.success_count = 0;
                    tracing::info!(
                        breaker = %self.name,
                        "Circuit breaker → half-open"
                    );
                    true
                } else {
                    tracing::debug!(
                        breaker = %self.name,
                        failures = inner.failure_count,
                        "Circuit breaker is open, rejecting request"
                    );
                    false
                }
            }
        }
    }

    fn record(&self, outcome: Outcome) {
        let mut inner = self.lock();
        match outcome {
            Outcome::Ignored => {}
            Outcome::Success => match inner.state {
                CircuitState::Closed => {
                    inner.failure_count = 0;
                }
                CircuitState::HalfOpen => {
                    inner.success_count += 1;
                    if inner.success_count >= self.config.success_threshold {
                        inner.state = CircuitState::Closed;
                        inner.failure_count = 0;
                        inner.success_count = 0;
                        inner.last_failure = None;
                        tracing::info!(
                            breaker = %self.name,
                            "Circuit breaker closed after successful recovery"
                        );
                    }
                }
                // Late result from a call admitted before the breaker opened.
                CircuitState::Open => {}
            },
            Outcome::Failure => {
                inner.failure_count = inner.failure_count.saturating_add(1);
                inner.last_failure = Some(Instant::now());
                match inner.state {
                    CircuitState::Closed => {
                        if inner.failure_count >= self.config.failure_threshold {
                            inner.state = CircuitState::Open;
                            inner.times_opened += 1;
                            tracing::error!(
                                breaker = %self.name,
                                failures = inner.failure_count,
                                threshold = self.config.failure_threshold,
                                "Circuit breaker opened due to failure threshold"
                            );
                        } else {
                            tracing::debug!(
                                breaker = %self.name,
                                failures = inner.failure_count,
                                threshold = self.config.failure_threshold,
                                "Protected call failed"
                            );
                        }
                    }
                    CircuitState::HalfOpen => {
                        inner.state = CircuitState::Open;
                        inner.success_count = 0;
                        inner.times_opened += 1;
                        tracing::warn!(
                            breaker = %self.name,
                            failures = inner.failure_count,
                            "Circuit breaker failed during half-open, returning to open"
                        );
                    }
                    CircuitState::Open => {}
                }
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, CircuitInner> {
        // Every critical section leaves the counters consistent, so a
        // poisoned lock still holds valid state.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

/// An admitted call whose outcome has not been recorded yet.
///
/// Dropping it unsettled (cancellation, panic) records a failure.
struct PendingCall<'a> {
    breaker: &'a CircuitBreaker,
    settled: bool,
}

impl PendingCall<'_> {
    fn finish(mut self, outcome: Outcome) {
        self.settled = true;
        self.breaker.record(outcome);
    }

    fn settle<T, E, P>(self, result: Result<T, E>, counts_as_failure: P) -> Result<T, CircuitError<E>>
    where
        P: FnOnce(&E) -> bool,
    {
        match result {
            Ok(value) => {
                self.finish(Outcome::Success);
                Ok(value)
            }
            Err(e) => {
                let outcome = if counts_as_failure(&e) {
                    Outcome::Failure
                } else {
                    Outcome::Ignored
                };
                self.finish(outcome);
                Err(CircuitError::Operation(e))
            }
        }
    }
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        if !self.settled {
            tracing::warn!(
                breaker = %self.breaker.name,
                "Protected call abandoned before completion, counting as failure"
            );
            self.breaker.record(Outcome::Failure);
        }
    }
}

/// Milliseconds in `d`, saturating at `u64::MAX`.
fn whole_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
