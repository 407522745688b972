//! End-to-end behaviour of breakers, buckets and registries under the
//! timing and concurrency conditions an RPC server sees.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;

use rpcshield_core::policy::RateLimiterConfig;
use rpcshield_core::{
    BreakerRegistry, CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitState,
    KeyedRegistry, TokenBucket,
};

// ─── Helpers ──────────────────────────────────────────────────────────────────

#[derive(Debug, PartialEq)]
struct DownstreamError(&'static str);

fn breaker(failure_threshold: u32, reset_secs: u64) -> CircuitBreaker {
    CircuitBreaker::new(
        "downstream",
        CircuitBreakerConfig {
            failure_threshold,
            reset_timeout: Duration::from_secs(reset_secs),
            ..Default::default()
        },
    )
}

async fn failing(cb: &CircuitBreaker) -> Result<(), CircuitError<DownstreamError>> {
    cb.call(|| async { Err(DownstreamError("unavailable")) }).await
}

async fn succeeding(cb: &CircuitBreaker) -> Result<(), CircuitError<DownstreamError>> {
    cb.call(|| async { Ok(()) }).await
}

// ─── Circuit breaker ──────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn opens_exactly_at_threshold() {
    for threshold in 1..=6 {
        let cb = breaker(threshold, 60);
        for i in 1..=threshold + 3 {
            let _ = failing(&cb).await;
            let expected = if i < threshold {
                CircuitState::Closed
            } else {
                CircuitState::Open
            };
            assert_eq!(cb.state(), expected, "threshold={threshold} failure #{i}");
        }
        assert_eq!(cb.stats().times_opened, 1, "threshold={threshold}");
    }
}

#[tokio::test(start_paused = true)]
async fn reset_timeout_scenario() {
    // failure_threshold=3, reset_timeout=60s
    let cb = breaker(3, 60);
    for _ in 0..3 {
        let err = failing(&cb).await.unwrap_err();
        assert_eq!(err.into_operation(), Some(DownstreamError("unavailable")));
    }
    assert_eq!(cb.state(), CircuitState::Open);
    let opened_at = cb.last_failure_time().unwrap();

    // t+10s: rejected without running
    tokio::time::advance(Duration::from_secs(10)).await;
    let ran = AtomicUsize::new(0);
    let err = cb
        .call(|| async {
            ran.fetch_add(1, Ordering::SeqCst);
            Ok::<_, DownstreamError>(())
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CircuitError::Open { ref breaker } if breaker == "downstream"));
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(cb.state(), CircuitState::Open);

    // t+61s: admitted as the half-open trial, and it fails
    tokio::time::advance(Duration::from_secs(51)).await;
    let err = cb
        .call(|| async {
            ran.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(DownstreamError("still down"))
        })
        .await
        .unwrap_err();
    assert_eq!(err.into_operation(), Some(DownstreamError("still down")));
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    assert_eq!(cb.state(), CircuitState::Open);
    assert_eq!(
        cb.last_failure_time().unwrap() - opened_at,
        Duration::from_secs(61)
    );
}

#[tokio::test(start_paused = true)]
async fn single_half_open_failure_reopens_after_any_successes() {
    for prior_successes in 0..3 {
        let cb = breaker(1, 5);
        let _ = failing(&cb).await;
        tokio::time::advance(Duration::from_secs(5)).await;

        for _ in 0..prior_successes {
            succeeding(&cb).await.unwrap();
            assert_eq!(cb.state(), CircuitState::HalfOpen);
        }
        let _ = failing(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open, "after {prior_successes} successes");
        assert!(failing(&cb).await.unwrap_err().is_open());
    }
}

#[tokio::test(start_paused = true)]
async fn three_half_open_successes_close() {
    let cb = breaker(2, 30);
    let _ = failing(&cb).await;
    let _ = failing(&cb).await;
    assert_eq!(cb.failure_count(), 2);

    tokio::time::advance(Duration::from_secs(30)).await;
    succeeding(&cb).await.unwrap();
    succeeding(&cb).await.unwrap();
    assert_eq!(cb.state(), CircuitState::HalfOpen);
    succeeding(&cb).await.unwrap();
    assert_eq!(cb.state(), CircuitState::Closed);
    assert_eq!(cb.failure_count(), 0);

    // Closed again: a single failure does not trip a threshold of 2.
    let _ = failing(&cb).await;
    assert_eq!(cb.state(), CircuitState::Closed);
}

#[test]
fn concurrent_failures_open_once() {
    const THREADS: usize = 32;
    let cb = breaker(10, 60);
    let barrier = Barrier::new(THREADS);

    std::thread::scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                barrier.wait();
                let _ = cb.call_blocking(|| Err::<(), _>(DownstreamError("boom")));
            });
        }
    });

    let stats = cb.stats();
    assert_eq!(stats.state, CircuitState::Open);
    assert_eq!(stats.times_opened, 1);
    // Late failures from calls admitted before opening are still counted.
    assert!(stats.failure_count >= 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_call_does_not_block_other_breakers() {
    let registry = Arc::new(BreakerRegistry::default());
    let (entered_tx, entered_rx) = tokio::sync::oneshot::channel::<()>();
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

    let slow_registry = Arc::clone(&registry);
    let slow = tokio::spawn(async move {
        slow_registry
            .get("slow")
            .call(|| async move {
                let _ = entered_tx.send(());
                let _ = release_rx.await;
                Ok::<_, DownstreamError>(())
            })
            .await
    });

    // The slow call is parked inside its operation; other keys stay usable.
    entered_rx.await.unwrap();
    for i in 0..50 {
        let name = format!("fast-{i}");
        registry
            .get(&name)
            .call(|| async { Ok::<_, DownstreamError>(()) })
            .await
            .unwrap();
    }
    assert_eq!(registry.len(), 51);
    assert_eq!(registry.get("slow").state(), CircuitState::Closed);

    release_tx.send(()).unwrap();
    slow.await.unwrap().unwrap();
}

// ─── Token bucket ─────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn capacity_then_refill_scenario() {
    // capacity=10, refill_rate=5/s
    let bucket = TokenBucket::new(RateLimiterConfig {
        capacity: 10.0,
        refill_rate: 5.0,
    });
    for i in 0..10 {
        assert!(bucket.consume(1), "request {i} should pass");
    }
    assert!(!bucket.consume(1), "11th request should be denied");

    tokio::time::advance(Duration::from_secs(1)).await;
    assert!(bucket.consume(1));
}

#[tokio::test(start_paused = true)]
async fn new_token_only_after_one_over_rate() {
    for rate in [0.5_f64, 2.0, 8.0] {
        let bucket = TokenBucket::new(RateLimiterConfig {
            capacity: 3.0,
            refill_rate: rate,
        });
        assert!(bucket.consume(3));
        assert!(!bucket.consume(1));

        let full = Duration::from_secs_f64(1.0 / rate);
        tokio::time::advance(full.mul_f64(0.9)).await;
        assert!(!bucket.consume(1), "rate={rate}: too early");
        tokio::time::advance(full.mul_f64(0.2)).await;
        assert!(bucket.consume(1), "rate={rate}: should have refilled");
    }
}

#[test]
fn concurrent_consumers_never_overdraw() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 50;
    let bucket = TokenBucket::new(RateLimiterConfig {
        capacity: 100.0,
        refill_rate: 0.0,
    });
    let admitted = AtomicUsize::new(0);
    let barrier = Barrier::new(THREADS);

    std::thread::scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                barrier.wait();
                for _ in 0..PER_THREAD {
                    if bucket.consume(1) {
                        admitted.fetch_add(1, Ordering::SeqCst);
                    }
                }
            });
        }
    });

    assert_eq!(admitted.load(Ordering::SeqCst), 100);
    assert_eq!(bucket.available(), 0.0);
}

// ─── Registry ─────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_access_yields_one_breaker() {
    let registry = Arc::new(BreakerRegistry::default());
    let start = Arc::new(tokio::sync::Barrier::new(16));

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let start = Arc::clone(&start);
            tokio::spawn(async move {
                start.wait().await;
                registry.database("orders")
            })
        })
        .collect();

    let mut breakers = Vec::new();
    for h in handles {
        breakers.push(h.await.unwrap());
    }
    assert_eq!(registry.len(), 1);
    assert!(breakers.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
}

#[test]
fn generic_registry_counts_constructions() {
    let registry: KeyedRegistry<(String, String), TokenBucket> = KeyedRegistry::new();
    let built = AtomicUsize::new(0);
    let barrier = Barrier::new(8);

    std::thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| {
                barrier.wait();
                registry.get_or_create(("client:a".into(), "/svc/Get".into()), |_| {
                    built.fetch_add(1, Ordering::SeqCst);
                    TokenBucket::new(RateLimiterConfig::default())
                });
            });
        }
    });

    assert_eq!(built.load(Ordering::SeqCst), 1);
    assert_eq!(registry.len(), 1);
}
