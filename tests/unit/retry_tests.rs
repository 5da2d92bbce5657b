//! Unit tests for the retry engine.
//!
//! Covers:
//! - delay growth for each backoff strategy and the `max_delay` cap
//! - jitter bounds
//! - the default retry predicate
//! - attempt counting, hook calls, and non-retryable short-circuit
//! - rate limits left to the cooldown handler
//! - whole-stream restart in `with_retry_stream`

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::stream::{self, StreamExt};

use codex_turn::errors::{ExitKind, NetworkErrorKind, RateLimitError, TransportError};
use codex_turn::retry::rate_limit::{with_rate_limit_handling, RateLimitConfig};
use codex_turn::retry::{is_retryable, with_retry, with_retry_stream, Backoff, RetryPolicy};
use codex_turn::AppError;

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

fn fixed(strategy: Backoff) -> RetryPolicy {
    RetryPolicy::new()
        .base_delay(ms(100))
        .max_delay(ms(10_000))
        .jitter(false)
        .strategy(strategy)
}

// ── Delays ───────────────────────────────────────────────────────────────────

/// Exponential backoff doubles from the base and never shrinks.
#[test]
fn exponential_delays_double() {
    let policy = fixed(Backoff::Exponential);

    assert_eq!(policy.calculate_delay(1), ms(100));
    assert_eq!(policy.calculate_delay(2), ms(200));
    assert_eq!(policy.calculate_delay(3), ms(400));

    let delays: Vec<_> = (1..=20).map(|n| policy.calculate_delay(n)).collect();
    assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
    assert!(delays.iter().all(|delay| *delay <= ms(10_000)));
    assert_eq!(delays.last(), Some(&ms(10_000)));
}

/// Linear backoff grows by one base per attempt.
#[test]
fn linear_delays_grow_by_base() {
    let policy = fixed(Backoff::Linear);
    assert_eq!(policy.calculate_delay(1), ms(100));
    assert_eq!(policy.calculate_delay(4), ms(400));
}

/// Constant backoff always waits the base delay.
#[test]
fn constant_delays_stay_flat() {
    let policy = fixed(Backoff::Constant);
    assert_eq!(policy.calculate_delay(1), ms(100));
    assert_eq!(policy.calculate_delay(9), ms(100));
}

/// Custom backoff is used as given, still capped.
#[test]
fn custom_delays_are_capped() {
    let policy = fixed(Backoff::custom(|attempt| ms(u64::from(attempt) * 7_000)));
    assert_eq!(policy.calculate_delay(1), ms(7_000));
    assert_eq!(policy.calculate_delay(2), ms(10_000));
}

/// Jittered delays stay within a quarter of the capped delay.
#[test]
fn jitter_stays_in_bounds() {
    let policy = fixed(Backoff::Constant).base_delay(ms(1_000)).jitter(true);
    for _ in 0..200 {
        let delay = policy.calculate_delay(1);
        assert!(delay >= ms(750), "{delay:?} below bound");
        assert!(delay <= ms(1_250), "{delay:?} above bound");
    }
}

/// Jitter never pushes a delay past `max_delay`.
#[test]
fn jitter_respects_cap() {
    let policy = fixed(Backoff::Constant)
        .base_delay(ms(5_000))
        .max_delay(ms(5_000))
        .jitter(true);
    for _ in 0..200 {
        assert!(policy.calculate_delay(1) <= ms(5_000));
    }
}

/// A zero attempt limit is raised to one.
#[test]
fn attempt_limit_is_at_least_one() {
    assert_eq!(RetryPolicy::new().max_attempts(0).attempt_limit(), 1);
    assert_eq!(RetryPolicy::new().attempt_limit(), 4);
}

// ── Classification ───────────────────────────────────────────────────────────

/// Transient failures retry; permanent ones do not.
#[test]
fn default_predicate_classification() {
    let network = |kind| AppError::Network {
        kind,
        message: "boom".into(),
    };
    let http = |status| AppError::Http {
        status,
        headers: Vec::new(),
        body: String::new(),
    };
    let transport = |retryable| {
        AppError::Transport(TransportError {
            exit: ExitKind::Code(1),
            stderr: String::new(),
            truncated: false,
            retryable,
        })
    };

    assert!(is_retryable(&AppError::Timeout("slow".into())));
    assert!(is_retryable(&AppError::RateLimited(RateLimitError {
        message: "slow down".into(),
        retry_after: None,
    })));
    assert!(is_retryable(&network(NetworkErrorKind::ConnectionReset)));
    assert!(is_retryable(&network(NetworkErrorKind::ConnectionRefused)));
    assert!(is_retryable(&network(NetworkErrorKind::Dns)));
    assert!(is_retryable(&network(NetworkErrorKind::StreamReset)));
    assert!(is_retryable(&http(503)));
    assert!(is_retryable(&http(429)));
    assert!(is_retryable(&transport(true)));
    assert!(is_retryable(&AppError::Api {
        status: None,
        payload: serde_json::json!({ "code": "rate_limit_exceeded" }),
    }));

    assert!(!is_retryable(&network(NetworkErrorKind::Other)));
    assert!(!is_retryable(&http(400)));
    assert!(!is_retryable(&transport(false)));
    assert!(!is_retryable(&AppError::Auth("bad key".into())));
    assert!(!is_retryable(&AppError::InvalidRequest("bad input".into())));
    assert!(!is_retryable(&AppError::Api {
        status: Some(400),
        payload: serde_json::json!({ "code": "invalid_prompt" }),
    }));
}

// ── with_retry ───────────────────────────────────────────────────────────────

/// A persistently timing-out operation runs `max_attempts` times.
#[tokio::test(start_paused = true)]
async fn timeouts_exhaust_attempts() {
    let calls = &AtomicU32::new(0);
    let policy = RetryPolicy::new()
        .max_attempts(3)
        .base_delay(ms(10))
        .jitter(false);

    let result: codex_turn::Result<()> = with_retry(&policy, || async move {
        calls.fetch_add(1, Ordering::SeqCst);
        Err(AppError::Timeout("backend silent".into()))
    })
    .await;

    assert!(matches!(result, Err(AppError::Timeout(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

/// A non-retryable failure stops after one attempt without the hook.
#[tokio::test]
async fn auth_failure_is_not_retried() {
    let calls = &AtomicU32::new(0);
    let hooks = Arc::new(AtomicU32::new(0));
    let hook_count = Arc::clone(&hooks);
    let policy = RetryPolicy::new().on_retry(move |_, _| {
        hook_count.fetch_add(1, Ordering::SeqCst);
    });

    let result: codex_turn::Result<()> = with_retry(&policy, || async move {
        calls.fetch_add(1, Ordering::SeqCst);
        Err(AppError::Auth("bad key".into()))
    })
    .await;

    assert!(matches!(result, Err(AppError::Auth(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(hooks.load(Ordering::SeqCst), 0);
}

/// Success after failures returns the value; the hook sees each failure.
#[tokio::test(start_paused = true)]
async fn recovers_after_transient_failures() {
    let calls = &AtomicU32::new(0);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&seen);
    let policy = RetryPolicy::new()
        .jitter(false)
        .on_retry(move |attempt, err| recorder.lock().unwrap().push((attempt, err.to_string())));

    let value = with_retry(&policy, || async move {
        match calls.fetch_add(1, Ordering::SeqCst) {
            0 | 1 => Err(AppError::Timeout("slow".into())),
            _ => Ok("done"),
        }
    })
    .await
    .unwrap();

    assert_eq!(value, "done");
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].0, 1);
    assert_eq!(seen[1].0, 2);
}

/// A custom predicate can veto retries of otherwise transient failures.
#[tokio::test]
async fn custom_predicate_vetoes_retry() {
    let calls = &AtomicU32::new(0);
    let policy = RetryPolicy::new().retry_if(|_| false);

    let result: codex_turn::Result<()> = with_retry(&policy, || async move {
        calls.fetch_add(1, Ordering::SeqCst);
        Err(AppError::Timeout("slow".into()))
    })
    .await;

    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

/// Under the cooldown handler, throttling is not retried by the policy:
/// the first 429 waits out its hint, while timeouts still use backoff.
#[tokio::test(start_paused = true)]
async fn rate_limits_bypass_policy_under_cooldown_handler() {
    let calls = &AtomicU32::new(0);
    let retries = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&retries);
    let policy = &RetryPolicy::new()
        .jitter(false)
        .on_retry(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .excluding_rate_limits();
    let started = tokio::time::Instant::now();

    let value = with_rate_limit_handling(&RateLimitConfig::default(), move || {
        with_retry(policy, move || async move {
            match calls.fetch_add(1, Ordering::SeqCst) {
                0 => Err(AppError::Timeout("slow".into())),
                1 => Err(AppError::Http {
                    status: 429,
                    headers: vec![("retry-after".into(), "30".into())],
                    body: String::new(),
                }),
                _ => Ok("done"),
            }
        })
    })
    .await
    .unwrap();

    assert_eq!(value, "done");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(retries.load(Ordering::SeqCst), 1);
    assert!(started.elapsed() >= Duration::from_secs(30));
    assert!(started.elapsed() < Duration::from_secs(31));
}

/// A policy excluding rate limits gives up on the first throttled call.
#[tokio::test]
async fn excluded_rate_limit_is_returned_at_once() {
    let calls = &AtomicU32::new(0);
    let policy = RetryPolicy::new().excluding_rate_limits();

    let result: codex_turn::Result<()> = with_retry(&policy, || async move {
        calls.fetch_add(1, Ordering::SeqCst);
        Err(AppError::RateLimited(RateLimitError {
            message: "slow down".into(),
            retry_after: None,
        }))
    })
    .await;

    assert!(matches!(result, Err(AppError::RateLimited(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// ── with_retry_stream ────────────────────────────────────────────────────────

/// A retryable mid-stream failure restarts the stream from the beginning.
#[tokio::test(start_paused = true)]
async fn stream_restarts_and_redelivers() {
    let opens = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&opens);
    let policy = RetryPolicy::new().jitter(false);

    let items: Vec<_> = with_retry_stream(&policy, move || {
        let attempt = counter.fetch_add(1, Ordering::SeqCst);
        async move {
            let items = if attempt == 0 {
                vec![Ok(1), Err(AppError::Timeout("dropped".into()))]
            } else {
                vec![Ok(1), Ok(2)]
            };
            Ok(stream::iter(items).boxed())
        }
    })
    .collect()
    .await;

    let values: Vec<i32> = items.into_iter().map(Result::unwrap).collect();
    assert_eq!(values, vec![1, 1, 2]);
    assert_eq!(opens.load(Ordering::SeqCst), 2);
}

/// Open failures are retried too; the final failure ends the stream.
#[tokio::test(start_paused = true)]
async fn stream_open_failures_exhaust_attempts() {
    let opens = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&opens);
    let policy = RetryPolicy::new().max_attempts(2).jitter(false);

    let items: Vec<codex_turn::Result<i32>> = with_retry_stream(&policy, move || {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Err(AppError::Timeout("no backend".into())) }
    })
    .collect()
    .await;

    assert_eq!(items.len(), 1);
    assert!(matches!(items[0], Err(AppError::Timeout(_))));
    assert_eq!(opens.load(Ordering::SeqCst), 2);
}
