//! Generic retry loop with pluggable backoff.
//!
//! [`with_retry`] re-runs an async operation until it succeeds, the
//! [`RetryPolicy`] predicate vetoes the failure, or attempts run out; the
//! last failure is returned unchanged. [`with_retry_stream`] does the same
//! for streams, restarting the whole stream on a retryable failure. Items
//! yielded before the failure are yielded again by the restarted stream;
//! callers needing at-most-once delivery dedup on their side.

pub mod rate_limit;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, BoxStream, StreamExt};
use rand::Rng;
use tracing::{debug, warn};

use crate::errors::NetworkErrorKind;
use crate::{AppError, Result};

/// Jitter spread as a fraction of the capped delay.
const JITTER_FRACTION: f64 = 0.25;

type DelayFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;
type RetryPredicate = Arc<dyn Fn(&AppError) -> bool + Send + Sync>;
type RetryHook = Arc<dyn Fn(u32, &AppError) + Send + Sync>;

/// Delay growth between attempts. `attempt` is 1-based.
#[derive(Clone, Default)]
pub enum Backoff {
    /// `base * 2^(attempt - 1)`.
    #[default]
    Exponential,
    /// `base * attempt`.
    Linear,
    /// `base`.
    Constant,
    /// Caller-supplied `attempt -> delay`.
    Custom(DelayFn),
}

impl Backoff {
    /// Wrap a delay function.
    pub fn custom(f: impl Fn(u32) -> Duration + Send + Sync + 'static) -> Self {
        Self::Custom(Arc::new(f))
    }

    fn raw_delay(&self, attempt: u32, base: Duration) -> Duration {
        let attempt = attempt.max(1);
        match self {
            Self::Exponential => base.saturating_mul(2u32.saturating_pow(attempt - 1)),
            Self::Linear => base.saturating_mul(attempt),
            Self::Constant => base,
            Self::Custom(f) => f(attempt),
        }
    }
}

impl std::fmt::Debug for Backoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exponential => f.write_str("Exponential"),
            Self::Linear => f.write_str("Linear"),
            Self::Constant => f.write_str("Constant"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Retry configuration, built fluently.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: bool,
    strategy: Backoff,
    retry_if: RetryPredicate,
    on_retry: Option<RetryHook>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("jitter", &self.jitter)
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            jitter: true,
            strategy: Backoff::Exponential,
            retry_if: Arc::new(is_retryable),
            on_retry: None,
        }
    }
}

impl RetryPolicy {
    /// Policy with the default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total attempts including the first; at least 1.
    #[must_use]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Delay unit the strategy scales.
    #[must_use]
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Hard cap on any single delay, jitter included.
    #[must_use]
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Enable or disable ±25 % jitter.
    #[must_use]
    pub fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Backoff strategy.
    #[must_use]
    pub fn strategy(mut self, strategy: Backoff) -> Self {
        self.strategy = strategy;
        self
    }

    /// Replace the retry predicate.
    #[must_use]
    pub fn retry_if(mut self, predicate: impl Fn(&AppError) -> bool + Send + Sync + 'static) -> Self {
        self.retry_if = Arc::new(predicate);
        self
    }

    /// Same policy, but rate limits are never retried.
    ///
    /// Used under [`rate_limit::with_rate_limit_handling`] so throttling
    /// reaches the cooldown handler on its first occurrence.
    #[must_use]
    pub fn excluding_rate_limits(mut self) -> Self {
        let retry_if = Arc::clone(&self.retry_if);
        self.retry_if = Arc::new(move |err: &AppError| {
            rate_limit::detect(err).is_none() && retry_if(err)
        });
        self
    }

    /// Hook called with the attempt number and failure before each sleep.
    #[must_use]
    pub fn on_retry(mut self, hook: impl Fn(u32, &AppError) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Arc::new(hook));
        self
    }

    /// Configured attempt limit.
    #[must_use]
    pub fn attempt_limit(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the retry that follows failed attempt `attempt`.
    #[must_use]
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let capped = self
            .strategy
            .raw_delay(attempt, self.base_delay)
            .min(self.max_delay);
        if !self.jitter {
            return capped;
        }

        let secs = capped.as_secs_f64();
        let spread = secs * JITTER_FRACTION;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((secs + offset).max(0.0)).min(self.max_delay)
    }

    /// Whether `attempt` failed with `err` and another attempt should run.
    fn should_retry(&self, attempt: u32, err: &AppError) -> bool {
        attempt < self.max_attempts && (self.retry_if)(err)
    }

    /// Run the hook, log, and return the delay for the next attempt.
    fn before_retry(&self, attempt: u32, err: &AppError) -> Duration {
        let delay = self.calculate_delay(attempt);
        if let Some(hook) = &self.on_retry {
            hook(attempt, err);
        }
        warn!(
            attempt,
            max_attempts = self.max_attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %err,
            "retrying after failure"
        );
        delay
    }
}

/// Default retry predicate.
///
/// Retries timeouts, connection resets and refusals, DNS failures, stream
/// resets, HTTP 5xx and 429, transport failures flagged retryable, and rate
/// limits. Authentication and malformed-request failures never retry.
#[must_use]
pub fn is_retryable(err: &AppError) -> bool {
    match err {
        AppError::Timeout(_) | AppError::RateLimited(_) => true,
        AppError::Network { kind, .. } => matches!(
            kind,
            NetworkErrorKind::ConnectionReset
                | NetworkErrorKind::ConnectionRefused
                | NetworkErrorKind::Dns
                | NetworkErrorKind::StreamReset
        ),
        AppError::Http { status, .. } => *status == 429 || (500..600).contains(status),
        AppError::Transport(transport) => transport.retryable,
        AppError::Api { .. } => rate_limit::detect(err).is_some(),
        _ => false,
    }
}

/// Run `op` under `policy`.
///
/// # Errors
///
/// Returns the last failure once the predicate vetoes it or attempts run
/// out.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if policy.should_retry(attempt, &err) => {
                let delay = policy.before_retry(attempt, &err);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                debug!(attempt, error = %err, "giving up");
                return Err(err);
            }
        }
    }
}

struct StreamRetry<T, F> {
    policy: RetryPolicy,
    open: F,
    attempt: u32,
    current: Option<BoxStream<'static, Result<T>>>,
    done: bool,
}

impl<T, F, Fut> StreamRetry<T, F>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<BoxStream<'static, Result<T>>>>,
{
    async fn next_item(&mut self) -> Option<Result<T>> {
        if self.done {
            return None;
        }
        loop {
            let failure = match self.current.as_mut() {
                None => match (self.open)().await {
                    Ok(stream) => {
                        self.current = Some(stream);
                        continue;
                    }
                    Err(err) => err,
                },
                Some(stream) => match stream.next().await {
                    Some(Ok(item)) => return Some(Ok(item)),
                    Some(Err(err)) => err,
                    None => {
                        self.done = true;
                        return None;
                    }
                },
            };

            self.current = None;
            if !self.policy.should_retry(self.attempt, &failure) {
                self.done = true;
                return Some(Err(failure));
            }
            let delay = self.policy.before_retry(self.attempt, &failure);
            tokio::time::sleep(delay).await;
            self.attempt += 1;
        }
    }
}

/// Stream variant of [`with_retry`].
///
/// `open` builds a fresh stream per attempt. A retryable failure, whether
/// from `open` or yielded by the stream, discards the stream and restarts
/// from scratch; the final failure is yielded as the last item.
pub fn with_retry_stream<T, F, Fut>(policy: &RetryPolicy, open: F) -> BoxStream<'static, Result<T>>
where
    T: Send + 'static,
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<BoxStream<'static, Result<T>>>> + Send,
{
    let state = StreamRetry {
        policy: policy.clone(),
        open,
        attempt: 1,
        current: None,
        done: false,
    };
    stream::unfold(state, |mut state| async move {
        state.next_item().await.map(|item| (item, state))
    })
    .boxed()
}
