//! Rate-limit detection and cooldown handling.
//!
//! [`detect`] recognises throttling in any [`AppError`], in precedence
//! order:
//!
//! 1. [`AppError::RateLimited`]: explicit signal, hint taken as is.
//! 2. [`AppError::Http`] with status 429: hint from `retry-after-ms` or
//!    `retry-after` headers.
//! 3. [`AppError::Api`] whose payload `code` or `type` names a rate limit.
//! 4. [`AppError::Api`] with status 429.
//!
//! [`with_rate_limit_handling`] sleeps through each cooldown and gives up
//! with [`AppError::StillRateLimited`] once attempts run out.

use std::future::Future;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::errors::RateLimitError;
use crate::{AppError, Result};

/// Throttling recognised in an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitSignal {
    /// Human-readable description.
    pub message: String,
    /// Server-provided cooldown hint.
    pub retry_after: Option<Duration>,
}

impl From<RateLimitSignal> for RateLimitError {
    fn from(signal: RateLimitSignal) -> Self {
        Self {
            message: signal.message,
            retry_after: signal.retry_after,
        }
    }
}

/// Cooldown settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    /// Cooldown after the first hit.
    pub base_delay: Duration,
    /// Cap on computed cooldowns; server hints are not capped.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Total attempts including the first.
    pub max_attempts: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            max_attempts: 3,
        }
    }
}

impl RateLimitConfig {
    /// Cooldown after rate-limited attempt `attempt` (1-based).
    ///
    /// A positive server hint is used as is. Without one the delay grows
    /// by `multiplier` per attempt, capped at `max_delay`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        if let Some(hint) = hint.filter(|hint| !hint.is_zero()) {
            return hint;
        }
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

// ── Detection ────────────────────────────────────────────────────────────────

/// Classify `err` as a rate limit.
#[must_use]
pub fn detect(err: &AppError) -> Option<RateLimitSignal> {
    match err {
        AppError::RateLimited(limit) => Some(RateLimitSignal {
            message: limit.message.clone(),
            retry_after: limit.retry_after,
        }),
        AppError::Http {
            status: 429,
            headers,
            body,
        } => Some(RateLimitSignal {
            message: if body.is_empty() {
                "http 429".to_owned()
            } else {
                body.clone()
            },
            retry_after: retry_after_from_headers(headers),
        }),
        AppError::Api { payload, .. } if has_rate_limit_marker(payload) => {
            Some(api_signal(payload))
        }
        AppError::Api {
            status: Some(429),
            payload,
        } => Some(api_signal(payload)),
        _ => None,
    }
}

const MARKER_KEYS: &[&str] = &["code", "type", "codexErrorInfo"];

fn has_rate_limit_marker(payload: &Value) -> bool {
    error_objects(payload).any(|object| {
        MARKER_KEYS
            .iter()
            .filter_map(|key| object.get(*key).and_then(Value::as_str))
            .any(is_rate_limit_marker)
    })
}

fn is_rate_limit_marker(marker: &str) -> bool {
    let normalized: String = marker
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect();
    normalized.contains("ratelimit") || normalized == "toomanyrequests"
}

/// The payload object and its nested `error` / `data` objects.
fn error_objects(payload: &Value) -> impl Iterator<Item = &Map<String, Value>> {
    let top = payload.as_object();
    let nested = ["error", "data"]
        .into_iter()
        .filter_map(move |key| top.and_then(|object| object.get(key)))
        .filter_map(Value::as_object);
    top.into_iter().chain(nested)
}

fn api_signal(payload: &Value) -> RateLimitSignal {
    let message = error_objects(payload)
        .find_map(|object| object.get("message").and_then(Value::as_str))
        .unwrap_or("rate limited")
        .to_owned();
    let retry_after = error_objects(payload).find_map(parse_retry_after_map);
    RateLimitSignal {
        message,
        retry_after,
    }
}

// ── Retry-After parsing ──────────────────────────────────────────────────────

/// Parse a cooldown hint.
///
/// - Numbers: below 1000 they are seconds, otherwise milliseconds.
/// - Strings: parsed as numbers with the same rule.
/// - Objects: `retry-after-ms` (milliseconds) or `retry-after`, matched
///   case-insensitively with `_` and `-` treated alike, also under a nested
///   `headers` object.
/// - Arrays of `[name, value]` pairs: read as headers.
#[must_use]
pub fn parse_retry_after(value: &Value) -> Option<Duration> {
    match value {
        Value::Number(number) => number.as_f64().and_then(seconds_or_millis),
        Value::String(text) => text.trim().parse::<f64>().ok().and_then(seconds_or_millis),
        Value::Object(map) => parse_retry_after_map(map),
        Value::Array(pairs) => {
            let headers: Vec<(String, String)> = pairs
                .iter()
                .filter_map(|pair| match pair.as_array()?.as_slice() {
                    [name, value] => Some((name.as_str()?.to_owned(), value_text(value)?)),
                    _ => None,
                })
                .collect();
            retry_after_from_headers(&headers)
        }
        _ => None,
    }
}

fn parse_retry_after_map(map: &Map<String, Value>) -> Option<Duration> {
    let mut seconds = None;
    for (key, value) in map {
        match normalize_key(key).as_str() {
            "retry-after-ms" | "retryafterms" => {
                if let Some(ms) = value_text(value).and_then(|text| text.trim().parse::<f64>().ok())
                {
                    return millis(ms);
                }
            }
            "retry-after" | "retryafter" | "headers" => {
                seconds = seconds.or_else(|| parse_retry_after(value));
            }
            _ => {}
        }
    }
    seconds
}

/// Cooldown hint from response headers.
///
/// `retry-after-ms` wins over `retry-after`; names are case-insensitive.
#[must_use]
pub fn retry_after_from_headers(headers: &[(String, String)]) -> Option<Duration> {
    let find = |wanted: &str| {
        headers
            .iter()
            .find(|(name, _)| normalize_key(name) == wanted)
            .and_then(|(_, value)| value.trim().parse::<f64>().ok())
    };
    find("retry-after-ms")
        .and_then(millis)
        .or_else(|| find("retry-after").and_then(seconds_or_millis))
}

fn normalize_key(key: &str) -> String {
    key.trim().to_ascii_lowercase().replace('_', "-")
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn seconds_or_millis(value: f64) -> Option<Duration> {
    if value < 1000.0 {
        Duration::try_from_secs_f64(value).ok()
    } else {
        millis(value)
    }
}

fn millis(value: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(value / 1000.0).ok()
}

// ── Handler ──────────────────────────────────────────────────────────────────

/// Run `op`, cooling down after each rate-limited attempt.
///
/// Failures that are not rate limits are returned unchanged.
///
/// # Errors
///
/// Returns [`AppError::StillRateLimited`] wrapping the last failure once
/// `max_attempts` attempts were all rate limited.
pub async fn with_rate_limit_handling<T, F, Fut>(config: &RateLimitConfig, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        let Some(signal) = detect(&err) else {
            return Err(err);
        };

        if attempt >= max_attempts {
            warn!(
                target: "codex_turn::rate_limit",
                attempts = attempt,
                message = %signal.message,
                "still rate limited, giving up"
            );
            return Err(AppError::StillRateLimited {
                attempts: attempt,
                retry_after: signal.retry_after,
                source: Box::new(err),
            });
        }

        let delay = config.delay_for(attempt, signal.retry_after);
        warn!(
            target: "codex_turn::rate_limit",
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            hinted = signal.retry_after.is_some(),
            message = %signal.message,
            "rate limited, cooling down"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
        debug!(attempt, "retrying after rate-limit cooldown");
    }
}
