//! Runtime configuration parsing, validation, and credential loading.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::retry::rate_limit::RateLimitConfig;
use crate::retry::{Backoff, RetryPolicy};
use crate::{AppError, Result};

/// Keychain service name used for the API key.
const KEYRING_SERVICE: &str = "codex-turn";

/// Environment variables checked for the API key, in order.
pub const API_KEY_ENV_VARS: &[&str] = &["CODEX_API_KEY", "OPENAI_API_KEY"];

/// Settings for the one-process-per-turn transport.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SubprocessConfig {
    /// Backend executable.
    #[serde(default = "default_executable")]
    pub executable: PathBuf,
    /// Maximum silence between process outputs before the turn is aborted.
    #[serde(default = "default_event_timeout_ms")]
    pub event_timeout_ms: u64,
    /// Grace period between the stop signal and a forced kill.
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    /// Cap on captured stderr; the tail is kept.
    #[serde(default = "default_max_stderr_bytes")]
    pub max_stderr_bytes: usize,
    /// API key forwarded to the backend (loaded at runtime, never from TOML).
    #[serde(skip)]
    pub api_key: Option<String>,
}

impl Default for SubprocessConfig {
    fn default() -> Self {
        Self {
            executable: default_executable(),
            event_timeout_ms: default_event_timeout_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            max_stderr_bytes: default_max_stderr_bytes(),
            api_key: None,
        }
    }
}

impl SubprocessConfig {
    /// Inactivity window as a [`Duration`].
    #[must_use]
    pub fn event_timeout(&self) -> Duration {
        Duration::from_millis(self.event_timeout_ms)
    }

    /// Stop grace period as a [`Duration`].
    #[must_use]
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

fn default_executable() -> PathBuf {
    PathBuf::from("codex")
}

fn default_event_timeout_ms() -> u64 {
    15_000
}

fn default_stop_grace_ms() -> u64 {
    2_000
}

fn default_max_stderr_bytes() -> usize {
    64 * 1024
}

/// Settings for the shared app-server connection.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ConnectionConfig {
    /// Maximum wait for a turn's completion notification.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Arguments that start the app server (`codex <args>`).
    #[serde(default = "default_app_server_args")]
    pub app_server_args: Vec<String>,
    /// Timeout for a single JSON-RPC call.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: default_idle_timeout_ms(),
            app_server_args: default_app_server_args(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

impl ConnectionConfig {
    /// Idle window as a [`Duration`].
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Call timeout as a [`Duration`].
    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

fn default_idle_timeout_ms() -> u64 {
    300_000
}

fn default_app_server_args() -> Vec<String> {
    vec!["app-server".into()]
}

fn default_call_timeout_ms() -> u64 {
    60_000
}

/// Backoff strategy names accepted in TOML.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StrategyName {
    /// `base * 2^(attempt - 1)`.
    #[default]
    Exponential,
    /// `base * attempt`.
    Linear,
    /// `base`.
    Constant,
}

/// Retry engine settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RetryConfig {
    /// Total attempts including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Hard cap on any delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Apply ±25 % jitter.
    #[serde(default = "default_true")]
    pub jitter: bool,
    /// Backoff strategy.
    #[serde(default)]
    pub strategy: StrategyName,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: true,
            strategy: StrategyName::default(),
        }
    }
}

impl RetryConfig {
    /// Build a [`RetryPolicy`] with the default retry predicate.
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        let strategy = match self.strategy {
            StrategyName::Exponential => Backoff::Exponential,
            StrategyName::Linear => Backoff::Linear,
            StrategyName::Constant => Backoff::Constant,
        };
        RetryPolicy::new()
            .max_attempts(self.max_attempts)
            .base_delay(Duration::from_millis(self.base_delay_ms))
            .max_delay(Duration::from_millis(self.max_delay_ms))
            .jitter(self.jitter)
            .strategy(strategy)
    }
}

fn default_max_attempts() -> u32 {
    4
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_true() -> bool {
    true
}

/// Rate-limit cooldown settings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct RateLimitSettings {
    /// Cooldown for the first rate-limit hit.
    #[serde(default = "default_rl_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Cooldown cap.
    #[serde(default = "default_rl_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Growth factor per attempt.
    #[serde(default = "default_rl_multiplier")]
    pub multiplier: f64,
    /// Total attempts including the first.
    #[serde(default = "default_rl_max_attempts")]
    pub max_attempts: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            base_delay_ms: default_rl_base_delay_ms(),
            max_delay_ms: default_rl_max_delay_ms(),
            multiplier: default_rl_multiplier(),
            max_attempts: default_rl_max_attempts(),
        }
    }
}

impl RateLimitSettings {
    /// Build the handler configuration.
    #[must_use]
    pub fn handler_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
            max_attempts: self.max_attempts,
        }
    }
}

fn default_rl_base_delay_ms() -> u64 {
    1_000
}

fn default_rl_max_delay_ms() -> u64 {
    60_000
}

fn default_rl_multiplier() -> f64 {
    2.0
}

fn default_rl_max_attempts() -> u32 {
    3
}

/// Runtime configuration parsed from `config.toml`.
///
/// Every section is optional; an empty document yields the defaults.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct RuntimeConfig {
    /// Subprocess transport settings.
    #[serde(default)]
    pub subprocess: SubprocessConfig,
    /// Connection transport settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Retry engine settings.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Rate-limit handler settings.
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
}

impl RuntimeConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Populate the backend API key from the keychain or environment.
    ///
    /// A missing key is not an error: the backend may already be logged in.
    pub async fn load_credentials(&mut self) {
        self.subprocess.api_key = load_api_key().await;
    }

    fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(AppError::Config(
                "retry.max_attempts must be greater than zero".into(),
            ));
        }

        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(AppError::Config(
                "retry.base_delay_ms must not exceed retry.max_delay_ms".into(),
            ));
        }

        if self.rate_limit.max_attempts == 0 {
            return Err(AppError::Config(
                "rate_limit.max_attempts must be greater than zero".into(),
            ));
        }

        if !(self.rate_limit.multiplier.is_finite() && self.rate_limit.multiplier >= 1.0) {
            return Err(AppError::Config(
                "rate_limit.multiplier must be a finite number >= 1.0".into(),
            ));
        }

        if self.subprocess.event_timeout_ms == 0 || self.connection.idle_timeout_ms == 0 {
            return Err(AppError::Config("timeouts must be greater than zero".into()));
        }

        if self.subprocess.executable.as_os_str().is_empty() {
            return Err(AppError::Config("subprocess.executable must not be empty".into()));
        }

        Ok(())
    }
}

/// Load the backend API key from OS keychain with env-var fallback.
///
/// Returns `None` when neither source provides a non-empty value.
pub async fn load_api_key() -> Option<String> {
    // keyring is synchronous I/O.
    let keychain_result = tokio::task::spawn_blocking(|| {
        keyring::Entry::new(KEYRING_SERVICE, "api_key").and_then(|entry| entry.get_password())
    })
    .await;

    match keychain_result {
        Ok(Ok(value)) if !value.is_empty() => return Some(value),
        Ok(Ok(_)) => warn!("keychain api key is empty, trying env vars"),
        Ok(Err(err)) => warn!(?err, "keychain lookup failed, trying env vars"),
        Err(err) => warn!(%err, "keychain task panicked, trying env vars"),
    }

    api_key_from_env()
}

/// First non-empty API key among [`API_KEY_ENV_VARS`].
#[must_use]
pub fn api_key_from_env() -> Option<String> {
    API_KEY_ENV_VARS
        .iter()
        .filter_map(|key| env::var(key).ok())
        .find(|value| !value.is_empty())
}
