//! Turn requests and transport dispatch.
//!
//! A [`TurnRequest`] names the input, the transport to use, and the
//! per-turn options. [`TurnRunner`] owns one instance of each transport and
//! routes a request to the chosen one, either collecting the whole turn or
//! returning a [`TurnStream`].

use std::path::PathBuf;
use std::sync::Arc;

use futures_util::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};

use crate::connection::ConnectionTransport;
use crate::event::ThreadEvent;
use crate::retry::rate_limit::{with_rate_limit_handling, RateLimitConfig};
use crate::retry::{with_retry, with_retry_stream, RetryPolicy};
use crate::stream::{StreamEvent, TurnStream};
use crate::subprocess::SubprocessTransport;
use crate::{AppError, Result};

/// File handed to the backend alongside the turn input.
///
/// Staging and checksumming happen before the turn is built; the runtime
/// only forwards the result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Staged file path.
    pub path: PathBuf,
    /// Display name.
    pub name: String,
    /// Content checksum.
    pub checksum: String,
}

/// Per-call overrides for `turn/start` on the persistent connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnOverrides {
    /// Working directory for the turn.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    /// Model override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Approval policy wire value (`never`, `on-request`, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_policy: Option<String>,
    /// Sandbox policy payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_policy: Option<serde_json::Value>,
    /// Reasoning effort (`low`, `medium`, `high`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effort: Option<String>,
    /// Reasoning summary verbosity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// Options shared by both transports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnOptions {
    /// Model to run the turn with.
    pub model: Option<String>,
    /// Existing thread to continue; a new thread is started when absent.
    pub thread_id: Option<String>,
    /// Opaque continuation token from a previous turn.
    pub continuation_token: Option<String>,
    /// Staged attachments.
    pub attachments: Vec<Attachment>,
    /// Connection-only overrides.
    pub overrides: TurnOverrides,
}

/// Which transport executes a turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransportChoice {
    /// One `codex exec` process per turn.
    #[default]
    Subprocess,
    /// The shared app-server connection.
    Connection,
}

/// A single turn to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnRequest {
    /// Turn input text.
    pub input: String,
    /// Transport to use.
    pub transport: TransportChoice,
    /// Turn options.
    pub options: TurnOptions,
}

impl TurnRequest {
    /// Build a subprocess request with default options.
    #[must_use]
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            transport: TransportChoice::Subprocess,
            options: TurnOptions::default(),
        }
    }

    /// Select the transport.
    #[must_use]
    pub fn with_transport(mut self, transport: TransportChoice) -> Self {
        self.transport = transport;
        self
    }

    /// Replace the options.
    #[must_use]
    pub fn with_options(mut self, options: TurnOptions) -> Self {
        self.options = options;
        self
    }
}

/// Routes turn requests to a transport.
#[derive(Clone)]
pub struct TurnRunner {
    subprocess: SubprocessTransport,
    connection: Option<Arc<ConnectionTransport>>,
}

impl TurnRunner {
    /// Runner that only has the subprocess transport.
    #[must_use]
    pub fn new(subprocess: SubprocessTransport) -> Self {
        Self {
            subprocess,
            connection: None,
        }
    }

    /// Attach a connection transport.
    #[must_use]
    pub fn with_connection(mut self, connection: Arc<ConnectionTransport>) -> Self {
        self.connection = Some(connection);
        self
    }

    /// Run a turn to completion and return its events in order.
    ///
    /// # Errors
    ///
    /// Propagates the chosen transport's failure; returns
    /// [`AppError::Config`] when the connection transport is requested but
    /// not configured.
    pub async fn run(&self, request: &TurnRequest) -> Result<Vec<ThreadEvent>> {
        match request.transport {
            TransportChoice::Subprocess => {
                self.subprocess
                    .run(&request.input, &request.options)
                    .await
            }
            TransportChoice::Connection => {
                self.connection()?
                    .run(&request.input, &request.options)
                    .await
            }
        }
    }

    /// Start a streamed turn.
    ///
    /// The returned stream is lazy: nothing is spawned or called until it
    /// is first read.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Config`] when the connection transport is
    /// requested but not configured.
    pub fn run_stream(&self, request: &TurnRequest) -> Result<TurnStream> {
        match request.transport {
            TransportChoice::Subprocess => Ok(self
                .subprocess
                .run_turn_stream(request.input.clone(), request.options.clone())),
            TransportChoice::Connection => Ok(self
                .connection()?
                .run_stream(request.input.clone(), request.options.clone())),
        }
    }

    /// Run a streamed turn and keep only the agent's text output.
    ///
    /// # Errors
    ///
    /// Returns the first error raised by the stream.
    pub async fn run_text(&self, request: &TurnRequest) -> Result<String> {
        let stream = self.run_stream(request)?;
        let mut events = stream.events().await?;
        let mut text = String::new();
        while let Some(event) = events.next().await {
            if let StreamEvent::Raw(ThreadEvent::AgentMessage { text: chunk }) = event? {
                text.push_str(&chunk);
            }
        }
        Ok(text)
    }

    /// Run a turn under `policy`, cooling down through rate limits.
    ///
    /// Rate limits skip `policy` and go straight to the cooldown handler;
    /// every other failure is retried by `policy`.
    ///
    /// # Errors
    ///
    /// Returns the last failure once retries are exhausted, or
    /// [`AppError::StillRateLimited`] when every cooldown was spent.
    pub async fn run_with_retry(
        &self,
        request: &TurnRequest,
        policy: &RetryPolicy,
        limits: &RateLimitConfig,
    ) -> Result<Vec<ThreadEvent>> {
        let policy = &policy.clone().excluding_rate_limits();
        with_rate_limit_handling(limits, move || with_retry(policy, move || self.run(request)))
            .await
    }

    /// Streamed turn that restarts from scratch on a retryable failure.
    ///
    /// Events seen before a failure are delivered again by the restarted
    /// turn.
    #[must_use]
    pub fn run_stream_with_retry(&self, request: TurnRequest, policy: RetryPolicy) -> TurnStream {
        let runner = self.clone();
        TurnStream::from_events(move || {
            async move {
                Ok::<_, AppError>(with_retry_stream(&policy, move || {
                    let runner = runner.clone();
                    let request = request.clone();
                    async move { runner.run_stream(&request)?.raw_events().await }
                }))
            }
            .boxed()
        })
    }

    fn connection(&self) -> Result<&ConnectionTransport> {
        self.connection
            .as_deref()
            .ok_or_else(|| AppError::Config("connection transport is not configured".into()))
    }
}
