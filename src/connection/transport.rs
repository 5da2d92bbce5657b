//! Turn execution over a shared persistent connection.
//!
//! A turn subscribes to the connection's inbound feed first, then resumes
//! or starts its thread and starts the turn. The synthetic
//! `thread.started` and `turn.started` events are emitted before any live
//! message. From then on every inbound message is correlated against the
//! turn's (thread id, turn id) pair; matched notifications become events,
//! matched approval requests are auto-resolved, and everything else is
//! left to the other turns sharing the connection.
//!
//! The turn ends cleanly on a matched `turn/completed`. If the turn sees
//! none of its own messages within the idle window it fails with
//! [`AppError::Timeout`]; traffic for other turns does not count.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use serde_json::{json, Map, Value};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::ConnectionConfig;
use crate::connection::approval::{is_approval_request, ApprovalResolver, AutoApprover};
use crate::connection::correlate::{message_matches, notification_to_event, TURN_COMPLETED};
use crate::connection::{Connection, InboundMessage, Subscription};
use crate::event::ThreadEvent;
use crate::stream::{pump, CancelMode, EventStream, ProducerFuture, PumpEnd, TurnSink, TurnStream};
use crate::turn::{TurnOptions, TurnOverrides};
use crate::{AppError, Result};

/// Outcome of [`ConnectionTransport::ensure_thread`].
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadHandle {
    /// Effective thread id.
    pub thread_id: String,
    /// Synthetic `thread.started` event.
    pub event: ThreadEvent,
    /// Raw call result.
    pub ack: Value,
}

/// Outcome of [`ConnectionTransport::start_turn`].
#[derive(Debug, Clone, PartialEq)]
pub struct TurnHandle {
    /// Turn id, when the backend reports one.
    pub turn_id: Option<String>,
    /// Synthetic `turn.started` event.
    pub event: ThreadEvent,
    /// Raw call result.
    pub ack: Value,
}

/// Runs turns on a shared [`Connection`]. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionTransport {
    conn: Arc<dyn Connection>,
    config: ConnectionConfig,
    resolver: Arc<dyn ApprovalResolver>,
}

impl std::fmt::Debug for ConnectionTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionTransport")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ConnectionTransport {
    /// Transport over `conn` that accepts every approval request.
    #[must_use]
    pub fn new(conn: Arc<dyn Connection>, config: ConnectionConfig) -> Self {
        Self {
            conn,
            config,
            resolver: Arc::new(AutoApprover::default()),
        }
    }

    /// Replace the approval resolver.
    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn ApprovalResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Resume `thread_id` when given, otherwise start a new thread.
    ///
    /// # Errors
    ///
    /// Propagates the call failure, or returns [`AppError::Connection`] when
    /// a new thread's id is missing from the result.
    pub async fn ensure_thread(
        &self,
        thread_id: Option<&str>,
        overrides: &TurnOverrides,
    ) -> Result<ThreadHandle> {
        let mut params = Map::new();
        if let Some(model) = &overrides.model {
            params.insert("model".into(), json!(model));
        }
        if let Some(cwd) = &overrides.cwd {
            params.insert("cwd".into(), json!(cwd));
        }

        let (ack, thread_id) = match thread_id.filter(|id| !id.trim().is_empty()) {
            Some(known) => {
                params.insert("threadId".into(), json!(known));
                let ack = self.conn.call("thread/resume", Value::Object(params)).await?;
                let id = ack_id(&ack, "thread", "threadId").unwrap_or_else(|| known.to_owned());
                (ack, id)
            }
            None => {
                let ack = self.conn.call("thread/start", Value::Object(params)).await?;
                let id = ack_id(&ack, "thread", "threadId").ok_or_else(|| {
                    AppError::Connection("thread/start result has no thread id".into())
                })?;
                (ack, id)
            }
        };

        info!(thread_id = %thread_id, "connection thread ready");
        Ok(ThreadHandle {
            event: ThreadEvent::ThreadStarted {
                thread_id: thread_id.clone(),
            },
            thread_id,
            ack,
        })
    }

    /// Start a turn on `thread_id`.
    ///
    /// # Errors
    ///
    /// Propagates the call failure.
    pub async fn start_turn(
        &self,
        thread_id: &str,
        input: &str,
        overrides: &TurnOverrides,
    ) -> Result<TurnHandle> {
        let mut params = match serde_json::to_value(overrides)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        params.insert("threadId".into(), json!(thread_id));
        params.insert("input".into(), json!([{ "type": "text", "text": input }]));

        let ack = self.conn.call("turn/start", Value::Object(params)).await?;
        let turn_id = ack_id(&ack, "turn", "turnId");
        info!(thread_id, turn_id = turn_id.as_deref(), "connection turn started");

        Ok(TurnHandle {
            event: ThreadEvent::TurnStarted {
                turn_id: turn_id.clone(),
            },
            turn_id,
            ack,
        })
    }

    /// Ask the backend to stop a turn. Best effort: the turn's own stream
    /// still ends through its usual path.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::MissingThread`] without a thread id, or the call
    /// failure.
    pub async fn interrupt(&self, thread_id: Option<&str>, turn_id: Option<&str>) -> Result<Value> {
        let thread_id = thread_id
            .filter(|id| !id.trim().is_empty())
            .ok_or(AppError::MissingThread)?;
        let mut params = json!({ "threadId": thread_id });
        if let Some(turn_id) = turn_id {
            params["turnId"] = json!(turn_id);
        }
        info!(thread_id, turn_id, "interrupting connection turn");
        self.conn.call("turn/interrupt", params).await
    }

    /// Run a turn and collect its events.
    ///
    /// # Errors
    ///
    /// Propagates setup call failures, [`AppError::Timeout`] when the turn
    /// goes idle, or [`AppError::Connection`] when the connection closes.
    pub async fn run(&self, input: &str, opts: &TurnOptions) -> Result<Vec<ThreadEvent>> {
        let turn = self.open(input, opts).await?;
        let mut events = turn.into_stream();
        let mut collected = Vec::new();
        while let Some(event) = events.next().await {
            collected.push(event?);
        }
        Ok(collected)
    }

    /// Lazy [`TurnStream`] for a turn.
    ///
    /// An immediate cancel also sends `turn/interrupt` for the turn.
    #[must_use]
    pub fn run_stream(&self, input: String, opts: TurnOptions) -> TurnStream {
        let transport = self.clone();
        TurnStream::new(Box::new(move |sink: TurnSink| {
            Ok(Box::pin(async move {
                let turn = transport.open(&input, &opts).await?;
                let thread_id = turn.thread_id.clone();
                let turn_id = turn.turn_id.clone();

                let end = pump(turn.into_stream(), &sink).await?;
                if end == PumpEnd::Cancelled(CancelMode::Immediate) {
                    if let Err(err) = transport
                        .interrupt(Some(&thread_id), turn_id.as_deref())
                        .await
                    {
                        warn!(thread_id = %thread_id, error = %err, "turn/interrupt failed");
                    }
                }
                Ok::<(), AppError>(())
            }) as ProducerFuture)
        }))
    }

    /// Subscribe, then establish the thread and turn.
    ///
    /// The subscription is dropped before any setup failure is returned.
    async fn open(&self, input: &str, opts: &TurnOptions) -> Result<TurnContext> {
        let subscription = self.conn.subscribe();

        let mut overrides = opts.overrides.clone();
        if overrides.model.is_none() {
            overrides.model.clone_from(&opts.model);
        }

        let established = async {
            let thread = self.ensure_thread(opts.thread_id.as_deref(), &overrides).await?;
            let turn = self.start_turn(&thread.thread_id, input, &overrides).await?;
            Ok::<_, AppError>((thread, turn))
        }
        .await;

        let (thread, turn) = match established {
            Ok(handles) => handles,
            Err(err) => {
                drop(subscription);
                warn!(error = %err, "connection turn setup failed");
                return Err(err);
            }
        };

        Ok(TurnContext {
            conn: Arc::clone(&self.conn),
            resolver: Arc::clone(&self.resolver),
            subscription,
            pending: VecDeque::from([thread.event, turn.event]),
            thread_id: thread.thread_id,
            turn_id: turn.turn_id,
            idle_timeout: self.config.idle_timeout(),
            finished: false,
        })
    }
}

/// Thread or turn id from a call result: `{kind: {id}}` or `{flat_key}`.
fn ack_id(ack: &Value, kind: &str, flat_key: &str) -> Option<String> {
    ack.get(kind)
        .and_then(|object| object.get("id"))
        .or_else(|| ack.get(flat_key))
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_owned)
}

/// Exclusive state of one running connection turn.
struct TurnContext {
    conn: Arc<dyn Connection>,
    resolver: Arc<dyn ApprovalResolver>,
    subscription: Subscription,
    pending: VecDeque<ThreadEvent>,
    thread_id: String,
    turn_id: Option<String>,
    idle_timeout: Duration,
    finished: bool,
}

impl TurnContext {
    fn into_stream(self) -> EventStream {
        stream::unfold(self, |mut turn| async move {
            turn.next_event().await.map(|item| (item, turn))
        })
        .boxed()
    }

    async fn next_event(&mut self) -> Option<Result<ThreadEvent>> {
        if let Some(event) = self.pending.pop_front() {
            return Some(Ok(event));
        }
        if self.finished {
            return None;
        }

        // Only this turn's own traffic moves the deadline.
        let mut deadline = Instant::now() + self.idle_timeout;
        loop {
            let message =
                match tokio::time::timeout_at(deadline, self.subscription.recv()).await {
                    Ok(Some(message)) => message,
                    Ok(None) => {
                        self.finished = true;
                        return Some(Err(AppError::Connection(
                            "connection closed before the turn completed".into(),
                        )));
                    }
                    Err(_elapsed) => {
                        self.finished = true;
                        warn!(
                            thread_id = %self.thread_id,
                            turn_id = self.turn_id.as_deref(),
                            idle = ?self.idle_timeout,
                            "connection turn went idle"
                        );
                        return Some(Err(AppError::Timeout(format!(
                            "no turn completion within {} ms",
                            self.idle_timeout.as_millis()
                        ))));
                    }
                };

            if !message_matches(
                message.params(),
                Some(self.thread_id.as_str()),
                self.turn_id.as_deref(),
            ) {
                trace!(method = message.method(), "message for another turn ignored");
                continue;
            }

            match message {
                InboundMessage::Notification { method, params } => {
                    if method == TURN_COMPLETED {
                        self.finished = true;
                    }
                    return Some(Ok(notification_to_event(&method, &params)));
                }
                InboundMessage::Request { id, method, params } => {
                    self.handle_request(id, &method, &params).await;
                    deadline = Instant::now() + self.idle_timeout;
                }
            }
        }
    }

    async fn handle_request(&self, id: Value, method: &str, params: &Value) {
        if !is_approval_request(method) {
            debug!(method, "unhandled connection request ignored");
            return;
        }
        let Some(answer) = self.resolver.resolve(method, params) else {
            debug!(method, "approval request left unanswered");
            return;
        };
        debug!(method, thread_id = %self.thread_id, "approval request resolved");
        if let Err(err) = self.conn.respond(id, answer).await {
            warn!(method, error = %err, "failed to answer approval request");
        }
    }
}
