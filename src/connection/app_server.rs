//! JSON-RPC client for `codex app-server` over stdio.
//!
//! Outbound messages go through a writer task that serialises one JSON
//! object per line. A reader task decodes inbound lines and routes them:
//!
//! | Inbound shape                  | Routed to                               |
//! |--------------------------------|-----------------------------------------|
//! | `id` + `result` / `error`      | the pending [`Connection::call`]        |
//! | `id` + `method`                | subscribers, as [`InboundMessage::Request`] |
//! | `method` only                  | subscribers, as [`InboundMessage::Notification`] |
//! | anything else                  | skipped; logged at `WARN`               |
//!
//! Lines that are too long, not UTF-8 or not JSON are skipped the same way.
//!
//! When the server's stdout closes every pending call fails with
//! [`AppError::Connection`] and every subscription ends.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio_util::codec::{Decoder, FramedRead, LinesCodec, LinesCodecError};
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::connection::{Connection, InboundMessage, Subscription};
use crate::subprocess::codec::MAX_LINE_BYTES;
use crate::subprocess::spawner::{build_env, ALLOWED_ENV_VARS};
use crate::{AppError, Result};

/// Capacity of the inbound broadcast feed per subscriber.
const INBOUND_CAPACITY: usize = 1024;

/// Capacity of the outbound message channel.
const OUTBOUND_CAPACITY: usize = 256;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>>;
type InboundSlot = Arc<std::sync::Mutex<Option<broadcast::Sender<InboundMessage>>>>;

/// Persistent connection to one app-server process.
pub struct AppServerConnection {
    outbound: mpsc::Sender<Value>,
    pending: PendingMap,
    inbound: InboundSlot,
    next_id: AtomicU64,
    call_timeout: Duration,
    child: Mutex<Option<Child>>,
    _reader: AbortOnDropHandle<()>,
    _writer: AbortOnDropHandle<()>,
}

impl std::fmt::Debug for AppServerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppServerConnection")
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

impl AppServerConnection {
    /// Spawn `executable` with the configured app-server arguments and
    /// perform the `initialize` handshake.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] if the process cannot be spawned, or the
    /// handshake call failure.
    pub async fn spawn(
        executable: &Path,
        config: &ConnectionConfig,
        api_key: Option<&str>,
    ) -> Result<Self> {
        let mut cmd = Command::new(executable);
        cmd.args(&config.app_server_args);
        cmd.env_clear();
        for &key in ALLOWED_ENV_VARS {
            if let Ok(val) = std::env::var(key) {
                cmd.env(key, val);
            }
        }
        cmd.envs(build_env(api_key));
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|err| AppError::Io(format!("failed to spawn app server: {err}")))?;
        info!(pid = child.id(), executable = %executable.display(), "app server spawned");

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AppError::Io("failed to capture app server stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Io("failed to capture app server stdout".into()))?;

        let conn = Self::from_io(stdout, stdin, config.call_timeout());
        *conn.child.lock().await = Some(child);
        conn.initialize().await?;
        Ok(conn)
    }

    /// Connection over an already-open reader/writer pair.
    ///
    /// No handshake is performed. Must be called inside a Tokio runtime.
    #[must_use]
    pub fn from_io<R, W>(reader: R, writer: W, call_timeout: Duration) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (inbound_tx, _) = broadcast::channel(INBOUND_CAPACITY);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let inbound: InboundSlot = Arc::new(std::sync::Mutex::new(Some(inbound_tx)));

        let reader = tokio::spawn(run_reader(reader, Arc::clone(&pending), Arc::clone(&inbound)));
        let writer = tokio::spawn(run_writer(writer, outbound_rx));

        Self {
            outbound,
            pending,
            inbound,
            next_id: AtomicU64::new(1),
            call_timeout,
            child: Mutex::new(None),
            _reader: AbortOnDropHandle::new(reader),
            _writer: AbortOnDropHandle::new(writer),
        }
    }

    /// `initialize` call followed by the `initialized` notification.
    ///
    /// # Errors
    ///
    /// Propagates the `initialize` call failure.
    pub async fn initialize(&self) -> Result<Value> {
        let result = self
            .request(
                "initialize",
                json!({
                    "clientInfo": {
                        "name": "codex_turn_rs",
                        "version": env!("CARGO_PKG_VERSION"),
                    }
                }),
            )
            .await?;
        self.send(json!({ "jsonrpc": "2.0", "method": "initialized" }))
            .await?;
        debug!("app server initialized");
        Ok(result)
    }

    /// Stop the app-server process, if this connection spawned one.
    pub async fn shutdown(&self, grace: Duration) {
        if let Some(mut child) = self.child.lock().await.take() {
            crate::subprocess::spawner::stop_process(&mut child, grace).await;
        }
    }

    async fn send(&self, message: Value) -> Result<()> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| AppError::Connection("app server writer stopped".into()))
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let message = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        if let Err(err) = self.send(message).await {
            self.pending.lock().await.remove(&id);
            return Err(err);
        }
        debug!(id, method, "app server call sent");

        match tokio::time::timeout(self.call_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AppError::Connection(format!(
                "app server closed before answering {method}"
            ))),
            Err(_elapsed) => {
                self.pending.lock().await.remove(&id);
                warn!(id, method, "app server call timed out");
                Err(AppError::Timeout(format!(
                    "{method} not answered within {} ms",
                    self.call_timeout.as_millis()
                )))
            }
        }
    }
}

impl Connection for AppServerConnection {
    fn call(
        &self,
        method: &str,
        params: Value,
    ) -> Pin<Box<dyn Future<Output = Result<Value>> + Send + '_>> {
        let method = method.to_owned();
        Box::pin(async move { self.request(&method, params).await })
    }

    fn respond(
        &self,
        id: Value,
        result: Value,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.send(json!({ "jsonrpc": "2.0", "id": id, "result": result }))
                .await
        })
    }

    fn subscribe(&self) -> Subscription {
        // A closed connection yields a subscription that ends immediately.
        let rx = lock_slot(&self.inbound)
            .as_ref()
            .map(broadcast::Sender::subscribe);
        Subscription::new(rx.unwrap_or_else(|| broadcast::channel(1).1))
    }
}

fn lock_slot(
    slot: &InboundSlot,
) -> std::sync::MutexGuard<'_, Option<broadcast::Sender<InboundMessage>>> {
    slot.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// How one inbound line is routed.
#[derive(Debug)]
enum Routed {
    Response { id: u64, result: Result<Value> },
    Inbound(InboundMessage),
    Invalid,
}

fn route_message(value: Value) -> Routed {
    let Value::Object(mut map) = value else {
        return Routed::Invalid;
    };
    let method = map
        .get("method")
        .and_then(Value::as_str)
        .map(str::to_owned);
    let params = map.remove("params").unwrap_or(Value::Null);

    match (map.remove("id"), method) {
        (Some(id), Some(method)) => Routed::Inbound(InboundMessage::Request { id, method, params }),
        (None, Some(method)) => Routed::Inbound(InboundMessage::Notification { method, params }),
        (Some(id), None) => {
            let Some(id) = id.as_u64() else {
                return Routed::Invalid;
            };
            let result = match map.remove("error") {
                Some(error) => Err(AppError::Api {
                    status: None,
                    payload: error,
                }),
                None => Ok(map.remove("result").unwrap_or(Value::Null)),
            };
            Routed::Response { id, result }
        }
        (None, None) => Routed::Invalid,
    }
}

/// Line-framed JSON decoder for the app-server's stdout.
///
/// Over-long lines, non-UTF-8 lines, blank lines and malformed JSON are
/// logged and skipped, so the framed reader only ends at EOF.
#[derive(Debug)]
struct MessageCodec(LinesCodec);

impl MessageCodec {
    fn new() -> Self {
        Self(LinesCodec::new_with_max_length(MAX_LINE_BYTES))
    }

    fn next_value(
        &mut self,
        src: &mut BytesMut,
        eof: bool,
    ) -> std::result::Result<Option<Value>, std::io::Error> {
        loop {
            let line = if eof {
                self.0.decode_eof(src)
            } else {
                self.0.decode(src)
            };
            match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str(&line) {
                        Ok(value) => return Ok(Some(value)),
                        Err(err) => {
                            warn!(error = %err, "app server reader: malformed json, skipping");
                        }
                    }
                }
                Ok(None) => return Ok(None),
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    warn!(
                        max_bytes = MAX_LINE_BYTES,
                        "app server reader: line too long, skipping"
                    );
                }
                Err(LinesCodecError::Io(err)) if err.kind() == std::io::ErrorKind::InvalidData => {
                    warn!(error = %err, "app server reader: undecodable line, skipping");
                }
                Err(LinesCodecError::Io(err)) => return Err(err),
            }
        }
    }
}

impl Decoder for MessageCodec {
    type Item = Value;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> std::result::Result<Option<Value>, Self::Error> {
        self.next_value(src, false)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> std::result::Result<Option<Value>, Self::Error> {
        self.next_value(src, true)
    }
}

async fn run_reader<R>(reader: R, pending: PendingMap, inbound: InboundSlot)
where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(reader, MessageCodec::new());

    while let Some(value) = framed.next().await {
        let value = match value {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, "app server reader: read failed, closing");
                break;
            }
        };

        match route_message(value) {
            Routed::Response { id, result } => match pending.lock().await.remove(&id) {
                Some(tx) => {
                    let _ = tx.send(result);
                }
                None => debug!(id, "app server reader: response for unknown call"),
            },
            Routed::Inbound(message) => {
                if let Some(tx) = lock_slot(&inbound).as_ref() {
                    // No subscribers is not an error.
                    let _ = tx.send(message);
                }
            }
            Routed::Invalid => warn!("app server reader: unsupported message shape, skipping"),
        }
    }

    debug!("app server reader: EOF");
    lock_slot(&inbound).take();
    for (_, tx) in pending.lock().await.drain() {
        let _ = tx.send(Err(AppError::Connection("app server closed".into())));
    }
}

async fn run_writer<W>(mut writer: W, mut outbound: mpsc::Receiver<Value>)
where
    W: AsyncWrite + Unpin + Send,
{
    while let Some(message) = outbound.recv().await {
        let mut bytes = match serde_json::to_vec(&message) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, "app server writer: failed to serialise message");
                continue;
            }
        };
        bytes.push(b'\n');

        let written = async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        }
        .await;
        if let Err(err) = written {
            warn!(error = %err, "app server writer: write failed, stopping");
            break;
        }
    }
    debug!("app server writer: stopped");
}
