//! Turns over a persistent connection shared by many concurrent turns.
//!
//! The [`Connection`] trait is the seam between the correlation layer and
//! whatever carries the calls. [`app_server::AppServerConnection`] speaks
//! JSON-RPC over the stdio of a `codex app-server` process; tests plug in
//! in-memory fakes.
//!
//! - `correlate`: (thread id, turn id) matching and notification adapter.
//! - `approval`: auto-resolution of approval requests.
//! - `transport`: [`ConnectionTransport`], the per-turn event loop.
//! - `app_server`: stdio JSON-RPC client.

pub mod app_server;
pub mod approval;
pub mod correlate;
pub mod transport;

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::warn;

use crate::Result;

pub use approval::{ApprovalDecision, ApprovalResolver, AutoApprover};
pub use transport::{ConnectionTransport, ThreadHandle, TurnHandle};

/// Message pushed by the backend outside of a call's response.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Fire-and-forget notification.
    Notification {
        /// Notification method, e.g. `turn/completed`.
        method: String,
        /// Notification payload.
        params: Value,
    },
    /// Request expecting an answer through [`Connection::respond`].
    Request {
        /// Request id to echo back.
        id: Value,
        /// Request method, e.g. `item/commandExecution/requestApproval`.
        method: String,
        /// Request payload.
        params: Value,
    },
}

impl InboundMessage {
    /// Method name of the message.
    #[must_use]
    pub fn method(&self) -> &str {
        match self {
            Self::Notification { method, .. } | Self::Request { method, .. } => method,
        }
    }

    /// Payload of the message.
    #[must_use]
    pub fn params(&self) -> &Value {
        match self {
            Self::Notification { params, .. } | Self::Request { params, .. } => params,
        }
    }
}

/// Live feed of inbound messages. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    rx: broadcast::Receiver<InboundMessage>,
}

impl Subscription {
    /// Wrap a broadcast receiver.
    #[must_use]
    pub fn new(rx: broadcast::Receiver<InboundMessage>) -> Self {
        Self { rx }
    }

    /// Next inbound message; `None` once the connection is gone.
    ///
    /// A subscriber that falls behind skips the messages it missed.
    pub async fn recv(&mut self) -> Option<InboundMessage> {
        loop {
            match self.rx.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "connection subscription lagged, messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Call/notification channel to the backend.
pub trait Connection: Send + Sync {
    /// Issue a call and wait for its result.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Api`](crate::AppError::Api) for an error response,
    /// [`AppError::Connection`](crate::AppError::Connection) if the
    /// connection is gone, or [`AppError::Timeout`](crate::AppError::Timeout).
    fn call(
        &self,
        method: &str,
        params: Value,
    ) -> Pin<Box<dyn Future<Output = Result<Value>> + Send + '_>>;

    /// Answer an inbound [`InboundMessage::Request`].
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Connection`](crate::AppError::Connection) if the
    /// answer cannot be written.
    fn respond(
        &self,
        id: Value,
        result: Value,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Subscribe to inbound notifications and requests.
    fn subscribe(&self) -> Subscription;
}
