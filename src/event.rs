//! Backend event model.
//!
//! Both transports produce [`ThreadEvent`]s. Known event kinds are decoded
//! into dedicated variants; any other JSON object carrying a string `type`
//! is kept as [`ThreadEvent::Raw`] so new backend events never break a
//! stream. Anything that is not such an object is rejected by
//! [`decode_event`] and skipped by the callers.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::{AppError, Result};

/// Cumulative token usage keyed by counter name (`input_tokens`, ...).
pub type Usage = BTreeMap<String, i64>;

/// One decoded backend event.
#[derive(Debug, Clone, PartialEq)]
pub enum ThreadEvent {
    /// A thread was created or resumed.
    ThreadStarted {
        /// Effective thread id.
        thread_id: String,
    },
    /// A turn began.
    TurnStarted {
        /// Turn id, when the backend reports one.
        turn_id: Option<String>,
    },
    /// A turn finished successfully.
    TurnCompleted {
        /// Turn id, when the backend reports one.
        turn_id: Option<String>,
        /// Usage reported for the turn.
        usage: Option<Usage>,
    },
    /// A turn failed on the backend side.
    TurnFailed {
        /// Backend error message.
        message: String,
    },
    /// An item (message, command, file change, ...) began.
    ItemStarted {
        /// Item payload as received.
        item: Value,
    },
    /// An in-flight item changed.
    ItemUpdated {
        /// Item payload as received.
        item: Value,
    },
    /// An item finished.
    ItemCompleted {
        /// Item payload as received.
        item: Value,
    },
    /// Agent text output.
    AgentMessage {
        /// Message text.
        text: String,
    },
    /// Cumulative usage update outside of turn completion.
    UsageUpdated {
        /// Usage counters.
        usage: Usage,
    },
    /// Backend-reported stream error.
    Error {
        /// Backend error message.
        message: String,
    },
    /// Event of a kind this crate does not model.
    Raw {
        /// Wire `type` or method name.
        kind: String,
        /// Full payload as received.
        payload: Value,
    },
}

impl ThreadEvent {
    /// Wire name of the event kind.
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::ThreadStarted { .. } => "thread.started",
            Self::TurnStarted { .. } => "turn.started",
            Self::TurnCompleted { .. } => "turn.completed",
            Self::TurnFailed { .. } => "turn.failed",
            Self::ItemStarted { .. } => "item.started",
            Self::ItemUpdated { .. } => "item.updated",
            Self::ItemCompleted { .. } => "item.completed",
            Self::AgentMessage { .. } => "agent_message",
            Self::UsageUpdated { .. } => "usage.updated",
            Self::Error { .. } => "error",
            Self::Raw { kind, .. } => kind,
        }
    }

    /// `true` for events that end a turn.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::TurnCompleted { .. } | Self::TurnFailed { .. })
    }

    /// Usage carried by this event, if any.
    #[must_use]
    pub fn usage(&self) -> Option<&Usage> {
        match self {
            Self::TurnCompleted { usage, .. } => usage.as_ref(),
            Self::UsageUpdated { usage } => Some(usage),
            _ => None,
        }
    }
}

/// Decode a single JSON value into a [`ThreadEvent`].
///
/// # Errors
///
/// Returns [`AppError::Decode`] when `value` is not an object or has no
/// string `type` field.
pub fn decode_event(value: Value) -> Result<ThreadEvent> {
    let map = match value {
        Value::Object(map) => map,
        other => {
            return Err(AppError::Decode(format!(
                "unsupported event shape: expected object, got {other}"
            )))
        }
    };

    let kind = map
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::Decode("unsupported event shape: missing `type`".into()))?
        .to_owned();

    let event = match kind.as_str() {
        "thread.started" => ThreadEvent::ThreadStarted {
            thread_id: str_field(&map, &["thread_id", "threadId"]).unwrap_or_default(),
        },
        "turn.started" => ThreadEvent::TurnStarted {
            turn_id: str_field(&map, &["turn_id", "turnId"]),
        },
        "turn.completed" => ThreadEvent::TurnCompleted {
            turn_id: str_field(&map, &["turn_id", "turnId"]),
            usage: map.get("usage").map(usage_from_value),
        },
        "turn.failed" => ThreadEvent::TurnFailed {
            message: error_message(&map),
        },
        "item.started" => ThreadEvent::ItemStarted {
            item: map.get("item").cloned().unwrap_or(Value::Null),
        },
        "item.updated" => ThreadEvent::ItemUpdated {
            item: map.get("item").cloned().unwrap_or(Value::Null),
        },
        "item.completed" => ThreadEvent::ItemCompleted {
            item: map.get("item").cloned().unwrap_or(Value::Null),
        },
        "agent_message" => ThreadEvent::AgentMessage {
            text: str_field(&map, &["text", "message"]).unwrap_or_default(),
        },
        "error" => ThreadEvent::Error {
            message: error_message(&map),
        },
        _ => ThreadEvent::Raw {
            kind,
            payload: Value::Object(map),
        },
    };

    Ok(event)
}

/// Convert a usage object into counters, ignoring non-integer fields.
#[must_use]
pub fn usage_from_value(value: &Value) -> Usage {
    value
        .as_object()
        .map(|map| {
            map.iter()
                .filter_map(|(key, v)| v.as_i64().map(|n| (key.clone(), n)))
                .collect()
        })
        .unwrap_or_default()
}

fn str_field(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| map.get(*key).and_then(Value::as_str))
        .map(str::to_owned)
}

fn error_message(map: &Map<String, Value>) -> String {
    if let Some(message) = str_field(map, &["message"]) {
        return message;
    }
    map.get("error")
        .and_then(|e| {
            e.as_str()
                .map(str::to_owned)
                .or_else(|| e.get("message").and_then(Value::as_str).map(str::to_owned))
        })
        .unwrap_or_else(|| "unknown error".to_owned())
}
