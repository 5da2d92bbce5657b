//! Routing of shared-connection messages to one logical turn.
//!
//! Every inbound message on a shared connection is tagged with the thread
//! and turn it belongs to, either flat (`threadId`, `thread_id`) or nested
//! (`thread.id`). A turn's loop keeps the messages whose tags agree with its
//! own (thread id, turn id) pair. A tag that is missing or blank on either
//! side matches, which lets acknowledgements sent before the ids are known
//! through.

use serde_json::Value;
use tracing::debug;

use crate::event::{usage_from_value, ThreadEvent};

/// Notification ending a turn.
pub const TURN_COMPLETED: &str = "turn/completed";

const THREAD_KEYS: &[&str] = &["threadId", "thread_id"];
const TURN_KEYS: &[&str] = &["turnId", "turn_id"];

/// Thread id tagged on `params`, if any.
#[must_use]
pub fn thread_id_of(params: &Value) -> Option<&str> {
    tagged_id(params, THREAD_KEYS, "thread")
}

/// Turn id tagged on `params`, if any.
#[must_use]
pub fn turn_id_of(params: &Value) -> Option<&str> {
    tagged_id(params, TURN_KEYS, "turn")
}

/// Whether a message with `params` belongs to the given turn.
#[must_use]
pub fn message_matches(params: &Value, thread_id: Option<&str>, turn_id: Option<&str>) -> bool {
    ids_agree(thread_id_of(params), thread_id) && ids_agree(turn_id_of(params), turn_id)
}

fn ids_agree(tagged: Option<&str>, ours: Option<&str>) -> bool {
    match (non_blank(tagged), non_blank(ours)) {
        (Some(tagged), Some(ours)) => tagged == ours,
        _ => true,
    }
}

fn non_blank(id: Option<&str>) -> Option<&str> {
    id.filter(|id| !id.trim().is_empty())
}

fn tagged_id<'a>(params: &'a Value, flat_keys: &[&str], nested: &str) -> Option<&'a str> {
    flat_keys
        .iter()
        .find_map(|key| params.get(*key).and_then(Value::as_str))
        .or_else(|| {
            params
                .get(nested)
                .and_then(|object| object.get("id"))
                .and_then(Value::as_str)
        })
}

/// Convert a matched notification into a [`ThreadEvent`].
///
/// Notifications without a dedicated variant become [`ThreadEvent::Raw`]
/// keyed by their method.
#[must_use]
pub fn notification_to_event(method: &str, params: &Value) -> ThreadEvent {
    let event = match method {
        "turn/started" => ThreadEvent::TurnStarted {
            turn_id: turn_id_of(params).map(str::to_owned),
        },
        TURN_COMPLETED => ThreadEvent::TurnCompleted {
            turn_id: turn_id_of(params).map(str::to_owned),
            usage: params.get("usage").map(usage_from_value),
        },
        "item/started" => ThreadEvent::ItemStarted {
            item: item_of(params),
        },
        "item/completed" => ThreadEvent::ItemCompleted {
            item: item_of(params),
        },
        "item/agentMessage/delta" => ThreadEvent::AgentMessage {
            text: params
                .get("delta")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
        },
        "thread/tokenUsage/updated" => ThreadEvent::UsageUpdated {
            usage: token_usage(params),
        },
        "error" => ThreadEvent::Error {
            message: params
                .get("error")
                .and_then(|error| error.get("message"))
                .or_else(|| params.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_owned(),
        },
        other => ThreadEvent::Raw {
            kind: other.to_owned(),
            payload: params.clone(),
        },
    };
    debug!(method, kind = event.kind(), "connection notification adapted");
    event
}

fn item_of(params: &Value) -> Value {
    params.get("item").cloned().unwrap_or(Value::Null)
}

/// Per-update usage: the `last` breakdown when present, else `usage`.
fn token_usage(params: &Value) -> crate::event::Usage {
    params
        .get("tokenUsage")
        .and_then(|usage| usage.get("last"))
        .or_else(|| params.get("usage"))
        .map(usage_from_value)
        .unwrap_or_default()
}
