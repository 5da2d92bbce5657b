//! Unit tests for shared-connection message routing.
//!
//! Covers:
//! - flat and nested id tags
//! - matching rules when either side lacks an id
//! - notification to event adaptation

use serde_json::json;

use codex_turn::connection::correlate::{
    message_matches, notification_to_event, thread_id_of, turn_id_of, TURN_COMPLETED,
};
use codex_turn::event::Usage;
use codex_turn::ThreadEvent;

// ── Tags ─────────────────────────────────────────────────────────────────────

/// Flat camelCase and snake_case keys are both read.
#[test]
fn flat_tags_are_read() {
    assert_eq!(thread_id_of(&json!({ "threadId": "t1" })), Some("t1"));
    assert_eq!(thread_id_of(&json!({ "thread_id": "t2" })), Some("t2"));
    assert_eq!(turn_id_of(&json!({ "turnId": "u1" })), Some("u1"));
    assert_eq!(turn_id_of(&json!({ "turn_id": "u2" })), Some("u2"));
}

/// Flat keys win over nested objects.
#[test]
fn flat_tag_beats_nested() {
    let params = json!({ "threadId": "flat", "thread": { "id": "nested" } });
    assert_eq!(thread_id_of(&params), Some("flat"));
}

/// Untagged messages carry no ids.
#[test]
fn untagged_message_has_no_ids() {
    let params = json!({ "delta": "hi" });
    assert_eq!(thread_id_of(&params), None);
    assert_eq!(turn_id_of(&params), None);
}

// ── Matching ─────────────────────────────────────────────────────────────────

/// Messages for the same thread and turn match.
#[test]
fn same_ids_match() {
    let params = json!({ "threadId": "t1", "turnId": "u1" });
    assert!(message_matches(&params, Some("t1"), Some("u1")));
}

/// A different thread or turn does not match.
#[test]
fn other_turns_do_not_match() {
    assert!(!message_matches(
        &json!({ "threadId": "t2", "turnId": "u1" }),
        Some("t1"),
        Some("u1")
    ));
    assert!(!message_matches(
        &json!({ "thread": { "id": "t1" }, "turn": { "id": "u9" } }),
        Some("t1"),
        Some("u1")
    ));
}

/// A missing id on either side is a wildcard.
#[test]
fn missing_ids_are_wildcards() {
    let thread_only = json!({ "threadId": "t1" });
    assert!(message_matches(&thread_only, Some("t1"), Some("u1")));
    assert!(message_matches(
        &json!({ "threadId": "t1", "turnId": "u7" }),
        Some("t1"),
        None
    ));
    assert!(message_matches(&json!({}), Some("t1"), Some("u1")));
    assert!(message_matches(
        &json!({ "threadId": "t1", "turnId": "u1" }),
        Some(""),
        Some("  ")
    ));
}

// ── Adaptation ───────────────────────────────────────────────────────────────

/// Turn lifecycle notifications become turn events.
#[test]
fn turn_lifecycle_notifications() {
    assert_eq!(
        notification_to_event("turn/started", &json!({ "turn": { "id": "u1" } })),
        ThreadEvent::TurnStarted {
            turn_id: Some("u1".into())
        }
    );

    let completed = notification_to_event(
        TURN_COMPLETED,
        &json!({ "turnId": "u1", "usage": { "input_tokens": 3, "note": "x" } }),
    );
    let usage: Usage = [("input_tokens".to_owned(), 3)].into_iter().collect();
    assert_eq!(
        completed,
        ThreadEvent::TurnCompleted {
            turn_id: Some("u1".into()),
            usage: Some(usage),
        }
    );
    assert!(completed.is_terminal());
}

/// Item and delta notifications keep their payloads.
#[test]
fn item_notifications() {
    let item = json!({ "id": "i1", "type": "commandExecution" });
    assert_eq!(
        notification_to_event("item/started", &json!({ "item": item.clone() })),
        ThreadEvent::ItemStarted { item: item.clone() }
    );
    assert_eq!(
        notification_to_event("item/completed", &json!({ "item": item.clone() })),
        ThreadEvent::ItemCompleted { item }
    );
    assert_eq!(
        notification_to_event("item/agentMessage/delta", &json!({ "delta": "Hel" })),
        ThreadEvent::AgentMessage { text: "Hel".into() }
    );
}

/// Token usage prefers the per-update breakdown.
#[test]
fn token_usage_prefers_last() {
    let event = notification_to_event(
        "thread/tokenUsage/updated",
        &json!({
            "tokenUsage": {
                "last": { "output_tokens": 4 },
                "total": { "output_tokens": 40 }
            }
        }),
    );
    let expected: Usage = [("output_tokens".to_owned(), 4)].into_iter().collect();
    assert_eq!(event, ThreadEvent::UsageUpdated { usage: expected });
}

/// Error notifications read nested or flat messages.
#[test]
fn error_notifications() {
    assert_eq!(
        notification_to_event("error", &json!({ "error": { "message": "boom" } })),
        ThreadEvent::Error {
            message: "boom".into()
        }
    );
    assert_eq!(
        notification_to_event("error", &json!({})),
        ThreadEvent::Error {
            message: "unknown error".into()
        }
    );
}

/// Unmodelled notifications are kept raw under their method.
#[test]
fn unknown_notifications_stay_raw() {
    let params = json!({ "threadId": "t1", "diff": "+a" });
    let event = notification_to_event("turn/diff/updated", &params);
    assert_eq!(event.kind(), "turn/diff/updated");
    assert_eq!(
        event,
        ThreadEvent::Raw {
            kind: "turn/diff/updated".into(),
            payload: params,
        }
    );
}
