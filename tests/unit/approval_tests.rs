//! Unit tests for approval request resolution.

use serde_json::json;

use codex_turn::connection::approval::{
    is_approval_request, COMMAND_APPROVAL, FILE_CHANGE_APPROVAL,
};
use codex_turn::connection::{ApprovalDecision, ApprovalResolver, AutoApprover};

/// Only the command and file-change methods are approval requests.
#[test]
fn recognises_approval_methods() {
    assert!(is_approval_request(COMMAND_APPROVAL));
    assert!(is_approval_request(FILE_CHANGE_APPROVAL));
    assert!(!is_approval_request("item/tool/call"));
    assert!(!is_approval_request("turn/completed"));
}

/// The default resolver accepts.
#[test]
fn default_resolver_accepts() {
    let answer = AutoApprover::default().resolve(COMMAND_APPROVAL, &json!({}));
    assert_eq!(answer, Some(json!({ "decision": "accept" })));
}

/// A declining resolver declines every request.
#[test]
fn declining_resolver() {
    let resolver = AutoApprover::new(ApprovalDecision::Decline);
    assert_eq!(
        resolver.resolve(FILE_CHANGE_APPROVAL, &json!({ "itemId": "i1" })),
        Some(json!({ "decision": "decline" }))
    );
}

/// An ignoring resolver leaves requests unanswered.
#[test]
fn ignoring_resolver() {
    let resolver = AutoApprover::new(ApprovalDecision::Ignore);
    assert_eq!(resolver.resolve(COMMAND_APPROVAL, &json!({})), None);
}
