//! Auto-resolution of backend approval requests.
//!
//! While a turn runs on a shared connection the backend may ask for
//! permission to execute a command or apply a file change. Matched requests
//! with one of the methods below are handed to an [`ApprovalResolver`]; an
//! answer it returns is sent straight back on the connection and never
//! reaches the stream consumer.

use serde_json::{json, Value};

/// Request for permission to run a command.
pub const COMMAND_APPROVAL: &str = "item/commandExecution/requestApproval";

/// Request for permission to apply a file change.
pub const FILE_CHANGE_APPROVAL: &str = "item/fileChange/requestApproval";

/// Whether `method` is an approval request this crate resolves.
#[must_use]
pub fn is_approval_request(method: &str) -> bool {
    matches!(method, COMMAND_APPROVAL | FILE_CHANGE_APPROVAL)
}

/// Decides approval requests.
pub trait ApprovalResolver: Send + Sync {
    /// Answer for the request, or `None` to leave it unanswered.
    fn resolve(&self, method: &str, params: &Value) -> Option<Value>;
}

/// Fixed answer given by [`AutoApprover`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ApprovalDecision {
    /// Approve every request.
    #[default]
    Accept,
    /// Refuse every request.
    Decline,
    /// Leave requests unanswered.
    Ignore,
}

/// Resolver applying one [`ApprovalDecision`] to every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprover {
    decision: ApprovalDecision,
}

impl AutoApprover {
    /// Resolver that always answers with `decision`.
    #[must_use]
    pub fn new(decision: ApprovalDecision) -> Self {
        Self { decision }
    }
}

impl ApprovalResolver for AutoApprover {
    fn resolve(&self, _method: &str, _params: &Value) -> Option<Value> {
        match self.decision {
            ApprovalDecision::Accept => Some(json!({ "decision": "accept" })),
            ApprovalDecision::Decline => Some(json!({ "decision": "decline" })),
            ApprovalDecision::Ignore => None,
        }
    }
}
