//! Types for the human-approval flow.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A request for human approval, handed to a [`crate::approval::Messenger`].
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub request_id: Uuid,
    pub agent_id: String,
    pub tool: String,
    pub signature: String,
    pub prompt: Option<String>,
}

/// The two choices a human can make on a pending approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalChoice {
    Approve,
    Deny,
}

/// The outcome of waiting on a pending approval. Three distinct causes —
/// a human pressed a button, the timer fired, or the gateway shut down —
/// each map to a distinct wire error when the outcome is a denial.
#[derive(Debug, Clone)]
pub enum ApprovalResult {
    Resolved {
        choice: ApprovalChoice,
        approved_by: Option<String>,
    },
    /// The per-request timer fired before a human responded.
    TimedOut,
    /// The gateway is shutting down and drained every pending approval as
    /// denied, resolver id `"shutdown"`.
    Shutdown,
}

/// Callback data carried on a Telegram inline-keyboard button, round-tripped
/// through the wire so the adapter doesn't need its own session state to
/// know which request a press belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackData {
    pub request_id: Uuid,
    pub choice: ApprovalChoice,
}
