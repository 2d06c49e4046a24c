use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::ids::ToolCallId;

/// Lifecycle state of one model-requested tool invocation.
///
/// Legal transitions:
///
/// ```text
/// Pending → (ApprovalRequired → Approved | Denied) → Executing → Completed | Failed
/// ```
///
/// `Sealed` is reachable from any non-terminal state, but only through
/// crash recovery.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Pending,
    ApprovalRequired,
    Approved,
    Executing,
    Completed,
    Failed,
    Denied,
    Sealed,
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Denied | Self::Sealed
        )
    }

    pub fn can_transition_to(self, next: CallState) -> bool {
        use CallState::*;
        match (self, next) {
            (Pending, ApprovalRequired) | (Pending, Executing) => true,
            (ApprovalRequired, Approved) | (ApprovalRequired, Denied) => true,
            (Approved, Executing) => true,
            (Executing, Completed) | (Executing, Failed) => true,
            // Sealing is legal from any non-terminal state.
            (from, Sealed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::ApprovalRequired => "approval_required",
            Self::Approved => "approved",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Denied => "denied",
            Self::Sealed => "sealed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("illegal tool call transition {from} → {to}")]
pub struct TransitionError {
    pub from: CallState,
    pub to: CallState,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Allow,
    Deny,
}

/// Approval bookkeeping attached to a call that required one.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<ApprovalDecision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEntry {
    pub state: CallState,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Durable record of one tool invocation, audit trail included.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: ToolCallId,
    pub tool_name: String,
    pub input: serde_json::Value,
    pub state: CallState,
    pub approval: ApprovalRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    pub audit: Vec<AuditEntry>,
}

impl ToolCallRecord {
    pub fn new(id: ToolCallId, tool_name: impl Into<String>, input: serde_json::Value) -> Self {
        let now = Utc::now().to_rfc3339();
        Self {
            id,
            tool_name: tool_name.into(),
            input,
            state: CallState::Pending,
            approval: ApprovalRecord::default(),
            result: None,
            error: None,
            started_at: None,
            finished_at: None,
            audit: vec![AuditEntry {
                state: CallState::Pending,
                timestamp: now,
                note: None,
            }],
        }
    }

    /// Advance the state, appending an audit entry. Rejects transitions
    /// outside the allowed graph.
    pub fn transition(
        &mut self,
        next: CallState,
        note: Option<String>,
    ) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(TransitionError {
                from: self.state,
                to: next,
            });
        }
        let now = Utc::now().to_rfc3339();
        match next {
            CallState::Executing => self.started_at = Some(now.clone()),
            s if s.is_terminal() => self.finished_at = Some(now.clone()),
            _ => {}
        }
        self.state = next;
        self.audit.push(AuditEntry {
            state: next,
            timestamp: now,
            note,
        });
        Ok(())
    }

    pub fn mark_approval_requested(&mut self) {
        self.approval.required = true;
        self.approval.requested_at = Some(Utc::now().to_rfc3339());
    }

    pub fn record_decision(
        &mut self,
        decision: ApprovalDecision,
        decider: Option<String>,
        note: Option<String>,
    ) {
        self.approval.decision = Some(decision);
        self.approval.decider = decider;
        self.approval.note = note;
        self.approval.decided_at = Some(Utc::now().to_rfc3339());
    }
}
