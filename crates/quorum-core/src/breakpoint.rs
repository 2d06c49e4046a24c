use serde::{Deserialize, Serialize};

/// The eight-valued execution-phase indicator, persisted with every
/// transition. Only `Ready`, `AwaitingApproval`, and the mid-tool states
/// are legitimate crash resting points; the others must be short-lived.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Breakpoint {
    #[default]
    Ready,
    PreModel,
    StreamingModel,
    ToolPending,
    AwaitingApproval,
    PreTool,
    ToolExecuting,
    PostTool,
}

/// What a resuming process must do given the breakpoint it observed on
/// open.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResumeAction {
    /// Nothing in flight; start at Ready.
    Clean,
    /// A partial assistant message may exist; drop it and start at Ready.
    DropPartial,
    /// Tool calls may be in flight; auto-seal them, then start at Ready.
    AutoSeal,
    /// Calls were parked on an approval; handling depends on the resume
    /// strategy.
    ResolveApprovals,
}

impl Breakpoint {
    pub fn resume_action(self) -> ResumeAction {
        match self {
            Self::Ready => ResumeAction::Clean,
            Self::PreModel | Self::StreamingModel => ResumeAction::DropPartial,
            Self::ToolPending | Self::PreTool | Self::ToolExecuting | Self::PostTool => {
                ResumeAction::AutoSeal
            }
            Self::AwaitingApproval => ResumeAction::ResolveApprovals,
        }
    }

    /// States where a crash leaves no cleanup behind.
    pub fn is_resting(self) -> bool {
        matches!(
            self,
            Self::Ready | Self::AwaitingApproval | Self::ToolExecuting
        )
    }

    /// States at which a snapshot may be captured directly.
    pub fn is_fork_eligible(self) -> bool {
        matches!(self, Self::Ready | Self::AwaitingApproval)
    }
}

impl std::fmt::Display for Breakpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Ready => "ready",
            Self::PreModel => "pre_model",
            Self::StreamingModel => "streaming_model",
            Self::ToolPending => "tool_pending",
            Self::AwaitingApproval => "awaiting_approval",
            Self::PreTool => "pre_tool",
            Self::ToolExecuting => "tool_executing",
            Self::PostTool => "post_tool",
        };
        f.write_str(s)
    }
}
