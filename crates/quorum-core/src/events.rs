use serde::{Deserialize, Serialize};

use crate::breakpoint::Breakpoint;
use crate::ids::{AgentId, ToolCallId};
use crate::messages::ReminderOrigin;
use crate::records::{ApprovalDecision, ToolCallRecord};
use crate::todo::TodoItem;
use crate::tokens::TokenUsage;

/// The three event streams. Disjoint event types, distinct audiences.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// User-facing streaming output.
    Progress,
    /// Decisions: approval requests and their resolutions.
    Control,
    /// Governance: state changes, errors, usage, housekeeping.
    Monitor,
}

/// Position in an agent's event log.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Bookmark {
    pub seq: u64,
    pub ts_ms: i64,
}

impl Bookmark {
    pub fn zero() -> Self {
        Self { seq: 0, ts_ms: 0 }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DoneReason {
    Completed,
    Interrupted,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Warning,
    Error,
    Fatal,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPhase {
    Model,
    Tool,
    Lifecycle,
    System,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompressionPhase {
    Start,
    End,
}

/// Coarse run state, reported on the monitor channel.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Working,
    AwaitingApproval,
    Paused,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResumeStrategy {
    Crash,
    Manual,
}

/// Every event the kernel emits. Each variant belongs to exactly one
/// channel; see [`KernelEvent::channel`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum KernelEvent {
    // ── progress ─────────────────────────────────────────────────────
    #[serde(rename = "text_chunk_start")]
    TextChunkStart,
    #[serde(rename = "text_chunk")]
    TextChunk { delta: String },
    #[serde(rename = "text_chunk_end")]
    TextChunkEnd { text: String },
    #[serde(rename = "think_chunk_start")]
    ThinkChunkStart,
    #[serde(rename = "think_chunk")]
    ThinkChunk { delta: String },
    #[serde(rename = "think_chunk_end")]
    ThinkChunkEnd { text: String },
    #[serde(rename = "tool:start")]
    ToolStart {
        call_id: ToolCallId,
        tool_name: String,
    },
    #[serde(rename = "tool:end")]
    ToolEnd {
        call_id: ToolCallId,
        result: serde_json::Value,
    },
    #[serde(rename = "tool:error")]
    ToolError { call_id: ToolCallId, error: String },
    #[serde(rename = "done")]
    Done { reason: DoneReason },

    // ── control ──────────────────────────────────────────────────────
    /// Carries the call snapshot only; the embedder resolves it through
    /// `decide(call_id, …)` on the owning agent.
    #[serde(rename = "permission_required")]
    PermissionRequired { call: ToolCallRecord },
    #[serde(rename = "permission_decided")]
    PermissionDecided {
        call_id: ToolCallId,
        decision: ApprovalDecision,
        #[serde(skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },

    // ── monitor ──────────────────────────────────────────────────────
    #[serde(rename = "state_changed")]
    StateChanged { state: RunState },
    #[serde(rename = "step_complete")]
    StepComplete { step: u64, sfp_index: usize },
    #[serde(rename = "error")]
    Error {
        severity: ErrorSeverity,
        phase: ErrorPhase,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<serde_json::Value>,
    },
    #[serde(rename = "token_usage")]
    TokenUsageReport { usage: TokenUsage },
    #[serde(rename = "tool_executed")]
    ToolExecuted { record: ToolCallRecord },
    #[serde(rename = "agent_resumed")]
    AgentResumed {
        strategy: ResumeStrategy,
        sealed: Vec<ToolCallRecord>,
    },
    #[serde(rename = "todo_changed")]
    TodoChanged { todos: Vec<TodoItem> },
    #[serde(rename = "todo_reminder")]
    TodoReminder { pending: usize },
    #[serde(rename = "file_changed")]
    FileChanged { path: String },
    #[serde(rename = "reminder_sent")]
    ReminderSent { origin: ReminderOrigin },
    #[serde(rename = "context_compression")]
    ContextCompression {
        phase: CompressionPhase,
        #[serde(skip_serializing_if = "Option::is_none")]
        ratio: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },
    #[serde(rename = "scheduler_triggered")]
    SchedulerTriggered { trigger_id: String, kind: String },
    #[serde(rename = "breakpoint_changed")]
    BreakpointChanged { from: Breakpoint, to: Breakpoint },
    #[serde(rename = "tool_manual_updated")]
    ToolManualUpdated { hash: String },
    #[serde(rename = "tool_custom_event")]
    ToolCustomEvent {
        name: String,
        data: serde_json::Value,
    },
}

impl KernelEvent {
    pub fn channel(&self) -> Channel {
        use KernelEvent::*;
        match self {
            TextChunkStart | TextChunk { .. } | TextChunkEnd { .. } | ThinkChunkStart
            | ThinkChunk { .. } | ThinkChunkEnd { .. } | ToolStart { .. } | ToolEnd { .. }
            | ToolError { .. } | Done { .. } => Channel::Progress,
            PermissionRequired { .. } | PermissionDecided { .. } => Channel::Control,
            StateChanged { .. } | StepComplete { .. } | Error { .. }
            | TokenUsageReport { .. } | ToolExecuted { .. } | AgentResumed { .. }
            | TodoChanged { .. } | TodoReminder { .. } | FileChanged { .. }
            | ReminderSent { .. } | ContextCompression { .. } | SchedulerTriggered { .. }
            | BreakpointChanged { .. } | ToolManualUpdated { .. } | ToolCustomEvent { .. } => {
                Channel::Monitor
            }
        }
    }

    pub fn event_type(&self) -> &'static str {
        use KernelEvent::*;
        match self {
            TextChunkStart => "text_chunk_start",
            TextChunk { .. } => "text_chunk",
            TextChunkEnd { .. } => "text_chunk_end",
            ThinkChunkStart => "think_chunk_start",
            ThinkChunk { .. } => "think_chunk",
            ThinkChunkEnd { .. } => "think_chunk_end",
            ToolStart { .. } => "tool:start",
            ToolEnd { .. } => "tool:end",
            ToolError { .. } => "tool:error",
            Done { .. } => "done",
            PermissionRequired { .. } => "permission_required",
            PermissionDecided { .. } => "permission_decided",
            StateChanged { .. } => "state_changed",
            StepComplete { .. } => "step_complete",
            Error { .. } => "error",
            TokenUsageReport { .. } => "token_usage",
            ToolExecuted { .. } => "tool_executed",
            AgentResumed { .. } => "agent_resumed",
            TodoChanged { .. } => "todo_changed",
            TodoReminder { .. } => "todo_reminder",
            FileChanged { .. } => "file_changed",
            ReminderSent { .. } => "reminder_sent",
            ContextCompression { .. } => "context_compression",
            SchedulerTriggered { .. } => "scheduler_triggered",
            BreakpointChanged { .. } => "breakpoint_changed",
            ToolManualUpdated { .. } => "tool_manual_updated",
            ToolCustomEvent { .. } => "tool_custom_event",
        }
    }
}

/// An event wrapped with its position in the per-agent log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub agent_id: AgentId,
    pub cursor: u64,
    pub bookmark: Bookmark,
    pub channel: Channel,
    pub event: KernelEvent,
}
