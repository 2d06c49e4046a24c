use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::hooks::{PostToolVerdict, ToolHookVerdict};
use crate::ids::{AgentId, ToolCallId};
use crate::records::ToolCallRecord;
use crate::sandbox::Sandbox;

/// Static attributes a tool declares about itself.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ToolAttributes {
    /// Never mutates anything; eligible for readonly auto-approval and
    /// unrestricted parallelism.
    #[serde(default)]
    pub readonly: bool,
    /// Safe to re-execute after a crash (idempotent).
    #[serde(default)]
    pub no_effect: bool,
    /// Per-call execution timeout. None means the dispatcher default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl ToolAttributes {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Entry in the manifest handed to the model.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolManifestEntry {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Failure classification. Drives the `retryable` flag shown to the model.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorType {
    /// Input rejected by the schema. Not retryable.
    Validation,
    /// The tool raised an expected error (file not found, etc).
    Runtime,
    /// The tool ran but reported `ok: false`.
    Logical,
    /// Timeout or external cancellation. Not retryable.
    Aborted,
    /// Uncaught panic or unexpected error.
    Exception,
}

impl ToolErrorType {
    pub fn default_retryable(self) -> bool {
        matches!(self, Self::Runtime | Self::Logical | Self::Exception)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Runtime => "runtime",
            Self::Logical => "logical",
            Self::Aborted => "aborted",
            Self::Exception => "exception",
        }
    }
}

/// Structured failure produced by a tool or the dispatcher.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolFailure {
    pub error: String,
    pub error_type: ToolErrorType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recommendations: Vec<String>,
}

impl ToolFailure {
    pub fn new(error_type: ToolErrorType, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            error_type,
            retryable: None,
            recommendations: Vec::new(),
        }
    }

    pub fn retryable(&self) -> bool {
        self.retryable
            .unwrap_or_else(|| self.error_type.default_retryable())
    }

    /// The payload the model sees in the failed tool_result.
    pub fn to_report(&self) -> serde_json::Value {
        serde_json::json!({
            "ok": false,
            "error": self.error,
            "errorType": self.error_type.as_str(),
            "retryable": self.retryable(),
            "recommendations": self.recommendations,
        })
    }
}

/// What a tool execution produced.
#[derive(Clone, Debug)]
pub enum ToolOutcome {
    Success { content: serde_json::Value },
    Failure(ToolFailure),
}

impl ToolOutcome {
    pub fn ok(content: impl Into<serde_json::Value>) -> Self {
        Self::Success {
            content: content.into(),
        }
    }

    pub fn fail(error_type: ToolErrorType, error: impl Into<String>) -> Self {
        Self::Failure(ToolFailure::new(error_type, error))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Emitter handed to tools for custom monitor events.
pub type CustomEventEmitter = Arc<dyn Fn(&str, serde_json::Value) + Send + Sync>;

/// Execution context supplied to every tool invocation.
#[derive(Clone)]
pub struct ToolContext {
    pub agent_id: AgentId,
    pub call_id: ToolCallId,
    pub sandbox: Option<Arc<dyn Sandbox>>,
    pub cancel: CancellationToken,
    pub emit: CustomEventEmitter,
}

impl ToolContext {
    /// A context with no sandbox and a no-op emitter, for tests.
    pub fn bare(agent_id: AgentId) -> Self {
        Self {
            agent_id,
            call_id: ToolCallId::new(),
            sandbox: None,
            cancel: CancellationToken::new(),
            emit: Arc::new(|_, _| {}),
        }
    }
}

/// Trait implemented by each tool.
///
/// `pre_tool_use` / `post_tool_use` are the per-tool hook points; the
/// defaults proceed untouched.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn input_schema(&self) -> serde_json::Value;

    fn attributes(&self) -> ToolAttributes {
        ToolAttributes::default()
    }

    /// Optional contribution appended to the model's tool manual.
    fn manual_entry(&self) -> Option<String> {
        None
    }

    async fn pre_tool_use(&self, _call: &ToolCallRecord) -> ToolHookVerdict {
        ToolHookVerdict::Proceed
    }

    async fn post_tool_use(
        &self,
        _call: &ToolCallRecord,
        _outcome: &ToolOutcome,
    ) -> PostToolVerdict {
        PostToolVerdict::Keep
    }

    async fn execute(&self, args: serde_json::Value, ctx: &ToolContext) -> ToolOutcome;

    fn to_manifest_entry(&self) -> ToolManifestEntry {
        ToolManifestEntry {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
        }
    }
}
