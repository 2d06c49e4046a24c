use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tracing::warn;

use quorum_core::events::{ErrorPhase, ErrorSeverity, KernelEvent};
use quorum_core::hooks::{AgentHooks, PostToolVerdict, ToolHookVerdict};
use quorum_core::messages::Message;
use quorum_core::records::ToolCallRecord;
use quorum_core::tools::ToolOutcome;

use crate::bus::EventBus;

const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(30);

/// Invokes embedder-supplied hooks at the fixed lifecycle points.
///
/// Error policy: a hook that panics or times out is reported as a
/// monitor `error {phase: lifecycle}` and treated as if it had returned
/// the default verdict. Hooks must not assume they are the only
/// listener.
pub struct HookManager {
    hooks: Vec<Arc<dyn AgentHooks>>,
    bus: Arc<EventBus>,
    timeout: Duration,
}

impl HookManager {
    pub fn new(hooks: Vec<Arc<dyn AgentHooks>>, bus: Arc<EventBus>) -> Self {
        Self {
            hooks,
            bus,
            timeout: DEFAULT_HOOK_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn report_failure(&self, point: &str, detail: String) {
        warn!(point, detail, "hook failed");
        self.bus.emit_or_log(KernelEvent::Error {
            severity: ErrorSeverity::Warning,
            phase: ErrorPhase::Lifecycle,
            message: format!("hook {point} failed"),
            detail: Some(serde_json::json!({ "detail": detail })),
        });
    }

    /// Mutate the outgoing context in place. No abort.
    pub async fn pre_model(&self, messages: &mut Vec<Message>) {
        for hook in &self.hooks {
            let fut = std::panic::AssertUnwindSafe(hook.pre_model(messages)).catch_unwind();
            match tokio::time::timeout(self.timeout, fut).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => self.report_failure("pre_model", "panicked".into()),
                Err(_) => self.report_failure("pre_model", "timed out".into()),
            }
        }
    }

    /// Mutate the streamed assistant message; tool call order must hold.
    pub async fn post_model(&self, message: &mut Message) {
        for hook in &self.hooks {
            let fut = std::panic::AssertUnwindSafe(hook.post_model(message)).catch_unwind();
            match tokio::time::timeout(self.timeout, fut).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => self.report_failure("post_model", "panicked".into()),
                Err(_) => self.report_failure("post_model", "timed out".into()),
            }
        }
    }

    pub async fn messages_changed(&self, messages: &[Message]) {
        for hook in &self.hooks {
            let fut = std::panic::AssertUnwindSafe(hook.messages_changed(messages)).catch_unwind();
            match tokio::time::timeout(self.timeout, fut).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => self.report_failure("messages_changed", "panicked".into()),
                Err(_) => self.report_failure("messages_changed", "timed out".into()),
            }
        }
    }

    /// First non-Proceed verdict wins.
    pub async fn pre_tool_use(&self, call: &ToolCallRecord) -> ToolHookVerdict {
        for hook in &self.hooks {
            let fut = std::panic::AssertUnwindSafe(hook.pre_tool_use(call)).catch_unwind();
            match tokio::time::timeout(self.timeout, fut).await {
                Ok(Ok(ToolHookVerdict::Proceed)) => continue,
                Ok(Ok(verdict)) => return verdict,
                Ok(Err(_)) => self.report_failure("pre_tool_use", "panicked".into()),
                Err(_) => self.report_failure("pre_tool_use", "timed out".into()),
            }
        }
        ToolHookVerdict::Proceed
    }

    /// First non-Keep verdict wins.
    pub async fn post_tool_use(
        &self,
        call: &ToolCallRecord,
        outcome: &ToolOutcome,
    ) -> PostToolVerdict {
        for hook in &self.hooks {
            let fut =
                std::panic::AssertUnwindSafe(hook.post_tool_use(call, outcome)).catch_unwind();
            match tokio::time::timeout(self.timeout, fut).await {
                Ok(Ok(PostToolVerdict::Keep)) => continue,
                Ok(Ok(verdict)) => return verdict,
                Ok(Err(_)) => self.report_failure("post_tool_use", "panicked".into()),
                Err(_) => self.report_failure("post_tool_use", "timed out".into()),
            }
        }
        PostToolVerdict::Keep
    }
}
