use async_trait::async_trait;

use crate::messages::Message;
use crate::records::ToolCallRecord;

/// Verdict from a `pre_tool_use` hook. Tagged variants, never exceptions.
#[derive(Clone, Debug)]
pub enum ToolHookVerdict {
    /// Run the tool normally.
    Proceed,
    /// Escalate this call to an approval regardless of policy.
    Ask,
    /// Refuse the call; the optional payload becomes the tool_result.
    Deny {
        reason: String,
        tool_result: Option<serde_json::Value>,
    },
    /// Skip execution and use this synthetic result.
    ShortCircuit { result: crate::tools::ToolOutcome },
}

/// Verdict from a `post_tool_use` hook.
#[derive(Clone, Debug)]
pub enum PostToolVerdict {
    Keep,
    /// Merge this object into a successful result payload.
    Update { patch: serde_json::Value },
    Replace { outcome: crate::tools::ToolOutcome },
}

/// Template-level lifecycle hooks. All methods default to no-ops; an
/// embedder overrides the points it cares about.
///
/// Hook failures are contained by the kernel: a panicking or timed-out
/// hook is reported on the monitor channel and treated as if it had
/// returned the default verdict.
#[async_trait]
pub trait AgentHooks: Send + Sync {
    /// Mutate the outgoing context in place. No abort.
    async fn pre_model(&self, _messages: &mut Vec<Message>) {}

    /// Mutate the streamed assistant message (redact, annotate). Tool
    /// call ordering must be preserved.
    async fn post_model(&self, _message: &mut Message) {}

    /// Observation only.
    async fn messages_changed(&self, _messages: &[Message]) {}

    async fn pre_tool_use(&self, _call: &ToolCallRecord) -> ToolHookVerdict {
        ToolHookVerdict::Proceed
    }

    async fn post_tool_use(
        &self,
        _call: &ToolCallRecord,
        _outcome: &crate::tools::ToolOutcome,
    ) -> PostToolVerdict {
        PostToolVerdict::Keep
    }
}

/// The no-hooks default.
pub struct NoHooks;

#[async_trait]
impl AgentHooks for NoHooks {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ToolCallId;

    #[tokio::test]
    async fn no_hooks_defaults() {
        let hooks = NoHooks;
        let mut messages = vec![Message::user_text("hi")];
        hooks.pre_model(&mut messages).await;
        assert_eq!(messages.len(), 1);

        let record =
            ToolCallRecord::new(ToolCallId::new(), "echo", serde_json::json!({}));
        assert!(matches!(
            hooks.pre_tool_use(&record).await,
            ToolHookVerdict::Proceed
        ));
        let outcome = crate::tools::ToolOutcome::ok("done");
        assert!(matches!(
            hooks.post_tool_use(&record, &outcome).await,
            PostToolVerdict::Keep
        ));
    }
}
