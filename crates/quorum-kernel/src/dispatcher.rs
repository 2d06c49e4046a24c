use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use quorum_core::breakpoint::Breakpoint;
use quorum_core::events::KernelEvent;
use quorum_core::hooks::{PostToolVerdict, ToolHookVerdict};
use quorum_core::ids::{AgentId, ToolCallId};
use quorum_core::messages::ContentBlock;
use quorum_core::records::{ApprovalDecision, CallState, ToolCallRecord};
use quorum_core::sandbox::Sandbox;
use quorum_core::tools::{
    Tool, ToolContext, ToolErrorType, ToolFailure, ToolOutcome,
};
use quorum_store::Store;

use crate::breakpoints::BreakpointManager;
use crate::bus::EventBus;
use crate::error::KernelError;
use crate::failure::RecommendationTable;
use crate::hooks::HookManager;
use crate::permissions::{Decision, PermissionManager, PermissionOutcome};
use crate::registry::ToolRegistry;
use crate::truncate;

/// Small default fan-out; the knob exists because the right value is
/// workload-dependent.
const DEFAULT_FAN_OUT: usize = 4;
const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    pub fan_out: usize,
    pub default_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            fan_out: DEFAULT_FAN_OUT,
            default_timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }
}

/// One model-emitted tool_use block, queued for execution.
#[derive(Clone, Debug)]
pub struct PendingCall {
    pub id: ToolCallId,
    pub name: String,
    pub input: serde_json::Value,
}

/// Executes a batch of tool calls: bounded fan-out, mutating calls
/// serialized, permission and hook gating, failure taxonomy, and
/// `tool_result` blocks returned in `tool_use` order regardless of
/// completion order.
pub struct ToolDispatcher {
    agent_id: AgentId,
    registry: Arc<RwLock<ToolRegistry>>,
    permissions: Arc<PermissionManager>,
    hooks: Arc<HookManager>,
    bus: Arc<EventBus>,
    store: Arc<dyn Store>,
    breakpoints: Arc<BreakpointManager>,
    recommendations: Arc<RecommendationTable>,
    records: Arc<Mutex<Vec<ToolCallRecord>>>,
    sandbox: Option<Arc<dyn Sandbox>>,
    config: DispatcherConfig,
    fan_out: Arc<Semaphore>,
    mutating: Arc<tokio::sync::Mutex<()>>,
}

impl ToolDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agent_id: AgentId,
        registry: Arc<RwLock<ToolRegistry>>,
        permissions: Arc<PermissionManager>,
        hooks: Arc<HookManager>,
        bus: Arc<EventBus>,
        store: Arc<dyn Store>,
        breakpoints: Arc<BreakpointManager>,
        records: Arc<Mutex<Vec<ToolCallRecord>>>,
        sandbox: Option<Arc<dyn Sandbox>>,
        config: DispatcherConfig,
    ) -> Self {
        let fan_out = Arc::new(Semaphore::new(config.fan_out.max(1)));
        Self {
            agent_id,
            registry,
            permissions,
            hooks,
            bus,
            store,
            breakpoints,
            recommendations: Arc::new(RecommendationTable::new()),
            records,
            sandbox,
            config,
            fan_out,
            mutating: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn recommendations(&self) -> &RecommendationTable {
        &self.recommendations
    }

    /// Run the whole batch. Returns `tool_result` blocks in the order of
    /// the originating `tool_use` blocks.
    pub async fn dispatch(
        self: &Arc<Self>,
        batch: Vec<PendingCall>,
        cancel: &CancellationToken,
    ) -> Result<Vec<ContentBlock>, KernelError> {
        // Register all records up front so the whole batch is durable
        // before anything executes.
        {
            let mut records = self.records.lock();
            for call in &batch {
                records.push(ToolCallRecord::new(
                    call.id.clone(),
                    call.name.clone(),
                    call.input.clone(),
                ));
            }
            self.store.save_tool_records(&self.agent_id, &records)?;
        }

        let mut handles = Vec::with_capacity(batch.len());
        for (idx, call) in batch.into_iter().enumerate() {
            let dispatcher = Arc::clone(self);
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                (idx, dispatcher.run_call(call, cancel).await)
            }));
        }

        let mut results: Vec<(usize, ContentBlock)> = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok((idx, block)) => results.push((idx, block)),
                Err(join_err) => {
                    error!(error = %join_err, "tool task failed to join");
                    return Err(KernelError::Internal(format!(
                        "tool task panicked outside the execution guard: {join_err}"
                    )));
                }
            }
        }
        results.sort_by_key(|(idx, _)| *idx);
        Ok(results.into_iter().map(|(_, block)| block).collect())
    }

    /// Apply a mutation to one record, persist the table, and return the
    /// updated snapshot.
    fn update_record(
        &self,
        id: &ToolCallId,
        f: impl FnOnce(&mut ToolCallRecord),
    ) -> Result<ToolCallRecord, KernelError> {
        let snapshot = {
            let mut records = self.records.lock();
            let record = records
                .iter_mut()
                .find(|r| &r.id == id)
                .ok_or_else(|| KernelError::Internal(format!("no record for call {id}")))?;
            f(record);
            let snapshot = record.clone();
            self.store.save_tool_records(&self.agent_id, &records)?;
            snapshot
        };
        Ok(snapshot)
    }

    fn record_snapshot(&self, id: &ToolCallId) -> Result<ToolCallRecord, KernelError> {
        self.records
            .lock()
            .iter()
            .find(|r| &r.id == id)
            .cloned()
            .ok_or_else(|| KernelError::Internal(format!("no record for call {id}")))
    }

    async fn run_call(
        self: Arc<Self>,
        call: PendingCall,
        cancel: CancellationToken,
    ) -> ContentBlock {
        match self.try_run_call(&call, cancel).await {
            Ok(block) => block,
            Err(e) => {
                error!(call = %call.id, error = %e, "tool call failed internally");
                self.finish_failure(
                    &call,
                    ToolFailure::new(ToolErrorType::Exception, e.to_string()),
                )
                .unwrap_or_else(|_| {
                    quorum_core::messages::failed_tool_result(&call.id, e.to_string())
                })
            }
        }
    }

    async fn try_run_call(
        &self,
        call: &PendingCall,
        cancel: CancellationToken,
    ) -> Result<ContentBlock, KernelError> {
        let tool = self.registry.read().get(&call.name);
        let Some(tool) = tool else {
            self.update_record(&call.id, |r| {
                let _ = r.transition(CallState::Executing, None);
                let _ = r.transition(
                    CallState::Failed,
                    Some(format!("unknown tool {}", call.name)),
                );
                r.error = Some(format!("unknown tool {}", call.name));
            })?;
            let mut failure = ToolFailure::new(
                ToolErrorType::Validation,
                format!("unknown tool {}", call.name),
            );
            failure.retryable = Some(false);
            return self.emit_terminal_failure(call, failure);
        };
        let attrs = tool.attributes();

        // 1. Permission gate.
        match self.permissions.evaluate(&call.name, &attrs) {
            PermissionOutcome::Allow => {}
            PermissionOutcome::Deny(reason) => {
                return self.deny_call(call, &reason, None, "policy");
            }
            PermissionOutcome::Ask => {
                match self.await_approval(call, &cancel).await? {
                    ApprovalResult::Approved => {}
                    ApprovalResult::Block(block) => return Ok(block),
                }
            }
        }

        // 2. Hook gate: template-level first, then the tool's own hook.
        let snapshot = self.record_snapshot(&call.id)?;
        let mut verdict = self.hooks.pre_tool_use(&snapshot).await;
        if matches!(verdict, ToolHookVerdict::Proceed) {
            verdict = tool.pre_tool_use(&snapshot).await;
        }
        match verdict {
            ToolHookVerdict::Proceed => {}
            ToolHookVerdict::Ask => {
                if snapshot.state == CallState::Pending {
                    match self.await_approval(call, &cancel).await? {
                        ApprovalResult::Approved => {}
                        ApprovalResult::Block(block) => return Ok(block),
                    }
                }
            }
            ToolHookVerdict::Deny {
                reason,
                tool_result,
            } => {
                self.update_record(&call.id, |r| {
                    let _ = r.transition(CallState::Executing, None);
                    let _ = r.transition(CallState::Failed, Some(format!("hook deny: {reason}")));
                    r.error = Some(reason.clone());
                })?;
                let content = tool_result.unwrap_or_else(|| {
                    ToolFailure::new(ToolErrorType::Validation, reason.clone()).to_report()
                });
                self.bus.emit_or_log(KernelEvent::ToolError {
                    call_id: call.id.clone(),
                    error: reason,
                });
                self.emit_executed(&call.id);
                return Ok(ContentBlock::ToolResult {
                    tool_use_id: call.id.clone(),
                    content,
                    is_error: true,
                });
            }
            ToolHookVerdict::ShortCircuit { result } => {
                self.update_record(&call.id, |r| {
                    let _ = r.transition(CallState::Executing, Some("short-circuited".into()));
                })?;
                return self.finish_outcome(call, &tool, result, true).await;
            }
        }

        // 3. Execute.
        self.update_record(&call.id, |r| {
            // A resumed call can reach here still ApprovalRequired when
            // the effective policy allows it outright now.
            if r.state == CallState::ApprovalRequired {
                let _ = r.transition(CallState::Approved, Some("allowed by policy".into()));
            }
            let _ = r.transition(CallState::Executing, None);
        })?;
        let _ = self.breakpoints.transition(Breakpoint::ToolExecuting);
        self.bus.emit_or_log(KernelEvent::ToolStart {
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
        });

        // Fan-out bound, with mutating calls serialized among themselves.
        let _permit = self
            .fan_out
            .acquire()
            .await
            .map_err(|_| KernelError::Internal("dispatcher semaphore closed".into()))?;
        let _mutating_guard = if attrs.readonly {
            None
        } else {
            Some(self.mutating.lock().await)
        };

        let call_cancel = cancel.child_token();
        let bus = Arc::clone(&self.bus);
        let ctx = ToolContext {
            agent_id: self.agent_id.clone(),
            call_id: call.id.clone(),
            sandbox: self.sandbox.clone(),
            cancel: call_cancel.clone(),
            emit: Arc::new(move |name, data| {
                bus.emit_or_log(KernelEvent::ToolCustomEvent {
                    name: name.to_string(),
                    data,
                });
            }),
        };

        let timeout = attrs.timeout().unwrap_or(self.config.default_timeout);
        let execution =
            std::panic::AssertUnwindSafe(tool.execute(call.input.clone(), &ctx)).catch_unwind();

        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                call_cancel.cancel();
                let mut f = ToolFailure::new(ToolErrorType::Aborted, "cancelled");
                f.retryable = Some(false);
                ToolOutcome::Failure(f)
            }
            result = tokio::time::timeout(timeout, execution) => match result {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(panic)) => {
                    let message = panic_message(&panic);
                    error!(tool = %call.name, panic = %message, "tool panicked");
                    ToolOutcome::Failure(ToolFailure::new(
                        ToolErrorType::Exception,
                        format!("tool panicked: {message}"),
                    ))
                }
                Err(_) => {
                    warn!(tool = %call.name, timeout_secs = timeout.as_secs(), "tool timed out");
                    let mut f = ToolFailure::new(
                        ToolErrorType::Aborted,
                        format!("timed out after {}s", timeout.as_secs()),
                    );
                    f.retryable = Some(false);
                    ToolOutcome::Failure(f)
                }
            },
        };

        self.finish_outcome(call, &tool, outcome, false).await
    }

    /// Post-hooks, truncation, terminal record state, events, block.
    async fn finish_outcome(
        &self,
        call: &PendingCall,
        tool: &Arc<dyn Tool>,
        outcome: ToolOutcome,
        short_circuited: bool,
    ) -> Result<ContentBlock, KernelError> {
        let snapshot = self.record_snapshot(&call.id)?;
        let mut outcome = outcome;

        let mut verdict = self.hooks.post_tool_use(&snapshot, &outcome).await;
        if matches!(verdict, PostToolVerdict::Keep) && !short_circuited {
            verdict = tool.post_tool_use(&snapshot, &outcome).await;
        }
        match verdict {
            PostToolVerdict::Keep => {}
            PostToolVerdict::Update { patch } => {
                if let ToolOutcome::Success { content } = &mut outcome {
                    merge_patch(content, &patch);
                }
            }
            PostToolVerdict::Replace { outcome: replaced } => outcome = replaced,
        }

        match outcome {
            ToolOutcome::Success { mut content } => {
                if let serde_json::Value::String(text) = &content {
                    let max = truncate::max_output_for_tool(&call.name);
                    content = serde_json::Value::String(truncate::truncate_output(text, max));
                }
                self.update_record(&call.id, |r| {
                    let _ = r.transition(CallState::Completed, None);
                    r.result = Some(content.clone());
                })?;
                self.bus.emit_or_log(KernelEvent::ToolEnd {
                    call_id: call.id.clone(),
                    result: content.clone(),
                });
                self.emit_executed(&call.id);
                Ok(ContentBlock::ToolResult {
                    tool_use_id: call.id.clone(),
                    content,
                    is_error: false,
                })
            }
            ToolOutcome::Failure(failure) => self.finish_failure(call, failure),
        }
    }

    fn finish_failure(
        &self,
        call: &PendingCall,
        mut failure: ToolFailure,
    ) -> Result<ContentBlock, KernelError> {
        self.recommendations.enrich(&call.name, &mut failure);
        self.update_record(&call.id, |r| {
            // Reach a terminal state through whatever prefix of the graph
            // the call got to before failing.
            match r.state {
                CallState::ApprovalRequired => {
                    let _ = r.transition(CallState::Denied, Some(failure.error.clone()));
                }
                _ => {
                    let _ = r.transition(CallState::Executing, None);
                    let _ = r.transition(CallState::Failed, Some(failure.error.clone()));
                }
            }
            r.error = Some(failure.error.clone());
            r.result = Some(failure.to_report());
        })?;
        self.bus.emit_or_log(KernelEvent::ToolError {
            call_id: call.id.clone(),
            error: failure.error.clone(),
        });
        self.emit_executed(&call.id);
        Ok(ContentBlock::ToolResult {
            tool_use_id: call.id.clone(),
            content: failure.to_report(),
            is_error: true,
        })
    }

    fn emit_terminal_failure(
        &self,
        call: &PendingCall,
        failure: ToolFailure,
    ) -> Result<ContentBlock, KernelError> {
        self.bus.emit_or_log(KernelEvent::ToolError {
            call_id: call.id.clone(),
            error: failure.error.clone(),
        });
        self.emit_executed(&call.id);
        Ok(ContentBlock::ToolResult {
            tool_use_id: call.id.clone(),
            content: failure.to_report(),
            is_error: true,
        })
    }

    /// Outright denial (policy or decision): the record passes through
    /// ApprovalRequired so Denied stays reachable on the legal graph.
    fn deny_call(
        &self,
        call: &PendingCall,
        reason: &str,
        decider: Option<String>,
        origin: &str,
    ) -> Result<ContentBlock, KernelError> {
        self.update_record(&call.id, |r| {
            if r.state == CallState::Pending {
                let _ = r.transition(CallState::ApprovalRequired, Some(origin.to_string()));
            }
            r.record_decision(ApprovalDecision::Deny, decider, Some(reason.to_string()));
            let _ = r.transition(CallState::Denied, Some(reason.to_string()));
            r.error = Some(reason.to_string());
        })?;

        let mut failure = ToolFailure::new(ToolErrorType::Validation, format!("denied: {reason}"));
        failure.retryable = Some(false);
        self.recommendations.enrich(&call.name, &mut failure);

        self.bus.emit_or_log(KernelEvent::ToolError {
            call_id: call.id.clone(),
            error: failure.error.clone(),
        });
        self.emit_executed(&call.id);
        Ok(ContentBlock::ToolResult {
            tool_use_id: call.id.clone(),
            content: failure.to_report(),
            is_error: true,
        })
    }

    async fn await_approval(
        &self,
        call: &PendingCall,
        cancel: &CancellationToken,
    ) -> Result<ApprovalResult, KernelError> {
        let record = self.update_record(&call.id, |r| {
            r.mark_approval_requested();
            let _ = r.transition(CallState::ApprovalRequired, None);
        })?;
        let rx = self.permissions.register_pending(&record);
        let _ = self.breakpoints.transition(Breakpoint::AwaitingApproval);

        let decision = tokio::select! {
            _ = cancel.cancelled() => {
                self.permissions.cancel_pending(&call.id);
                let mut f = ToolFailure::new(ToolErrorType::Aborted, "interrupted while awaiting approval");
                f.retryable = Some(false);
                return Ok(ApprovalResult::Block(self.finish_failure(call, f)?));
            }
            decision = rx => decision,
        };

        let approvals_drained = self.permissions.pending_ids().is_empty();
        if approvals_drained {
            let _ = self.breakpoints.transition(Breakpoint::PreTool);
        }

        match decision {
            Ok(Decision {
                decision: ApprovalDecision::Allow,
                note,
                decider,
            }) => {
                self.update_record(&call.id, |r| {
                    r.record_decision(ApprovalDecision::Allow, decider, note);
                    let _ = r.transition(CallState::Approved, None);
                })?;
                Ok(ApprovalResult::Approved)
            }
            Ok(Decision {
                decision: ApprovalDecision::Deny,
                note,
                decider,
            }) => {
                let reason = note.clone().unwrap_or_else(|| "denied".to_string());
                Ok(ApprovalResult::Block(self.deny_call(
                    call,
                    &reason,
                    decider,
                    "decision",
                )?))
            }
            Err(_) => {
                let mut f =
                    ToolFailure::new(ToolErrorType::Aborted, "approval channel dropped");
                f.retryable = Some(false);
                Ok(ApprovalResult::Block(self.finish_failure(call, f)?))
            }
        }
    }

    fn emit_executed(&self, id: &ToolCallId) {
        if let Ok(record) = self.record_snapshot(id) {
            self.bus
                .emit_or_log(KernelEvent::ToolExecuted { record });
        }
    }
}

enum ApprovalResult {
    Approved,
    Block(ContentBlock),
}

/// Shallow object merge for `PostToolVerdict::Update`.
fn merge_patch(content: &mut serde_json::Value, patch: &serde_json::Value) {
    match (content.as_object_mut(), patch.as_object()) {
        (Some(target), Some(source)) => {
            for (k, v) in source {
                target.insert(k.clone(), v.clone());
            }
        }
        _ => *content = patch.clone(),
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}
