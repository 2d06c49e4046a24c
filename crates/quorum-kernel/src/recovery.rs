use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use quorum_core::breakpoint::{Breakpoint, ResumeAction};
use quorum_core::events::{KernelEvent, ResumeStrategy};
use quorum_core::ids::{AgentId, ToolCallId};
use quorum_core::messages::{failed_tool_result, ContentBlock, Message, Role};
use quorum_core::records::{ApprovalDecision, CallState, ToolCallRecord};
use quorum_store::{aux_maps, Store};

use crate::bus::EventBus;
use crate::error::KernelError;

/// What crash recovery did on open.
pub struct RecoveryOutcome {
    /// Records converted to a terminal state with a synthetic result.
    pub sealed: Vec<ToolCallRecord>,
    /// Approvals left pending (`strategy: manual` only); the embedder
    /// re-triggers or decides them.
    pub leftover_approvals: Vec<ToolCallRecord>,
    pub dropped_partial: bool,
    /// Breakpoint after recovery.
    pub breakpoint: Breakpoint,
}

/// Apply the crash-resume rules for the observed breakpoint: drop
/// partial assistant output, auto-seal in-flight tool calls, and leave
/// the agent at a legitimate resting state.
pub fn recover(
    store: &Arc<dyn Store>,
    bus: &Arc<EventBus>,
    agent_id: &AgentId,
    strategy: ResumeStrategy,
) -> Result<RecoveryOutcome, KernelError> {
    let mut agent_info = store.load_info(agent_id)?;
    let mut messages = store.load_messages(agent_id)?;
    let mut records = store.load_tool_records(agent_id)?;

    let action = agent_info.breakpoint.resume_action();
    let mut dropped_partial = false;

    if action == ResumeAction::DropPartial {
        // A trailing assistant message whose tool calls never produced
        // results is a partial turn; drop it from the history but keep
        // the content in the recovered_files map for inspection.
        let drop_last = messages
            .last()
            .map(|last| last.role == Role::Assistant && has_unresulted_uses(last, &messages))
            .unwrap_or(false);
        if drop_last {
            if let Some(partial) = messages.pop() {
                store.put_aux(
                    agent_id,
                    aux_maps::RECOVERED_FILES,
                    &format!("partial_{:08}", messages.len()),
                    &serde_json::json!({
                        "dropped_at": Utc::now().to_rfc3339(),
                        "message": partial,
                    }),
                )?;
            }
            dropped_partial = true;
        }
    }

    let mut sealed = Vec::new();
    let mut leftover_approvals = Vec::new();

    for record in records.iter_mut() {
        if record.state.is_terminal() {
            continue;
        }
        let synthetic_error = match record.state {
            CallState::Pending => {
                record.transition(CallState::Sealed, Some("crash before execution".into()))?;
                "auto-sealed: crash before execution"
            }
            CallState::ApprovalRequired => match strategy {
                ResumeStrategy::Crash => {
                    record.record_decision(
                        ApprovalDecision::Deny,
                        None,
                        Some("auto-sealed on crash".into()),
                    );
                    record.transition(CallState::Denied, Some("auto-sealed on crash".into()))?;
                    "auto-sealed: approval lost"
                }
                ResumeStrategy::Manual => {
                    leftover_approvals.push(record.clone());
                    continue;
                }
            },
            CallState::Approved => {
                record.transition(CallState::Sealed, Some("approved but unexecuted".into()))?;
                "auto-sealed: approved but unexecuted"
            }
            CallState::Executing => {
                record.transition(
                    CallState::Sealed,
                    Some("execution interrupted; check for side effects".into()),
                )?;
                "auto-sealed: execution interrupted; check for side effects"
            }
            _ => continue,
        };
        record.error = Some(synthetic_error.to_string());
        record.result = Some(serde_json::json!({ "error": synthetic_error }));
        sealed.push(record.clone());
    }

    // Every sealed call whose tool_use is still in the history and has
    // no result yet contributes a synthetic failed tool_result to a new
    // user message. Uses that left with a dropped partial need none.
    let resulted = resulted_ids(&messages);
    let used = used_ids(&messages);
    let blocks: Vec<ContentBlock> = sealed
        .iter()
        .filter(|r| used.contains(&r.id) && !resulted.contains(&r.id))
        .map(|r| {
            failed_tool_result(
                &r.id,
                r.error.clone().unwrap_or_else(|| "auto-sealed".into()),
            )
        })
        .collect();
    if !blocks.is_empty() {
        messages.push(Message::tool_results(blocks));
    }

    let breakpoint = if leftover_approvals.is_empty() {
        Breakpoint::Ready
    } else {
        Breakpoint::AwaitingApproval
    };

    store.save_messages(agent_id, &messages)?;
    store.save_tool_records(agent_id, &records)?;
    agent_info.breakpoint = breakpoint;
    agent_info.message_count = messages.len();
    store.save_info(&agent_info)?;

    if !sealed.is_empty() || dropped_partial {
        warn!(
            agent = %agent_id,
            sealed = sealed.len(),
            dropped_partial,
            "crash recovery applied"
        );
    } else {
        info!(agent = %agent_id, "clean resume");
    }

    bus.emit_or_log(KernelEvent::AgentResumed {
        strategy,
        sealed: sealed.clone(),
    });
    for record in &sealed {
        bus.emit_or_log(KernelEvent::ToolEnd {
            call_id: record.id.clone(),
            result: record
                .result
                .clone()
                .unwrap_or(serde_json::Value::Null),
        });
    }

    Ok(RecoveryOutcome {
        sealed,
        leftover_approvals,
        dropped_partial,
        breakpoint,
    })
}

fn resulted_ids(messages: &[Message]) -> HashSet<ToolCallId> {
    messages
        .iter()
        .flat_map(|m| m.content.iter())
        .filter_map(|b| match b {
            ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.clone()),
            _ => None,
        })
        .collect()
}

fn used_ids(messages: &[Message]) -> HashSet<ToolCallId> {
    messages
        .iter()
        .flat_map(|m| m.tool_uses())
        .map(|(id, _, _)| id.clone())
        .collect()
}

fn has_unresulted_uses(message: &Message, all: &[Message]) -> bool {
    let resulted = resulted_ids(all);
    message
        .tool_uses()
        .iter()
        .any(|(id, _, _)| !resulted.contains(*id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorum_core::info::AgentInfo;
    use quorum_store::MemoryStore;

    struct Setup {
        store: Arc<dyn Store>,
        bus: Arc<EventBus>,
        agent: AgentId,
    }

    fn setup(breakpoint: Breakpoint) -> Setup {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let agent = AgentId::new();
        let mut info = AgentInfo::new(agent.clone(), "t", "1", "h");
        info.breakpoint = breakpoint;
        store.save_info(&info).unwrap();
        let bus = Arc::new(EventBus::open(agent.clone(), Arc::clone(&store)).unwrap());
        Setup { store, bus, agent }
    }

    fn seed_call(s: &Setup, state: CallState) -> ToolCallId {
        let mut record =
            ToolCallRecord::new(ToolCallId::new(), "fs_write", serde_json::json!({}));
        match state {
            CallState::Pending => {}
            CallState::ApprovalRequired => {
                record.mark_approval_requested();
                record
                    .transition(CallState::ApprovalRequired, None)
                    .unwrap();
            }
            CallState::Approved => {
                record
                    .transition(CallState::ApprovalRequired, None)
                    .unwrap();
                record.transition(CallState::Approved, None).unwrap();
            }
            CallState::Executing => {
                record.transition(CallState::Executing, None).unwrap();
            }
            other => panic!("unsupported seed state {other:?}"),
        }
        let id = record.id.clone();

        // The assistant message that requested the call.
        let mut messages = s.store.load_messages(&s.agent).unwrap();
        messages.push(Message::user_text("do the thing"));
        messages.push(Message {
            role: Role::Assistant,
            content: vec![ContentBlock::ToolUse {
                id: id.clone(),
                name: "fs_write".into(),
                input: serde_json::json!({}),
            }],
            meta: None,
        });
        s.store.save_messages(&s.agent, &messages).unwrap();

        let mut records = s.store.load_tool_records(&s.agent).unwrap();
        records.push(record);
        s.store.save_tool_records(&s.agent, &records).unwrap();
        id
    }

    #[test]
    fn clean_resume_is_noop() {
        let s = setup(Breakpoint::Ready);
        let outcome =
            recover(&s.store, &s.bus, &s.agent, ResumeStrategy::Crash).unwrap();
        assert!(outcome.sealed.is_empty());
        assert!(!outcome.dropped_partial);
        assert_eq!(outcome.breakpoint, Breakpoint::Ready);
    }

    #[test]
    fn executing_call_sealed_with_synthetic_result() {
        let s = setup(Breakpoint::ToolExecuting);
        let id = seed_call(&s, CallState::Executing);

        let outcome =
            recover(&s.store, &s.bus, &s.agent, ResumeStrategy::Crash).unwrap();
        assert_eq!(outcome.sealed.len(), 1);
        assert_eq!(outcome.sealed[0].state, CallState::Sealed);
        assert_eq!(outcome.breakpoint, Breakpoint::Ready);

        // Synthetic failed result appended to the history.
        let messages = s.store.load_messages(&s.agent).unwrap();
        let last = messages.last().unwrap();
        assert_eq!(last.role, Role::User);
        match &last.content[0] {
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                assert_eq!(tool_use_id, &id);
                assert!(is_error);
                assert!(content["error"]
                    .as_str()
                    .unwrap()
                    .contains("execution interrupted"));
            }
            other => panic!("expected tool_result, got {other:?}"),
        }

        // agent_resumed then a synthetic tool:end.
        let events = s.store.read_events(&s.agent, None, None).unwrap();
        let types: Vec<&str> = events.iter().map(|e| e.event.event_type()).collect();
        assert!(types.contains(&"agent_resumed"));
        assert!(types.contains(&"tool:end"));
    }

    #[test]
    fn pending_and_approved_sealed() {
        let s = setup(Breakpoint::ToolPending);
        seed_call(&s, CallState::Pending);
        seed_call(&s, CallState::Approved);

        let outcome =
            recover(&s.store, &s.bus, &s.agent, ResumeStrategy::Crash).unwrap();
        assert_eq!(outcome.sealed.len(), 2);
        let errors: Vec<&str> = outcome
            .sealed
            .iter()
            .map(|r| r.error.as_deref().unwrap())
            .collect();
        assert!(errors.contains(&"auto-sealed: crash before execution"));
        assert!(errors.contains(&"auto-sealed: approved but unexecuted"));
    }

    #[test]
    fn approval_required_crash_strategy_denies() {
        let s = setup(Breakpoint::AwaitingApproval);
        let id = seed_call(&s, CallState::ApprovalRequired);

        let outcome =
            recover(&s.store, &s.bus, &s.agent, ResumeStrategy::Crash).unwrap();
        assert_eq!(outcome.sealed.len(), 1);
        let record = &outcome.sealed[0];
        assert_eq!(record.id, id);
        assert_eq!(record.state, CallState::Denied);
        assert_eq!(record.approval.decision, Some(ApprovalDecision::Deny));
        assert_eq!(
            record.approval.note.as_deref(),
            Some("auto-sealed on crash")
        );
        assert_eq!(outcome.breakpoint, Breakpoint::Ready);
    }

    #[test]
    fn approval_required_manual_strategy_left_pending() {
        let s = setup(Breakpoint::AwaitingApproval);
        let id = seed_call(&s, CallState::ApprovalRequired);

        let outcome =
            recover(&s.store, &s.bus, &s.agent, ResumeStrategy::Manual).unwrap();
        assert!(outcome.sealed.is_empty());
        assert_eq!(outcome.leftover_approvals.len(), 1);
        assert_eq!(outcome.leftover_approvals[0].id, id);
        assert_eq!(outcome.breakpoint, Breakpoint::AwaitingApproval);

        // The record is untouched and the tool_use still unresulted.
        let records = s.store.load_tool_records(&s.agent).unwrap();
        assert_eq!(records[0].state, CallState::ApprovalRequired);
    }

    #[test]
    fn streaming_partial_assistant_dropped() {
        let s = setup(Breakpoint::StreamingModel);
        seed_call(&s, CallState::Pending);
        // seed_call left a trailing assistant message with an unresulted
        // tool_use; under DropPartial it goes away, and the pending
        // record seals without needing a synthetic result.
        let outcome =
            recover(&s.store, &s.bus, &s.agent, ResumeStrategy::Crash).unwrap();
        assert!(outcome.dropped_partial);

        let messages = s.store.load_messages(&s.agent).unwrap();
        assert!(messages.iter().all(|m| m.role != Role::Assistant));

        // The discarded turn is preserved in the recovered_files map.
        let recovered = s
            .store
            .list_aux(&s.agent, aux_maps::RECOVERED_FILES)
            .unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].1["message"]["role"], "assistant");
        assert!(recovered[0].1["dropped_at"].as_str().is_some());
    }

    #[test]
    fn no_unresulted_uses_after_crash_recovery() {
        let s = setup(Breakpoint::ToolExecuting);
        seed_call(&s, CallState::Executing);
        seed_call(&s, CallState::Pending);

        recover(&s.store, &s.bus, &s.agent, ResumeStrategy::Crash).unwrap();

        let messages = s.store.load_messages(&s.agent).unwrap();
        let resulted = resulted_ids(&messages);
        for message in &messages {
            for (id, _, _) in message.tool_uses() {
                assert!(resulted.contains(id), "unresulted tool_use {id}");
            }
        }
    }
}
