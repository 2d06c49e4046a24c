//! End-to-end scenarios over the full kernel stack with a scripted
//! model provider.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use quorum_core::breakpoint::Breakpoint;
use quorum_core::config::{AgentConfig, PermissionConfig, PermissionMode};
use quorum_core::events::{Channel, DoneReason, KernelEvent, ResumeStrategy};
use quorum_core::ids::{AgentId, ToolCallId};
use quorum_core::info::AgentInfo;
use quorum_core::messages::{ContentBlock, Message, Role};
use quorum_core::records::{ApprovalDecision, CallState, ToolCallRecord};
use quorum_core::tools::{Tool, ToolAttributes, ToolContext, ToolOutcome};
use quorum_kernel::agent::{Agent, AgentDeps, ChatStatus};
use quorum_kernel::bus::EventBus;
use quorum_kernel::pool::AgentPool;
use quorum_llm::{ScriptedProvider, ScriptedResponse};
use quorum_store::{MemoryStore, Store};

struct FsReadTool;

#[async_trait]
impl Tool for FsReadTool {
    fn name(&self) -> &str {
        "fs_read"
    }
    fn description(&self) -> &str {
        "Reads a file from the sandbox"
    }
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {"path": {"type": "string"}},
            "required": ["path"]
        })
    }
    fn attributes(&self) -> ToolAttributes {
        ToolAttributes {
            readonly: true,
            ..Default::default()
        }
    }
    async fn execute(&self, _args: serde_json::Value, _ctx: &ToolContext) -> ToolOutcome {
        ToolOutcome::ok("hello")
    }
}

struct FsWriteTool;

#[async_trait]
impl Tool for FsWriteTool {
    fn name(&self) -> &str {
        "fs_write"
    }
    fn description(&self) -> &str {
        "Writes a file in the sandbox"
    }
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {"path": {"type": "string"}, "content": {"type": "string"}},
            "required": ["path", "content"]
        })
    }
    async fn execute(&self, _args: serde_json::Value, _ctx: &ToolContext) -> ToolOutcome {
        ToolOutcome::ok("written")
    }
}

fn agent_config(mode: PermissionMode) -> AgentConfig {
    AgentConfig {
        template_id: "default".into(),
        template_version: "1".into(),
        system_prompt: "You are a test agent.".into(),
        permission: PermissionConfig {
            mode,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn make_deps(store: &Arc<dyn Store>, responses: Vec<ScriptedResponse>) -> AgentDeps {
    AgentDeps {
        store: Arc::clone(store),
        provider: Arc::new(ScriptedProvider::new(responses)),
        tools: vec![Arc::new(FsReadTool), Arc::new(FsWriteTool)],
        hooks: vec![],
        sandbox: None,
    }
}

fn assert_every_tool_use_resulted(messages: &[Message]) {
    let resulted: HashSet<ToolCallId> = messages
        .iter()
        .flat_map(|m| m.content.iter())
        .filter_map(|b| match b {
            ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.clone()),
            _ => None,
        })
        .collect();
    for message in messages {
        for (id, name, _) in message.tool_uses() {
            assert!(
                resulted.contains(id),
                "tool_use {id} ({name}) has no tool_result"
            );
        }
    }
}

// ── Scenario 1: basic completion ─────────────────────────────────────

#[tokio::test]
async fn basic_completion() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let id = AgentId::new();
    let agent = Agent::create(
        id.clone(),
        agent_config(PermissionMode::Auto),
        make_deps(&store, vec![ScriptedResponse::text("pong")]),
    )
    .unwrap();

    let reply = agent.send("ping").await.unwrap();
    assert_eq!(reply, "pong");

    let messages = store.load_messages(&id).unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[0].text_content(), "ping");
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(messages[1].text_content(), "pong");

    let progress = store
        .read_events(&id, None, Some(&[Channel::Progress]))
        .unwrap();
    let types: Vec<&str> = progress.iter().map(|e| e.event.event_type()).collect();
    assert_eq!(
        types,
        vec!["text_chunk_start", "text_chunk", "text_chunk_end", "done"]
    );
    match &progress[1].event {
        KernelEvent::TextChunk { delta } => assert_eq!(delta, "pong"),
        other => panic!("expected text_chunk, got {other:?}"),
    }
    match &progress[3].event {
        KernelEvent::Done { reason } => assert_eq!(*reason, DoneReason::Completed),
        other => panic!("expected done, got {other:?}"),
    }

    assert_eq!(store.load_info(&id).unwrap().breakpoint, Breakpoint::Ready);
}

// ── Scenario 2: tool auto-approve ────────────────────────────────────

#[tokio::test]
async fn tool_auto_approve() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let id = AgentId::new();
    let call_id = ToolCallId::new();
    let agent = Agent::create(
        id.clone(),
        agent_config(PermissionMode::Auto),
        make_deps(
            &store,
            vec![
                ScriptedResponse::tool_call(
                    call_id.clone(),
                    "fs_read",
                    serde_json::json!({"path": "/tmp/x"}),
                ),
                ScriptedResponse::text("got hello"),
            ],
        ),
    )
    .unwrap();

    let reply = agent.send("read /tmp/x").await.unwrap();
    assert_eq!(reply, "got hello");

    // Record transitions Pending → Executing → Completed.
    let records = store.load_tool_records(&id).unwrap();
    assert_eq!(records.len(), 1);
    let audit: Vec<CallState> = records[0].audit.iter().map(|a| a.state).collect();
    assert_eq!(
        audit,
        vec![CallState::Pending, CallState::Executing, CallState::Completed]
    );

    // Progress carries tool:start then tool:end for the call id.
    let progress = store
        .read_events(&id, None, Some(&[Channel::Progress]))
        .unwrap();
    let start_pos = progress
        .iter()
        .position(|e| matches!(&e.event, KernelEvent::ToolStart { call_id: c, .. } if c == &call_id))
        .expect("no tool:start");
    let end_pos = progress
        .iter()
        .position(|e| matches!(&e.event, KernelEvent::ToolEnd { call_id: c, .. } if c == &call_id))
        .expect("no tool:end");
    assert!(start_pos < end_pos);

    // The follow-up user message holds the matching tool_result.
    let messages = store.load_messages(&id).unwrap();
    match &messages[2].content[0] {
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => {
            assert_eq!(tool_use_id, &call_id);
            assert!(!is_error);
            assert_eq!(content, "hello");
        }
        other => panic!("expected tool_result, got {other:?}"),
    }
    assert_every_tool_use_resulted(&messages);
}

// ── Scenario 3: approval deny ────────────────────────────────────────

#[tokio::test]
async fn approval_deny() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let id = AgentId::new();
    let call_id = ToolCallId::new();
    let agent = Agent::create(
        id.clone(),
        agent_config(PermissionMode::Approval),
        make_deps(
            &store,
            vec![
                ScriptedResponse::tool_call(
                    call_id.clone(),
                    "fs_write",
                    serde_json::json!({"path": "/tmp/x", "content": "data"}),
                ),
                ScriptedResponse::text("understood, not writing"),
            ],
        ),
    )
    .unwrap();

    let outcome = agent.chat("write something").await.unwrap();
    assert_eq!(outcome.status, ChatStatus::Paused);
    assert_eq!(outcome.permission_ids, vec![call_id.clone()]);

    agent
        .decide(&call_id, ApprovalDecision::Deny, Some("nope".into()))
        .unwrap();

    // Wait until the record reaches Denied and the turn finishes.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let records = store.load_tool_records(&id).unwrap();
        if records.first().map(|r| r.state) == Some(CallState::Denied)
            && agent.status().last_text.is_some()
        {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "turn never settled");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Synthetic failed result mentioning the note.
    let messages = store.load_messages(&id).unwrap();
    let result = messages
        .iter()
        .flat_map(|m| m.content.iter())
        .find_map(|b| match b {
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } if tool_use_id == &call_id => Some((content.clone(), *is_error)),
            _ => None,
        })
        .expect("no tool_result for denied call");
    assert!(result.1);
    assert!(result.0["error"].as_str().unwrap().contains("nope"));

    // Control channel: permission_required precedes permission_decided.
    let control = store
        .read_events(&id, None, Some(&[Channel::Control]))
        .unwrap();
    let types: Vec<&str> = control.iter().map(|e| e.event.event_type()).collect();
    assert_eq!(types, vec!["permission_required", "permission_decided"]);
    match &control[1].event {
        KernelEvent::PermissionDecided { decision, .. } => {
            assert_eq!(*decision, ApprovalDecision::Deny);
        }
        other => panic!("expected permission_decided, got {other:?}"),
    }
}

// ── Scenario 4: crash mid-execution ──────────────────────────────────

#[tokio::test]
async fn crash_mid_execution_auto_seals() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let id = AgentId::new();

    // Fabricate the exact on-disk state a crash during EXECUTING leaves
    // behind: persisted user + assistant(tool_use), a record in
    // Executing, breakpoint ToolExecuting.
    let call_id = ToolCallId::new();
    let mut info = AgentInfo::new(id.clone(), "default", "1", "hash");
    info.breakpoint = Breakpoint::ToolExecuting;
    info.saved_config = Some(agent_config(PermissionMode::Auto));
    store.save_info(&info).unwrap();
    store
        .save_messages(
            &id,
            &[
                Message::user_text("write the report"),
                Message {
                    role: Role::Assistant,
                    content: vec![ContentBlock::ToolUse {
                        id: call_id.clone(),
                        name: "fs_write".into(),
                        input: serde_json::json!({"path": "/tmp/report", "content": "..."}),
                    }],
                    meta: None,
                },
            ],
        )
        .unwrap();
    let mut record = ToolCallRecord::new(
        call_id.clone(),
        "fs_write",
        serde_json::json!({"path": "/tmp/report", "content": "..."}),
    );
    record.transition(CallState::Executing, None).unwrap();
    store.save_tool_records(&id, &[record]).unwrap();

    // "Restart" with strategy: crash.
    let agent = Agent::resume(
        id.clone(),
        agent_config(PermissionMode::Auto),
        make_deps(&store, vec![]),
    )
    .unwrap();

    let records = store.load_tool_records(&id).unwrap();
    assert_eq!(records[0].state, CallState::Sealed);
    assert!(records[0]
        .error
        .as_deref()
        .unwrap()
        .contains("execution interrupted"));

    let messages = store.load_messages(&id).unwrap();
    assert_every_tool_use_resulted(&messages);
    let last = messages.last().unwrap();
    match &last.content[0] {
        ContentBlock::ToolResult {
            tool_use_id,
            is_error,
            ..
        } => {
            assert_eq!(tool_use_id, &call_id);
            assert!(is_error);
        }
        other => panic!("expected tool_result, got {other:?}"),
    }

    let monitor = store
        .read_events(&id, None, Some(&[Channel::Monitor]))
        .unwrap();
    let resumed = monitor
        .iter()
        .find_map(|e| match &e.event {
            KernelEvent::AgentResumed { strategy, sealed } => Some((*strategy, sealed.clone())),
            _ => None,
        })
        .expect("no agent_resumed event");
    assert_eq!(resumed.0, ResumeStrategy::Crash);
    assert_eq!(resumed.1.len(), 1);
    assert_eq!(resumed.1[0].id, call_id);

    assert_eq!(agent.status().breakpoint, Breakpoint::Ready);
    assert_eq!(store.load_info(&id).unwrap().breakpoint, Breakpoint::Ready);
}

#[tokio::test]
async fn crash_while_awaiting_approval_manual_leaves_pending() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let id = AgentId::new();
    let call_id = ToolCallId::new();

    let mut config = agent_config(PermissionMode::Approval);
    config.resume.strategy = ResumeStrategy::Manual;

    let mut info = AgentInfo::new(id.clone(), "default", "1", "hash");
    info.breakpoint = Breakpoint::AwaitingApproval;
    store.save_info(&info).unwrap();
    store
        .save_messages(
            &id,
            &[
                Message::user_text("write it"),
                Message {
                    role: Role::Assistant,
                    content: vec![ContentBlock::ToolUse {
                        id: call_id.clone(),
                        name: "fs_write".into(),
                        input: serde_json::json!({"path": "/tmp/x", "content": "y"}),
                    }],
                    meta: None,
                },
            ],
        )
        .unwrap();
    let mut record = ToolCallRecord::new(
        call_id.clone(),
        "fs_write",
        serde_json::json!({"path": "/tmp/x", "content": "y"}),
    );
    record.mark_approval_requested();
    record
        .transition(CallState::ApprovalRequired, None)
        .unwrap();
    store.save_tool_records(&id, &[record]).unwrap();

    let agent = Agent::resume(
        id.clone(),
        config,
        make_deps(&store, vec![ScriptedResponse::text("written after restart")]),
    )
    .unwrap();

    // The approval is re-triggered: wait for it to become pending again.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while agent.status().pending_approvals.is_empty() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "approval was not re-registered"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(agent.status().pending_approvals, vec![call_id.clone()]);

    // Decide now; the tool executes and the loop continues to a text turn.
    agent
        .decide(&call_id, ApprovalDecision::Allow, None)
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let records = store.load_tool_records(&id).unwrap();
        if records[0].state == CallState::Completed {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "approved call never executed"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_every_tool_use_resulted(&store.load_messages(&id).unwrap());
}

// ── Scenario 5: event replay ─────────────────────────────────────────

#[tokio::test]
async fn event_replay_from_bookmark() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let id = AgentId::new();
    let bus = Arc::new(EventBus::open(id, Arc::clone(&store)).unwrap());

    let mut bookmark_at_5 = None;
    for i in 1..=10u64 {
        let envelope = bus
            .emit(KernelEvent::TextChunk {
                delta: format!("e{i}"),
            })
            .unwrap();
        assert_eq!(envelope.cursor, i);
        if i == 5 {
            bookmark_at_5 = Some(envelope.bookmark);
        }
    }

    let mut stream = bus
        .subscribe(vec![Channel::Progress], bookmark_at_5)
        .unwrap();

    // Two live events after subscription.
    bus.emit(KernelEvent::TextChunk { delta: "e11".into() }).unwrap();
    bus.emit(KernelEvent::TextChunk { delta: "e12".into() }).unwrap();

    let mut cursors = Vec::new();
    for _ in 0..7 {
        let envelope = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("stream stalled")
            .expect("stream ended early");
        cursors.push(envelope.cursor);
    }
    assert_eq!(cursors, vec![6, 7, 8, 9, 10, 11, 12]);
}

// ── Scenario 6: fork divergence ──────────────────────────────────────

#[tokio::test]
async fn fork_divergence() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let pool = AgentPool::new(Arc::clone(&store));

    let a_id = AgentId::new();
    let agent_a = pool
        .create(
            a_id.clone(),
            agent_config(PermissionMode::Auto),
            make_deps(
                &store,
                vec![
                    ScriptedResponse::text("first answer"),
                    ScriptedResponse::text("a diverges"),
                ],
            ),
        )
        .unwrap();
    agent_a.send("first question").await.unwrap();

    let snapshot = agent_a.snapshot(Some("fork point".into())).unwrap();
    let shared_len = snapshot.messages.len();
    assert_eq!(shared_len, 2);

    let agent_b = pool
        .fork(
            &a_id,
            Some(snapshot.id.clone()),
            agent_config(PermissionMode::Auto),
            make_deps(&store, vec![ScriptedResponse::text("b diverges")]),
        )
        .unwrap();
    let b_id = agent_b.id().clone();

    agent_a.send("continue as A").await.unwrap();
    agent_b.send("continue as B").await.unwrap();

    let a_messages = store.load_messages(&a_id).unwrap();
    let b_messages = store.load_messages(&b_id).unwrap();

    // Identical shared prefix, divergent tails.
    for i in 0..shared_len {
        assert_eq!(
            serde_json::to_string(&a_messages[i]).unwrap(),
            serde_json::to_string(&b_messages[i]).unwrap(),
            "prefix diverged at {i}"
        );
    }
    assert_eq!(a_messages[shared_len].text_content(), "continue as A");
    assert_eq!(b_messages[shared_len].text_content(), "continue as B");

    // Disjoint event logs, and lineage includes the source.
    let a_events = store.read_events(&a_id, None, None).unwrap();
    let b_events = store.read_events(&b_id, None, None).unwrap();
    assert!(a_events.iter().all(|e| e.agent_id == a_id));
    assert!(b_events.iter().all(|e| e.agent_id == b_id));

    let b_info = store.load_info(&b_id).unwrap();
    assert_eq!(b_info.lineage, vec![a_id.clone()]);
}

// ── Round-trips ──────────────────────────────────────────────────────

#[tokio::test]
async fn snapshot_fork_destroy_leaves_source_unchanged() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let pool = AgentPool::new(Arc::clone(&store));
    let a_id = AgentId::new();
    let agent_a = pool
        .create(
            a_id.clone(),
            agent_config(PermissionMode::Auto),
            make_deps(&store, vec![ScriptedResponse::text("pong")]),
        )
        .unwrap();
    agent_a.send("ping").await.unwrap();

    let before_messages = serde_json::to_string(&store.load_messages(&a_id).unwrap()).unwrap();
    let before_records =
        serde_json::to_string(&store.load_tool_records(&a_id).unwrap()).unwrap();
    let before_todos = serde_json::to_string(&store.load_todos(&a_id).unwrap()).unwrap();

    let fork = pool
        .fork(
            &a_id,
            None,
            agent_config(PermissionMode::Auto),
            make_deps(&store, vec![]),
        )
        .unwrap();
    let fork_id = fork.id().clone();
    pool.destroy(&fork_id).await.unwrap();

    assert_eq!(
        serde_json::to_string(&store.load_messages(&a_id).unwrap()).unwrap(),
        before_messages
    );
    assert_eq!(
        serde_json::to_string(&store.load_tool_records(&a_id).unwrap()).unwrap(),
        before_records
    );
    assert_eq!(
        serde_json::to_string(&store.load_todos(&a_id).unwrap()).unwrap(),
        before_todos
    );
}

#[tokio::test]
async fn save_crash_load_is_stable() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let id = AgentId::new();
    {
        let agent = Agent::create(
            id.clone(),
            agent_config(PermissionMode::Auto),
            make_deps(&store, vec![ScriptedResponse::text("pong")]),
        )
        .unwrap();
        agent.send("ping").await.unwrap();
        agent.shutdown_worker();
    }

    let before_messages = serde_json::to_string(&store.load_messages(&id).unwrap()).unwrap();
    let before_todos = serde_json::to_string(&store.load_todos(&id).unwrap()).unwrap();

    // Process "restarts"; breakpoint was Ready so resume is clean.
    let _resumed = Agent::resume(
        id.clone(),
        agent_config(PermissionMode::Auto),
        make_deps(&store, vec![]),
    )
    .unwrap();

    assert_eq!(
        serde_json::to_string(&store.load_messages(&id).unwrap()).unwrap(),
        before_messages
    );
    assert_eq!(
        serde_json::to_string(&store.load_todos(&id).unwrap()).unwrap(),
        before_todos
    );
}

// ── Cross-cutting invariants ─────────────────────────────────────────

#[tokio::test]
async fn event_cursors_have_no_gaps() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let id = AgentId::new();
    let call_id = ToolCallId::new();
    let agent = Agent::create(
        id.clone(),
        agent_config(PermissionMode::Auto),
        make_deps(
            &store,
            vec![
                ScriptedResponse::tool_call(
                    call_id,
                    "fs_read",
                    serde_json::json!({"path": "/tmp/x"}),
                ),
                ScriptedResponse::text("done"),
            ],
        ),
    )
    .unwrap();
    agent.send("go").await.unwrap();

    let events = store.read_events(&id, None, None).unwrap();
    assert!(!events.is_empty());
    for (i, envelope) in events.iter().enumerate() {
        assert_eq!(envelope.cursor, i as u64 + 1, "cursor gap at {i}");
        assert_eq!(envelope.bookmark.seq, envelope.cursor);
    }
}
