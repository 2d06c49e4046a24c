use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use quorum_core::breakpoint::Breakpoint;
use quorum_core::config::AgentConfig;
use quorum_core::events::{
    Bookmark, Channel, DoneReason, ErrorPhase, ErrorSeverity, EventEnvelope, KernelEvent,
    RunState,
};
use quorum_core::hooks::AgentHooks;
use quorum_core::ids::{AgentId, SnapshotId, ToolCallId};
use quorum_core::info::{AgentInfo, AgentStatus, Snapshot};
use quorum_core::messages::{ContentBlock, Message, Role};
use quorum_core::provider::{
    ModelProvider, ProviderError, StreamChunk, StreamOptions,
};
use quorum_core::records::{ApprovalDecision, ToolCallRecord};
use quorum_core::sandbox::Sandbox;
use quorum_core::todo::{TodoItem, TodoPatch};
use quorum_core::tokens::TokenUsage;
use quorum_core::tools::Tool;
use quorum_store::{AgentLock, Store};

use crate::breakpoints::BreakpointManager;
use crate::bus::{EventBus, ListenerHandle};
use crate::context::ContextManager;
use crate::dispatcher::{DispatcherConfig, PendingCall, ToolDispatcher};
use crate::error::KernelError;
use crate::hooks::HookManager;
use crate::permissions::PermissionManager;
use crate::recovery;
use crate::registry::ToolRegistry;
use crate::scheduler::Scheduler;
use crate::todo::TodoManager;
use crate::watcher::FileWatcher;

const MAX_STEPS_PER_INPUT: u64 = 50;
const MAX_RUN_DURATION: Duration = Duration::from_secs(3600);
const MAX_STREAM_RETRIES: u32 = 3;
const STREAM_RETRY_BASE: Duration = Duration::from_secs(1);
const STREAM_RETRY_CAP: Duration = Duration::from_secs(60);
const QUEUE_CAPACITY: usize = 64;
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything an agent needs from outside the kernel.
pub struct AgentDeps {
    pub store: Arc<dyn Store>,
    pub provider: Arc<dyn ModelProvider>,
    pub tools: Vec<Arc<dyn Tool>>,
    pub hooks: Vec<Arc<dyn AgentHooks>>,
    pub sandbox: Option<Arc<dyn Sandbox>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChatStatus {
    Ok,
    Paused,
}

/// Result of `chat`: either a completed turn or a pause on pending
/// approvals. After a pause, the turn finishes in the background once
/// every decision lands; the final text is then available via `status`.
#[derive(Debug)]
pub struct ChatOutcome {
    pub status: ChatStatus,
    pub text: Option<String>,
    pub last: Option<String>,
    pub permission_ids: Vec<ToolCallId>,
}

enum QueueItem {
    Input {
        message: Message,
        done: Option<oneshot::Sender<Result<String, KernelError>>>,
    },
    /// Re-enter the loop on the existing history (used after resumed
    /// approvals complete).
    Continue,
}

/// One live agent: a cooperative worker over an input queue, with the
/// full kernel stack (bus, permissions, hooks, dispatcher, breakpoints,
/// context, todos, scheduler, watcher) wired per agent id.
pub struct Agent {
    core: Arc<AgentCore>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
    queues: Mutex<Option<(mpsc::Receiver<QueueItem>, mpsc::Receiver<Message>)>>,
}

struct AgentCore {
    id: AgentId,
    config: AgentConfig,
    store: Arc<dyn Store>,
    provider: Arc<dyn ModelProvider>,
    bus: Arc<EventBus>,
    permissions: Arc<PermissionManager>,
    breakpoints: Arc<BreakpointManager>,
    dispatcher: Arc<ToolDispatcher>,
    context: Arc<ContextManager>,
    hooks: Arc<HookManager>,
    registry: Arc<RwLock<ToolRegistry>>,
    todos: Arc<TodoManager>,
    scheduler: Arc<Scheduler>,
    watcher: Option<Arc<FileWatcher>>,
    messages: Arc<Mutex<Vec<Message>>>,
    records: Arc<Mutex<Vec<ToolCallRecord>>>,
    input_tx: mpsc::Sender<QueueItem>,
    // Held so the reminder channel never closes while the agent lives.
    _reminder_tx: mpsc::Sender<Message>,
    run_state: watch::Sender<RunState>,
    usage: Mutex<TokenUsage>,
    step: AtomicU64,
    sfp_index: AtomicUsize,
    last_text: Mutex<Option<String>>,
    cancel: Mutex<CancellationToken>,
    _lock: Mutex<Option<AgentLock>>,
}

impl Agent {
    /// Create a brand-new agent. Refuses an id that already exists in
    /// the store.
    pub fn create(
        id: AgentId,
        config: AgentConfig,
        deps: AgentDeps,
    ) -> Result<Arc<Self>, KernelError> {
        if deps.store.exists(&id)? {
            return Err(KernelError::AlreadyExists(id));
        }
        let lock = deps.store.acquire_agent_lock(&id, LOCK_TIMEOUT)?;

        let mut agent_info = AgentInfo::new(
            id.clone(),
            &config.template_id,
            &config.template_version,
            &config.version_hash(),
        );
        agent_info.saved_config = Some(config.clone());
        deps.store.save_info(&agent_info)?;

        let bus = Arc::new(EventBus::open(id.clone(), Arc::clone(&deps.store))?);
        let agent = Self::assemble(
            id,
            config,
            deps,
            bus,
            Breakpoint::Ready,
            Vec::new(),
            Vec::new(),
            lock,
        )?;
        agent.start();
        agent.core.todos.on_start();
        Ok(agent)
    }

    /// Resume an existing agent, applying the crash-recovery rules for
    /// the breakpoint observed in the store.
    pub fn resume(
        id: AgentId,
        config: AgentConfig,
        deps: AgentDeps,
    ) -> Result<Arc<Self>, KernelError> {
        if !deps.store.exists(&id)? {
            return Err(KernelError::AgentNotFound(id));
        }
        let lock = deps.store.acquire_agent_lock(&id, LOCK_TIMEOUT)?;

        let bus = Arc::new(EventBus::open(id.clone(), Arc::clone(&deps.store))?);
        let outcome = recovery::recover(&deps.store, &bus, &id, config.resume.strategy)?;

        let messages = deps.store.load_messages(&id)?;
        let records = deps.store.load_tool_records(&id)?;
        let auto_run = config.resume.auto_run;

        let agent = Self::assemble(
            id,
            config,
            deps,
            bus,
            outcome.breakpoint,
            messages,
            records,
            lock,
        )?;

        if !outcome.leftover_approvals.is_empty() {
            agent.core.resume_pending_approvals(outcome.leftover_approvals);
        }
        if auto_run {
            agent.start();
        }
        Ok(agent)
    }

    /// Like `resume`, but the config comes from the metadata saved at
    /// create time, with an optional override pass.
    pub fn resume_from_store(
        id: AgentId,
        deps: AgentDeps,
        overrides: Option<&dyn Fn(&mut AgentConfig)>,
    ) -> Result<Arc<Self>, KernelError> {
        let agent_info = deps.store.load_info(&id)?;
        let mut config = agent_info.saved_config.ok_or_else(|| {
            KernelError::InvalidState(format!("agent {id} has no saved config"))
        })?;
        if let Some(apply) = overrides {
            apply(&mut config);
        }
        Self::resume(id, config, deps)
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        id: AgentId,
        config: AgentConfig,
        deps: AgentDeps,
        bus: Arc<EventBus>,
        initial_breakpoint: Breakpoint,
        messages: Vec<Message>,
        records: Vec<ToolCallRecord>,
        lock: AgentLock,
    ) -> Result<Arc<Self>, KernelError> {
        let AgentDeps {
            store,
            provider,
            tools,
            hooks,
            sandbox,
        } = deps;

        let (input_tx, input_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (reminder_tx, reminder_rx) = mpsc::channel(QUEUE_CAPACITY);

        let mut registry = ToolRegistry::new();
        for tool in tools {
            registry.register(tool);
        }
        let registry = Arc::new(RwLock::new(registry));

        let permissions = Arc::new(PermissionManager::new(
            config.permission.clone(),
            Arc::clone(&bus),
        ));
        let hook_manager = Arc::new(HookManager::new(hooks, Arc::clone(&bus)));
        let breakpoints = Arc::new(BreakpointManager::new(
            id.clone(),
            Arc::clone(&store),
            Arc::clone(&bus),
            initial_breakpoint,
        ));
        let shared_records = Arc::new(Mutex::new(records));
        let dispatcher = Arc::new(ToolDispatcher::new(
            id.clone(),
            Arc::clone(&registry),
            Arc::clone(&permissions),
            Arc::clone(&hook_manager),
            Arc::clone(&bus),
            Arc::clone(&store),
            Arc::clone(&breakpoints),
            Arc::clone(&shared_records),
            sandbox.clone(),
            DispatcherConfig::default(),
        ));
        let context = Arc::new(ContextManager::new(
            id.clone(),
            config.context.clone(),
            config.system_prompt.clone(),
            Arc::clone(&registry),
            Arc::clone(&provider),
            Arc::clone(&store),
            Arc::clone(&bus),
        ));
        let todos = Arc::new(TodoManager::new(
            id.clone(),
            config.todo.clone(),
            Arc::clone(&store),
            Arc::clone(&bus),
            reminder_tx.clone(),
        )?);
        let scheduler = Arc::new(Scheduler::new(
            id.clone(),
            Arc::clone(&bus),
            reminder_tx.clone(),
        ));
        let watcher = sandbox.as_ref().filter(|_| config.sandbox.watch_files).map(|sb| {
            Arc::new(FileWatcher::new(
                id.clone(),
                Arc::clone(&bus),
                Arc::clone(sb),
                reminder_tx.clone(),
            ))
        });

        let sfp = messages.len();
        let (run_state, _) = watch::channel(RunState::Idle);
        let core = Arc::new(AgentCore {
            id,
            config,
            store,
            provider,
            bus,
            permissions,
            breakpoints,
            dispatcher,
            context,
            hooks: hook_manager,
            registry,
            todos,
            scheduler,
            watcher,
            messages: Arc::new(Mutex::new(messages)),
            records: shared_records,
            input_tx,
            _reminder_tx: reminder_tx,
            run_state,
            usage: Mutex::new(TokenUsage::default()),
            step: AtomicU64::new(0),
            sfp_index: AtomicUsize::new(sfp),
            last_text: Mutex::new(None),
            cancel: Mutex::new(CancellationToken::new()),
            _lock: Mutex::new(Some(lock)),
        });

        Ok(Arc::new(Self {
            core,
            worker: Mutex::new(None),
            queues: Mutex::new(Some((input_rx, reminder_rx))),
        }))
    }

    /// Spawn the worker if it is not already running. Called
    /// automatically unless `resume.auto_run` is off.
    pub fn start(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        let Some((input_rx, reminder_rx)) = self.queues.lock().take() else {
            return;
        };
        let core = Arc::clone(&self.core);
        *worker = Some(tokio::spawn(worker_loop(core, input_rx, reminder_rx)));
    }

    pub fn id(&self) -> &AgentId {
        &self.core.id
    }

    pub fn config(&self) -> &AgentConfig {
        &self.core.config
    }

    /// Enqueue a user message and wait for the turn to complete.
    pub async fn send(&self, text: impl Into<String>) -> Result<String, KernelError> {
        self.send_message(Message::user_text(text)).await
    }

    pub async fn send_message(&self, message: Message) -> Result<String, KernelError> {
        let (tx, rx) = oneshot::channel();
        self.core
            .input_tx
            .send(QueueItem::Input {
                message,
                done: Some(tx),
            })
            .await
            .map_err(|_| KernelError::QueueClosed)?;
        rx.await.map_err(|_| KernelError::QueueClosed)?
    }

    /// Enqueue without waiting (room deliveries, injected reminders).
    pub fn post(&self, message: Message) -> Result<(), KernelError> {
        self.core
            .input_tx
            .try_send(QueueItem::Input {
                message,
                done: None,
            })
            .map_err(|_| KernelError::QueueClosed)
    }

    /// Run a turn, returning early with `Paused` when approvals are
    /// required. Alias: [`Agent::complete`].
    pub async fn chat(&self, input: impl Into<String>) -> Result<ChatOutcome, KernelError> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.core.permissions.watch_pending();
        self.core
            .input_tx
            .send(QueueItem::Input {
                message: Message::user_text(input),
                done: Some(tx),
            })
            .await
            .map_err(|_| KernelError::QueueClosed)?;

        tokio::pin!(rx);
        loop {
            tokio::select! {
                result = &mut rx => {
                    let text = result.map_err(|_| KernelError::QueueClosed)??;
                    return Ok(ChatOutcome {
                        status: ChatStatus::Ok,
                        text: Some(text.clone()),
                        last: Some(text),
                        permission_ids: Vec::new(),
                    });
                }
                changed = pending.changed() => {
                    if changed.is_err() {
                        continue;
                    }
                    let ids = pending.borrow().clone();
                    if !ids.is_empty() {
                        return Ok(ChatOutcome {
                            status: ChatStatus::Paused,
                            text: None,
                            last: self.core.last_text.lock().clone(),
                            permission_ids: ids,
                        });
                    }
                }
            }
        }
    }

    pub async fn complete(&self, input: impl Into<String>) -> Result<ChatOutcome, KernelError> {
        self.chat(input).await
    }

    /// Resolve a pending approval.
    pub fn decide(
        &self,
        call_id: &ToolCallId,
        decision: ApprovalDecision,
        note: Option<String>,
    ) -> Result<(), KernelError> {
        self.core.permissions.decide(call_id, decision, note, None)
    }

    /// Cancel the current turn at its next yield point. Persisted
    /// content stays.
    pub fn interrupt(&self, note: Option<String>) {
        if let Some(note) = note {
            info!(agent = %self.core.id, note, "interrupt requested");
        }
        self.core.cancel.lock().cancel();
    }

    pub fn status(&self) -> AgentStatus {
        AgentStatus {
            run_state: *self.core.run_state.borrow(),
            breakpoint: self.core.breakpoints.current(),
            step: self.core.step.load(Ordering::Relaxed),
            pending_approvals: self.core.permissions.pending_ids(),
            usage: *self.core.usage.lock(),
            last_text: self.core.last_text.lock().clone(),
        }
    }

    pub fn info(&self) -> Result<AgentInfo, KernelError> {
        Ok(self.core.store.load_info(&self.core.id)?)
    }

    /// Capture a snapshot at the current Safe-Fork-Point. Refuses while
    /// a turn is mid-flight.
    pub fn snapshot(&self, label: Option<String>) -> Result<Snapshot, KernelError> {
        let breakpoint = self.core.breakpoints.current();
        if !breakpoint.is_fork_eligible() {
            return Err(KernelError::InvalidState(format!(
                "cannot snapshot at breakpoint {breakpoint}"
            )));
        }
        let sfp = self.core.sfp_index.load(Ordering::SeqCst);
        let messages = self.core.messages.lock();
        let snapshot = Snapshot {
            id: SnapshotId::new(),
            label,
            messages: messages[..sfp.min(messages.len())].to_vec(),
            sfp_index: sfp,
            bookmark: Bookmark {
                seq: self.core.store.last_cursor(&self.core.id)?,
                ts_ms: Utc::now().timestamp_millis(),
            },
            created_at: Utc::now().to_rfc3339(),
        };
        self.core.store.save_snapshot(&self.core.id, &snapshot)?;
        Ok(snapshot)
    }

    // ── todo surface ─────────────────────────────────────────────────

    pub fn get_todos(&self) -> Vec<TodoItem> {
        self.core.todos.get_todos()
    }

    pub fn set_todos(&self, todos: Vec<TodoItem>) -> Result<(), KernelError> {
        self.core.todos.set_todos(todos)
    }

    pub fn update_todo(&self, patch: TodoPatch) -> Result<TodoItem, KernelError> {
        self.core.todos.update_todo(patch)
    }

    pub fn delete_todo(&self, id: &str) -> Result<(), KernelError> {
        self.core.todos.delete_todo(id)
    }

    // ── event surface ────────────────────────────────────────────────

    pub fn subscribe(
        &self,
        channels: Vec<Channel>,
        since: Option<Bookmark>,
    ) -> Result<std::pin::Pin<Box<dyn futures::Stream<Item = EventEnvelope> + Send>>, KernelError>
    {
        Ok(self.core.bus.subscribe(channels, since)?)
    }

    pub fn on(
        &self,
        event_type: &str,
        handler: impl Fn(&EventEnvelope) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.core.bus.on(event_type, handler)
    }

    // ── component access for embedders ───────────────────────────────

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.core.scheduler
    }

    pub fn watcher(&self) -> Option<&Arc<FileWatcher>> {
        self.core.watcher.as_ref()
    }

    pub fn registry(&self) -> &Arc<RwLock<ToolRegistry>> {
        &self.core.registry
    }

    pub fn dispatcher(&self) -> &Arc<ToolDispatcher> {
        &self.core.dispatcher
    }

    /// Wait until the agent is not working, up to `timeout`. Used by
    /// graceful shutdown.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let mut state = self.core.run_state.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if *state.borrow() != RunState::Working {
                return true;
            }
            match tokio::time::timeout_at(deadline, state.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return true,
                Err(_) => return false,
            }
        }
    }

    /// Flush state and stop the worker. Pending queue items are dropped.
    pub fn shutdown_worker(&self) {
        self.core.scheduler.shutdown();
        if let Some(watcher) = &self.core.watcher {
            watcher.dispose();
        }
        if let Some(handle) = self.worker.lock().take() {
            handle.abort();
        }
        self.core._lock.lock().take();
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.shutdown_worker();
    }
}

async fn worker_loop(
    core: Arc<AgentCore>,
    mut input_rx: mpsc::Receiver<QueueItem>,
    mut reminder_rx: mpsc::Receiver<Message>,
) {
    loop {
        let item = tokio::select! {
            item = input_rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
            // Reminders participate in the same queue ordering; the
            // sender half in AgentCore keeps this channel open.
            reminder = reminder_rx.recv() => match reminder {
                Some(message) => QueueItem::Input { message, done: None },
                None => break,
            },
        };
        core.process(item).await;
    }
}

impl AgentCore {
    fn set_run_state(&self, state: RunState) {
        if *self.run_state.borrow() != state {
            let _ = self.run_state.send(state);
            self.bus
                .emit_or_log(KernelEvent::StateChanged { state });
        }
    }

    async fn process(&self, item: QueueItem) {
        let (input, done) = match item {
            QueueItem::Input { message, done } => (Some(message), done),
            QueueItem::Continue => (None, None),
        };

        self.set_run_state(RunState::Working);
        let result = self.run_turn(input).await;

        let next_state = match &result {
            Err(KernelError::Store(_)) => RunState::Paused,
            _ if !self.permissions.pending_ids().is_empty() => RunState::AwaitingApproval,
            _ => RunState::Idle,
        };
        self.set_run_state(next_state);

        if let Some(done) = done {
            let _ = done.send(result);
        }
    }

    /// The per-input loop: model call → tool dispatch → repeat until a
    /// turn ends without tool calls.
    #[instrument(skip_all, fields(agent = %self.id))]
    async fn run_turn(&self, input: Option<Message>) -> Result<String, KernelError> {
        let cancel = CancellationToken::new();
        *self.cancel.lock() = cancel.clone();

        if let Some(message) = input {
            self.push_message(message).await?;
        }

        let run_start = Instant::now();
        let mut steps_this_input = 0u64;
        let options = StreamOptions {
            max_tokens: None,
            thinking: self.config.thinking.clone(),
            reasoning_transport: self.config.context.reasoning_transport,
        };

        loop {
            if cancel.is_cancelled() {
                return self.finish_interrupted();
            }
            steps_this_input += 1;
            if steps_this_input > MAX_STEPS_PER_INPUT {
                return Err(KernelError::MaxStepsExceeded(MAX_STEPS_PER_INPUT));
            }
            if run_start.elapsed() >= MAX_RUN_DURATION {
                warn!(agent = %self.id, "run exceeded max duration");
                return self.finish_interrupted();
            }

            // 1. Pre-model: hooks mutate the outgoing copy only.
            self.breakpoints.transition(Breakpoint::PreModel)?;
            let mut outgoing = self.messages.lock().clone();
            self.hooks.pre_model(&mut outgoing).await;
            let context = self.context.build(&outgoing)?;

            // 2. Stream.
            self.breakpoints.transition(Breakpoint::StreamingModel)?;
            let (mut assistant, usage) = match self.stream_once(&context, &options, &cancel).await
            {
                Ok(result) => result,
                Err(StreamFailure::Interrupted) => return self.finish_interrupted(),
                Err(StreamFailure::Model(e)) => {
                    error!(agent = %self.id, error = %e, "model stream failed");
                    self.bus.emit_or_log(KernelEvent::Error {
                        severity: ErrorSeverity::Error,
                        phase: ErrorPhase::Model,
                        message: e.to_string(),
                        detail: Some(serde_json::json!({ "kind": e.error_kind() })),
                    });
                    self.bus.emit_or_log(KernelEvent::Done {
                        reason: DoneReason::Interrupted,
                    });
                    self.breakpoints.transition(Breakpoint::Ready)?;
                    return Err(KernelError::Provider(e));
                }
            };

            // 3. Post-model, persist, account.
            self.hooks.post_model(&mut assistant).await;
            let tool_uses: Vec<PendingCall> = assistant
                .tool_uses()
                .into_iter()
                .map(|(id, name, input)| PendingCall {
                    id: id.clone(),
                    name: name.to_string(),
                    input: input.clone(),
                })
                .collect();
            let final_text = assistant.text_content();
            self.push_message(assistant).await?;

            self.bus.emit_or_log(KernelEvent::Done {
                reason: DoneReason::Completed,
            });
            self.bus
                .emit_or_log(KernelEvent::TokenUsageReport { usage });
            self.usage.lock().accumulate(&usage);

            // 4. Tools, or finish the step.
            if !tool_uses.is_empty() {
                self.breakpoints.transition(Breakpoint::ToolPending)?;
                let blocks = self.dispatcher.dispatch(tool_uses, &cancel).await?;
                self.push_message(Message::tool_results(blocks)).await?;
                if cancel.is_cancelled() {
                    return self.finish_interrupted();
                }
                self.breakpoints.transition(Breakpoint::PostTool)?;
                continue;
            }

            return self.finish_step(final_text);
        }
    }

    fn finish_interrupted(&self) -> Result<String, KernelError> {
        self.bus.emit_or_log(KernelEvent::Done {
            reason: DoneReason::Interrupted,
        });
        self.breakpoints.transition(Breakpoint::Ready)?;
        Err(KernelError::Interrupted)
    }

    fn finish_step(&self, final_text: String) -> Result<String, KernelError> {
        let sfp = self.messages.lock().len();
        self.sfp_index.store(sfp, Ordering::SeqCst);
        self.breakpoints.transition(Breakpoint::Ready)?;

        let mut agent_info = self.store.load_info(&self.id)?;
        agent_info.message_count = sfp;
        agent_info.last_sfp_index = sfp;
        agent_info.last_bookmark = Bookmark {
            seq: self.store.last_cursor(&self.id)?,
            ts_ms: Utc::now().timestamp_millis(),
        };
        self.store.save_info(&agent_info)?;

        let step = self.step.fetch_add(1, Ordering::SeqCst) + 1;
        self.bus.emit_or_log(KernelEvent::StepComplete {
            step,
            sfp_index: sfp,
        });
        *self.last_text.lock() = Some(final_text.clone());

        self.todos.on_step(step);
        self.scheduler.on_step(step);
        Ok(final_text)
    }

    async fn push_message(&self, message: Message) -> Result<(), KernelError> {
        let snapshot = {
            let mut messages = self.messages.lock();
            messages.push(message);
            if let Err(e) = self.store.save_messages(&self.id, &messages) {
                // A failing store is fatal for the turn; surface it and
                // let the embedder address the backend.
                self.bus.emit_or_log(KernelEvent::Error {
                    severity: ErrorSeverity::Fatal,
                    phase: ErrorPhase::System,
                    message: format!("message persistence failed: {e}"),
                    detail: None,
                });
                return Err(e.into());
            }
            messages.clone()
        };
        self.hooks.messages_changed(&snapshot).await;
        Ok(())
    }

    /// One streaming model call, with in-place retries for retryable
    /// failures (3 attempts, exponential backoff, retry-after honored).
    async fn stream_once(
        &self,
        context: &quorum_core::provider::ModelContext,
        options: &StreamOptions,
        cancel: &CancellationToken,
    ) -> Result<(Message, TokenUsage), StreamFailure> {
        let mut attempt = 0u32;
        loop {
            let failure = match self.try_stream(context, options, cancel).await {
                Ok(result) => return Ok(result),
                Err(f) => f,
            };
            let StreamFailure::Model(e) = &failure else {
                return Err(failure);
            };
            if !e.is_retryable() || attempt >= MAX_STREAM_RETRIES {
                return Err(failure);
            }
            let delay = e
                .suggested_delay()
                .unwrap_or_else(|| retry_backoff(attempt));
            warn!(
                agent = %self.id,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %e,
                "retrying model stream"
            );
            attempt += 1;
            tokio::select! {
                _ = cancel.cancelled() => return Err(StreamFailure::Interrupted),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn try_stream(
        &self,
        context: &quorum_core::provider::ModelContext,
        options: &StreamOptions,
        cancel: &CancellationToken,
    ) -> Result<(Message, TokenUsage), StreamFailure> {
        let mut stream = tokio::select! {
            _ = cancel.cancelled() => return Err(StreamFailure::Interrupted),
            result = self.provider.stream(context, options) => match result {
                Ok(stream) => stream,
                Err(e) => return Err(StreamFailure::Model(e)),
            },
        };

        let mut blocks: Vec<ContentBlock> = Vec::new();
        let mut open = OpenSegment::None;
        let mut usage = TokenUsage::default();

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(StreamFailure::Interrupted),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            match chunk {
                StreamChunk::TextDelta { delta } => {
                    if !matches!(open, OpenSegment::Text(_)) {
                        self.close_segment(&mut open, &mut blocks);
                        self.bus.emit_or_log(KernelEvent::TextChunkStart);
                        open = OpenSegment::Text(String::new());
                    }
                    self.bus.emit_or_log(KernelEvent::TextChunk {
                        delta: delta.clone(),
                    });
                    if let OpenSegment::Text(buf) = &mut open {
                        buf.push_str(&delta);
                    }
                }
                StreamChunk::ReasoningDelta { delta } => {
                    if !matches!(open, OpenSegment::Think(_)) {
                        self.close_segment(&mut open, &mut blocks);
                        self.bus.emit_or_log(KernelEvent::ThinkChunkStart);
                        open = OpenSegment::Think(String::new());
                    }
                    self.bus.emit_or_log(KernelEvent::ThinkChunk {
                        delta: delta.clone(),
                    });
                    if let OpenSegment::Think(buf) = &mut open {
                        buf.push_str(&delta);
                    }
                }
                StreamChunk::ToolUse { id, name, input } => {
                    self.close_segment(&mut open, &mut blocks);
                    blocks.push(ContentBlock::ToolUse { id, name, input });
                }
                StreamChunk::End { usage: u } => {
                    usage = u;
                }
                StreamChunk::Error { error } => {
                    return Err(StreamFailure::Model(error));
                }
            }
        }
        self.close_segment(&mut open, &mut blocks);

        Ok((
            Message {
                role: Role::Assistant,
                content: blocks,
                meta: None,
            },
            usage,
        ))
    }

    fn close_segment(&self, open: &mut OpenSegment, blocks: &mut Vec<ContentBlock>) {
        match std::mem::replace(open, OpenSegment::None) {
            OpenSegment::None => {}
            OpenSegment::Text(text) => {
                self.bus
                    .emit_or_log(KernelEvent::TextChunkEnd { text: text.clone() });
                blocks.push(ContentBlock::Text { text });
            }
            OpenSegment::Think(text) => {
                self.bus
                    .emit_or_log(KernelEvent::ThinkChunkEnd { text: text.clone() });
                blocks.push(ContentBlock::Reasoning {
                    text,
                    signature: None,
                });
            }
        }
    }

    /// Approvals that survived a `strategy: manual` restart: re-dispatch
    /// them (which re-emits `permission_required`), then continue the
    /// loop once every decision is in.
    fn resume_pending_approvals(self: &Arc<Self>, leftover: Vec<ToolCallRecord>) {
        let core = Arc::clone(self);
        tokio::spawn(async move {
            let calls: Vec<PendingCall> = leftover
                .iter()
                .map(|r| PendingCall {
                    id: r.id.clone(),
                    name: r.tool_name.clone(),
                    input: r.input.clone(),
                })
                .collect();
            let cancel = core.cancel.lock().clone();
            match core.dispatcher.dispatch(calls, &cancel).await {
                Ok(blocks) => {
                    if let Err(e) = core.push_message(Message::tool_results(blocks)).await {
                        error!(agent = %core.id, error = %e, "failed to persist resumed results");
                        return;
                    }
                    let _ = core.input_tx.send(QueueItem::Continue).await;
                }
                Err(e) => {
                    error!(agent = %core.id, error = %e, "resumed approval dispatch failed");
                }
            }
        });
    }
}

enum OpenSegment {
    None,
    Text(String),
    Think(String),
}

enum StreamFailure {
    Interrupted,
    Model(ProviderError),
}

fn retry_backoff(attempt: u32) -> Duration {
    let base = STREAM_RETRY_BASE.as_millis() as u64;
    let exp = base.saturating_mul(1u64 << attempt.min(10));
    let capped = exp.min(STREAM_RETRY_CAP.as_millis() as u64);
    // ±20% jitter from the clock's low bits; precision is not the point.
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    let spread = capped / 5;
    let jitter = if spread > 0 { nanos % (2 * spread) } else { 0 };
    Duration::from_millis(capped - spread + jitter)
}
