use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use quorum_core::config::TodoConfig;
use quorum_core::events::KernelEvent;
use quorum_core::ids::AgentId;
use quorum_core::messages::{Message, ReminderOrigin};
use quorum_core::todo::{TodoItem, TodoPatch, TodoStatus};
use quorum_store::Store;

use crate::bus::EventBus;
use crate::error::KernelError;

/// Per-agent task list with step-based reminder scheduling. Every
/// mutation persists the snapshot and emits `todo_changed`; the step
/// ticker injects a reminder message while open items exist.
pub struct TodoManager {
    agent_id: AgentId,
    config: TodoConfig,
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    reminders: mpsc::Sender<Message>,
    todos: Mutex<Vec<TodoItem>>,
}

impl TodoManager {
    pub fn new(
        agent_id: AgentId,
        config: TodoConfig,
        store: Arc<dyn Store>,
        bus: Arc<EventBus>,
        reminders: mpsc::Sender<Message>,
    ) -> Result<Self, KernelError> {
        let todos = store.load_todos(&agent_id)?;
        Ok(Self {
            agent_id,
            config,
            store,
            bus,
            reminders,
            todos: Mutex::new(todos),
        })
    }

    pub fn get_todos(&self) -> Vec<TodoItem> {
        self.todos.lock().clone()
    }

    pub fn set_todos(&self, todos: Vec<TodoItem>) -> Result<(), KernelError> {
        {
            let mut current = self.todos.lock();
            *current = todos;
            self.store.save_todos(&self.agent_id, &current)?;
        }
        self.emit_changed();
        Ok(())
    }

    pub fn update_todo(&self, patch: TodoPatch) -> Result<TodoItem, KernelError> {
        let updated = {
            let mut todos = self.todos.lock();
            let item = todos
                .iter_mut()
                .find(|t| t.id == patch.id)
                .ok_or_else(|| KernelError::InvalidState(format!("no todo {}", patch.id)))?;
            if let Some(title) = patch.title {
                item.title = title;
            }
            if let Some(status) = patch.status {
                item.status = status;
            }
            item.touch();
            let updated = item.clone();
            self.store.save_todos(&self.agent_id, &todos)?;
            updated
        };
        self.emit_changed();
        Ok(updated)
    }

    pub fn delete_todo(&self, id: &str) -> Result<(), KernelError> {
        {
            let mut todos = self.todos.lock();
            let before = todos.len();
            todos.retain(|t| t.id != id);
            if todos.len() == before {
                return Err(KernelError::InvalidState(format!("no todo {id}")));
            }
            self.store.save_todos(&self.agent_id, &todos)?;
        }
        self.emit_changed();
        Ok(())
    }

    fn open_count(&self) -> usize {
        self.todos
            .lock()
            .iter()
            .filter(|t| t.status.is_open())
            .count()
    }

    /// Step ticker, driven by the agent loop after each completed step.
    pub fn on_step(&self, step: u64) {
        if !self.config.enabled || self.config.remind_interval_steps == 0 {
            return;
        }
        if step % self.config.remind_interval_steps != 0 {
            return;
        }
        self.maybe_remind();
    }

    /// Reminder at agent start, when configured.
    pub fn on_start(&self) {
        if self.config.enabled && self.config.reminder_on_start {
            self.maybe_remind();
        }
    }

    fn maybe_remind(&self) {
        let pending = self.open_count();
        if pending == 0 {
            return;
        }
        debug!(agent = %self.agent_id, pending, "todo reminder");
        self.bus.emit_or_log(KernelEvent::TodoReminder { pending });

        let titles: Vec<String> = self
            .todos
            .lock()
            .iter()
            .filter(|t| t.status.is_open())
            .map(|t| format!("- [{}] {}", status_tag(t.status), t.title))
            .collect();
        let text = format!(
            "You have {pending} open todo item(s):\n{}\nUpdate their status as you make progress.",
            titles.join("\n")
        );
        if self
            .reminders
            .try_send(Message::reminder(ReminderOrigin::Todo, text))
            .is_ok()
        {
            self.bus.emit_or_log(KernelEvent::ReminderSent {
                origin: ReminderOrigin::Todo,
            });
        }
    }

    fn emit_changed(&self) {
        let todos = self.todos.lock().clone();
        self.bus.emit_or_log(KernelEvent::TodoChanged { todos });
    }
}

fn status_tag(status: TodoStatus) -> &'static str {
    match status {
        TodoStatus::Pending => "pending",
        TodoStatus::InProgress => "in progress",
        TodoStatus::Completed => "completed",
        TodoStatus::Cancelled => "cancelled",
    }
}
