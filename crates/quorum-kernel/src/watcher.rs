use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use quorum_core::events::KernelEvent;
use quorum_core::ids::AgentId;
use quorum_core::messages::{Message, ReminderOrigin};
use quorum_core::sandbox::{Sandbox, WatchHandle};

use crate::bus::EventBus;
use crate::error::KernelError;

/// Observes tool-touched files through the sandbox's watch surface and
/// turns external modifications into `file_changed` events plus a
/// reminder so the model can refresh its understanding.
pub struct FileWatcher {
    agent_id: AgentId,
    bus: Arc<EventBus>,
    sandbox: Arc<dyn Sandbox>,
    reminders: mpsc::Sender<Message>,
    watched: Mutex<BTreeSet<PathBuf>>,
    handle: Mutex<Option<WatchHandle>>,
}

impl FileWatcher {
    pub fn new(
        agent_id: AgentId,
        bus: Arc<EventBus>,
        sandbox: Arc<dyn Sandbox>,
        reminders: mpsc::Sender<Message>,
    ) -> Self {
        Self {
            agent_id,
            bus,
            sandbox,
            reminders,
            watched: Mutex::new(BTreeSet::new()),
            handle: Mutex::new(None),
        }
    }

    /// Add paths to the watch set (typically the files a read/write tool
    /// just touched) and re-arm the sandbox watch over the full set.
    pub fn track(&self, paths: &[PathBuf]) -> Result<(), KernelError> {
        let all: Vec<PathBuf> = {
            let mut watched = self.watched.lock();
            for path in paths {
                watched.insert(path.clone());
            }
            watched.iter().cloned().collect()
        };
        if all.is_empty() {
            return Ok(());
        }

        let agent_id = self.agent_id.clone();
        let bus = Arc::clone(&self.bus);
        let reminders = self.reminders.clone();
        let callback: quorum_core::sandbox::WatchCallback = Arc::new(move |path: &Path| {
            debug!(agent = %agent_id, path = %path.display(), "watched file changed");
            bus.emit_or_log(KernelEvent::FileChanged {
                path: path.display().to_string(),
            });
            let text = format!(
                "The file {} was modified outside this conversation. Re-read it before relying on earlier contents.",
                path.display()
            );
            if reminders
                .try_send(Message::reminder(ReminderOrigin::FileWatcher, text))
                .is_ok()
            {
                bus.emit_or_log(KernelEvent::ReminderSent {
                    origin: ReminderOrigin::FileWatcher,
                });
            }
        });

        let new_handle = self
            .sandbox
            .watch_files(&all, callback)
            .map_err(|e| KernelError::Internal(format!("watch_files: {e}")))?;
        // Drop the previous watch only after the new one is armed.
        *self.handle.lock() = Some(new_handle);
        Ok(())
    }

    pub fn watched(&self) -> Vec<PathBuf> {
        self.watched.lock().iter().cloned().collect()
    }

    pub fn dispose(&self) {
        self.handle.lock().take();
        self.watched.lock().clear();
    }
}
