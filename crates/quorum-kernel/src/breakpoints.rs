use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use quorum_core::breakpoint::Breakpoint;
use quorum_core::events::KernelEvent;
use quorum_core::ids::AgentId;
use quorum_store::Store;

use crate::bus::EventBus;
use crate::error::KernelError;

/// Holds the agent's current breakpoint, writing every transition
/// through to the persisted metadata and emitting `breakpoint_changed`.
pub struct BreakpointManager {
    agent_id: AgentId,
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    current: Mutex<Breakpoint>,
}

impl BreakpointManager {
    pub fn new(
        agent_id: AgentId,
        store: Arc<dyn Store>,
        bus: Arc<EventBus>,
        initial: Breakpoint,
    ) -> Self {
        Self {
            agent_id,
            store,
            bus,
            current: Mutex::new(initial),
        }
    }

    pub fn current(&self) -> Breakpoint {
        *self.current.lock()
    }

    /// Transition to `to`, persisting before the event goes out. A
    /// same-state transition is a no-op.
    pub fn transition(&self, to: Breakpoint) -> Result<(), KernelError> {
        let from = {
            let mut current = self.current.lock();
            let from = *current;
            if from == to {
                return Ok(());
            }
            *current = to;
            from
        };

        debug!(agent = %self.agent_id, %from, %to, "breakpoint");

        let mut info = self.store.load_info(&self.agent_id)?;
        info.breakpoint = to;
        self.store.save_info(&info)?;

        self.bus
            .emit_or_log(KernelEvent::BreakpointChanged { from, to });
        Ok(())
    }
}
