use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use quorum_core::ids::AgentId;

use crate::error::StoreError;

/// RAII guard over one agent id. Dropping it releases the lock.
pub struct AgentLock {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl AgentLock {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    pub fn release(mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for AgentLock {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// In-process advisory lock table shared by the embedded backends.
///
/// This is a per-process mutex only. A backend with a real distributed
/// lock (lease, advisory lock) replaces this and reports
/// `distributed_lock: true` from its health check.
#[derive(Clone, Default)]
pub struct LockRegistry {
    held: Arc<Mutex<HashSet<String>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, agent: &AgentId, timeout: Duration) -> Result<AgentLock, StoreError> {
        let deadline = Instant::now() + timeout;
        let key = agent.as_str().to_string();
        loop {
            {
                let mut held = self.held.lock();
                if held.insert(key.clone()) {
                    let held = self.held.clone();
                    let key = key.clone();
                    return Ok(AgentLock::new(move || {
                        held.lock().remove(&key);
                    }));
                }
            }
            if Instant::now() >= deadline {
                return Err(StoreError::Conflict(format!("agent lock held: {key}")));
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    pub fn is_held(&self, agent: &AgentId) -> bool {
        self.held.lock().contains(agent.as_str())
    }
}
