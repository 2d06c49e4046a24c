use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use quorum_core::ids::AgentId;
use quorum_core::messages::{ContentBlock, Message, MessageMeta, Role};

use crate::error::KernelError;
use crate::pool::AgentPool;

/// A named membership map over one pool, routing human-authored
/// messages by `@name` mention. Without mentions, `say` broadcasts to
/// everyone except the sender. Delivery enqueues synchronously;
/// processing is asynchronous.
pub struct Room {
    pool: Arc<AgentPool>,
    members: RwLock<HashMap<String, AgentId>>,
}

impl Room {
    pub fn new(pool: Arc<AgentPool>) -> Self {
        Self {
            pool,
            members: RwLock::new(HashMap::new()),
        }
    }

    pub fn join(&self, name: impl Into<String>, agent_id: AgentId) {
        self.members.write().insert(name.into(), agent_id);
    }

    pub fn leave(&self, name: &str) -> bool {
        self.members.write().remove(name).is_some()
    }

    pub fn members(&self) -> Vec<String> {
        let mut names: Vec<String> = self.members.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Deliver `text` from `from_name`. Returns the member names the
    /// message was enqueued to.
    pub fn say(&self, from_name: &str, text: &str) -> Result<Vec<String>, KernelError> {
        let members = self.members.read();
        let mentioned: Vec<String> = mentions(text)
            .into_iter()
            .filter(|name| members.contains_key(name))
            .collect();

        let recipients: Vec<(String, AgentId)> = if mentioned.is_empty() {
            members
                .iter()
                .filter(|(name, _)| name.as_str() != from_name)
                .map(|(name, id)| (name.clone(), id.clone()))
                .collect()
        } else {
            mentioned
                .iter()
                .filter(|name| name.as_str() != from_name)
                .filter_map(|name| members.get(name).map(|id| (name.clone(), id.clone())))
                .collect()
        };
        drop(members);

        let mut delivered = Vec::new();
        for (name, agent_id) in recipients {
            let Some(agent) = self.pool.get(&agent_id) else {
                debug!(member = %name, "room member not live; skipped");
                continue;
            };
            let message = Message {
                role: Role::User,
                content: vec![ContentBlock::Text {
                    text: format!("[from:{from_name}] {text}"),
                }],
                meta: Some(MessageMeta {
                    origin: None,
                    sender: Some(from_name.to_string()),
                }),
            };
            agent.post(message)?;
            delivered.push(name);
        }
        delivered.sort();
        Ok(delivered)
    }
}

/// Extract `@name` mentions: alphanumerics, `_`, and `-` after an `@`.
fn mentions(text: &str) -> Vec<String> {
    let mut found = Vec::new();
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'@' {
            let start = i + 1;
            let mut end = start;
            while end < bytes.len()
                && (bytes[end].is_ascii_alphanumeric()
                    || bytes[end] == b'_'
                    || bytes[end] == b'-')
            {
                end += 1;
            }
            if end > start {
                found.push(text[start..end].to_string());
            }
            i = end;
        } else {
            i += 1;
        }
    }
    found
}
