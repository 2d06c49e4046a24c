use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use quorum_core::events::{Bookmark, Channel, EventEnvelope};
use quorum_core::ids::{AgentId, SnapshotId};
use quorum_core::info::{AgentInfo, Snapshot};
use quorum_core::messages::Message;
use quorum_core::records::ToolCallRecord;
use quorum_core::todo::TodoItem;

use crate::error::StoreError;
use crate::locks::{AgentLock, LockRegistry};
use crate::{PoolMeta, Store, StoreHealth};

#[derive(Default)]
struct AgentState {
    messages: Vec<Message>,
    tool_records: Vec<ToolCallRecord>,
    todos: Vec<TodoItem>,
    events: Vec<EventEnvelope>,
    snapshots: HashMap<String, Snapshot>,
    info: Option<AgentInfo>,
    media: HashMap<String, Vec<u8>>,
    aux: HashMap<(String, String), serde_json::Value>,
}

#[derive(Default)]
struct Inner {
    agents: HashMap<String, AgentState>,
    pool_meta: Option<PoolMeta>,
}

/// In-memory store for tests and lightweight embedding. Same semantics
/// as the durable backends, minus the durability.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
    locks: LockRegistry,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_agent<T>(
        &self,
        agent: &AgentId,
        f: impl FnOnce(&mut AgentState) -> T,
    ) -> T {
        let mut inner = self.inner.write();
        let state = inner.agents.entry(agent.as_str().to_string()).or_default();
        f(state)
    }

    fn read_agent<T>(
        &self,
        agent: &AgentId,
        f: impl FnOnce(Option<&AgentState>) -> T,
    ) -> T {
        let inner = self.inner.read();
        f(inner.agents.get(agent.as_str()))
    }
}

impl Store for MemoryStore {
    fn save_messages(&self, agent: &AgentId, messages: &[Message]) -> Result<(), StoreError> {
        self.with_agent(agent, |s| s.messages = messages.to_vec());
        Ok(())
    }

    fn load_messages(&self, agent: &AgentId) -> Result<Vec<Message>, StoreError> {
        Ok(self.read_agent(agent, |s| s.map(|s| s.messages.clone()).unwrap_or_default()))
    }

    fn save_tool_records(
        &self,
        agent: &AgentId,
        records: &[ToolCallRecord],
    ) -> Result<(), StoreError> {
        self.with_agent(agent, |s| s.tool_records = records.to_vec());
        Ok(())
    }

    fn load_tool_records(&self, agent: &AgentId) -> Result<Vec<ToolCallRecord>, StoreError> {
        Ok(self.read_agent(agent, |s| {
            s.map(|s| s.tool_records.clone()).unwrap_or_default()
        }))
    }

    fn save_todos(&self, agent: &AgentId, todos: &[TodoItem]) -> Result<(), StoreError> {
        self.with_agent(agent, |s| s.todos = todos.to_vec());
        Ok(())
    }

    fn load_todos(&self, agent: &AgentId) -> Result<Vec<TodoItem>, StoreError> {
        Ok(self.read_agent(agent, |s| s.map(|s| s.todos.clone()).unwrap_or_default()))
    }

    fn append_event(&self, envelope: &EventEnvelope) -> Result<(), StoreError> {
        self.with_agent(&envelope.agent_id, |s| {
            // Idempotent on retry: same cursor appended twice is a no-op.
            if s.events.last().map(|e| e.cursor) != Some(envelope.cursor)
                && !s.events.iter().any(|e| e.cursor == envelope.cursor)
            {
                s.events.push(envelope.clone());
            }
        });
        Ok(())
    }

    fn read_events(
        &self,
        agent: &AgentId,
        since: Option<Bookmark>,
        channels: Option<&[Channel]>,
    ) -> Result<Vec<EventEnvelope>, StoreError> {
        let after = since.map(|b| b.seq).unwrap_or(0);
        Ok(self.read_agent(agent, |s| {
            s.map(|s| {
                s.events
                    .iter()
                    .filter(|e| since.is_none() || e.cursor > after)
                    .filter(|e| channels.map(|c| c.contains(&e.channel)).unwrap_or(true))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
        }))
    }

    fn last_cursor(&self, agent: &AgentId) -> Result<u64, StoreError> {
        Ok(self.read_agent(agent, |s| {
            s.and_then(|s| s.events.iter().map(|e| e.cursor).max())
                .unwrap_or(0)
        }))
    }

    fn save_snapshot(&self, agent: &AgentId, snapshot: &Snapshot) -> Result<(), StoreError> {
        self.with_agent(agent, |s| {
            s.snapshots
                .insert(snapshot.id.as_str().to_string(), snapshot.clone())
        });
        Ok(())
    }

    fn load_snapshot(&self, agent: &AgentId, id: &SnapshotId) -> Result<Snapshot, StoreError> {
        self.read_agent(agent, |s| {
            s.and_then(|s| s.snapshots.get(id.as_str()).cloned())
                .ok_or_else(|| StoreError::NotFound(format!("snapshot {id} for {agent}")))
        })
    }

    fn list_snapshots(&self, agent: &AgentId) -> Result<Vec<SnapshotId>, StoreError> {
        Ok(self.read_agent(agent, |s| {
            s.map(|s| {
                let mut ids: Vec<String> = s.snapshots.keys().cloned().collect();
                ids.sort();
                ids.into_iter().map(SnapshotId::from_raw).collect()
            })
            .unwrap_or_default()
        }))
    }

    fn save_info(&self, info: &AgentInfo) -> Result<(), StoreError> {
        self.with_agent(&info.id.clone(), |s| s.info = Some(info.clone()));
        Ok(())
    }

    fn load_info(&self, agent: &AgentId) -> Result<AgentInfo, StoreError> {
        self.read_agent(agent, |s| {
            s.and_then(|s| s.info.clone())
                .ok_or_else(|| StoreError::NotFound(format!("agent {agent}")))
        })
    }

    fn save_media(
        &self,
        agent: &AgentId,
        media_id: &str,
        bytes: &[u8],
    ) -> Result<(), StoreError> {
        self.with_agent(agent, |s| {
            s.media.insert(media_id.to_string(), bytes.to_vec())
        });
        Ok(())
    }

    fn load_media(&self, agent: &AgentId, media_id: &str) -> Result<Vec<u8>, StoreError> {
        self.read_agent(agent, |s| {
            s.and_then(|s| s.media.get(media_id).cloned())
                .ok_or_else(|| StoreError::NotFound(format!("media {media_id} for {agent}")))
        })
    }

    fn put_aux(
        &self,
        agent: &AgentId,
        map: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<(), StoreError> {
        self.with_agent(agent, |s| {
            s.aux
                .insert((map.to_string(), key.to_string()), value.clone())
        });
        Ok(())
    }

    fn get_aux(
        &self,
        agent: &AgentId,
        map: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        Ok(self.read_agent(agent, |s| {
            s.and_then(|s| s.aux.get(&(map.to_string(), key.to_string())).cloned())
        }))
    }

    fn list_aux(
        &self,
        agent: &AgentId,
        map: &str,
    ) -> Result<Vec<(String, serde_json::Value)>, StoreError> {
        Ok(self.read_agent(agent, |s| {
            s.map(|s| {
                let mut entries: Vec<(String, serde_json::Value)> = s
                    .aux
                    .iter()
                    .filter(|((m, _), _)| m == map)
                    .map(|((_, k), v)| (k.clone(), v.clone()))
                    .collect();
                entries.sort_by(|a, b| a.0.cmp(&b.0));
                entries
            })
            .unwrap_or_default()
        }))
    }

    fn exists(&self, agent: &AgentId) -> Result<bool, StoreError> {
        Ok(self.read_agent(agent, |s| s.map(|s| s.info.is_some()).unwrap_or(false)))
    }

    fn delete_agent(&self, agent: &AgentId) -> Result<(), StoreError> {
        self.inner.write().agents.remove(agent.as_str());
        Ok(())
    }

    fn list_agents(&self, prefix: &str) -> Result<Vec<AgentId>, StoreError> {
        let inner = self.inner.read();
        let mut ids: Vec<String> = inner
            .agents
            .iter()
            .filter(|(id, state)| id.starts_with(prefix) && state.info.is_some())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids.into_iter().map(AgentId::from_raw).collect())
    }

    fn save_pool_meta(&self, meta: &PoolMeta) -> Result<(), StoreError> {
        self.inner.write().pool_meta = Some(meta.clone());
        Ok(())
    }

    fn load_pool_meta(&self) -> Result<Option<PoolMeta>, StoreError> {
        Ok(self.inner.read().pool_meta.clone())
    }

    fn acquire_agent_lock(
        &self,
        agent: &AgentId,
        timeout: Duration,
    ) -> Result<AgentLock, StoreError> {
        self.locks.acquire(agent, timeout)
    }

    fn health_check(&self) -> StoreHealth {
        StoreHealth {
            backend: "memory".into(),
            distributed_lock: false,
            detail: Some("volatile; agent lock is in-memory, single-process only".into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use quorum_core::events::KernelEvent;

    fn envelope(agent: &AgentId, cursor: u64, channel: Channel) -> EventEnvelope {
        EventEnvelope {
            agent_id: agent.clone(),
            cursor,
            bookmark: Bookmark {
                seq: cursor,
                ts_ms: cursor as i64,
            },
            channel,
            event: KernelEvent::TextChunk {
                delta: format!("{cursor}"),
            },
        }
    }

    #[test]
    fn messages_roundtrip() {
        let store = MemoryStore::new();
        let agent = AgentId::new();
        store
            .save_messages(&agent, &[Message::user_text("hello")])
            .unwrap();
        assert_eq!(store.load_messages(&agent).unwrap().len(), 1);
    }

    #[test]
    fn events_since_and_channel_filter() {
        let store = MemoryStore::new();
        let agent = AgentId::new();
        for i in 1..=6 {
            let channel = if i % 2 == 0 {
                Channel::Monitor
            } else {
                Channel::Progress
            };
            store.append_event(&envelope(&agent, i, channel)).unwrap();
        }
        let tail = store
            .read_events(
                &agent,
                Some(Bookmark { seq: 3, ts_ms: 0 }),
                Some(&[Channel::Progress]),
            )
            .unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].cursor, 5);
    }

    #[test]
    fn duplicate_append_is_idempotent() {
        let store = MemoryStore::new();
        let agent = AgentId::new();
        let env = envelope(&agent, 1, Channel::Progress);
        store.append_event(&env).unwrap();
        store.append_event(&env).unwrap();
        assert_eq!(store.read_events(&agent, None, None).unwrap().len(), 1);
    }

    #[test]
    fn exists_requires_info() {
        let store = MemoryStore::new();
        let agent = AgentId::new();
        // Messages alone don't make an agent exist.
        store
            .save_messages(&agent, &[Message::user_text("hi")])
            .unwrap();
        assert!(!store.exists(&agent).unwrap());

        store
            .save_info(&AgentInfo::new(agent.clone(), "t", "1", "h"))
            .unwrap();
        assert!(store.exists(&agent).unwrap());
    }

    #[test]
    fn delete_removes_all_state() {
        let store = MemoryStore::new();
        let agent = AgentId::new();
        store
            .save_info(&AgentInfo::new(agent.clone(), "t", "1", "h"))
            .unwrap();
        store.save_media(&agent, "m", b"x").unwrap();
        store.delete_agent(&agent).unwrap();
        assert!(!store.exists(&agent).unwrap());
        assert!(store.load_media(&agent, "m").is_err());
    }

    #[test]
    fn snapshot_listing_sorted() {
        let store = MemoryStore::new();
        let agent = AgentId::new();
        for _ in 0..3 {
            let snap = Snapshot {
                id: SnapshotId::new(),
                label: None,
                messages: vec![],
                sfp_index: 0,
                bookmark: Bookmark::zero(),
                created_at: Utc::now().to_rfc3339(),
            };
            store.save_snapshot(&agent, &snap).unwrap();
        }
        let ids = store.list_snapshots(&agent).unwrap();
        assert_eq!(ids.len(), 3);
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn health_is_volatile_single_process() {
        let health = MemoryStore::new().health_check();
        assert_eq!(health.backend, "memory");
        assert!(!health.distributed_lock);
    }
}
