//! Durable state storage for the quorum agent runtime kernel.
//!
//! [`Store`] is the abstract persistence boundary: messages, tool call
//! records, todos, the event log, snapshots, and agent metadata, all
//! keyed by agent id and idempotent on retry. [`SqliteStore`] is the
//! embedded reference implementation; [`MemoryStore`] backs tests and
//! lightweight embedding.

pub mod error;
pub mod locks;
pub mod memory;
pub mod schema;
pub mod sqlite;

pub use error::StoreError;
pub use locks::{AgentLock, LockRegistry};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use quorum_core::events::{Bookmark, Channel, EventEnvelope};
use quorum_core::ids::{AgentId, SnapshotId};
use quorum_core::info::{AgentInfo, Snapshot};
use quorum_core::messages::Message;
use quorum_core::records::ToolCallRecord;
use quorum_core::todo::TodoItem;

/// Names of the auxiliary per-agent maps.
pub mod aux_maps {
    pub const HISTORY_WINDOWS: &str = "history_windows";
    pub const COMPRESSION_RECORDS: &str = "compression_records";
    pub const RECOVERED_FILES: &str = "recovered_files";
}

/// Pool-level metadata, stored outside the agent-id keyspace so it can
/// never collide with an agent.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PoolMeta {
    pub running: Vec<AgentId>,
    pub saved_at: String,
}

/// Result of [`Store::health_check`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreHealth {
    pub backend: String,
    /// Whether `acquire_agent_lock` is a real cross-process mutex.
    /// Embedded backends report `false`; embedders must not deploy them
    /// multi-process.
    pub distributed_lock: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Abstract storage for agent durable state.
///
/// Contract: after any `save_*` returns `Ok`, a subsequent `load_*` in
/// any later process sees the new state. Writes for one agent id are
/// serialized by the caller (the agent loop is single-threaded);
/// cross-agent writes may arrive in parallel.
pub trait Store: Send + Sync {
    // ── replace-on-write documents ───────────────────────────────────
    fn save_messages(&self, agent: &AgentId, messages: &[Message]) -> Result<(), StoreError>;
    fn load_messages(&self, agent: &AgentId) -> Result<Vec<Message>, StoreError>;

    fn save_tool_records(
        &self,
        agent: &AgentId,
        records: &[ToolCallRecord],
    ) -> Result<(), StoreError>;
    fn load_tool_records(&self, agent: &AgentId) -> Result<Vec<ToolCallRecord>, StoreError>;

    fn save_todos(&self, agent: &AgentId, todos: &[TodoItem]) -> Result<(), StoreError>;
    fn load_todos(&self, agent: &AgentId) -> Result<Vec<TodoItem>, StoreError>;

    // ── event log (append-only) ──────────────────────────────────────
    fn append_event(&self, envelope: &EventEnvelope) -> Result<(), StoreError>;

    /// Events strictly after `since` (all events when `None`), in cursor
    /// order, optionally filtered by channel.
    fn read_events(
        &self,
        agent: &AgentId,
        since: Option<Bookmark>,
        channels: Option<&[Channel]>,
    ) -> Result<Vec<EventEnvelope>, StoreError>;

    /// Highest cursor ever appended for this agent (0 when the log is
    /// empty). A resuming event bus continues numbering from here.
    fn last_cursor(&self, agent: &AgentId) -> Result<u64, StoreError>;

    // ── snapshots ────────────────────────────────────────────────────
    fn save_snapshot(&self, agent: &AgentId, snapshot: &Snapshot) -> Result<(), StoreError>;
    fn load_snapshot(&self, agent: &AgentId, id: &SnapshotId) -> Result<Snapshot, StoreError>;
    fn list_snapshots(&self, agent: &AgentId) -> Result<Vec<SnapshotId>, StoreError>;

    // ── metadata ─────────────────────────────────────────────────────
    fn save_info(&self, info: &AgentInfo) -> Result<(), StoreError>;
    fn load_info(&self, agent: &AgentId) -> Result<AgentInfo, StoreError>;

    // ── media cache ──────────────────────────────────────────────────
    fn save_media(&self, agent: &AgentId, media_id: &str, bytes: &[u8])
        -> Result<(), StoreError>;
    fn load_media(&self, agent: &AgentId, media_id: &str) -> Result<Vec<u8>, StoreError>;

    // ── auxiliary maps ───────────────────────────────────────────────
    fn put_aux(
        &self,
        agent: &AgentId,
        map: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<(), StoreError>;
    fn get_aux(
        &self,
        agent: &AgentId,
        map: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>, StoreError>;
    fn list_aux(
        &self,
        agent: &AgentId,
        map: &str,
    ) -> Result<Vec<(String, serde_json::Value)>, StoreError>;

    // ── namespace ────────────────────────────────────────────────────
    fn exists(&self, agent: &AgentId) -> Result<bool, StoreError>;
    fn delete_agent(&self, agent: &AgentId) -> Result<(), StoreError>;
    fn list_agents(&self, prefix: &str) -> Result<Vec<AgentId>, StoreError>;

    // ── pool metadata (separate keyspace) ────────────────────────────
    fn save_pool_meta(&self, meta: &PoolMeta) -> Result<(), StoreError>;
    fn load_pool_meta(&self) -> Result<Option<PoolMeta>, StoreError>;

    // ── coordination ─────────────────────────────────────────────────
    /// Exclusive ownership of one agent id. Released when the returned
    /// guard drops. Whether the mutex spans processes is reported by
    /// `health_check`.
    fn acquire_agent_lock(
        &self,
        agent: &AgentId,
        timeout: Duration,
    ) -> Result<AgentLock, StoreError>;

    fn health_check(&self) -> StoreHealth;
}
