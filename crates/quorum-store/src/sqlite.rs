use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::info;

use quorum_core::events::{Bookmark, Channel, EventEnvelope};
use quorum_core::ids::{AgentId, SnapshotId};
use quorum_core::info::{AgentInfo, Snapshot};
use quorum_core::messages::Message;
use quorum_core::records::{CallState, ToolCallRecord};
use quorum_core::todo::TodoItem;

use crate::error::StoreError;
use crate::locks::{AgentLock, LockRegistry};
use crate::schema;
use crate::{PoolMeta, Store, StoreHealth};

const DOC_MESSAGES: &str = "messages";
const DOC_TOOL_RECORDS: &str = "tool_records";
const DOC_TODOS: &str = "todos";

fn channel_str(channel: Channel) -> &'static str {
    match channel {
        Channel::Progress => "progress",
        Channel::Control => "control",
        Channel::Monitor => "monitor",
    }
}

/// Embedded SQLite-backed store. Single connection behind a mutex;
/// WAL journal mode makes each write atomic across a crash.
///
/// The agent lock is per-process only (see [`LockRegistry`]);
/// `health_check` reports `distributed_lock: false` accordingly.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
    locks: LockRegistry,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init(&conn)?;
        info!(path = %path.display(), "sqlite store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_owned(),
            locks: LockRegistry::new(),
        })
    }

    /// In-memory database, for testing.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: PathBuf::from(":memory:"),
            locks: LockRegistry::new(),
        })
    }

    fn init(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(schema::PRAGMAS)?;
        conn.execute_batch(schema::CREATE_TABLES)?;
        let version: Option<u32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .ok();
        if version.is_none() {
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                [schema::SCHEMA_VERSION],
            )?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    fn save_doc<T: serde::Serialize>(
        &self,
        agent: &AgentId,
        kind: &str,
        value: &T,
    ) -> Result<(), StoreError> {
        let body = serde_json::to_string(value)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO docs (agent_id, kind, body, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (agent_id, kind) DO UPDATE SET body = ?3, updated_at = ?4",
                rusqlite::params![agent.as_str(), kind, body, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    fn load_doc<T: serde::de::DeserializeOwned>(
        &self,
        agent: &AgentId,
        kind: &str,
    ) -> Result<Option<T>, StoreError> {
        self.with_conn(|conn| {
            let body: Option<String> = conn
                .query_row(
                    "SELECT body FROM docs WHERE agent_id = ?1 AND kind = ?2",
                    rusqlite::params![agent.as_str(), kind],
                    |row| row.get(0),
                )
                .ok();
            match body {
                Some(body) => Ok(Some(serde_json::from_str(&body)?)),
                None => Ok(None),
            }
        })
    }

    // ── extended query surface (inherent, not part of the trait) ─────

    /// Metadata for every stored agent, newest first.
    pub fn query_agents(&self, limit: u32, offset: u32) -> Result<Vec<AgentInfo>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT info FROM agents ORDER BY updated_at DESC LIMIT ?1 OFFSET ?2",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![limit, offset], |row| {
                    row.get::<_, String>(0)
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter()
                .map(|body| serde_json::from_str(&body).map_err(StoreError::from))
                .collect()
        })
    }

    /// Messages for an agent whose text content matches `needle`.
    pub fn query_messages(
        &self,
        agent: &AgentId,
        needle: &str,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let messages = self.load_messages(agent)?;
        Ok(messages
            .into_iter()
            .filter(|m| m.text_content().contains(needle))
            .take(limit)
            .collect())
    }

    /// Tool call records for an agent, optionally filtered by state.
    pub fn query_tool_calls(
        &self,
        agent: &AgentId,
        state: Option<CallState>,
    ) -> Result<Vec<ToolCallRecord>, StoreError> {
        let records = self.load_tool_records(agent)?;
        Ok(records
            .into_iter()
            .filter(|r| state.map(|s| r.state == s).unwrap_or(true))
            .collect())
    }

    /// Coarse counts across the whole database.
    pub fn aggregate_stats(&self) -> Result<serde_json::Value, StoreError> {
        self.with_conn(|conn| {
            let agents: i64 =
                conn.query_row("SELECT COUNT(*) FROM agents", [], |row| row.get(0))?;
            let events: i64 =
                conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
            let snapshots: i64 =
                conn.query_row("SELECT COUNT(*) FROM snapshots", [], |row| row.get(0))?;
            Ok(serde_json::json!({
                "agents": agents,
                "events": events,
                "snapshots": snapshots,
            }))
        })
    }
}

impl Store for SqliteStore {
    fn save_messages(&self, agent: &AgentId, messages: &[Message]) -> Result<(), StoreError> {
        self.save_doc(agent, DOC_MESSAGES, &messages)
    }

    fn load_messages(&self, agent: &AgentId) -> Result<Vec<Message>, StoreError> {
        Ok(self.load_doc(agent, DOC_MESSAGES)?.unwrap_or_default())
    }

    fn save_tool_records(
        &self,
        agent: &AgentId,
        records: &[ToolCallRecord],
    ) -> Result<(), StoreError> {
        self.save_doc(agent, DOC_TOOL_RECORDS, &records)
    }

    fn load_tool_records(&self, agent: &AgentId) -> Result<Vec<ToolCallRecord>, StoreError> {
        Ok(self.load_doc(agent, DOC_TOOL_RECORDS)?.unwrap_or_default())
    }

    fn save_todos(&self, agent: &AgentId, todos: &[TodoItem]) -> Result<(), StoreError> {
        self.save_doc(agent, DOC_TODOS, &todos)
    }

    fn load_todos(&self, agent: &AgentId) -> Result<Vec<TodoItem>, StoreError> {
        Ok(self.load_doc(agent, DOC_TODOS)?.unwrap_or_default())
    }

    fn append_event(&self, envelope: &EventEnvelope) -> Result<(), StoreError> {
        let body = serde_json::to_string(envelope)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO events (agent_id, seq, channel, ts_ms, body)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    envelope.agent_id.as_str(),
                    envelope.cursor as i64,
                    channel_str(envelope.channel),
                    envelope.bookmark.ts_ms,
                    body,
                ],
            )?;
            Ok(())
        })
    }

    fn read_events(
        &self,
        agent: &AgentId,
        since: Option<Bookmark>,
        channels: Option<&[Channel]>,
    ) -> Result<Vec<EventEnvelope>, StoreError> {
        let after = since.map(|b| b.seq as i64).unwrap_or(-1);
        let rows: Vec<String> = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT body FROM events WHERE agent_id = ?1 AND seq > ?2 ORDER BY seq ASC",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![agent.as_str(), after], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        let mut envelopes = Vec::with_capacity(rows.len());
        for body in rows {
            let envelope: EventEnvelope = serde_json::from_str(&body)?;
            if let Some(channels) = channels {
                if !channels.contains(&envelope.channel) {
                    continue;
                }
            }
            envelopes.push(envelope);
        }
        Ok(envelopes)
    }

    fn last_cursor(&self, agent: &AgentId) -> Result<u64, StoreError> {
        self.with_conn(|conn| {
            let max: i64 = conn.query_row(
                "SELECT COALESCE(MAX(seq), 0) FROM events WHERE agent_id = ?1",
                [agent.as_str()],
                |row| row.get(0),
            )?;
            Ok(max as u64)
        })
    }

    fn save_snapshot(&self, agent: &AgentId, snapshot: &Snapshot) -> Result<(), StoreError> {
        let body = serde_json::to_string(snapshot)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO snapshots (agent_id, id, body, created_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (agent_id, id) DO UPDATE SET body = ?3",
                rusqlite::params![
                    agent.as_str(),
                    snapshot.id.as_str(),
                    body,
                    snapshot.created_at,
                ],
            )?;
            Ok(())
        })
    }

    fn load_snapshot(&self, agent: &AgentId, id: &SnapshotId) -> Result<Snapshot, StoreError> {
        let body: String = self.with_conn(|conn| {
            conn.query_row(
                "SELECT body FROM snapshots WHERE agent_id = ?1 AND id = ?2",
                rusqlite::params![agent.as_str(), id.as_str()],
                |row| row.get(0),
            )
            .map_err(|_| StoreError::NotFound(format!("snapshot {id} for {agent}")))
        })?;
        Ok(serde_json::from_str(&body)?)
    }

    fn list_snapshots(&self, agent: &AgentId) -> Result<Vec<SnapshotId>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM snapshots WHERE agent_id = ?1 ORDER BY created_at ASC",
            )?;
            let rows = stmt
                .query_map([agent.as_str()], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows.into_iter().map(SnapshotId::from_raw).collect())
        })
    }

    fn save_info(&self, info: &AgentInfo) -> Result<(), StoreError> {
        let body = serde_json::to_string(info)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO agents (id, info, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT (id) DO UPDATE SET info = ?2, updated_at = ?3",
                rusqlite::params![info.id.as_str(), body, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    fn load_info(&self, agent: &AgentId) -> Result<AgentInfo, StoreError> {
        let body: String = self.with_conn(|conn| {
            conn.query_row(
                "SELECT info FROM agents WHERE id = ?1",
                [agent.as_str()],
                |row| row.get(0),
            )
            .map_err(|_| StoreError::NotFound(format!("agent {agent}")))
        })?;
        Ok(serde_json::from_str(&body)?)
    }

    fn save_media(
        &self,
        agent: &AgentId,
        media_id: &str,
        bytes: &[u8],
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO media (agent_id, media_id, bytes) VALUES (?1, ?2, ?3)
                 ON CONFLICT (agent_id, media_id) DO UPDATE SET bytes = ?3",
                rusqlite::params![agent.as_str(), media_id, bytes],
            )?;
            Ok(())
        })
    }

    fn load_media(&self, agent: &AgentId, media_id: &str) -> Result<Vec<u8>, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT bytes FROM media WHERE agent_id = ?1 AND media_id = ?2",
                rusqlite::params![agent.as_str(), media_id],
                |row| row.get(0),
            )
            .map_err(|_| StoreError::NotFound(format!("media {media_id} for {agent}")))
        })
    }

    fn put_aux(
        &self,
        agent: &AgentId,
        map: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let body = serde_json::to_string(value)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO aux (agent_id, map, key, body) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (agent_id, map, key) DO UPDATE SET body = ?4",
                rusqlite::params![agent.as_str(), map, key, body],
            )?;
            Ok(())
        })
    }

    fn get_aux(
        &self,
        agent: &AgentId,
        map: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        self.with_conn(|conn| {
            let body: Option<String> = conn
                .query_row(
                    "SELECT body FROM aux WHERE agent_id = ?1 AND map = ?2 AND key = ?3",
                    rusqlite::params![agent.as_str(), map, key],
                    |row| row.get(0),
                )
                .ok();
            match body {
                Some(body) => Ok(Some(serde_json::from_str(&body)?)),
                None => Ok(None),
            }
        })
    }

    fn list_aux(
        &self,
        agent: &AgentId,
        map: &str,
    ) -> Result<Vec<(String, serde_json::Value)>, StoreError> {
        let rows: Vec<(String, String)> = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT key, body FROM aux WHERE agent_id = ?1 AND map = ?2 ORDER BY key ASC",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![agent.as_str(), map], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        rows.into_iter()
            .map(|(key, body)| Ok((key, serde_json::from_str(&body)?)))
            .collect()
    }

    fn exists(&self, agent: &AgentId) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM agents WHERE id = ?1",
                [agent.as_str()],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    fn delete_agent(&self, agent: &AgentId) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            for table in ["docs", "events", "snapshots", "media", "aux"] {
                conn.execute(
                    &format!("DELETE FROM {table} WHERE agent_id = ?1"),
                    [agent.as_str()],
                )?;
            }
            conn.execute("DELETE FROM agents WHERE id = ?1", [agent.as_str()])?;
            Ok(())
        })
    }

    fn list_agents(&self, prefix: &str) -> Result<Vec<AgentId>, StoreError> {
        self.with_conn(|conn| {
            let pattern = format!("{prefix}%");
            let mut stmt =
                conn.prepare("SELECT id FROM agents WHERE id LIKE ?1 ORDER BY id ASC")?;
            let rows = stmt
                .query_map([pattern], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows.into_iter().map(AgentId::from_raw).collect())
        })
    }

    fn save_pool_meta(&self, meta: &PoolMeta) -> Result<(), StoreError> {
        let body = serde_json::to_string(meta)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO pool_meta (slot, body) VALUES (0, ?1)
                 ON CONFLICT (slot) DO UPDATE SET body = ?1",
                [body],
            )?;
            Ok(())
        })
    }

    fn load_pool_meta(&self) -> Result<Option<PoolMeta>, StoreError> {
        self.with_conn(|conn| {
            let body: Option<String> = conn
                .query_row("SELECT body FROM pool_meta WHERE slot = 0", [], |row| {
                    row.get(0)
                })
                .ok();
            match body {
                Some(body) => Ok(Some(serde_json::from_str(&body)?)),
                None => Ok(None),
            }
        })
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
            backend: "sqlite".into(),
            distributed_lock: false,
            detail: Some("agent lock is in-memory, single-process only".into()),
        }
    }
}
