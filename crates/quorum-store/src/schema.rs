/// SQL DDL for the quorum store database.
/// WAL mode keeps every write atomic across a crash; the journal replay
/// on reopen satisfies the crash-safety contract.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS agents (
    id TEXT PRIMARY KEY,
    info TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS docs (
    agent_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    body TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (agent_id, kind)
);

CREATE TABLE IF NOT EXISTS events (
    agent_id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    channel TEXT NOT NULL,
    ts_ms INTEGER NOT NULL,
    body TEXT NOT NULL,
    PRIMARY KEY (agent_id, seq)
);

CREATE TABLE IF NOT EXISTS snapshots (
    agent_id TEXT NOT NULL,
    id TEXT NOT NULL,
    body TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (agent_id, id)
);

CREATE TABLE IF NOT EXISTS media (
    agent_id TEXT NOT NULL,
    media_id TEXT NOT NULL,
    bytes BLOB NOT NULL,
    PRIMARY KEY (agent_id, media_id)
);

CREATE TABLE IF NOT EXISTS aux (
    agent_id TEXT NOT NULL,
    map TEXT NOT NULL,
    key TEXT NOT NULL,
    body TEXT NOT NULL,
    PRIMARY KEY (agent_id, map, key)
);

CREATE TABLE IF NOT EXISTS pool_meta (
    slot INTEGER PRIMARY KEY CHECK (slot = 0),
    body TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_agent_channel ON events(agent_id, channel, seq);
CREATE INDEX IF NOT EXISTS idx_snapshots_agent ON snapshots(agent_id);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
