use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::breakpoint::Breakpoint;
use crate::events::{Bookmark, RunState};
use crate::ids::{AgentId, SnapshotId};
use crate::messages::Message;
use crate::tokens::TokenUsage;

/// Durable per-agent metadata. Written at create, updated at every
/// persisted state change, read at resume.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: AgentId,
    pub template_id: String,
    pub template_version: String,
    pub created_at: String,
    /// Ancestor agent ids, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lineage: Vec<AgentId>,
    pub config_hash: String,
    pub message_count: usize,
    pub last_sfp_index: usize,
    pub last_bookmark: Bookmark,
    pub breakpoint: Breakpoint,
    /// Saved config, so `resume_from_store` can rebuild without the
    /// embedder re-supplying it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saved_config: Option<crate::config::AgentConfig>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl AgentInfo {
    pub fn new(id: AgentId, template_id: &str, template_version: &str, config_hash: &str) -> Self {
        Self {
            id,
            template_id: template_id.to_string(),
            template_version: template_version.to_string(),
            created_at: Utc::now().to_rfc3339(),
            lineage: Vec::new(),
            config_hash: config_hash.to_string(),
            message_count: 0,
            last_sfp_index: 0,
            last_bookmark: Bookmark::zero(),
            breakpoint: Breakpoint::Ready,
            saved_config: None,
            metadata: serde_json::Map::new(),
        }
    }
}

/// State captured at a Safe-Fork-Point.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub messages: Vec<Message>,
    pub sfp_index: usize,
    pub bookmark: Bookmark,
    pub created_at: String,
}

/// Live status surfaced to embedders.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentStatus {
    pub run_state: RunState,
    pub breakpoint: Breakpoint,
    pub step: u64,
    pub pending_approvals: Vec<crate::ids::ToolCallId>,
    pub usage: TokenUsage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_text: Option<String>,
}
