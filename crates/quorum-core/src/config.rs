use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::events::ResumeStrategy;
use crate::provider::{ReasoningTransport, ThinkingConfig};

/// How tool calls are gated.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    /// Approve silently.
    #[default]
    Auto,
    /// Require approval for every tool.
    Approval,
    /// Auto-approve tools flagged readonly; require approval otherwise.
    Readonly,
    /// A named mode supplied by the embedder.
    Custom(String),
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PermissionConfig {
    pub mode: PermissionMode,
    /// Any tool not on this list is denied outright.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_tools: Option<Vec<String>>,
    /// Unconditional deny.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deny_tools: Vec<String>,
    /// Always require approval, regardless of mode.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub require_approval_tools: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TodoConfig {
    pub enabled: bool,
    pub remind_interval_steps: u64,
    pub reminder_on_start: bool,
}

impl Default for TodoConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            remind_interval_steps: 5,
            reminder_on_start: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContextOptions {
    pub max_tokens: usize,
    pub compress_to_tokens: usize,
    /// Keep the most recent N media-bearing messages intact.
    pub multimodal_keep_recent: usize,
    pub reasoning_transport: ReasoningTransport,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            max_tokens: 160_000,
            compress_to_tokens: 80_000,
            multimodal_keep_recent: 3,
            reasoning_transport: ReasoningTransport::Provider,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResumeOptions {
    pub strategy: ResumeStrategy,
    /// Whether the worker starts processing queued input immediately.
    pub auto_run: bool,
}

impl Default for ResumeOptions {
    fn default() -> Self {
        Self {
            strategy: ResumeStrategy::Crash,
            auto_run: true,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SandboxConfig {
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<String>,
    #[serde(default)]
    pub enforce_boundary: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allow_paths: Vec<String>,
    #[serde(default)]
    pub watch_files: bool,
}

/// Limits on templates reachable through task dispatch and nesting depth.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubagentConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub templates: Option<Vec<String>>,
    pub depth: u32,
    #[serde(default)]
    pub inherit_config: bool,
}

impl Default for SubagentConfig {
    fn default() -> Self {
        Self {
            templates: None,
            depth: 1,
            inherit_config: true,
        }
    }
}

/// Full configuration for one agent.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    pub template_id: String,
    pub template_version: String,
    pub system_prompt: String,
    #[serde(default)]
    pub permission: PermissionConfig,
    #[serde(default)]
    pub todo: TodoConfig,
    #[serde(default)]
    pub context: ContextOptions,
    #[serde(default)]
    pub resume: ResumeOptions,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub subagents: SubagentConfig,
    #[serde(default)]
    pub thinking: ThinkingConfig,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl AgentConfig {
    /// Stable hash over the serialized config, recorded in agent metadata
    /// so a resume can detect a config drift.
    pub fn version_hash(&self) -> String {
        let serialized = serde_json::to_string(self).unwrap_or_default();
        let mut hasher = DefaultHasher::new();
        serialized.hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }
}
