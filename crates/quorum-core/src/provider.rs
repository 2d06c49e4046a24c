use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::ids::ToolCallId;
use crate::messages::Message;
use crate::tokens::TokenUsage;
use crate::tools::ToolManifestEntry;

/// Typed error hierarchy for model transport operations, classified for
/// the retry policy.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ProviderError {
    // Fatal; never retried
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("quota exhausted: {0}")]
    Quota(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    // Retryable
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("server error {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),

    // Operational
    #[error("cancelled")]
    Cancelled,
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::ServerError { .. }
                | Self::Network(_)
                | Self::Timeout(_)
                | Self::StreamInterrupted(_)
        )
    }

    pub fn suggested_delay(&self) -> Option<Duration> {
        if let Self::RateLimited { retry_after } = self {
            *retry_after
        } else {
            None
        }
    }

    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Auth(_) => "auth",
            Self::Quota(_) => "quota",
            Self::InvalidRequest(_) => "invalid_request",
            Self::RateLimited { .. } => "rate_limited",
            Self::ServerError { .. } => "server_error",
            Self::Network(_) => "network",
            Self::Timeout(_) => "timeout",
            Self::StreamInterrupted(_) => "stream_interrupted",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Chunks emitted during model streaming.
///
/// Ordering contract: deltas in any interleaving, complete `ToolUse`
/// blocks as they finish, then exactly one `End` (or an `Error` at any
/// point, terminating the stream).
#[derive(Clone, Debug)]
pub enum StreamChunk {
    TextDelta { delta: String },
    ReasoningDelta { delta: String },
    ToolUse {
        id: ToolCallId,
        name: String,
        input: serde_json::Value,
    },
    End { usage: TokenUsage },
    Error { error: ProviderError },
}

impl StreamChunk {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::End { .. } | Self::Error { .. })
    }
}

/// How reasoning blocks travel in the outgoing context.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningTransport {
    /// Keep native reasoning blocks.
    #[default]
    Provider,
    /// Collapse to `<think>…</think>` text.
    Text,
    /// Drop from the outgoing context (history on disk unaffected).
    Omit,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingConfig {
    Disabled,
    #[default]
    Adaptive,
    Budget {
        tokens: u32,
    },
    Effort {
        level: EffortLevel,
    },
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EffortLevel {
    Low,
    Medium,
    High,
    Max,
}

/// Knobs for one streaming completion.
#[derive(Clone, Debug, Default)]
pub struct StreamOptions {
    pub max_tokens: Option<u32>,
    pub thinking: ThinkingConfig,
    pub reasoning_transport: ReasoningTransport,
}

/// The assembled context handed to a provider.
#[derive(Clone, Debug)]
pub struct ModelContext {
    pub system: String,
    pub tools: Vec<ToolManifestEntry>,
    pub messages: Vec<Message>,
}

impl ModelContext {
    pub fn empty() -> Self {
        Self {
            system: String::new(),
            tools: Vec::new(),
            messages: Vec::new(),
        }
    }
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = StreamChunk> + Send>>;

/// Trait implemented by each model transport adapter.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> &str;
    fn context_window(&self) -> usize;

    /// Cost model for context budgeting. The default is the usual
    /// chars/4 heuristic; adapters override with provider tokenizers.
    fn estimate_tokens(&self, text: &str) -> usize {
        text.len().div_ceil(4)
    }

    async fn stream(
        &self,
        context: &ModelContext,
        options: &StreamOptions,
    ) -> Result<ChunkStream, ProviderError>;
}
