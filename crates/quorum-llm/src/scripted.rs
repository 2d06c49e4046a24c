use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;

use quorum_core::ids::ToolCallId;
use quorum_core::provider::{
    ChunkStream, ModelContext, ModelProvider, ProviderError, StreamChunk, StreamOptions,
};
use quorum_core::tokens::TokenUsage;

/// Pre-programmed responses for deterministic testing without API calls.
pub enum ScriptedResponse {
    /// Yield a sequence of chunks.
    Stream(Vec<StreamChunk>),
    /// Return an error from the `stream()` call itself.
    Error(ProviderError),
    /// Wait, then yield the inner response.
    Delay(Duration, Box<ScriptedResponse>),
}

impl ScriptedResponse {
    /// A plain text completion.
    pub fn text(text: &str) -> Self {
        Self::Stream(vec![
            StreamChunk::TextDelta {
                delta: text.to_string(),
            },
            StreamChunk::End {
                usage: TokenUsage {
                    input_tokens: 10,
                    output_tokens: text.len() as u64 / 4 + 1,
                    ..Default::default()
                },
            },
        ])
    }

    /// A completion that requests one tool call.
    pub fn tool_call(id: ToolCallId, name: &str, input: serde_json::Value) -> Self {
        Self::Stream(vec![
            StreamChunk::ToolUse {
                id,
                name: name.to_string(),
                input,
            },
            StreamChunk::End {
                usage: TokenUsage {
                    input_tokens: 10,
                    output_tokens: 5,
                    ..Default::default()
                },
            },
        ])
    }

    /// A stream that fails mid-flight.
    pub fn stream_error(error: ProviderError) -> Self {
        Self::Stream(vec![StreamChunk::Error { error }])
    }

    pub fn delayed(delay: Duration, inner: ScriptedResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Provider that plays back scripted responses in sequence.
pub struct ScriptedProvider {
    responses: Mutex<Vec<Option<ScriptedResponse>>>,
    call_count: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<ScriptedResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(Some).collect()),
            call_count: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted-1"
    }

    fn context_window(&self) -> usize {
        200_000
    }

    async fn stream(
        &self,
        _context: &ModelContext,
        _options: &StreamOptions,
    ) -> Result<ChunkStream, ProviderError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        let response = self.responses.lock().get_mut(idx).and_then(Option::take);
        let Some(response) = response else {
            return Err(ProviderError::InvalidRequest(format!(
                "no scripted response for call {idx}"
            )));
        };
        resolve(response).await
    }
}

async fn resolve(response: ScriptedResponse) -> Result<ChunkStream, ProviderError> {
    let mut current = response;
    loop {
        match current {
            ScriptedResponse::Stream(chunks) => {
                return Ok(Box::pin(stream::iter(chunks)));
            }
            ScriptedResponse::Error(e) => return Err(e),
            ScriptedResponse::Delay(duration, inner) => {
                tokio::time::sleep(duration).await;
                current = *inner;
            }
        }
    }
}
