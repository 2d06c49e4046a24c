use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::info;

use quorum_core::config::ContextOptions;
use quorum_core::events::{CompressionPhase, KernelEvent};
use quorum_core::ids::AgentId;
use quorum_core::messages::{ContentBlock, MediaSource, Message, Role};
use quorum_core::provider::{ModelContext, ModelProvider, ReasoningTransport};
use quorum_store::{aux_maps, Store};

use crate::bus::EventBus;
use crate::error::KernelError;
use crate::registry::ToolRegistry;

/// The compressed prefix: everything before `upto` is represented by one
/// synthetic system message in the outgoing context. History on disk is
/// untouched.
#[derive(Clone, Debug)]
struct CompressedPrefix {
    upto: usize,
    summary: String,
}

/// Assembles the prompt each turn: system text, tool manual, message
/// history with compression, multimodal retention, and reasoning
/// transport applied.
pub struct ContextManager {
    agent_id: AgentId,
    options: ContextOptions,
    system_prompt: String,
    registry: Arc<RwLock<ToolRegistry>>,
    provider: Arc<dyn ModelProvider>,
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    last_manual_hash: Mutex<Option<String>>,
    compressed: Mutex<Option<CompressedPrefix>>,
    compression_seq: AtomicU64,
}

impl ContextManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agent_id: AgentId,
        options: ContextOptions,
        system_prompt: String,
        registry: Arc<RwLock<ToolRegistry>>,
        provider: Arc<dyn ModelProvider>,
        store: Arc<dyn Store>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            agent_id,
            options,
            system_prompt,
            registry,
            provider,
            store,
            bus,
            last_manual_hash: Mutex::new(None),
            compressed: Mutex::new(None),
            compression_seq: AtomicU64::new(0),
        }
    }

    /// Build the outgoing context for one model call.
    pub fn build(&self, messages: &[Message]) -> Result<ModelContext, KernelError> {
        let (manifest, manual, manual_hash) = {
            let registry = self.registry.read();
            (registry.manifest(), registry.manual(), registry.manual_hash())
        };

        {
            let mut last = self.last_manual_hash.lock();
            if last.as_deref() != Some(manual_hash.as_str()) {
                *last = Some(manual_hash.clone());
                self.bus
                    .emit_or_log(KernelEvent::ToolManualUpdated { hash: manual_hash });
            }
        }

        let mut system = self.system_prompt.clone();
        if !manual.is_empty() {
            system.push_str("\n\n# Tools\n\n");
            system.push_str(&manual);
        }

        let mut working = self.apply_prefix(messages);

        let system_tokens = self.provider.estimate_tokens(&system);
        if system_tokens + self.estimate_messages(&working) > self.options.max_tokens {
            self.compress(messages, system_tokens)?;
            working = self.apply_prefix(messages);
            info!(
                agent = %self.agent_id,
                tokens = system_tokens + self.estimate_messages(&working),
                "context compressed"
            );
        }

        self.apply_multimodal_retention(&mut working)?;
        self.apply_reasoning_transport(&mut working);

        Ok(ModelContext {
            system,
            tools: manifest,
            messages: working,
        })
    }

    fn apply_prefix(&self, messages: &[Message]) -> Vec<Message> {
        let compressed = self.compressed.lock();
        match &*compressed {
            Some(prefix) if prefix.upto < messages.len() => {
                let mut out = Vec::with_capacity(messages.len() - prefix.upto + 1);
                out.push(Message::system_text(prefix.summary.clone()));
                out.extend_from_slice(&messages[prefix.upto..]);
                out
            }
            Some(prefix) => {
                vec![Message::system_text(prefix.summary.clone())]
            }
            None => messages.to_vec(),
        }
    }

    fn estimate_messages(&self, messages: &[Message]) -> usize {
        messages.iter().map(|m| self.estimate_message(m)).sum()
    }

    fn estimate_message(&self, message: &Message) -> usize {
        let mut tokens = 4; // role + framing
        for block in &message.content {
            tokens += match block {
                ContentBlock::Text { text } => self.provider.estimate_tokens(text),
                ContentBlock::Reasoning { text, .. } => self.provider.estimate_tokens(text),
                ContentBlock::ToolUse { input, .. } => {
                    self.provider.estimate_tokens(&input.to_string()) + 8
                }
                ContentBlock::ToolResult { content, .. } => {
                    self.provider.estimate_tokens(&content.to_string()) + 8
                }
                // Flat charge per media block; providers bill these
                // by resolution, not text length.
                ContentBlock::Image { .. } | ContentBlock::Audio { .. }
                | ContentBlock::File { .. } => 1_000,
            };
        }
        tokens
    }

    /// Fold the oldest segment into one synthetic system message so the
    /// tail fits `compress_to_tokens`. The cut lands on a fork boundary
    /// so no tool_use is separated from its result.
    fn compress(&self, messages: &[Message], system_tokens: usize) -> Result<(), KernelError> {
        let old_upto = self.compressed.lock().as_ref().map(|p| p.upto).unwrap_or(0);
        let budget = self.options.compress_to_tokens.saturating_sub(system_tokens);

        // Walk back from the end accumulating tail cost until the budget
        // is spent, then snap forward to the nearest fork boundary.
        let mut tail_tokens = 0;
        let mut cut = messages.len().saturating_sub(1);
        for (i, message) in messages.iter().enumerate().rev() {
            let cost = self.estimate_message(message);
            if tail_tokens + cost > budget && i > old_upto {
                cut = i + 1;
                break;
            }
            tail_tokens += cost;
            cut = i;
        }
        while cut < messages.len() && cut > 0 && !messages[cut - 1].is_fork_boundary() {
            cut += 1;
        }
        if cut <= old_upto || cut >= messages.len() {
            // Nothing new to fold; the tail alone is over budget.
            return Ok(());
        }

        self.bus.emit_or_log(KernelEvent::ContextCompression {
            phase: CompressionPhase::Start,
            ratio: None,
            summary: None,
        });

        let before = self.estimate_messages(messages);
        let summary = summarize(&messages[..cut]);
        *self.compressed.lock() = Some(CompressedPrefix {
            upto: cut,
            summary: summary.clone(),
        });
        let after = self.estimate_messages(&self.apply_prefix(messages));
        let ratio = if before > 0 {
            after as f64 / before as f64
        } else {
            1.0
        };

        let seq = self.compression_seq.fetch_add(1, Ordering::Relaxed);
        self.store.put_aux(
            &self.agent_id,
            aux_maps::COMPRESSION_RECORDS,
            &format!("{seq:08}"),
            &serde_json::json!({
                "upto": cut,
                "ratio": ratio,
                "summary": summary,
            }),
        )?;
        // The folded window itself, so embedders can reconstruct which
        // span of raw history each summary stands in for.
        self.store.put_aux(
            &self.agent_id,
            aux_maps::HISTORY_WINDOWS,
            &format!("{seq:08}"),
            &serde_json::json!({ "from": old_upto, "to": cut }),
        )?;

        self.bus.emit_or_log(KernelEvent::ContextCompression {
            phase: CompressionPhase::End,
            ratio: Some(ratio),
            summary: Some(summary),
        });
        Ok(())
    }

    /// Keep the most recent N media-bearing messages intact; earlier
    /// media blocks become placeholder text referencing the media cache.
    fn apply_multimodal_retention(&self, messages: &mut [Message]) -> Result<(), KernelError> {
        let keep = self.options.multimodal_keep_recent;
        let media_indices: Vec<usize> = messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.has_media())
            .map(|(i, _)| i)
            .collect();
        if media_indices.len() <= keep {
            return Ok(());
        }

        let to_strip = &media_indices[..media_indices.len() - keep];
        for &idx in to_strip {
            for block in &mut messages[idx].content {
                if !block.is_media() {
                    continue;
                }
                let (source, mime) = match &*block {
                    ContentBlock::Image { source, mime_type }
                    | ContentBlock::Audio { source, mime_type }
                    | ContentBlock::File {
                        source, mime_type, ..
                    } => (source.clone(), mime_type.clone()),
                    _ => unreachable!(),
                };
                let media_id = match &source {
                    MediaSource::Cache { media_id } => media_id.clone(),
                    MediaSource::Base64 { data } => {
                        let id = format!("media_{}", content_hash(data, &mime));
                        self.store.save_media(&self.agent_id, &id, data.as_bytes())?;
                        id
                    }
                    MediaSource::Url { url } => {
                        let id = format!("media_{}", content_hash(url, &mime));
                        self.store.save_media(&self.agent_id, &id, url.as_bytes())?;
                        id
                    }
                    MediaSource::FileId { file_id } => {
                        let id = format!("media_{}", content_hash(file_id, &mime));
                        self.store
                            .save_media(&self.agent_id, &id, file_id.as_bytes())?;
                        id
                    }
                };
                *block = ContentBlock::Text {
                    text: format!("[media {media_id} ({mime}) retained in cache]"),
                };
            }
        }
        Ok(())
    }

    fn apply_reasoning_transport(&self, messages: &mut Vec<Message>) {
        match self.options.reasoning_transport {
            ReasoningTransport::Provider => {}
            ReasoningTransport::Text => {
                for message in messages.iter_mut() {
                    for block in &mut message.content {
                        if let ContentBlock::Reasoning { text, .. } = block {
                            *block = ContentBlock::Text {
                                text: format!("<think>{text}</think>"),
                            };
                        }
                    }
                }
            }
            ReasoningTransport::Omit => {
                for message in messages.iter_mut() {
                    message
                        .content
                        .retain(|b| !matches!(b, ContentBlock::Reasoning { .. }));
                }
                messages.retain(|m| !m.content.is_empty());
            }
        }
    }
}

fn content_hash(data: &str, mime: &str) -> String {
    let mut hasher = DefaultHasher::new();
    data.hash(&mut hasher);
    mime.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Extractive summary of a folded segment: one line per message, capped.
fn summarize(messages: &[Message]) -> String {
    const LINE_CAP: usize = 120;
    const TOTAL_CAP: usize = 4_000;

    let mut lines = vec!["Summary of earlier conversation:".to_string()];
    for message in messages {
        let role = match message.role {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        };
        let text = message.text_content();
        let mut line = text.split('\n').next().unwrap_or("").to_string();
        if line.len() > LINE_CAP {
            let mut cap = LINE_CAP;
            while !line.is_char_boundary(cap) {
                cap -= 1;
            }
            line.truncate(cap);
            line.push('…');
        }
        if line.is_empty() {
            let tools: Vec<&str> = message
                .tool_uses()
                .iter()
                .map(|(_, name, _)| *name)
                .collect();
            if tools.is_empty() {
                continue;
            }
            line = format!("[tool calls: {}]", tools.join(", "));
        }
        lines.push(format!("- {role}: {line}"));
        if lines.iter().map(|l| l.len() + 1).sum::<usize>() > TOTAL_CAP {
            lines.push("- …".to_string());
            break;
        }
    }
    lines.join("\n")
}
