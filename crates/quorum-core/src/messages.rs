use serde::{Deserialize, Serialize};

use crate::ids::ToolCallId;

/// A conversation message: a role plus an ordered list of content blocks.
///
/// Tool results live in user-role messages (one `ToolResult` block per
/// originating `ToolUse`), mirroring how providers expect the wire format.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<MessageMeta>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// Transport metadata. Reminder messages carry their origin here so the
/// loop can distinguish them from human input without inspecting content.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MessageMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<ReminderOrigin>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReminderOrigin {
    Todo,
    Scheduler,
    FileWatcher,
    Room,
}

/// Content blocks, tagged for the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Reasoning {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    Image {
        source: MediaSource,
        mime_type: String,
    },
    Audio {
        source: MediaSource,
        mime_type: String,
    },
    File {
        source: MediaSource,
        mime_type: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    ToolUse {
        id: ToolCallId,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: ToolCallId,
        content: serde_json::Value,
        #[serde(default)]
        is_error: bool,
    },
}

/// Where the bytes of a media block live.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MediaSource {
    Url { url: String },
    FileId { file_id: String },
    Base64 { data: String },
    /// Placeholder installed by multimodal retention; bytes are in the
    /// store's media cache under this id.
    Cache { media_id: String },
}

impl ContentBlock {
    pub fn is_media(&self) -> bool {
        matches!(
            self,
            Self::Image { .. } | Self::Audio { .. } | Self::File { .. }
        )
    }
}

impl Message {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::Text { text: text.into() }],
            meta: None,
        }
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: vec![ContentBlock::Text { text: text.into() }],
            meta: None,
        }
    }

    pub fn system_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: vec![ContentBlock::Text { text: text.into() }],
            meta: None,
        }
    }

    /// A system-role reminder tagged with its origin.
    pub fn reminder(origin: ReminderOrigin, text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: vec![ContentBlock::Text { text: text.into() }],
            meta: Some(MessageMeta {
                origin: Some(origin),
                sender: None,
            }),
        }
    }

    pub fn tool_results(results: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::User,
            content: results,
            meta: None,
        }
    }

    pub fn tool_uses(&self) -> Vec<(&ToolCallId, &str, &serde_json::Value)> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, name, input } => Some((id, name.as_str(), input)),
                _ => None,
            })
            .collect()
    }

    pub fn has_tool_uses(&self) -> bool {
        self.content
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolUse { .. }))
    }

    pub fn has_media(&self) -> bool {
        self.content.iter().any(ContentBlock::is_media)
    }

    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn is_reminder(&self) -> bool {
        self.meta
            .as_ref()
            .map(|m| m.origin.is_some())
            .unwrap_or(false)
    }

    /// A completed tool-result message or a plain (non-reminder) user
    /// message marks a legal fork point right after it.
    pub fn is_fork_boundary(&self) -> bool {
        match self.role {
            Role::User => true,
            Role::Assistant | Role::System => false,
        }
    }
}

/// Build the synthetic failed `tool_result` block used by denials and
/// auto-sealing.
pub fn failed_tool_result(id: &ToolCallId, error: impl Into<String>) -> ContentBlock {
    ContentBlock::ToolResult {
        tool_use_id: id.clone(),
        content: serde_json::json!({ "error": error.into() }),
        is_error: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_text_message() {
        let msg = Message::user_text("hello");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["content"][0]["type"], "text");
        assert_eq!(json["content"][0]["text"], "hello");
        assert!(json.get("meta").is_none());
    }

    #[test]
    fn reminder_is_tagged() {
        let msg = Message::reminder(ReminderOrigin::Todo, "pending items");
        assert_eq!(msg.role, Role::System);
        assert!(msg.is_reminder());
        let plain = Message::system_text("not a reminder");
        assert!(!plain.is_reminder());
    }

    #[test]
    fn tool_uses_extracted() {
        let id = ToolCallId::new();
        let msg = Message {
            role: Role::Assistant,
            content: vec![
                ContentBlock::Text {
                    text: "reading".into(),
                },
                ContentBlock::ToolUse {
                    id: id.clone(),
                    name: "fs_read".into(),
                    input: serde_json::json!({"path": "/tmp/x"}),
                },
            ],
            meta: None,
        };
        assert!(msg.has_tool_uses());
        let uses = msg.tool_uses();
        assert_eq!(uses.len(), 1);
        assert_eq!(uses[0].1, "fs_read");
        assert_eq!(msg.text_content(), "reading");
    }

    #[test]
    fn failed_result_block() {
        let id = ToolCallId::new();
        let block = failed_tool_result(&id, "denied: nope");
        match block {
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                assert_eq!(tool_use_id, id);
                assert!(is_error);
                assert_eq!(content["error"], "denied: nope");
            }
            _ => panic!("expected tool_result"),
        }
    }

    #[test]
    fn fork_boundaries() {
        assert!(Message::user_text("hi").is_fork_boundary());
        assert!(Message::tool_results(vec![]).is_fork_boundary());
        assert!(!Message::assistant_text("hello").is_fork_boundary());
        assert!(!Message::system_text("sys").is_fork_boundary());
    }

    #[test]
    fn media_detection() {
        let msg = Message {
            role: Role::User,
            content: vec![ContentBlock::Image {
                source: MediaSource::Base64 {
                    data: "aGk=".into(),
                },
                mime_type: "image/png".into(),
            }],
            meta: None,
        };
        assert!(msg.has_media());
        assert!(!Message::user_text("no media").has_media());
    }

    #[test]
    fn serde_roundtrip_all_blocks() {
        let msg = Message {
            role: Role::User,
            content: vec![
                ContentBlock::Text { text: "look".into() },
                ContentBlock::Reasoning {
                    text: "hmm".into(),
                    signature: Some("sig".into()),
                },
                ContentBlock::Image {
                    source: MediaSource::Url {
                        url: "https://example.com/a.png".into(),
                    },
                    mime_type: "image/png".into(),
                },
                ContentBlock::Audio {
                    source: MediaSource::FileId {
                        file_id: "file_9".into(),
                    },
                    mime_type: "audio/wav".into(),
                },
                ContentBlock::File {
                    source: MediaSource::Cache {
                        media_id: "media_1".into(),
                    },
                    mime_type: "application/pdf".into(),
                    name: Some("doc.pdf".into()),
                },
                ContentBlock::ToolUse {
                    id: ToolCallId::new(),
                    name: "shell".into(),
                    input: serde_json::json!({"command": "ls"}),
                },
                ContentBlock::ToolResult {
                    tool_use_id: ToolCallId::new(),
                    content: serde_json::json!("ok"),
                    is_error: false,
                },
            ],
            meta: Some(MessageMeta {
                origin: None,
                sender: Some("alice".into()),
            }),
        };

        let json = serde_json::to_string(&msg).unwrap();
        let parsed: Message = serde_json::from_str(&json).unwrap();
        let json2 = serde_json::to_string(&parsed).unwrap();
        assert_eq!(json, json2);
    }
}
