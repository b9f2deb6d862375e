//! Transcript data model.
//!
//! A transcript message may begin life as the live streaming message, in
//! which case its text grows as deltas arrive; once `is_streaming` drops to
//! false it is immutable apart from the finalize-exactly-once transition
//! made by the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single tool invocation attached to a transcript message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallInfo {
    /// Invocation identifier (may be synthesized when the gateway omits one).
    pub id: String,
    /// Tool name (e.g. "ls", "browser").
    pub name: String,
    /// Input payload as sent by the gateway, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
    /// Word-truncated result text. Set at most once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Monotonic: flips false→true when the result lands, never back.
    pub completed: bool,
}

impl ToolCallInfo {
    /// A fresh, incomplete invocation record.
    #[must_use]
    pub fn started(id: String, name: String, input: Option<serde_json::Value>) -> Self {
        Self {
            id,
            name,
            input,
            output: None,
            completed: false,
        }
    }
}

/// An ephemeral image attachment reference. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageAttachment {
    /// MIME type of the image data.
    pub mime: String,
    /// Raw image bytes.
    pub bytes: Vec<u8>,
}

/// One entry in the conversation transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptMessage {
    /// Opaque message identifier.
    pub id: String,
    /// Message text. Grows while `is_streaming` is true.
    pub text: String,
    /// True for user-authored messages, false for assistant messages.
    pub from_user: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// True while the message is the live streaming message.
    pub is_streaming: bool,
    /// True if the response was cut short (new send, abort, or disconnect).
    pub interrupted: bool,
    /// Tool invocations in arrival order.
    #[serde(default)]
    pub tool_calls: Vec<ToolCallInfo>,
    /// Ephemeral image attachments; not part of the persisted form.
    #[serde(skip)]
    pub attachments: Vec<ImageAttachment>,
}

impl TranscriptMessage {
    /// A new user message.
    #[must_use]
    pub fn user(text: String, attachments: Vec<ImageAttachment>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            text,
            from_user: true,
            created_at: Utc::now(),
            is_streaming: false,
            interrupted: false,
            tool_calls: Vec::new(),
            attachments,
        }
    }

    /// A new, empty assistant message in streaming state.
    #[must_use]
    pub fn assistant_streaming() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            text: String::new(),
            from_user: false,
            created_at: Utc::now(),
            is_streaming: true,
            interrupted: false,
            tool_calls: Vec::new(),
            attachments: Vec::new(),
        }
    }

    /// A complete assistant message (history replay or terminal error text).
    #[must_use]
    pub fn assistant(text: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            text,
            from_user: false,
            created_at: Utc::now(),
            is_streaming: false,
            interrupted: false,
            tool_calls: Vec::new(),
            attachments: Vec::new(),
        }
    }
}
