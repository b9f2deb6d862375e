//! Wire types for the gateway chat protocol.
//!
//! The event stream uses tagged JSON objects, one event per frame. Unknown
//! event types are preserved rather than dropped so the engine can log them.

use serde::{Deserialize, Serialize};

/// Reserved assistant reply used as a liveness probe. Never surfaced to the
/// transcript or forwarded to speech output.
pub const HEARTBEAT_SENTINEL: &str = "HEARTBEAT_OK";

/// Fixed user-side probe text the gateway injects for liveness checks.
/// History messages carrying it are filtered out.
pub const HEARTBEAT_PROMPT: &str =
    "System heartbeat: reply HEARTBEAT_OK if nothing needs attention.";

/// An inbound chat event from the gateway.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    /// Streaming text delta for the in-flight response.
    TextDelta {
        /// Fragment text. May overlap or re-deliver earlier content.
        #[serde(default)]
        text: String,
        /// Monotonic sequence number, when the transport provides one.
        #[serde(default)]
        seq: Option<u64>,
    },
    /// The model is reasoning; no visible text yet.
    ThinkingDelta {
        /// Sequence number, when provided.
        #[serde(default)]
        seq: Option<u64>,
    },
    /// A tool invocation has started.
    ToolCallStart {
        /// Tool name.
        #[serde(default)]
        name: String,
        /// Invocation id, when the gateway assigns one.
        #[serde(default)]
        id: Option<String>,
    },
    /// A tool invocation has finished.
    ToolCallEnd {
        /// Tool name.
        #[serde(default)]
        name: String,
        /// Invocation id, when the gateway assigns one.
        #[serde(default)]
        id: Option<String>,
        /// Result payload; text blocks are extracted from it.
        #[serde(default)]
        result: serde_json::Value,
    },
    /// Terminal success. `final_text` is the authoritative complete response
    /// when present.
    Done {
        /// Authoritative final text, if the gateway sends one.
        #[serde(default)]
        final_text: Option<String>,
        /// Sequence number; may equal the last delta's number.
        #[serde(default)]
        seq: Option<u64>,
    },
    /// Terminal failure reported by the gateway for this run.
    Error {
        /// Human-readable error text.
        #[serde(default)]
        message: String,
        /// Sequence number; may equal the last delta's number.
        #[serde(default)]
        seq: Option<u64>,
    },
    /// Agent lifecycle status line ("thinking", "responding", ...).
    AgentStatus {
        /// Status label.
        #[serde(default)]
        status: String,
    },
}

impl ChatEvent {
    /// Terminal events close the streaming session.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}

/// Parsed event or an unrecognized frame from the gateway.
#[derive(Debug, Clone)]
pub enum InboundFrame {
    /// A recognized chat event.
    Event(ChatEvent),
    /// An unrecognized JSON frame (logged, not processed).
    Unknown(String),
}

/// Parse a single JSON frame into an [`InboundFrame`].
#[must_use]
pub fn parse_frame(json_line: &str) -> InboundFrame {
    match serde_json::from_str::<ChatEvent>(json_line) {
        Ok(event) => InboundFrame::Event(event),
        Err(_) => InboundFrame::Unknown(json_line.to_owned()),
    }
}

// ---------------------------------------------------------------------------
// Durable history log
// ---------------------------------------------------------------------------

/// Role of a durable history message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryRole {
    User,
    Assistant,
    /// A dedicated tool-result record, matched against earlier tool calls.
    ToolResult,
}

/// One heterogeneous content part inside a history message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Plain text.
    Text {
        #[serde(default)]
        text: String,
    },
    /// A tool invocation recorded inline.
    ToolCall {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        name: String,
        #[serde(default)]
        input: Option<serde_json::Value>,
    },
    /// A tool result recorded inline.
    ToolResult {
        #[serde(default)]
        tool_call_id: Option<String>,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        content: serde_json::Value,
    },
}

/// One message in the gateway's durable log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryMessage {
    /// Message role.
    pub role: HistoryRole,
    /// Heterogeneous content parts.
    #[serde(default)]
    pub content: Vec<ContentPart>,
}

/// Extract the text blocks of a tool result payload, newline-joined.
///
/// Accepts either a bare string or the structured
/// `{"content":[{"type":"text","text":...}]}` form.
#[must_use]
pub fn extract_result_text(result: &serde_json::Value) -> Option<String> {
    if let Some(s) = result.as_str() {
        let s = s.trim();
        return (!s.is_empty()).then(|| s.to_owned());
    }

    let content = result.get("content")?.as_array()?;
    let mut out = String::new();
    for block in content {
        if block.get("type").and_then(|v| v.as_str()) != Some("text") {
            continue;
        }
        let text = block.get("text").and_then(|v| v.as_str()).unwrap_or("");
        if text.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(text);
    }
    if out.is_empty() { None } else { Some(out) }
}
