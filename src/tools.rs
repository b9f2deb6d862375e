//! Tool call correlation.
//!
//! Attaches a tool's output to the correct invocation record, for both live
//! streaming and replayed history. Gateway identifiers may be absent or
//! duplicated, so matching falls back from exact id to tool name, and a
//! result that matches nothing is synthesized into its own completed record
//! rather than dropped.

use crate::transcript::ToolCallInfo;

/// Marker appended when a tool result is cut at the word limit.
pub const TRUNCATION_MARKER: &str = "…";

/// How a result found its invocation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultAttachment {
    /// Exact identifier match against an incomplete invocation.
    MatchedById,
    /// Most recent incomplete invocation with the same tool name.
    MatchedByName,
    /// No match existed; a completed record was synthesized.
    Synthesized,
}

/// Truncate `text` to at most `max_words` whitespace-separated words,
/// appending the truncation marker when anything was cut.
#[must_use]
pub fn truncate_words(text: &str, max_words: usize) -> String {
    if max_words == 0 {
        return if text.split_whitespace().next().is_some() {
            TRUNCATION_MARKER.to_owned()
        } else {
            text.to_owned()
        };
    }
    let mut word_ends = text
        .split_whitespace()
        .map(|w| w.as_ptr() as usize - text.as_ptr() as usize + w.len());
    let Some(end) = word_ends.nth(max_words.saturating_sub(1)) else {
        return text.to_owned();
    };
    if word_ends.next().is_none() {
        return text.to_owned();
    }
    let mut out = text[..end].to_owned();
    out.push(' ');
    out.push_str(TRUNCATION_MARKER);
    out
}

/// Append a fresh incomplete invocation for a live tool-start event.
///
/// When the gateway assigns no id, one is synthesized so later results can
/// still fall back to name matching.
pub fn record_start(
    calls: &mut Vec<ToolCallInfo>,
    id: Option<String>,
    name: String,
    input: Option<serde_json::Value>,
) {
    let id = id.unwrap_or_else(|| format!("local-{}", uuid::Uuid::new_v4()));
    calls.push(ToolCallInfo::started(id, name, input));
}

/// Attach a result to the correct invocation, in priority order: exact id
/// among incomplete invocations, then most recent incomplete invocation with
/// the same name, then a synthesized already-complete record. Output is
/// never overwritten once an invocation completes.
pub fn attach_result(
    calls: &mut Vec<ToolCallInfo>,
    id: Option<&str>,
    name: Option<&str>,
    output: String,
) -> ResultAttachment {
    if let Some(id) = id
        && let Some(call) = calls.iter_mut().find(|c| !c.completed && c.id == id)
    {
        call.output = Some(output);
        call.completed = true;
        return ResultAttachment::MatchedById;
    }

    if let Some(name) = name
        && let Some(call) = calls.iter_mut().rev().find(|c| !c.completed && c.name == name)
    {
        call.output = Some(output);
        call.completed = true;
        return ResultAttachment::MatchedByName;
    }

    // Result arrived with no corresponding invocation (e.g. across a history
    // page boundary). Keep it rather than dropping it silently.
    tracing::debug!(id, name, "synthesizing record for orphaned tool result");
    calls.push(ToolCallInfo {
        id: id.map_or_else(|| format!("local-{}", uuid::Uuid::new_v4()), str::to_owned),
        name: name.unwrap_or("unknown").to_owned(),
        input: None,
        output: Some(output),
        completed: true,
    });
    ResultAttachment::Synthesized
}
