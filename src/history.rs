//! History reconciliation and filtering.
//!
//! Converts the gateway's durable message log into the transcript's message
//! list, suitable to fully replace the in-memory transcript after a
//! reconnect or foreground resume. Tool results are merged into their
//! originating calls and synthetic heartbeat traffic is suppressed. History
//! text is complete, so none of the streaming partial-match heuristics apply
//! here.

use crate::protocol::{
    ContentPart, HEARTBEAT_PROMPT, HEARTBEAT_SENTINEL, HistoryMessage, HistoryRole,
    extract_result_text,
};
use crate::tools::{attach_result, truncate_words};
use crate::transcript::{ToolCallInfo, TranscriptMessage};

/// Convert the gateway's durable log into transcript messages.
///
/// History order is preserved; a tool result that matches no prior call
/// becomes a standalone completed record at its own position.
#[must_use]
pub fn reconcile_history(
    history: &[HistoryMessage],
    tool_output_max_words: usize,
) -> Vec<TranscriptMessage> {
    let mut out: Vec<TranscriptMessage> = Vec::with_capacity(history.len());

    for message in history {
        match message.role {
            HistoryRole::User => {
                let text = body_text(&message.content);
                if is_heartbeat_probe(&text) {
                    tracing::debug!("dropping heartbeat probe from history");
                    continue;
                }
                if text.is_empty() {
                    continue;
                }
                out.push(TranscriptMessage::user(text, Vec::new()));
            }

            HistoryRole::Assistant => {
                let text = body_text(&message.content);
                if text.trim() == HEARTBEAT_SENTINEL {
                    tracing::debug!("dropping heartbeat reply from history");
                    continue;
                }

                let mut tool_calls = extract_tool_calls(&message.content);
                // Inline results correlate against the calls extracted from
                // this same message.
                for part in &message.content {
                    if let ContentPart::ToolResult {
                        tool_call_id,
                        name,
                        content,
                    } = part
                    {
                        let output = result_output(content, tool_output_max_words);
                        attach_result(
                            &mut tool_calls,
                            tool_call_id.as_deref(),
                            name.as_deref(),
                            output,
                        );
                    }
                }

                if text.is_empty() && tool_calls.is_empty() {
                    continue;
                }
                let mut msg = TranscriptMessage::assistant(text);
                msg.tool_calls = tool_calls;
                out.push(msg);
            }

            HistoryRole::ToolResult => {
                for part in &message.content {
                    let ContentPart::ToolResult {
                        tool_call_id,
                        name,
                        content,
                    } = part
                    else {
                        continue;
                    };
                    let output = result_output(content, tool_output_max_words);
                    if attach_to_prior(&mut out, tool_call_id.as_deref(), name.as_deref(), &output)
                    {
                        continue;
                    }

                    // No prior call anywhere (e.g. a history page boundary):
                    // keep the result as its own completed record.
                    tracing::debug!("history tool result matched no prior call");
                    let mut calls = Vec::new();
                    attach_result(&mut calls, tool_call_id.as_deref(), name.as_deref(), output);
                    let mut msg = TranscriptMessage::assistant(String::new());
                    msg.tool_calls = calls;
                    out.push(msg);
                }
            }
        }
    }

    out
}

/// Concatenate all trimmed text parts of a message.
fn body_text(parts: &[ContentPart]) -> String {
    let mut out = String::new();
    for part in parts {
        if let ContentPart::Text { text } = part {
            let t = text.trim();
            if t.is_empty() {
                continue;
            }
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(t);
        }
    }
    out
}

/// A user message that is exactly, or ends with, the probe text is
/// synthetic heartbeat traffic.
fn is_heartbeat_probe(text: &str) -> bool {
    text == HEARTBEAT_PROMPT || text.ends_with(HEARTBEAT_PROMPT)
}

fn extract_tool_calls(parts: &[ContentPart]) -> Vec<ToolCallInfo> {
    let mut calls = Vec::new();
    for part in parts {
        if let ContentPart::ToolCall { id, name, input } = part {
            crate::tools::record_start(&mut calls, id.clone(), name.clone(), input.clone());
        }
    }
    calls
}

fn result_output(content: &serde_json::Value, max_words: usize) -> String {
    extract_result_text(content)
        .map(|t| truncate_words(&t, max_words))
        .unwrap_or_default()
}

/// Match a dedicated tool-result message against previously emitted
/// messages' calls: exact id first, then most recent incomplete call with
/// the same name.
fn attach_to_prior(
    messages: &mut [TranscriptMessage],
    id: Option<&str>,
    name: Option<&str>,
    output: &str,
) -> bool {
    if let Some(id) = id {
        for msg in messages.iter_mut().rev() {
            if let Some(call) = msg
                .tool_calls
                .iter_mut()
                .find(|c| !c.completed && c.id == id)
            {
                call.output = Some(output.to_owned());
                call.completed = true;
                return true;
            }
        }
    }

    if let Some(name) = name {
        for msg in messages.iter_mut().rev() {
            if let Some(call) = msg
                .tool_calls
                .iter_mut()
                .rev()
                .find(|c| !c.completed && c.name == name)
            {
                call.output = Some(output.to_owned());
                call.completed = true;
                return true;
            }
        }
    }

    false
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    fn text_part(text: &str) -> ContentPart {
        ContentPart::Text {
            text: text.to_owned(),
        }
    }

    fn call_part(id: &str, name: &str) -> ContentPart {
        ContentPart::ToolCall {
            id: Some(id.to_owned()),
            name: name.to_owned(),
            input: None,
        }
    }

    fn result_part(id: Option<&str>, name: Option<&str>, text: &str) -> ContentPart {
        ContentPart::ToolResult {
            tool_call_id: id.map(str::to_owned),
            name: name.map(str::to_owned),
            content: serde_json::json!(text),
        }
    }

    fn user_msg(text: &str) -> HistoryMessage {
        HistoryMessage {
            role: HistoryRole::User,
            content: vec![text_part(text)],
        }
    }

    #[test]
    fn text_parts_are_trimmed_and_concatenated() {
        let history = vec![HistoryMessage {
            role: HistoryRole::Assistant,
            content: vec![text_part("  first  "), text_part("second")],
        }];
        let out = reconcile_history(&history, 120);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].text, "first\nsecond");
        assert!(!out[0].from_user);
    }

    #[test]
    fn inline_tool_results_merge_into_same_message() {
        let history = vec![HistoryMessage {
            role: HistoryRole::Assistant,
            content: vec![
                text_part("Listing files"),
                call_part("A", "ls"),
                result_part(Some("A"), Some("ls"), "file.txt"),
            ],
        }];
        let out = reconcile_history(&history, 120);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].tool_calls.len(), 1);
        assert!(out[0].tool_calls[0].completed);
        assert_eq!(out[0].tool_calls[0].output.as_deref(), Some("file.txt"));
    }

    #[test]
    fn dedicated_result_message_matches_prior_call() {
        let history = vec![
            HistoryMessage {
                role: HistoryRole::Assistant,
                content: vec![text_part("Running"), call_part("A", "ls")],
            },
            HistoryMessage {
                role: HistoryRole::ToolResult,
                content: vec![result_part(Some("A"), None, "done")],
            },
        ];
        let out = reconcile_history(&history, 120);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].tool_calls[0].output.as_deref(), Some("done"));
        assert!(out[0].tool_calls[0].completed);
    }

    #[test]
    fn orphan_result_message_becomes_standalone_record() {
        let history = vec![HistoryMessage {
            role: HistoryRole::ToolResult,
            content: vec![result_part(Some("Z"), Some("grep"), "lost page")],
        }];
        let out = reconcile_history(&history, 120);
        assert_eq!(out.len(), 1);
        assert!(out[0].text.is_empty());
        assert_eq!(out[0].tool_calls.len(), 1);
        assert_eq!(out[0].tool_calls[0].id, "Z");
        assert!(out[0].tool_calls[0].completed);
    }

    #[test]
    fn orphan_result_keeps_its_history_position() {
        let history = vec![
            user_msg("before"),
            HistoryMessage {
                role: HistoryRole::ToolResult,
                content: vec![result_part(Some("Z"), Some("grep"), "lost page")],
            },
            user_msg("after"),
        ];
        let out = reconcile_history(&history, 120);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].text, "before");
        assert_eq!(out[1].tool_calls[0].id, "Z");
        assert_eq!(out[2].text, "after");
    }

    #[test]
    fn heartbeat_traffic_is_filtered() {
        let history = vec![
            user_msg(HEARTBEAT_PROMPT),
            user_msg(&format!("context preamble\n{HEARTBEAT_PROMPT}")),
            HistoryMessage {
                role: HistoryRole::Assistant,
                content: vec![text_part(&format!("  {HEARTBEAT_SENTINEL}  "))],
            },
            user_msg("a real question"),
        ];
        let out = reconcile_history(&history, 120);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].text, "a real question");
    }

    #[test]
    fn heartbeat_lookalike_is_not_partially_matched() {
        // Streaming prefix heuristics must not apply: a message that merely
        // starts with the sentinel survives.
        let history = vec![HistoryMessage {
            role: HistoryRole::Assistant,
            content: vec![text_part(&format!("{HEARTBEAT_SENTINEL} and more"))],
        }];
        let out = reconcile_history(&history, 120);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn tool_output_is_word_truncated() {
        let long = "w ".repeat(300);
        let history = vec![HistoryMessage {
            role: HistoryRole::Assistant,
            content: vec![
                call_part("A", "cat"),
                result_part(Some("A"), None, &long),
            ],
        }];
        let out = reconcile_history(&history, 10);
        let output = out[0].tool_calls[0].output.as_deref().unwrap();
        assert!(output.ends_with(crate::tools::TRUNCATION_MARKER));
        assert!(output.len() < long.len());
    }

    #[test]
    fn empty_messages_are_skipped_without_reordering() {
        let history = vec![
            user_msg("one"),
            HistoryMessage {
                role: HistoryRole::Assistant,
                content: vec![text_part("   ")],
            },
            user_msg("two"),
        ];
        let out = reconcile_history(&history, 120);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].text, "one");
        assert_eq!(out[1].text, "two");
    }
}
