//! Streaming delta reconciliation.
//!
//! The transport may re-deliver, reorder, or resend overlapping fragments of
//! the in-flight response. [`StreamingSession`] merges them into one growing
//! authoritative string and decides which suffix, if any, is safe to forward
//! downstream (speech synthesis) incrementally.
//!
//! Literal prefix checks run before whitespace-normalized containment so two
//! unrelated fragments sharing a long substring collide as rarely as
//! possible; when only the normalized check matches, the longer fragment
//! wins wholesale and nothing is forwarded (no safe incremental delta).

use crate::protocol::HEARTBEAT_SENTINEL;
use crate::signal::{CompletionSignal, SessionOutcome};

/// Collapse runs of whitespace to single spaces.
fn normalize_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Mutable state for one in-flight response, created at send and destroyed
/// when its completion signal resolves. Never persisted.
#[derive(Debug)]
pub struct StreamingSession {
    /// Accumulated authoritative text so far.
    text: String,
    /// Watermark: everything before this byte offset has been forwarded.
    forwarded_len: usize,
    /// Last accepted sequence number.
    last_seq: Option<u64>,
    /// A tool invocation is currently executing.
    tool_active: bool,
    signal: CompletionSignal,
}

impl StreamingSession {
    /// Start a session around the given completion signal.
    #[must_use]
    pub fn new(signal: CompletionSignal) -> Self {
        Self {
            text: String::new(),
            forwarded_len: 0,
            last_seq: None,
            tool_active: false,
            signal,
        }
    }

    /// Accumulated text so far.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Whether a tool invocation is executing.
    #[must_use]
    pub fn tool_active(&self) -> bool {
        self.tool_active
    }

    /// Mark tool execution started/finished.
    pub fn set_tool_active(&mut self, active: bool) {
        self.tool_active = active;
    }

    /// Sequence gate. Non-terminal events must carry a strictly greater
    /// number than the last accepted one; terminal events may reuse the last
    /// number (the transport reuses it for the closing frame). Events
    /// without a number pass through.
    pub fn accept_seq(&mut self, seq: Option<u64>, terminal: bool) -> bool {
        let Some(seq) = seq else { return true };
        match self.last_seq {
            Some(last) if terminal => {
                if seq < last {
                    tracing::debug!(seq, last, "dropping stale terminal event");
                    return false;
                }
            }
            Some(last) => {
                if seq <= last {
                    tracing::debug!(seq, last, "dropping redelivered delta");
                    return false;
                }
            }
            None => {}
        }
        self.last_seq = Some(seq);
        true
    }

    /// Merge one inbound fragment. Returns the suffix that is safe to
    /// forward downstream, if any.
    pub fn apply_delta(&mut self, incoming: &str) -> Option<String> {
        if incoming.is_empty() {
            return None;
        }

        if self.text.is_empty() {
            // First fragment: accept verbatim.
            self.text.push_str(incoming);
            return self.drain_forwardable();
        }

        if let Some(suffix) = incoming.strip_prefix(self.text.as_str()) {
            // Literal prefix-extension: append only the new suffix.
            if suffix.is_empty() {
                return None;
            }
            self.text.push_str(suffix);
            return self.drain_forwardable();
        }

        let norm_incoming = normalize_ws(incoming);
        let norm_current = normalize_ws(&self.text);

        if incoming.len() > self.text.len() && norm_incoming.contains(&norm_current) {
            // Extension detected only after normalization: replace
            // wholesale. An incremental delta cannot be computed safely, so
            // the watermark jumps past the replacement.
            self.text.clear();
            self.text.push_str(incoming);
            self.forwarded_len = self.text.len();
            return None;
        }

        if norm_current.contains(&norm_incoming) {
            // Stale duplicate of content already merged.
            return None;
        }

        // No overlap recognized: best-effort recovery, concatenate.
        tracing::debug!(
            incoming_len = incoming.len(),
            accumulated_len = self.text.len(),
            "unrecognized fragment overlap, concatenating"
        );
        self.text.push_str(incoming);
        self.drain_forwardable()
    }

    /// Apply an authoritative final text from the terminal event. The
    /// accumulated text is replaced only when the final text is strictly
    /// more complete. Never forwards: incremental forwarding has already
    /// happened.
    pub fn apply_final(&mut self, final_text: Option<&str>) {
        if let Some(final_text) = final_text {
            let replace = final_text.len() > self.text.len()
                || !normalize_ws(final_text).starts_with(&normalize_ws(&self.text));
            if replace {
                self.text.clear();
                self.text.push_str(final_text);
            }
        }
        self.forwarded_len = self.text.len();
    }

    /// True when the complete response is exactly the liveness sentinel.
    #[must_use]
    pub fn is_heartbeat(&self) -> bool {
        self.text.trim() == HEARTBEAT_SENTINEL
    }

    /// Resolve the session's completion signal. Idempotent.
    pub fn resolve(&mut self, outcome: SessionOutcome) {
        self.signal.resolve(outcome);
    }

    /// Everything past the watermark, unless forwarding must be withheld
    /// because the text could still turn out to be the heartbeat sentinel.
    fn drain_forwardable(&mut self) -> Option<String> {
        let trimmed = self.text.trim_start();
        if HEARTBEAT_SENTINEL.starts_with(trimmed) {
            // Still a (possibly strict) prefix of the sentinel: hold back
            // until the text diverges or the terminal event decides.
            return None;
        }

        if self.forwarded_len >= self.text.len() {
            return None;
        }
        let suffix = self.text[self.forwarded_len..].to_owned();
        self.forwarded_len = self.text.len();
        Some(suffix)
    }
}
