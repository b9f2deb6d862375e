//! Configuration types for the session engine.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the gateway session engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Streaming / reconciliation settings.
    pub streaming: StreamingConfig,
    /// Offline queue settings.
    pub queue: QueueConfig,
    /// Reconnect and history-refresh timing.
    pub timing: TimingConfig,
}

/// Streaming reconciliation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Maximum number of words kept from a tool result before truncation.
    pub tool_output_max_words: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            tool_output_max_words: 120,
        }
    }
}

/// Offline queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Message count at which a capacity warning is raised.
    pub warn_message_count: usize,
    /// Serialized queue size in bytes at which a capacity warning is raised.
    pub warn_total_bytes: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            warn_message_count: 50,
            warn_total_bytes: 4 * 1024 * 1024,
        }
    }
}

/// Reconnect and history-refresh timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Bounded wait for a best-effort reconnect before queueing a send, in ms.
    pub reconnect_wait_ms: u64,
    /// Delay before re-fetching history after a finalize, letting the
    /// gateway's own persistence settle, in ms.
    pub history_settle_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            reconnect_wait_ms: 3_000,
            history_settle_ms: 600,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = EngineConfig::default();
        assert!(cfg.streaming.tool_output_max_words > 0);
        assert!(cfg.queue.warn_message_count > 0);
        assert!(cfg.timing.history_settle_ms < cfg.timing.reconnect_wait_ms);
    }

    #[test]
    fn partial_toml_like_json_fills_defaults() {
        let cfg: EngineConfig =
            serde_json::from_str(r#"{"queue":{"warn_message_count":5}}"#).unwrap();
        assert_eq!(cfg.queue.warn_message_count, 5);
        assert_eq!(cfg.streaming.tool_output_max_words, 120);
    }
}
