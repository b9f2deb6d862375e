//! Collaborator interfaces.
//!
//! Everything outside the reconciliation/delivery engine — the gateway
//! connection, the chat channel, the persistence store, and speech output —
//! is reached through these narrow traits so hosts and tests can supply
//! their own implementations.

use crate::connection::CombinedStatus;
use crate::error::Result;
use crate::protocol::HistoryMessage;
use crate::transcript::{ImageAttachment, TranscriptMessage};
use async_trait::async_trait;
use std::time::Duration;

/// An outgoing chat message in transport-neutral form.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    /// Message text.
    pub text: String,
    /// Attachment blobs (MIME + bytes).
    pub attachments: Vec<ImageAttachment>,
    /// Ask the gateway for an extended-thinking run.
    pub thinking: bool,
    /// Idempotency key; reused verbatim on every retry of the same logical
    /// send.
    pub idempotency_key: Option<String>,
}

/// Gateway response to a send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// A new run was started.
    Accepted {
        /// Gateway run identifier.
        run_id: String,
    },
    /// The idempotency key was already processed; the message landed from a
    /// prior attempt.
    Duplicate,
}

/// The persistent dual-role gateway connection.
#[async_trait]
pub trait ConnectionTransport: Send + Sync {
    /// Current combined role status.
    fn status(&self) -> CombinedStatus;

    /// Whether the auth token is missing.
    fn auth_token_missing(&self) -> bool;

    /// Establish the connection.
    async fn connect(&self) -> Result<()>;

    /// Best-effort reconnect of whatever roles are down.
    async fn reconnect(&self) -> Result<()>;

    /// Tear the connection down.
    async fn disconnect(&self) -> Result<()>;

    /// Drop and re-establish the connection unconditionally.
    async fn force_reconnect(&self) -> Result<()>;

    /// Generic request/response call on the operator role.
    async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value>;
}

/// The chat channel riding on the operator role.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Send a message; the response arrives on the event stream.
    async fn send(&self, message: OutgoingMessage) -> Result<SendOutcome>;

    /// Best-effort abort of the in-flight run.
    async fn abort(&self) -> Result<()>;

    /// Fetch the gateway's durable message log.
    async fn request_history(&self) -> Result<Vec<HistoryMessage>>;

    /// Clear any stale run state on the gateway side.
    async fn clear_run_state(&self) -> Result<()>;
}

/// Durable local message storage. Save/load contract only; internals are the
/// host's business.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist one message.
    async fn save_message(&self, message: &TranscriptMessage) -> Result<()>;

    /// Persist a full transcript, replacing what was there.
    async fn save_messages(&self, messages: &[TranscriptMessage]) -> Result<()>;

    /// Load the persisted transcript.
    async fn load_messages(&self) -> Result<Vec<TranscriptMessage>>;

    /// Remove everything.
    async fn clear_all_messages(&self) -> Result<()>;

    /// Drop messages older than the given age.
    async fn prune_older_than(&self, max_age: chrono::Duration) -> Result<()>;
}

/// Speech output sink. The engine only forwards incremental suffixes; pacing
/// and playback are the host's concern.
pub trait SpeechSink: Send + Sync {
    /// Queue text for synthesis.
    fn append_text(&self, text: &str);
    /// Response finished; synthesize whatever is buffered.
    fn flush(&self);
    /// Stop playback immediately (interrupt).
    fn stop(&self);
    /// Drop all buffered state.
    fn reset(&self);
}
