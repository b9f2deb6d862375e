//! Tether: client-side session engine for a remote gateway agent.
//!
//! This crate keeps a local conversation transcript faithful to what a
//! remote agent is doing, over a connection that can drop, re-deliver, and
//! reorder:
//! - **Connection status**: Dual-role (operator + node) status resolved into
//!   a capability tier
//! - **Streaming**: Overlapping text deltas reconciled into one growing
//!   response, with incremental suffix forwarding for speech
//! - **Tool calls**: Start/end events correlated by id, name, or synthesis
//! - **Interrupts**: New sends, explicit aborts, and connection loss all
//!   finalize the in-flight response exactly once, with a visible marker
//! - **History**: The gateway's durable log reconciled into the transcript
//! - **Offline**: Messages queued while disconnected and re-sent under
//!   stable idempotency keys
//!
//! The engine owns no sockets. Hosts supply the transport, store, and
//! optional speech sink through the traits in [`transport`].

pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod history;
pub mod offline;
pub mod protocol;
pub mod signal;
pub mod streaming;
pub mod tools;
pub mod transcript;
pub mod transport;

pub use config::EngineConfig;
pub use connection::{Capabilities, CombinedStatus, RoleStatus, Severity, TieredStatus};
pub use engine::{EngineEvent, ProcessingState, SendStarted, SessionEngine};
pub use error::{Result, TetherError};
pub use offline::{CapacityWarning, OfflineMessage, SyncReport};
pub use protocol::{ChatEvent, InboundFrame};
pub use signal::{ResponseTicket, SessionOutcome};
pub use transcript::{ImageAttachment, ToolCallInfo, TranscriptMessage};
pub use transport::{
    ChatTransport, ConnectionTransport, MessageStore, OutgoingMessage, SendOutcome, SpeechSink,
};
