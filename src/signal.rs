//! One-shot completion signal with idempotent resolve.
//!
//! Each streaming session owns exactly one [`CompletionSignal`]; the send
//! path awaits the paired [`ResponseTicket`]. Resolving twice is a no-op, so
//! every finalization path can resolve unconditionally.

use tokio::sync::oneshot;

/// How a streaming session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The gateway finished the response normally.
    Completed,
    /// The session was cut short (new send, user abort, or disconnect).
    Interrupted,
    /// The gateway reported a run error.
    Failed(String),
}

/// Resolver half, owned by the streaming session.
#[derive(Debug)]
pub struct CompletionSignal {
    tx: Option<oneshot::Sender<SessionOutcome>>,
}

/// Awaitable half, returned to the send path.
#[derive(Debug)]
pub struct ResponseTicket {
    rx: oneshot::Receiver<SessionOutcome>,
}

/// Create a linked signal/ticket pair.
#[must_use]
pub fn completion_pair() -> (CompletionSignal, ResponseTicket) {
    let (tx, rx) = oneshot::channel();
    (CompletionSignal { tx: Some(tx) }, ResponseTicket { rx })
}

impl CompletionSignal {
    /// Resolve the signal. No-ops if already resolved or the ticket was
    /// dropped.
    pub fn resolve(&mut self, outcome: SessionOutcome) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(outcome);
        }
    }

    /// True once [`resolve`](Self::resolve) has run.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.tx.is_none()
    }
}

impl ResponseTicket {
    /// Wait for the session to finish.
    ///
    /// Returns [`SessionOutcome::Interrupted`] if the signal was dropped
    /// unresolved; no caller should hang on a vanished session.
    pub async fn wait(self) -> SessionOutcome {
        self.rx.await.unwrap_or(SessionOutcome::Interrupted)
    }
}
