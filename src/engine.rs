//! Session engine.
//!
//! Owns the transcript, the live streaming message, and the interrupt/abort
//! state machine. All engine state is mutated from one logical execution
//! context: inbound protocol events are marshalled onto that context by the
//! host and applied through [`SessionEngine::handle_event`]. The send path
//! returns a [`ResponseTicket`] so the caller can await the response while
//! the engine keeps applying events.
//!
//! Exactly one finalization path runs per streaming session: success, error,
//! and the three interrupt flavors all funnel through taking the session out
//! of its slot, and the completion signal's idempotent resolve backstops any
//! overlap.

use crate::config::EngineConfig;
use crate::connection::{Capabilities, CombinedStatus, TieredStatus, resolve_status};
use crate::error::{Result, TetherError};
use crate::history::reconcile_history;
use crate::offline::{CapacityWarning, OfflineQueue, SyncReport};
use crate::protocol::{ChatEvent, extract_result_text};
use crate::signal::{ResponseTicket, SessionOutcome, completion_pair};
use crate::streaming::StreamingSession;
use crate::tools;
use crate::transcript::{ImageAttachment, TranscriptMessage};
use crate::transport::{
    ChatTransport, ConnectionTransport, MessageStore, OutgoingMessage, SendOutcome, SpeechSink,
};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;

/// Marker appended when a new send supersedes a streaming response.
pub const INTERRUPTED_MARKER: &str = "[interrupted]";

/// Marker appended when the user explicitly aborts a response.
pub const CANCELLED_MARKER: &str = "[Response cancelled]";

/// Marker appended when the transport drops mid-response.
pub const CONNECTION_LOST_MARKER: &str = "[connection lost]";

/// What the engine is doing right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingState {
    Idle,
    Thinking,
    Responding,
    /// A tool is executing; carries the tool name.
    UsingTool(String),
}

/// Engine notifications for host UIs.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Tiered connection status changed.
    Status(TieredStatus),
    /// Processing state changed.
    Processing(ProcessingState),
    /// A message was appended to the transcript.
    MessageAppended(TranscriptMessage),
    /// The offline queue crossed a capacity threshold.
    QueueCapacity(CapacityWarning),
    /// The offline queue's pending count changed.
    QueuePending { pending: usize },
}

/// Result of starting a send.
#[derive(Debug)]
pub enum SendStarted {
    /// The gateway accepted the send; await the ticket for the response.
    Sent {
        /// Resolves when the session finalizes.
        ticket: ResponseTicket,
    },
    /// Chat capability was absent; the message is queued for later sync.
    Queued {
        /// Idempotency key the queued item will reuse on every retry.
        key: String,
        /// Messages now pending.
        pending: usize,
        /// Capacity warning, if a threshold was crossed.
        warning: Option<CapacityWarning>,
    },
    /// The transport rejected the send. The session was finalized and the
    /// payload is handed back for a possible retry.
    Failed {
        /// The message that did not go out.
        payload: OutgoingMessage,
        /// Transport error text.
        error: String,
    },
}

/// A persistence write, applied by the ordered worker.
enum PersistJob {
    Save(TranscriptMessage),
    Replace(Vec<TranscriptMessage>),
    Clear(oneshot::Sender<Result<()>>),
}

/// One worker consumes all persistence writes so they land in the order the
/// engine issued them, even when individual store calls are slow.
fn spawn_persist_worker(store: Arc<dyn MessageStore>) -> mpsc::UnboundedSender<PersistJob> {
    let (tx, mut rx) = mpsc::unbounded_channel::<PersistJob>();
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            match job {
                PersistJob::Save(message) => {
                    if let Err(e) = store.save_message(&message).await {
                        tracing::warn!("failed to persist message: {e}");
                    }
                }
                PersistJob::Replace(messages) => {
                    if let Err(e) = store.save_messages(&messages).await {
                        tracing::warn!("failed to persist transcript: {e}");
                    }
                }
                PersistJob::Clear(ack) => {
                    let _ = ack.send(store.clear_all_messages().await);
                }
            }
        }
    });
    tx
}

/// The reconciliation/delivery engine for one gateway conversation.
pub struct SessionEngine {
    config: EngineConfig,
    connection: Arc<dyn ConnectionTransport>,
    chat: Arc<dyn ChatTransport>,
    store: Arc<dyn MessageStore>,
    speech: Option<Arc<dyn SpeechSink>>,
    events_tx: broadcast::Sender<EngineEvent>,
    persist_tx: mpsc::UnboundedSender<PersistJob>,

    transcript: Vec<TranscriptMessage>,
    /// The in-progress assistant message, tracked separately from the
    /// transcript until finalize.
    live: Option<TranscriptMessage>,
    session: Option<StreamingSession>,
    /// Raised while a user-initiated cancel is in flight; inbound events for
    /// the superseded session are dropped rather than processed.
    suppress_events: bool,
    state: ProcessingState,
    status: TieredStatus,
    queue: OfflineQueue,
}

impl SessionEngine {
    /// Build an engine around its collaborators. Spawns the ordered
    /// persistence worker, so this must run inside a Tokio runtime.
    pub fn new(
        config: EngineConfig,
        connection: Arc<dyn ConnectionTransport>,
        chat: Arc<dyn ChatTransport>,
        store: Arc<dyn MessageStore>,
    ) -> Self {
        let status = resolve_status(connection.status(), connection.auth_token_missing());
        let (events_tx, _) = broadcast::channel(64);
        let queue = OfflineQueue::new(config.queue.clone());
        let persist_tx = spawn_persist_worker(Arc::clone(&store));
        Self {
            config,
            connection,
            chat,
            store,
            speech: None,
            events_tx,
            persist_tx,
            transcript: Vec::new(),
            live: None,
            session: None,
            suppress_events: false,
            state: ProcessingState::Idle,
            status,
            queue,
        }
    }

    /// Attach a speech sink for incremental suffix forwarding.
    #[must_use]
    pub fn with_speech(mut self, speech: Arc<dyn SpeechSink>) -> Self {
        self.speech = Some(speech);
        self
    }

    /// Subscribe to engine notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events_tx.subscribe()
    }

    /// Engine notifications as a `Stream`, for hosts that drive a select
    /// loop. Slow consumers see `BroadcastStreamRecvError::Lagged`.
    #[must_use]
    pub fn event_stream(&self) -> BroadcastStream<EngineEvent> {
        BroadcastStream::new(self.events_tx.subscribe())
    }

    /// The transcript (finalized messages only).
    #[must_use]
    pub fn transcript(&self) -> &[TranscriptMessage] {
        &self.transcript
    }

    /// The live streaming message, if a response is in flight.
    #[must_use]
    pub fn live_message(&self) -> Option<&TranscriptMessage> {
        self.live.as_ref()
    }

    /// Current tiered connection status.
    #[must_use]
    pub fn status(&self) -> &TieredStatus {
        &self.status
    }

    /// Current processing state.
    #[must_use]
    pub fn processing_state(&self) -> &ProcessingState {
        &self.state
    }

    /// Messages waiting in the offline queue.
    #[must_use]
    pub fn queue_pending(&self) -> usize {
        self.queue.pending_count()
    }

    /// Serializable snapshot of the offline queue, for hosts that persist
    /// queued messages across restarts.
    #[must_use]
    pub fn queue_snapshot(&self) -> Vec<crate::offline::OfflineMessage> {
        self.queue.snapshot()
    }

    /// Restore a previously snapshotted offline queue.
    pub fn restore_queue(&mut self, items: Vec<crate::offline::OfflineMessage>) {
        self.queue.restore(items);
        self.emit(EngineEvent::QueuePending {
            pending: self.queue.pending_count(),
        });
    }

    // -----------------------------------------------------------------------
    // Send path
    // -----------------------------------------------------------------------

    /// Send a user message, superseding any in-flight response.
    ///
    /// When chat capability is absent even after a bounded reconnect wait,
    /// the message is queued instead; queueing is informational, never a
    /// hard failure. On [`SendStarted::Sent`], await the ticket for the
    /// response while continuing to feed [`handle_event`](Self::handle_event).
    pub async fn send_message(
        &mut self,
        text: String,
        attachments: Vec<ImageAttachment>,
        thinking: bool,
    ) -> SendStarted {
        // A new send during streaming cancels the old session first.
        if self.session.is_some() {
            self.interrupt_with(INTERRUPTED_MARKER, true).await;
        }

        if !self.current_capabilities().chat_available {
            self.try_reconnect_bounded().await;
        }

        let user = TranscriptMessage::user(text.clone(), attachments.clone());
        self.transcript.push(user.clone());
        self.persist(user.clone());
        self.emit(EngineEvent::MessageAppended(user));

        if !self.current_capabilities().chat_available {
            let (key, warning) = self.queue.enqueue(text, attachments, thinking);
            tracing::info!(%key, pending = self.queue.pending_count(), "chat offline, message queued");
            if let Some(w) = warning {
                self.emit(EngineEvent::QueueCapacity(w));
            }
            let pending = self.queue.pending_count();
            self.emit(EngineEvent::QueuePending { pending });
            self.suppress_events = false;
            return SendStarted::Queued {
                key,
                pending,
                warning,
            };
        }

        let (signal, ticket) = completion_pair();
        self.session = Some(StreamingSession::new(signal));
        self.live = Some(TranscriptMessage::assistant_streaming());
        self.set_state(ProcessingState::Thinking);

        let outgoing = OutgoingMessage {
            text,
            attachments,
            thinking,
            idempotency_key: Some(uuid::Uuid::new_v4().to_string()),
        };

        match self.chat.send(outgoing.clone()).await {
            Ok(SendOutcome::Accepted { run_id }) => {
                tracing::debug!(%run_id, "send accepted");
                // The gateway has moved on to the new run; late events for
                // the superseded session can no longer arrive.
                self.suppress_events = false;
                SendStarted::Sent { ticket }
            }
            Ok(SendOutcome::Duplicate) => {
                // A fresh key reported duplicate: the message already landed.
                tracing::warn!("fresh send reported as duplicate by gateway");
                if let Some(mut session) = self.session.take() {
                    session.resolve(SessionOutcome::Completed);
                }
                self.live = None;
                self.suppress_events = false;
                self.set_state(ProcessingState::Idle);
                SendStarted::Sent { ticket }
            }
            Err(e) => {
                // Force finalization so no caller hangs, and hand the
                // payload back for retry.
                let error = e.to_string();
                tracing::warn!("send failed: {error}");
                if let Some(mut session) = self.session.take() {
                    session.resolve(SessionOutcome::Failed(error.clone()));
                }
                self.live = None;
                self.suppress_events = false;
                self.set_state(ProcessingState::Idle);
                SendStarted::Failed {
                    payload: outgoing,
                    error,
                }
            }
        }
    }

    /// Explicit user abort of the in-flight response.
    pub async fn abort(&mut self) {
        self.interrupt_with(CANCELLED_MARKER, true).await;
    }

    // -----------------------------------------------------------------------
    // Inbound events
    // -----------------------------------------------------------------------

    /// Apply one inbound chat event.
    pub async fn handle_event(&mut self, event: ChatEvent) {
        if self.suppress_events {
            tracing::debug!("dropping inbound event for superseded session");
            return;
        }
        if self.session.is_none() && !matches!(event, ChatEvent::AgentStatus { .. }) {
            tracing::debug!("dropping inbound event with no active session");
            return;
        }

        match event {
            ChatEvent::TextDelta { text, seq } => {
                let Some(session) = self.session.as_mut() else { return };
                if !session.accept_seq(seq, false) {
                    return;
                }
                let forward = session.apply_delta(&text);
                let full = session.text().to_owned();
                if let Some(live) = self.live.as_mut() {
                    live.text = full;
                }
                if let Some(suffix) = forward
                    && let Some(sink) = self.speech.as_ref()
                {
                    sink.append_text(&suffix);
                }
                self.set_state(ProcessingState::Responding);
            }

            ChatEvent::ThinkingDelta { seq } => {
                let Some(session) = self.session.as_mut() else { return };
                if !session.accept_seq(seq, false) {
                    return;
                }
                self.set_state(ProcessingState::Thinking);
            }

            ChatEvent::ToolCallStart { name, id } => {
                if let Some(session) = self.session.as_mut() {
                    session.set_tool_active(true);
                }
                if let Some(live) = self.live.as_mut() {
                    tools::record_start(&mut live.tool_calls, id, name.clone(), None);
                }
                self.set_state(ProcessingState::UsingTool(name));
            }

            ChatEvent::ToolCallEnd { name, id, result } => {
                let output = extract_result_text(&result)
                    .map(|t| tools::truncate_words(&t, self.config.streaming.tool_output_max_words))
                    .unwrap_or_default();
                if let Some(live) = self.live.as_mut() {
                    tools::attach_result(
                        &mut live.tool_calls,
                        id.as_deref(),
                        Some(name.as_str()),
                        output,
                    );
                }
                if let Some(session) = self.session.as_mut() {
                    session.set_tool_active(false);
                }
                self.set_state(ProcessingState::Thinking);
            }

            ChatEvent::Done { final_text, seq } => {
                let Some(session) = self.session.as_mut() else { return };
                if !session.accept_seq(seq, true) {
                    return;
                }
                session.apply_final(final_text.as_deref());
                self.finalize_success();
            }

            ChatEvent::Error { message, seq } => {
                let Some(session) = self.session.as_mut() else { return };
                if !session.accept_seq(seq, true) {
                    return;
                }
                self.finalize_error(message);
            }

            ChatEvent::AgentStatus { status } => match status.as_str() {
                "thinking" => self.set_state(ProcessingState::Thinking),
                "responding" => self.set_state(ProcessingState::Responding),
                other => tracing::debug!(status = other, "unmapped agent status"),
            },
        }
    }

    // -----------------------------------------------------------------------
    // Connection + queue
    // -----------------------------------------------------------------------

    /// Apply a dual-role status update from the connection transport.
    ///
    /// A transport drop while streaming interrupts the session with the
    /// connection-lost marker; regained chat capability triggers an offline
    /// queue sync.
    pub async fn apply_connection_status(
        &mut self,
        combined: CombinedStatus,
        auth_token_missing: bool,
    ) {
        let tiered = resolve_status(combined, auth_token_missing);
        let was_chat = self.status.capabilities.chat_available;
        let now_chat = tiered.capabilities.chat_available;
        tracing::info!(label = tiered.label, "connection status: {combined:?}");
        self.status = tiered.clone();
        self.emit(EngineEvent::Status(tiered));

        if was_chat && !now_chat && self.session.is_some() {
            self.interrupt_with(CONNECTION_LOST_MARKER, false).await;
        }
        if !was_chat && now_chat && !self.queue.is_empty() {
            self.sync_offline_queue().await;
        }
    }

    /// Resend queued messages in enqueue order.
    pub async fn sync_offline_queue(&mut self) -> SyncReport {
        self.suppress_events = false;
        let report = self.queue.sync(self.chat.as_ref()).await;
        tracing::info!(
            delivered = report.delivered,
            duplicates = report.duplicates,
            failed = report.failed,
            "offline queue sync finished"
        );
        self.emit(EngineEvent::QueuePending {
            pending: self.queue.pending_count(),
        });
        report
    }

    /// Manual retry of one queued message, reusing its idempotency key.
    ///
    /// # Errors
    ///
    /// See [`OfflineQueue::retry`].
    pub async fn retry_queued(&mut self, key: &str) -> Result<SendOutcome> {
        let outcome = self.queue.retry(key, self.chat.as_ref()).await?;
        self.emit(EngineEvent::QueuePending {
            pending: self.queue.pending_count(),
        });
        Ok(outcome)
    }

    // -----------------------------------------------------------------------
    // History + persistence
    // -----------------------------------------------------------------------

    /// Replace the transcript from the gateway's durable log.
    ///
    /// Waits the configured settle delay first so the gateway's own
    /// finalization lands. Any live streaming state is reset before the
    /// replacement so a stale streaming message cannot resurrect as a
    /// duplicate.
    ///
    /// # Errors
    ///
    /// The transport error if the history fetch fails; local state is
    /// untouched in that case.
    pub async fn refresh_history(&mut self) -> Result<()> {
        tokio::time::sleep(Duration::from_millis(self.config.timing.history_settle_ms)).await;
        let history = self.chat.request_history().await?;

        if let Some(mut session) = self.session.take() {
            session.resolve(SessionOutcome::Interrupted);
        }
        self.live = None;
        self.suppress_events = false;

        self.transcript =
            reconcile_history(&history, self.config.streaming.tool_output_max_words);
        self.persist_all(self.transcript.clone());
        self.set_state(ProcessingState::Idle);
        tracing::debug!(messages = self.transcript.len(), "transcript replaced from history");
        Ok(())
    }

    /// Load the locally persisted transcript (startup).
    ///
    /// # Errors
    ///
    /// The store error if loading fails.
    pub async fn load_persisted(&mut self) -> Result<()> {
        self.transcript = self.store.load_messages().await?;
        Ok(())
    }

    /// Clear the transcript locally, in the store, and on the gateway.
    ///
    /// The store clear goes through the ordered persistence worker so a
    /// pending save cannot land after it.
    ///
    /// # Errors
    ///
    /// The store error if clearing fails; the gateway-side clear is
    /// best-effort.
    pub async fn clear_transcript(&mut self) -> Result<()> {
        self.transcript.clear();
        self.live = None;

        let (ack_tx, ack_rx) = oneshot::channel();
        self.persist_tx
            .send(PersistJob::Clear(ack_tx))
            .map_err(|_| TetherError::Channel("persistence worker stopped".to_owned()))?;
        ack_rx
            .await
            .map_err(|_| TetherError::Channel("persistence worker stopped".to_owned()))??;

        if let Err(e) = self.chat.clear_run_state().await {
            tracing::debug!("clear_run_state failed: {e}");
        }
        Ok(())
    }

    /// Drop persisted messages older than the given age.
    ///
    /// # Errors
    ///
    /// The store error if pruning fails.
    pub async fn prune_persisted(&self, max_age: chrono::Duration) -> Result<()> {
        self.store.prune_older_than(max_age).await
    }

    // -----------------------------------------------------------------------
    // Finalization (exactly once per session)
    // -----------------------------------------------------------------------

    fn finalize_success(&mut self) {
        let Some(mut session) = self.session.take() else { return };
        let live = self.live.take();

        let heartbeat = session.is_heartbeat();
        let mut message = live.unwrap_or_else(TranscriptMessage::assistant_streaming);
        message.text = session.text().to_owned();
        message.is_streaming = false;

        if heartbeat {
            tracing::debug!("suppressing heartbeat reply");
            if let Some(sink) = &self.speech {
                sink.reset();
            }
        } else if !message.text.trim().is_empty() || !message.tool_calls.is_empty() {
            self.transcript.push(message.clone());
            self.persist(message.clone());
            self.emit(EngineEvent::MessageAppended(message));
            if let Some(sink) = &self.speech {
                sink.flush();
            }
        }

        session.resolve(SessionOutcome::Completed);
        self.set_state(ProcessingState::Idle);
    }

    fn finalize_error(&mut self, error_text: String) {
        let Some(mut session) = self.session.take() else { return };
        let live = self.live.take();

        let mut message = live.unwrap_or_else(TranscriptMessage::assistant_streaming);
        let accumulated = session.text().trim().to_owned();
        message.text = if accumulated.is_empty() {
            error_text.clone()
        } else {
            format!("{accumulated}\n\n{error_text}")
        };
        message.is_streaming = false;

        self.transcript.push(message.clone());
        self.persist(message.clone());
        self.emit(EngineEvent::MessageAppended(message));
        if let Some(sink) = &self.speech {
            sink.stop();
        }

        session.resolve(SessionOutcome::Failed(error_text));
        self.set_state(ProcessingState::Idle);
    }

    /// Finalize the in-flight session as interrupted, appending `marker`.
    /// Resolves the completion signal before any cleanup so an awaiting
    /// sender unblocks, and raises suppression so late events for the
    /// superseded session are dropped.
    async fn interrupt_with(&mut self, marker: &str, notify_gateway: bool) {
        let Some(mut session) = self.session.take() else { return };
        self.suppress_events = true;

        if notify_gateway
            && let Err(e) = self.chat.abort().await
        {
            tracing::debug!("abort signal failed: {e}");
        }

        let live = self.live.take();
        let accumulated = session.text().to_owned();
        session.resolve(SessionOutcome::Interrupted);

        let mut message = live.unwrap_or_else(TranscriptMessage::assistant_streaming);
        // Whichever partial text is non-empty survives under the marker.
        let base = if message.text.is_empty() {
            accumulated
        } else {
            message.text.clone()
        };
        message.text = if base.is_empty() {
            marker.to_owned()
        } else {
            format!("{base}\n\n{marker}")
        };
        message.interrupted = true;
        message.is_streaming = false;

        if let Some(sink) = &self.speech {
            sink.stop();
        }

        self.transcript.push(message.clone());
        self.persist(message.clone());
        self.emit(EngineEvent::MessageAppended(message));
        self.set_state(ProcessingState::Idle);
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn current_capabilities(&self) -> Capabilities {
        resolve_status(
            self.connection.status(),
            self.connection.auth_token_missing(),
        )
        .capabilities
    }

    async fn try_reconnect_bounded(&self) {
        if let Err(e) = self.connection.reconnect().await {
            tracing::debug!("best-effort reconnect failed: {e}");
        }
        let deadline =
            Instant::now() + Duration::from_millis(self.config.timing.reconnect_wait_ms);
        while Instant::now() < deadline {
            if self.current_capabilities().chat_available {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Persist fire-and-forget but ordered: writes are issued immediately
    /// after the transcript mutation that triggered them and applied by the
    /// single worker in issue order, so a save issued before a transcript
    /// replacement can never land after it.
    fn persist(&self, message: TranscriptMessage) {
        let _ = self.persist_tx.send(PersistJob::Save(message));
    }

    fn persist_all(&self, messages: Vec<TranscriptMessage>) {
        let _ = self.persist_tx.send(PersistJob::Replace(messages));
    }

    fn set_state(&mut self, state: ProcessingState) {
        if self.state != state {
            self.state = state.clone();
            self.emit(EngineEvent::Processing(state));
        }
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::error::TetherError;
    use crate::protocol::{ContentPart, HistoryMessage, HistoryRole};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct StubConnection {
        status: Mutex<CombinedStatus>,
        auth_missing: bool,
    }

    impl StubConnection {
        fn with_status(status: CombinedStatus) -> Arc<Self> {
            Arc::new(Self {
                status: Mutex::new(status),
                auth_missing: false,
            })
        }

        fn set_status(&self, status: CombinedStatus) {
            *self.status.lock().unwrap() = status;
        }
    }

    #[async_trait::async_trait]
    impl ConnectionTransport for StubConnection {
        fn status(&self) -> CombinedStatus {
            *self.status.lock().unwrap()
        }

        fn auth_token_missing(&self) -> bool {
            self.auth_missing
        }

        async fn connect(&self) -> Result<()> {
            Ok(())
        }

        async fn reconnect(&self) -> Result<()> {
            Ok(())
        }

        async fn disconnect(&self) -> Result<()> {
            Ok(())
        }

        async fn force_reconnect(&self) -> Result<()> {
            Ok(())
        }

        async fn call(
            &self,
            _method: &str,
            _params: serde_json::Value,
            _timeout: Duration,
        ) -> Result<serde_json::Value> {
            Ok(serde_json::Value::Null)
        }
    }

    #[derive(Default)]
    struct StubChat {
        /// Scripted send outcomes; empty script means every send is accepted.
        outcomes: Mutex<VecDeque<Result<SendOutcome>>>,
        sent: Mutex<Vec<OutgoingMessage>>,
        aborts: Mutex<usize>,
        history: Mutex<Vec<HistoryMessage>>,
    }

    impl StubChat {
        fn script(outcomes: Vec<Result<SendOutcome>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                ..Self::default()
            })
        }

        fn abort_count(&self) -> usize {
            *self.aborts.lock().unwrap()
        }

        fn sent_count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    #[async_trait::async_trait]
    impl ChatTransport for StubChat {
        async fn send(&self, message: OutgoingMessage) -> Result<SendOutcome> {
            self.sent.lock().unwrap().push(message);
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(SendOutcome::Accepted {
                    run_id: "run-1".to_owned(),
                }))
        }

        async fn abort(&self) -> Result<()> {
            *self.aborts.lock().unwrap() += 1;
            Ok(())
        }

        async fn request_history(&self) -> Result<Vec<HistoryMessage>> {
            Ok(self.history.lock().unwrap().clone())
        }

        async fn clear_run_state(&self) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct NullStore;

    #[async_trait::async_trait]
    impl MessageStore for NullStore {
        async fn save_message(&self, _message: &TranscriptMessage) -> Result<()> {
            Ok(())
        }

        async fn save_messages(&self, _messages: &[TranscriptMessage]) -> Result<()> {
            Ok(())
        }

        async fn load_messages(&self) -> Result<Vec<TranscriptMessage>> {
            Ok(Vec::new())
        }

        async fn clear_all_messages(&self) -> Result<()> {
            Ok(())
        }

        async fn prune_older_than(&self, _max_age: chrono::Duration) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingSpeech {
        appended: Mutex<Vec<String>>,
        stops: Mutex<usize>,
        flushes: Mutex<usize>,
    }

    impl SpeechSink for RecordingSpeech {
        fn append_text(&self, text: &str) {
            self.appended.lock().unwrap().push(text.to_owned());
        }

        fn flush(&self) {
            *self.flushes.lock().unwrap() += 1;
        }

        fn stop(&self) {
            *self.stops.lock().unwrap() += 1;
        }

        fn reset(&self) {}
    }

    fn test_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.timing.reconnect_wait_ms = 0;
        config.timing.history_settle_ms = 0;
        config
    }

    fn online_engine(chat: Arc<StubChat>) -> SessionEngine {
        SessionEngine::new(
            test_config(),
            StubConnection::with_status(CombinedStatus::Connected),
            chat,
            Arc::new(NullStore),
        )
    }

    async fn expect_ticket(started: SendStarted) -> ResponseTicket {
        match started {
            SendStarted::Sent { ticket } => ticket,
            other => panic!("expected Sent, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_then_done_appends_assistant_message() {
        let chat = StubChat::script(vec![]);
        let mut engine = online_engine(Arc::clone(&chat));

        let ticket = expect_ticket(engine.send_message("hi".to_owned(), vec![], false).await).await;
        engine
            .handle_event(ChatEvent::TextDelta {
                text: "Hello".to_owned(),
                seq: Some(1),
            })
            .await;
        engine
            .handle_event(ChatEvent::TextDelta {
                text: "Hello there".to_owned(),
                seq: Some(2),
            })
            .await;
        engine
            .handle_event(ChatEvent::Done {
                final_text: None,
                seq: Some(2),
            })
            .await;

        assert_eq!(ticket.wait().await, SessionOutcome::Completed);
        let last = engine.transcript().last().unwrap();
        assert_eq!(last.text, "Hello there");
        assert!(!last.from_user);
        assert!(!last.is_streaming);
        assert_eq!(*engine.processing_state(), ProcessingState::Idle);
        assert!(engine.live_message().is_none());
    }

    #[tokio::test]
    async fn stale_thinking_delta_does_not_regress_state() {
        let chat = StubChat::script(vec![]);
        let mut engine = online_engine(Arc::clone(&chat));

        let _ticket =
            expect_ticket(engine.send_message("hi".to_owned(), vec![], false).await).await;
        engine
            .handle_event(ChatEvent::TextDelta {
                text: "Hello".to_owned(),
                seq: Some(2),
            })
            .await;
        assert_eq!(*engine.processing_state(), ProcessingState::Responding);

        // A thinking notification from before the delta arrives late; the
        // sequence gate drops it.
        engine
            .handle_event(ChatEvent::ThinkingDelta { seq: Some(1) })
            .await;
        assert_eq!(*engine.processing_state(), ProcessingState::Responding);

        // A fresh one moves the state forward normally.
        engine
            .handle_event(ChatEvent::ThinkingDelta { seq: Some(3) })
            .await;
        assert_eq!(*engine.processing_state(), ProcessingState::Thinking);
    }

    #[tokio::test]
    async fn new_send_interrupts_streaming_response() {
        let chat = StubChat::script(vec![]);
        let mut engine = online_engine(Arc::clone(&chat));

        let first = expect_ticket(engine.send_message("one".to_owned(), vec![], false).await).await;
        engine
            .handle_event(ChatEvent::TextDelta {
                text: "Hello wor".to_owned(),
                seq: Some(1),
            })
            .await;

        let _second =
            expect_ticket(engine.send_message("two".to_owned(), vec![], false).await).await;

        assert_eq!(first.wait().await, SessionOutcome::Interrupted);
        assert_eq!(chat.abort_count(), 1);

        let interrupted = engine
            .transcript()
            .iter()
            .find(|m| m.interrupted)
            .expect("interrupted message in transcript");
        assert_eq!(interrupted.text, "Hello wor\n\n[interrupted]");
        assert!(!interrupted.is_streaming);
    }

    #[tokio::test]
    async fn abort_without_text_appends_marker_only() {
        let chat = StubChat::script(vec![]);
        let mut engine = online_engine(Arc::clone(&chat));

        let ticket =
            expect_ticket(engine.send_message("stop me".to_owned(), vec![], false).await).await;
        engine.abort().await;

        assert_eq!(ticket.wait().await, SessionOutcome::Interrupted);
        let last = engine.transcript().last().unwrap();
        assert_eq!(last.text, CANCELLED_MARKER);
        assert!(last.interrupted);
    }

    #[tokio::test]
    async fn events_after_interrupt_are_suppressed() {
        let chat = StubChat::script(vec![]);
        let mut engine = online_engine(Arc::clone(&chat));

        let _ticket =
            expect_ticket(engine.send_message("one".to_owned(), vec![], false).await).await;
        engine.abort().await;

        // Late event for the superseded session.
        engine
            .handle_event(ChatEvent::TextDelta {
                text: "stale".to_owned(),
                seq: Some(9),
            })
            .await;
        assert!(engine.live_message().is_none());
        assert!(!engine.transcript().iter().any(|m| m.text.contains("stale")));
    }

    #[tokio::test]
    async fn heartbeat_reply_never_surfaces() {
        let chat = StubChat::script(vec![]);
        let speech = Arc::new(RecordingSpeech::default());
        let mut engine =
            online_engine(Arc::clone(&chat)).with_speech(Arc::clone(&speech) as Arc<dyn SpeechSink>);

        let ticket = expect_ticket(
            engine
                .send_message(crate::protocol::HEARTBEAT_PROMPT.to_owned(), vec![], false)
                .await,
        )
        .await;
        engine
            .handle_event(ChatEvent::TextDelta {
                text: "HEARTBEAT_OK".to_owned(),
                seq: Some(1),
            })
            .await;
        engine
            .handle_event(ChatEvent::Done {
                final_text: None,
                seq: Some(1),
            })
            .await;

        assert_eq!(ticket.wait().await, SessionOutcome::Completed);
        // Only the user message surfaced; nothing was spoken.
        assert!(engine.transcript().iter().all(|m| m.from_user));
        assert!(speech.appended.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn error_event_finalizes_with_failure() {
        let chat = StubChat::script(vec![]);
        let mut engine = online_engine(Arc::clone(&chat));

        let ticket = expect_ticket(engine.send_message("hi".to_owned(), vec![], false).await).await;
        engine
            .handle_event(ChatEvent::TextDelta {
                text: "partial".to_owned(),
                seq: Some(1),
            })
            .await;
        engine
            .handle_event(ChatEvent::Error {
                message: "boom".to_owned(),
                seq: Some(1),
            })
            .await;

        assert_eq!(ticket.wait().await, SessionOutcome::Failed("boom".to_owned()));
        let last = engine.transcript().last().unwrap();
        assert_eq!(last.text, "partial\n\nboom");
    }

    #[tokio::test]
    async fn transport_rejection_returns_payload() {
        let chat = StubChat::script(vec![Err(TetherError::Transport("down".to_owned()))]);
        let mut engine = online_engine(Arc::clone(&chat));

        match engine.send_message("hi".to_owned(), vec![], true).await {
            SendStarted::Failed { payload, error } => {
                assert_eq!(payload.text, "hi");
                assert!(payload.thinking);
                assert!(payload.idempotency_key.is_some());
                assert!(error.contains("down"));
            }
            other => panic!("expected Failed, got {other:?}"),
        }
        assert_eq!(*engine.processing_state(), ProcessingState::Idle);
    }

    #[tokio::test]
    async fn offline_send_queues_instead_of_failing() {
        let chat = StubChat::script(vec![]);
        let connection = StubConnection::with_status(CombinedStatus::Disconnected);
        let mut engine = SessionEngine::new(
            test_config(),
            Arc::clone(&connection) as Arc<dyn ConnectionTransport>,
            Arc::clone(&chat) as Arc<dyn ChatTransport>,
            Arc::new(NullStore),
        );

        match engine.send_message("later".to_owned(), vec![], false).await {
            SendStarted::Queued { pending, .. } => assert_eq!(pending, 1),
            other => panic!("expected Queued, got {other:?}"),
        }
        assert_eq!(engine.queue_pending(), 1);
        assert_eq!(chat.sent_count(), 0);

        // Chat capability regained: the queue drains.
        connection.set_status(CombinedStatus::Connected);
        engine
            .apply_connection_status(CombinedStatus::Connected, false)
            .await;
        assert_eq!(engine.queue_pending(), 0);
        assert_eq!(chat.sent_count(), 1);
    }

    #[tokio::test]
    async fn connection_loss_interrupts_without_gateway_abort() {
        let chat = StubChat::script(vec![]);
        let mut engine = online_engine(Arc::clone(&chat));

        let ticket = expect_ticket(engine.send_message("hi".to_owned(), vec![], false).await).await;
        engine
            .handle_event(ChatEvent::TextDelta {
                text: "mid-sentence".to_owned(),
                seq: Some(1),
            })
            .await;

        engine
            .apply_connection_status(CombinedStatus::Disconnected, false)
            .await;

        assert_eq!(ticket.wait().await, SessionOutcome::Interrupted);
        assert_eq!(chat.abort_count(), 0);
        let last = engine.transcript().last().unwrap();
        assert_eq!(last.text, "mid-sentence\n\n[connection lost]");
    }

    #[tokio::test]
    async fn tool_call_events_update_live_message() {
        let chat = StubChat::script(vec![]);
        let mut engine = online_engine(Arc::clone(&chat));

        let ticket = expect_ticket(engine.send_message("hi".to_owned(), vec![], false).await).await;
        engine
            .handle_event(ChatEvent::ToolCallStart {
                name: "read_file".to_owned(),
                id: Some("call-1".to_owned()),
            })
            .await;
        assert_eq!(
            *engine.processing_state(),
            ProcessingState::UsingTool("read_file".to_owned())
        );

        engine
            .handle_event(ChatEvent::ToolCallEnd {
                name: "read_file".to_owned(),
                id: Some("call-1".to_owned()),
                result: serde_json::json!("file contents"),
            })
            .await;
        engine
            .handle_event(ChatEvent::TextDelta {
                text: "Done reading.".to_owned(),
                seq: Some(1),
            })
            .await;
        engine
            .handle_event(ChatEvent::Done {
                final_text: None,
                seq: Some(1),
            })
            .await;

        assert_eq!(ticket.wait().await, SessionOutcome::Completed);
        let last = engine.transcript().last().unwrap();
        assert_eq!(last.tool_calls.len(), 1);
        assert!(last.tool_calls[0].completed);
        assert_eq!(last.tool_calls[0].output.as_deref(), Some("file contents"));
    }

    #[tokio::test]
    async fn refresh_history_replaces_transcript_and_resets_live_state() {
        let chat = StubChat::script(vec![]);
        chat.history.lock().unwrap().push(HistoryMessage {
            role: HistoryRole::User,
            content: vec![ContentPart::Text {
                text: "from the log".to_owned(),
            }],
        });
        let mut engine = online_engine(Arc::clone(&chat));

        let ticket = expect_ticket(engine.send_message("hi".to_owned(), vec![], false).await).await;
        engine
            .handle_event(ChatEvent::TextDelta {
                text: "will be discarded".to_owned(),
                seq: Some(1),
            })
            .await;

        engine.refresh_history().await.unwrap();

        assert_eq!(ticket.wait().await, SessionOutcome::Interrupted);
        assert!(engine.live_message().is_none());
        assert_eq!(engine.transcript().len(), 1);
        assert_eq!(engine.transcript()[0].text, "from the log");
    }

    #[tokio::test]
    async fn agent_status_is_applied_without_a_session() {
        let chat = StubChat::script(vec![]);
        let mut engine = online_engine(chat);

        engine
            .handle_event(ChatEvent::AgentStatus {
                status: "thinking".to_owned(),
            })
            .await;
        assert_eq!(*engine.processing_state(), ProcessingState::Thinking);
    }
}
