//! Offline queue sync.
//!
//! A user-authored message is never lost: when the chat role is down, sends
//! are buffered here and resent in enqueue order once capability returns.
//! Each queued item's identity doubles as its idempotency key, reused
//! verbatim on every retry so the gateway recognizes repeated attempts as
//! one logical message.

use crate::config::QueueConfig;
use crate::error::TetherError;
use crate::transcript::ImageAttachment;
use crate::transport::{ChatTransport, OutgoingMessage, SendOutcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// A message buffered while the chat role is unavailable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineMessage {
    /// Identity and idempotency key.
    pub id: String,
    /// Message text.
    pub text: String,
    /// Attachment blobs, base64 in the serialized snapshot.
    #[serde(with = "blob_serde", default)]
    pub attachments: Vec<ImageAttachment>,
    /// Extended-thinking hint carried through to the eventual send.
    pub thinking: bool,
    /// When the message was queued.
    pub queued_at: DateTime<Utc>,
}

impl OfflineMessage {
    fn to_outgoing(&self) -> OutgoingMessage {
        OutgoingMessage {
            text: self.text.clone(),
            attachments: self.attachments.clone(),
            thinking: self.thinking,
            idempotency_key: Some(self.id.clone()),
        }
    }

    /// Approximate serialized size in bytes.
    fn byte_size(&self) -> usize {
        self.text.len()
            + self
                .attachments
                .iter()
                .map(|a| a.mime.len() + a.bytes.len())
                .sum::<usize>()
    }
}

/// Raised when the queue crosses a configured threshold. Enqueueing keeps
/// working; absolute cap enforcement belongs to the external queue store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityWarning {
    /// Fill level as a percentage of the nearest threshold (>= 100).
    pub percent: u32,
    /// Messages currently queued.
    pub pending: usize,
}

/// Outcome counts of one sync pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Sends the gateway accepted as new runs.
    pub delivered: usize,
    /// Sends the gateway recognized as already-landed duplicates.
    pub duplicates: usize,
    /// Sends that failed and stay queued.
    pub failed: usize,
}

/// The offline send queue.
#[derive(Debug)]
pub struct OfflineQueue {
    items: VecDeque<OfflineMessage>,
    config: QueueConfig,
}

impl OfflineQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new(config: QueueConfig) -> Self {
        Self {
            items: VecDeque::new(),
            config,
        }
    }

    /// Number of messages waiting.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.items.len()
    }

    /// True when nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Total approximate serialized size of the queue in bytes.
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.items.iter().map(OfflineMessage::byte_size).sum()
    }

    /// Buffer a message under a fresh idempotency key. Returns the key and a
    /// capacity warning once a threshold is crossed.
    pub fn enqueue(
        &mut self,
        text: String,
        attachments: Vec<ImageAttachment>,
        thinking: bool,
    ) -> (String, Option<CapacityWarning>) {
        let id = uuid::Uuid::new_v4().to_string();
        self.items.push_back(OfflineMessage {
            id: id.clone(),
            text,
            attachments,
            thinking,
            queued_at: Utc::now(),
        });

        let warning = self.capacity_warning();
        if let Some(w) = warning {
            tracing::warn!(percent = w.percent, pending = w.pending, "offline queue filling");
        }
        (id, warning)
    }

    /// Resend every queued item in enqueue order, reusing each item's
    /// original idempotency key. A server-reported duplicate counts as a
    /// successful delivery. Failed items stay queued for a later pass.
    pub async fn sync(&mut self, chat: &dyn ChatTransport) -> SyncReport {
        let mut report = SyncReport::default();
        let mut retained = VecDeque::new();

        while let Some(item) = self.items.pop_front() {
            match chat.send(item.to_outgoing()).await {
                Ok(SendOutcome::Accepted { run_id }) => {
                    tracing::info!(key = %item.id, %run_id, "queued message delivered");
                    report.delivered += 1;
                }
                Ok(SendOutcome::Duplicate) => {
                    // Landed server-side from a prior attempt.
                    tracing::info!(key = %item.id, "queued message was already delivered");
                    report.duplicates += 1;
                }
                Err(e) => {
                    tracing::warn!(key = %item.id, "queued message resend failed: {e}");
                    report.failed += 1;
                    retained.push_back(item);
                }
            }
        }

        self.items = retained;
        report
    }

    /// Manual retry of one queued item, same idempotency discipline.
    ///
    /// # Errors
    ///
    /// `Channel` if the id is not queued; the transport error if the resend
    /// fails (the item stays queued).
    pub async fn retry(
        &mut self,
        id: &str,
        chat: &dyn ChatTransport,
    ) -> crate::error::Result<SendOutcome> {
        let Some(pos) = self.items.iter().position(|m| m.id == id) else {
            return Err(TetherError::Channel(format!("no queued message with id {id}")));
        };

        let outgoing = self.items[pos].to_outgoing();
        let outcome = chat.send(outgoing).await?;
        self.items.remove(pos);
        Ok(outcome)
    }

    /// Serializable snapshot of the queue for an external store.
    #[must_use]
    pub fn snapshot(&self) -> Vec<OfflineMessage> {
        self.items.iter().cloned().collect()
    }

    /// Restore a previously snapshotted queue (replaces current contents).
    pub fn restore(&mut self, items: Vec<OfflineMessage>) {
        self.items = items.into();
    }

    fn capacity_warning(&self) -> Option<CapacityWarning> {
        let count_pct = percent_of(self.items.len(), self.config.warn_message_count);
        let bytes_pct = percent_of(self.total_bytes(), self.config.warn_total_bytes);
        let percent = count_pct.max(bytes_pct);
        (percent >= 100).then_some(CapacityWarning {
            percent,
            pending: self.items.len(),
        })
    }
}

fn percent_of(value: usize, threshold: usize) -> u32 {
    if threshold == 0 {
        return 0;
    }
    u32::try_from(value.saturating_mul(100) / threshold).unwrap_or(u32::MAX)
}

mod blob_serde {
    //! Attachment blobs as `{mime, data}` with base64 payloads.

    use crate::transcript::ImageAttachment;
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    struct BlobRepr {
        mime: String,
        data: String,
    }

    pub fn serialize<S: Serializer>(
        attachments: &[ImageAttachment],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let reprs: Vec<BlobRepr> = attachments
            .iter()
            .map(|a| BlobRepr {
                mime: a.mime.clone(),
                data: STANDARD.encode(&a.bytes),
            })
            .collect();
        reprs.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<ImageAttachment>, D::Error> {
        let reprs = Vec::<BlobRepr>::deserialize(deserializer)?;
        reprs
            .into_iter()
            .map(|r| {
                Ok(ImageAttachment {
                    mime: r.mime,
                    bytes: STANDARD.decode(&r.data).map_err(D::Error::custom)?,
                })
            })
            .collect()
    }
}
