use crate::policy::NotificationPolicy;
use crate::registry::ConnectionRegistry;
use crate::store::Store;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use shared::domain::{ConversationId, UserId};
use shared::protocol::{NotificationPayload, ServerEvent};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const PREVIEW_MAX_CHARS: usize = 80;

/// The engine's sole outbound call into the device-notification layer (push
/// gateway, OS notification center, …).
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(
        &self,
        user_id: UserId,
        title: &str,
        body: &str,
        payload: &NotificationPayload,
    );
}

/// One undeliverable message, queued for coalescing.
#[derive(Debug, Clone)]
pub struct NotificationEvent {
    pub sender_id: UserId,
    pub sender_name: String,
    pub preview: String,
}

impl NotificationEvent {
    pub fn new(sender_id: UserId, sender_name: String, content: &str) -> Self {
        Self {
            sender_id,
            sender_name,
            preview: truncate_preview(content),
        }
    }
}

fn truncate_preview(content: &str) -> String {
    if content.chars().count() <= PREVIEW_MAX_CHARS {
        return content.to_owned();
    }
    let mut preview: String = content.chars().take(PREVIEW_MAX_CHARS).collect();
    preview.push('…');
    preview
}

type BatchKey = (UserId, ConversationId);

struct PendingBatch {
    /// Guards against a timer that fires after its batch was cleared or
    /// superseded; such a fire finds a different generation and gives up.
    generation: u64,
    queued: Vec<NotificationEvent>,
    timer: JoinHandle<()>,
}

/// Coalesces per-(recipient, conversation) bursts over a fixed window and
/// emits one notification per flush: full detail for a single message, a
/// summary for several.
///
/// Lifecycle per key: idle → pending (first event arms the window timer) →
/// flushed → idle. `clear` short-circuits pending → idle without emitting.
/// At most one pending batch exists per key at any instant.
#[derive(Clone)]
pub struct NotificationBatcher {
    inner: Arc<BatcherInner>,
}

struct BatcherInner {
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn Store>,
    sink: Arc<dyn NotificationSink>,
    window: Duration,
    policies: DashMap<UserId, NotificationPolicy>,
    batches: DashMap<BatchKey, PendingBatch>,
    badges: DashMap<BatchKey, u64>,
    next_generation: AtomicU64,
}

impl NotificationBatcher {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        store: Arc<dyn Store>,
        sink: Arc<dyn NotificationSink>,
        window: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(BatcherInner {
                registry,
                store,
                sink,
                window,
                policies: DashMap::new(),
                batches: DashMap::new(),
                badges: DashMap::new(),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    /// Queues an event for an unreachable recipient. Opens the batch and arms
    /// its window timer when none is pending for the key. The recipient's
    /// policy gates here and again at flush, so disabling notifications
    /// mid-window silences the batch either way.
    pub fn enqueue(
        &self,
        recipient_id: UserId,
        conversation_id: ConversationId,
        event: NotificationEvent,
    ) {
        if !self.policy_of(recipient_id).enabled {
            debug!(
                recipient_id = recipient_id.0,
                "notification dropped, notifications disabled"
            );
            return;
        }
        let key = (recipient_id, conversation_id);
        match self.inner.batches.entry(key) {
            Entry::Occupied(mut occupied) => {
                occupied.get_mut().queued.push(event);
            }
            Entry::Vacant(vacant) => {
                let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
                let inner = self.inner.clone();
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(inner.window).await;
                    inner.flush(key, generation).await;
                });
                vacant.insert(PendingBatch {
                    generation,
                    queued: vec![event],
                    timer,
                });
            }
        }
    }

    /// The recipient opened the conversation: cancel the pending batch, drop
    /// its queue without emitting, and reset the badge. Idempotent and safe
    /// at any point before flush.
    pub fn clear(&self, recipient_id: UserId, conversation_id: ConversationId) {
        let key = (recipient_id, conversation_id);
        if let Some((_, batch)) = self.inner.batches.remove(&key) {
            batch.timer.abort();
            debug!(
                recipient_id = recipient_id.0,
                conversation_id = conversation_id.0,
                dropped = batch.queued.len(),
                "pending notification batch cleared"
            );
        }
        self.inner.badges.remove(&key);
    }

    /// Total unread-badge count across the user's conversations.
    pub fn badge_of(&self, user_id: UserId) -> u64 {
        self.inner
            .badges
            .iter()
            .filter(|entry| entry.key().0 == user_id)
            .map(|entry| *entry.value())
            .sum()
    }

    pub fn set_policy(&self, user_id: UserId, policy: NotificationPolicy) {
        self.inner.policies.insert(user_id, policy);
    }

    pub fn has_pending(&self, recipient_id: UserId, conversation_id: ConversationId) -> bool {
        self.inner
            .batches
            .contains_key(&(recipient_id, conversation_id))
    }

    fn policy_of(&self, user_id: UserId) -> NotificationPolicy {
        self.inner
            .policies
            .get(&user_id)
            .map(|entry| entry.clone())
            .unwrap_or_default()
    }
}

impl BatcherInner {
    async fn flush(&self, key: BatchKey, generation: u64) {
        let Some((_, batch)) = self
            .batches
            .remove_if(&key, |_, pending| pending.generation == generation)
        else {
            // Cleared or superseded while this timer was in flight.
            return;
        };
        let (recipient_id, conversation_id) = key;
        let policy = self
            .policies
            .get(&recipient_id)
            .map(|entry| entry.clone())
            .unwrap_or_default();
        if !policy.enabled {
            debug!(
                recipient_id = recipient_id.0,
                "batch dropped at flush, notifications disabled"
            );
            return;
        }

        if policy.allows_badge() {
            *self.badges.entry(key).or_insert(0) += batch.queued.len() as u64;
        }
        if !policy.allows_summary() {
            debug!(
                recipient_id = recipient_id.0,
                conversation_id = conversation_id.0,
                "batch suppressed by do-not-disturb"
            );
            return;
        }

        let payload = self.compose(conversation_id, &batch.queued).await;
        let summary = ServerEvent::NotificationSummary {
            notification: payload.clone(),
        };
        // A recipient who connected while the batch was pending gets the
        // summary in-band; the sink is for devices with no live session.
        if self.registry.deliver(recipient_id, &summary) > 0 {
            debug!(
                recipient_id = recipient_id.0,
                conversation_id = conversation_id.0,
                messages = payload.message_count,
                "summary delivered to live sessions"
            );
            return;
        }
        self.sink
            .deliver(recipient_id, &payload.title, &payload.body, &payload)
            .await;
    }

    async fn compose(
        &self,
        conversation_id: ConversationId,
        queued: &[NotificationEvent],
    ) -> NotificationPayload {
        let conversation_name = match self.store.load_conversation(conversation_id).await {
            Ok(Some(record)) => record.name,
            Ok(None) => String::new(),
            Err(err) => {
                warn!(
                    conversation_id = conversation_id.0,
                    error = %err,
                    "conversation lookup failed while composing notification"
                );
                String::new()
            }
        };
        let message_count = queued.len();
        let sender_count = queued
            .iter()
            .map(|event| event.sender_id)
            .collect::<HashSet<_>>()
            .len();

        let (title, body) = if let [only] = queued {
            let title = if conversation_name.is_empty() {
                only.sender_name.clone()
            } else {
                conversation_name
            };
            (title, format!("{}: {}", only.sender_name, only.preview))
        } else {
            let title = if conversation_name.is_empty() {
                "New messages".to_owned()
            } else {
                conversation_name
            };
            let senders = if sender_count == 1 {
                "1 sender".to_owned()
            } else {
                format!("{sender_count} senders")
            };
            (
                title,
                format!("{message_count} new messages from {senders}"),
            )
        };

        NotificationPayload {
            conversation_id,
            title,
            body,
            message_count,
            sender_count,
        }
    }
}

#[cfg(test)]
#[path = "tests/batching_tests.rs"]
mod tests;
