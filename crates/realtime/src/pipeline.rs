use crate::batching::{NotificationBatcher, NotificationEvent};
use crate::cipher::ConversationCipher;
use crate::clock::Clock;
use crate::error::DeliveryError;
use crate::policy::DeliveryPolicy;
use crate::registry::ConnectionRegistry;
use crate::rooms::RoomManager;
use crate::store::{NewMessage, Store};
use crate::sync::KeyedLocks;
use dashmap::DashMap;
use shared::domain::{ConversationId, MessageId, MessageStatus, SessionId, UserId};
use shared::protocol::{MessagePayload, ServerEvent};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// An aggregate status change that still has to be persisted and announced.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StatusAdvance {
    pub sender_id: UserId,
    pub conversation_id: ConversationId,
    pub status: MessageStatus,
}

struct TrackedDelivery {
    sender_id: UserId,
    conversation_id: ConversationId,
    /// Recipients required for aggregate advancement, snapshotted at send
    /// time. Members who join later are never retroactively required.
    required: HashSet<UserId>,
    delivered: HashSet<UserId>,
    read: HashSet<UserId>,
    status: MessageStatus,
}

/// Per-message delivery bookkeeping behind the aggregate status rule: the
/// visible status is the least-advanced state across the required recipient
/// set, advanced only through [`MessageStatus::advance`] so racing
/// acknowledgments cannot move it backwards.
///
/// In-memory by construction: after a restart, in-flight messages simply
/// stop aggregating (clients re-sync read state through receipts).
#[derive(Default)]
pub struct DeliveryTracker {
    inner: DashMap<MessageId, TrackedDelivery>,
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn record_send(
        &self,
        message_id: MessageId,
        conversation_id: ConversationId,
        sender_id: UserId,
        required: HashSet<UserId>,
    ) {
        // Nothing to aggregate when the sender talks to an empty room.
        if required.is_empty() {
            return;
        }
        self.inner.insert(
            message_id,
            TrackedDelivery {
                sender_id,
                conversation_id,
                required,
                delivered: HashSet::new(),
                read: HashSet::new(),
                status: MessageStatus::Sent,
            },
        );
    }

    /// Unknown messages and non-required recipients are no-ops, which also
    /// makes duplicate acknowledgments harmless.
    pub(crate) fn record_delivered(
        &self,
        message_id: MessageId,
        recipient_id: UserId,
    ) -> Option<StatusAdvance> {
        let mut entry = self.inner.get_mut(&message_id)?;
        if !entry.required.contains(&recipient_id) {
            return None;
        }
        entry.delivered.insert(recipient_id);
        if entry.delivered.len() == entry.required.len() {
            let advanced = entry.status.advance(MessageStatus::Delivered)?;
            entry.status = advanced;
            return Some(StatusAdvance {
                sender_id: entry.sender_id,
                conversation_id: entry.conversation_id,
                status: advanced,
            });
        }
        None
    }

    /// A read implies delivery for that recipient, so a full read set can
    /// advance the aggregate straight from `sent` to `read`.
    pub(crate) fn record_read(
        &self,
        message_id: MessageId,
        reader_id: UserId,
    ) -> Option<StatusAdvance> {
        let advance = {
            let mut entry = self.inner.get_mut(&message_id)?;
            if !entry.required.contains(&reader_id) {
                return None;
            }
            entry.read.insert(reader_id);
            entry.delivered.insert(reader_id);
            let next = if entry.read.len() == entry.required.len() {
                MessageStatus::Read
            } else if entry.delivered.len() == entry.required.len() {
                MessageStatus::Delivered
            } else {
                return None;
            };
            let advanced = entry.status.advance(next)?;
            entry.status = advanced;
            StatusAdvance {
                sender_id: entry.sender_id,
                conversation_id: entry.conversation_id,
                status: advanced,
            }
        };
        // Fully read is terminal for tracking purposes.
        if advance.status == MessageStatus::Read {
            self.inner.remove(&message_id);
        }
        Some(advance)
    }

    #[cfg(test)]
    pub(crate) fn tracked_status(&self, message_id: MessageId) -> Option<MessageStatus> {
        self.inner.get(&message_id).map(|e| e.status)
    }
}

/// Persists an aggregate advance (compare-and-advance at the store) and
/// announces it to the sender's sessions.
pub(crate) async fn apply_status_advance(
    store: &dyn Store,
    registry: &ConnectionRegistry,
    message_id: MessageId,
    advance: StatusAdvance,
) -> Result<(), DeliveryError> {
    store
        .update_message_status(message_id, advance.status)
        .await
        .map_err(DeliveryError::Persistence)?;
    registry.deliver(
        advance.sender_id,
        &ServerEvent::MessageStatus {
            message_id,
            conversation_id: advance.conversation_id,
            status: advance.status,
        },
    );
    Ok(())
}

/// Send/edit/delete/react intents: validate membership, persist through the
/// cipher, advance status, fan out, and hand unreachable recipients to the
/// batcher.
pub struct DeliveryPipeline {
    store: Arc<dyn Store>,
    cipher: Arc<dyn ConversationCipher>,
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RoomManager>,
    batcher: NotificationBatcher,
    tracker: Arc<DeliveryTracker>,
    clock: Arc<dyn Clock>,
    policy: DeliveryPolicy,
    send_order: KeyedLocks<ConversationId>,
}

impl DeliveryPipeline {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        store: Arc<dyn Store>,
        cipher: Arc<dyn ConversationCipher>,
        registry: Arc<ConnectionRegistry>,
        rooms: Arc<RoomManager>,
        batcher: NotificationBatcher,
        tracker: Arc<DeliveryTracker>,
        clock: Arc<dyn Clock>,
        policy: DeliveryPolicy,
    ) -> Self {
        Self {
            store,
            cipher,
            registry,
            rooms,
            batcher,
            tracker,
            clock,
            policy,
            send_order: KeyedLocks::new(),
        }
    }

    /// Accepts a send intent and drives it to `sent` + fan-out.
    ///
    /// Sends within one conversation are serialized so recipients observe
    /// them in send order; different conversations never wait on each other.
    /// `origin` is the session the intent arrived on — it receives the
    /// returned payload as its reply instead of an echoed `message_new`.
    pub async fn send(
        &self,
        sender_id: UserId,
        conversation_id: ConversationId,
        content: String,
        temp_id: Option<String>,
        origin: Option<SessionId>,
    ) -> Result<MessagePayload, DeliveryError> {
        if !self.rooms.is_member(sender_id, conversation_id) {
            return Err(DeliveryError::NotAMember {
                user_id: sender_id,
                conversation_id,
            });
        }
        if content.trim().is_empty() {
            return Err(DeliveryError::Validation("message content is empty".into()));
        }

        let _fifo = self.send_order.acquire(conversation_id).await;

        let created_at = self.clock.now();
        let sealed = self.cipher.seal(conversation_id, &content)?;
        let record = self
            .store
            .persist_message(NewMessage {
                conversation_id,
                sender_id,
                content: sealed,
                created_at,
            })
            .await
            .map_err(DeliveryError::Persistence)?;

        if let Err(err) = self
            .store
            .update_message_status(record.message_id, MessageStatus::Sent)
            .await
        {
            // Best effort: leave the row marked failed for history queries.
            let _ = self
                .store
                .update_message_status(record.message_id, MessageStatus::Failed)
                .await;
            return Err(DeliveryError::Persistence(err));
        }

        let mut recipients = self.rooms.members_of(conversation_id);
        recipients.remove(&sender_id);
        self.tracker.record_send(
            record.message_id,
            conversation_id,
            sender_id,
            recipients.clone(),
        );

        let payload = MessagePayload {
            message_id: record.message_id,
            conversation_id,
            sender_id,
            content,
            status: MessageStatus::Sent,
            temp_id,
            created_at,
            edited_at: None,
        };
        // The sender's other devices reconcile their optimistic copy through
        // temp_id, same as the origin does through the reply.
        let echo = ServerEvent::MessageNew {
            message: payload.clone(),
        };
        match origin {
            Some(origin) => self.registry.deliver_except(sender_id, origin, &echo),
            None => self.registry.deliver(sender_id, &echo),
        };

        // Recipients have no optimistic copy; the correlation id stays
        // between the sender's devices.
        let event = ServerEvent::MessageNew {
            message: MessagePayload {
                temp_id: None,
                ..payload.clone()
            },
        };
        let mut notification: Option<NotificationEvent> = None;
        for recipient in recipients {
            if self.registry.deliver(recipient, &event) > 0 {
                continue;
            }
            if notification.is_none() {
                let sender_name = self.sender_label(sender_id).await;
                notification = Some(NotificationEvent::new(
                    sender_id,
                    sender_name,
                    &payload.content,
                ));
            }
            if let Some(template) = &notification {
                self.batcher
                    .enqueue(recipient, conversation_id, template.clone());
            }
        }

        debug!(
            message_id = record.message_id.0,
            conversation_id = conversation_id.0,
            sender_id = sender_id.0,
            "message sent"
        );
        Ok(payload)
    }

    /// Records that `recipient_id`'s client actually received the push.
    /// Advances the aggregate to `delivered` once every send-time recipient
    /// has acknowledged. Unknown and duplicate acknowledgments are no-ops.
    pub async fn ack_delivered(
        &self,
        recipient_id: UserId,
        message_id: MessageId,
    ) -> Result<(), DeliveryError> {
        let Some(advance) = self.tracker.record_delivered(message_id, recipient_id) else {
            return Ok(());
        };
        apply_status_advance(self.store.as_ref(), &self.registry, message_id, advance).await
    }

    /// Author-only, within the edit window (inclusive). Keeps delivery and
    /// read state untouched and fans `message_edited` to every member.
    pub async fn edit(
        &self,
        editor_id: UserId,
        message_id: MessageId,
        new_content: String,
    ) -> Result<(), DeliveryError> {
        let record = self.load_existing(message_id).await?;
        if !self.rooms.is_member(editor_id, record.conversation_id) {
            return Err(DeliveryError::NotAMember {
                user_id: editor_id,
                conversation_id: record.conversation_id,
            });
        }
        if record.sender_id != editor_id {
            return Err(DeliveryError::NotAuthor(message_id));
        }
        if record.is_deleted {
            return Err(DeliveryError::Validation(
                "deleted messages cannot be edited".into(),
            ));
        }
        if new_content.trim().is_empty() {
            return Err(DeliveryError::Validation("message content is empty".into()));
        }
        let now = self.clock.now();
        if now - record.created_at > self.policy.edit_window {
            return Err(DeliveryError::EditWindowExpired(message_id));
        }

        let sealed = self.cipher.seal(record.conversation_id, &new_content)?;
        self.store
            .apply_edit(message_id, sealed, now)
            .await
            .map_err(DeliveryError::Persistence)?;

        self.fan_to_members(
            record.conversation_id,
            &ServerEvent::MessageEdited {
                message_id,
                conversation_id: record.conversation_id,
                content: new_content,
                edited_at: now,
            },
        );
        Ok(())
    }

    /// `for_everyone` tombstones the message (author-only, delete window,
    /// inclusive) and fans `message_deleted`; otherwise records an
    /// actor-local hide with no fan-out.
    pub async fn delete(
        &self,
        actor_id: UserId,
        message_id: MessageId,
        for_everyone: bool,
    ) -> Result<(), DeliveryError> {
        let record = self.load_existing(message_id).await?;
        if !self.rooms.is_member(actor_id, record.conversation_id) {
            return Err(DeliveryError::NotAMember {
                user_id: actor_id,
                conversation_id: record.conversation_id,
            });
        }

        if !for_everyone {
            return self
                .store
                .hide_for_user(message_id, actor_id)
                .await
                .map_err(DeliveryError::Persistence);
        }

        if record.sender_id != actor_id {
            return Err(DeliveryError::NotAuthor(message_id));
        }
        if self.clock.now() - record.created_at > self.policy.delete_window {
            return Err(DeliveryError::DeleteWindowExpired(message_id));
        }

        self.store
            .apply_delete(message_id)
            .await
            .map_err(DeliveryError::Persistence)?;

        self.fan_to_members(
            record.conversation_id,
            &ServerEvent::MessageDeleted {
                message_id,
                conversation_id: record.conversation_id,
            },
        );
        Ok(())
    }

    /// Toggle: an existing (user, emoji) reaction is removed, otherwise it is
    /// added. Exactly one `reaction_changed` goes out either way.
    pub async fn react(
        &self,
        user_id: UserId,
        message_id: MessageId,
        emoji: String,
    ) -> Result<(), DeliveryError> {
        let record = self.load_existing(message_id).await?;
        if !self.rooms.is_member(user_id, record.conversation_id) {
            return Err(DeliveryError::NotAMember {
                user_id,
                conversation_id: record.conversation_id,
            });
        }
        if emoji.trim().is_empty() {
            return Err(DeliveryError::Validation("emoji is empty".into()));
        }
        if record.is_deleted {
            return Err(DeliveryError::Validation(
                "deleted messages cannot be reacted to".into(),
            ));
        }

        let action = self
            .store
            .toggle_reaction(message_id, user_id, &emoji)
            .await
            .map_err(DeliveryError::Persistence)?;

        self.fan_to_members(
            record.conversation_id,
            &ServerEvent::ReactionChanged {
                message_id,
                conversation_id: record.conversation_id,
                user_id,
                emoji,
                action,
            },
        );
        Ok(())
    }

    async fn load_existing(
        &self,
        message_id: MessageId,
    ) -> Result<crate::store::MessageRecord, DeliveryError> {
        self.store
            .load_message(message_id)
            .await
            .map_err(DeliveryError::Persistence)?
            .ok_or(DeliveryError::MessageNotFound(message_id))
    }

    fn fan_to_members(&self, conversation_id: ConversationId, event: &ServerEvent) {
        for member in self.rooms.members_of(conversation_id) {
            self.registry.deliver(member, event);
        }
    }

    async fn sender_label(&self, sender_id: UserId) -> String {
        match self.store.display_name(sender_id).await {
            Ok(Some(name)) => name,
            Ok(None) => format!("User {}", sender_id.0),
            Err(err) => {
                warn!(error = %err, sender_id = sender_id.0, "sender name lookup failed");
                format!("User {}", sender_id.0)
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/pipeline_tests.rs"]
mod tests;
