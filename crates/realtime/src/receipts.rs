use crate::batching::NotificationBatcher;
use crate::clock::Clock;
use crate::error::DeliveryError;
use crate::pipeline::{apply_status_advance, DeliveryTracker};
use crate::registry::ConnectionRegistry;
use crate::rooms::RoomManager;
use crate::store::Store;
use crate::sync::KeyedLocks;
use shared::domain::{ConversationId, MessageId, SessionId, UserId};
use shared::protocol::ServerEvent;
use std::sync::Arc;
use tracing::debug;

/// Records read boundaries and turns them into receipts, unread counts, and
/// aggregate status advances.
pub struct ReadReceiptAggregator {
    store: Arc<dyn Store>,
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RoomManager>,
    tracker: Arc<DeliveryTracker>,
    batcher: NotificationBatcher,
    clock: Arc<dyn Clock>,
    /// Serializes receipt processing per (reader, conversation) so unread
    /// counts cannot double-decrement under concurrent boundary updates.
    locks: KeyedLocks<(UserId, ConversationId)>,
}

impl ReadReceiptAggregator {
    pub(crate) fn new(
        store: Arc<dyn Store>,
        registry: Arc<ConnectionRegistry>,
        rooms: Arc<RoomManager>,
        tracker: Arc<DeliveryTracker>,
        batcher: NotificationBatcher,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            registry,
            rooms,
            tracker,
            batcher,
            clock,
            locks: KeyedLocks::new(),
        }
    }

    /// Receipts every unread message up to and including `up_to` for the
    /// reader (their own messages excluded), then emits ONE
    /// `read_receipts_updated` event carrying the boundary — never one per
    /// message. Repeat calls with the same boundary change nothing.
    ///
    /// Opening a conversation is also the "seen" signal, so any pending
    /// notification batch for it is cleared and its badge reset.
    pub async fn mark_read(
        &self,
        reader_id: UserId,
        conversation_id: ConversationId,
        up_to: MessageId,
        origin: Option<SessionId>,
    ) -> Result<(), DeliveryError> {
        if !self.rooms.is_member(reader_id, conversation_id) {
            return Err(DeliveryError::NotAMember {
                user_id: reader_id,
                conversation_id,
            });
        }
        let _serial = self.locks.acquire((reader_id, conversation_id)).await;

        let read_at = self.clock.now();
        let newly_read = self
            .store
            .mark_read_up_to(conversation_id, reader_id, up_to, read_at)
            .await
            .map_err(DeliveryError::Persistence)?;
        let unread = self
            .store
            .unread_count(conversation_id, reader_id)
            .await
            .map_err(DeliveryError::Persistence)?;

        if !newly_read.is_empty() {
            let event = ServerEvent::ReadReceiptsUpdated {
                conversation_id,
                reader_id,
                up_to_message_id: up_to,
            };
            for member in self.rooms.members_of(conversation_id) {
                if member == reader_id {
                    continue;
                }
                self.registry.deliver(member, &event);
            }
            // The reader's other devices sync their read marker too.
            match origin {
                Some(origin) => self.registry.deliver_except(reader_id, origin, &event),
                None => self.registry.deliver(reader_id, &event),
            };

            for message_id in &newly_read {
                if let Some(advance) = self.tracker.record_read(*message_id, reader_id) {
                    apply_status_advance(
                        self.store.as_ref(),
                        &self.registry,
                        *message_id,
                        advance,
                    )
                    .await?;
                }
            }
        }

        self.batcher.clear(reader_id, conversation_id);
        debug!(
            reader_id = reader_id.0,
            conversation_id = conversation_id.0,
            newly_read = newly_read.len(),
            unread,
            "read boundary recorded"
        );
        Ok(())
    }

    pub async fn unread_count(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> Result<u64, DeliveryError> {
        if !self.rooms.is_member(user_id, conversation_id) {
            return Err(DeliveryError::NotAMember {
                user_id,
                conversation_id,
            });
        }
        self.store
            .unread_count(conversation_id, user_id)
            .await
            .map_err(DeliveryError::Persistence)
    }
}

#[cfg(test)]
#[path = "tests/receipts_tests.rs"]
mod tests;
