//! Real-time delivery core of the chat server.
//!
//! Routes messages, presence, read receipts and call signaling from an
//! authenticated user to every live session of every relevant participant.
//! The transport (WebSocket or otherwise) stays outside: it hands each
//! connection's outbound channel to [`RealtimeCore::connect`] and dispatches
//! inbound intents to the methods below. Persistence and device
//! notifications are injected through the [`store::Store`],
//! [`cipher::ConversationCipher`] and [`batching::NotificationSink`] seams.

pub mod batching;
pub mod calls;
pub mod cipher;
pub mod clock;
pub mod error;
pub mod pipeline;
pub mod policy;
pub mod presence;
pub mod receipts;
pub mod registry;
pub mod rooms;
pub mod store;
mod sync;

pub use batching::{NotificationBatcher, NotificationEvent, NotificationSink};
pub use calls::{CallRelay, CallSession};
pub use cipher::{ConversationCipher, PassthroughCipher};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::DeliveryError;
pub use pipeline::{DeliveryPipeline, DeliveryTracker};
pub use policy::{DeliveryPolicy, NotificationPolicy};
pub use receipts::ReadReceiptAggregator;
pub use registry::{ConnectionRegistry, PresenceTransition, Session};
pub use rooms::RoomManager;
pub use store::{ConversationRecord, MemoryStore, MessageRecord, NewMessage, Store};

use shared::domain::{CallId, CallKind, ConversationId, MessageId, SessionId, UserId};
use shared::protocol::{MessagePayload, ServerEvent};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// The assembled core. Every component is an owned, injected instance;
/// multiple isolated cores can coexist in one process, which is how the
/// tests run them.
///
/// Construct inside a tokio runtime: the presence broadcaster worker is
/// spawned here and aborted when the core drops.
pub struct RealtimeCore {
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RoomManager>,
    store: Arc<dyn Store>,
    batcher: NotificationBatcher,
    pipeline: DeliveryPipeline,
    receipts: ReadReceiptAggregator,
    calls: CallRelay,
    presence_worker: JoinHandle<()>,
}

impl RealtimeCore {
    pub fn new(
        store: Arc<dyn Store>,
        cipher: Arc<dyn ConversationCipher>,
        sink: Arc<dyn NotificationSink>,
        policy: DeliveryPolicy,
    ) -> Self {
        Self::with_clock(store, cipher, sink, policy, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn Store>,
        cipher: Arc<dyn ConversationCipher>,
        sink: Arc<dyn NotificationSink>,
        policy: DeliveryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let rooms = Arc::new(RoomManager::new());
        let tracker = Arc::new(DeliveryTracker::new());
        let batcher = NotificationBatcher::new(
            registry.clone(),
            store.clone(),
            sink,
            policy.batch_window,
        );
        let pipeline = DeliveryPipeline::new(
            store.clone(),
            cipher,
            registry.clone(),
            rooms.clone(),
            batcher.clone(),
            tracker.clone(),
            clock.clone(),
            policy,
        );
        let receipts = ReadReceiptAggregator::new(
            store.clone(),
            registry.clone(),
            rooms.clone(),
            tracker,
            batcher.clone(),
            clock,
        );
        let calls = CallRelay::new(registry.clone());
        let presence_worker = presence::spawn_broadcaster(registry.clone(), rooms.clone());

        Self {
            registry,
            rooms,
            store,
            batcher,
            pipeline,
            receipts,
            calls,
            presence_worker,
        }
    }

    /// Mirrors durable membership into live routing. Run once at start,
    /// before the transport accepts connections.
    pub async fn seed_rooms(&self) -> Result<usize, DeliveryError> {
        let memberships = self
            .store
            .all_memberships()
            .await
            .map_err(DeliveryError::Persistence)?;
        let count = memberships.len();
        self.rooms.seed(memberships);
        Ok(count)
    }

    /// Registers a live session for an authenticated user and returns its id.
    pub fn connect(&self, user_id: UserId, tx: mpsc::Sender<ServerEvent>) -> SessionId {
        self.registry.register(user_id, tx)
    }

    /// Drops a session. When this was the user's last one, any call they
    /// were part of is ended for the peer as well.
    pub fn disconnect(&self, session_id: SessionId) {
        if let Some(user_id) = self.registry.unregister(session_id) {
            if !self.registry.is_online(user_id) {
                self.calls.prune_for(user_id);
            }
        }
    }

    /// Durable membership add, then live routing. The conversation must
    /// already exist; creating conversations is the store owner's business.
    pub async fn join_conversation(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> Result<(), DeliveryError> {
        let known = self
            .store
            .load_conversation(conversation_id)
            .await
            .map_err(DeliveryError::Persistence)?
            .is_some();
        if !known {
            return Err(DeliveryError::ConversationNotFound(conversation_id));
        }
        self.store
            .add_member(conversation_id, user_id)
            .await
            .map_err(DeliveryError::Persistence)?;
        self.rooms.join(user_id, conversation_id);
        Ok(())
    }

    pub async fn leave_conversation(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> Result<(), DeliveryError> {
        self.store
            .remove_member(conversation_id, user_id)
            .await
            .map_err(DeliveryError::Persistence)?;
        self.rooms.leave(user_id, conversation_id);
        self.batcher.clear(user_id, conversation_id);
        Ok(())
    }

    pub async fn send_message(
        &self,
        sender_id: UserId,
        conversation_id: ConversationId,
        content: String,
        temp_id: Option<String>,
        origin: Option<SessionId>,
    ) -> Result<MessagePayload, DeliveryError> {
        self.pipeline
            .send(sender_id, conversation_id, content, temp_id, origin)
            .await
    }

    pub async fn ack_delivered(
        &self,
        recipient_id: UserId,
        message_id: MessageId,
    ) -> Result<(), DeliveryError> {
        self.pipeline.ack_delivered(recipient_id, message_id).await
    }

    pub async fn edit_message(
        &self,
        editor_id: UserId,
        message_id: MessageId,
        content: String,
    ) -> Result<(), DeliveryError> {
        self.pipeline.edit(editor_id, message_id, content).await
    }

    pub async fn delete_message(
        &self,
        actor_id: UserId,
        message_id: MessageId,
        for_everyone: bool,
    ) -> Result<(), DeliveryError> {
        self.pipeline
            .delete(actor_id, message_id, for_everyone)
            .await
    }

    pub async fn react(
        &self,
        user_id: UserId,
        message_id: MessageId,
        emoji: String,
    ) -> Result<(), DeliveryError> {
        self.pipeline.react(user_id, message_id, emoji).await
    }

    pub async fn mark_read(
        &self,
        reader_id: UserId,
        conversation_id: ConversationId,
        up_to: MessageId,
        origin: Option<SessionId>,
    ) -> Result<(), DeliveryError> {
        self.receipts
            .mark_read(reader_id, conversation_id, up_to, origin)
            .await
    }

    pub async fn unread_count(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> Result<u64, DeliveryError> {
        self.receipts.unread_count(user_id, conversation_id).await
    }

    pub fn typing(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
        is_typing: bool,
    ) -> Result<(), DeliveryError> {
        presence::fan_typing(&self.registry, &self.rooms, user_id, conversation_id, is_typing)
    }

    pub fn call_offer(
        &self,
        caller_id: UserId,
        call_id: CallId,
        target_id: UserId,
        kind: CallKind,
        sdp: String,
    ) {
        self.calls.offer(caller_id, call_id, target_id, kind, sdp);
    }

    pub fn call_answer(&self, from_user_id: UserId, call_id: CallId, target_id: UserId, sdp: String) {
        self.calls.answer(from_user_id, call_id, target_id, sdp);
    }

    pub fn call_ice_candidate(
        &self,
        from_user_id: UserId,
        call_id: CallId,
        target_id: UserId,
        candidate: String,
    ) {
        self.calls.ice_candidate(from_user_id, call_id, target_id, candidate);
    }

    pub fn call_hangup(&self, from_user_id: UserId, call_id: CallId, target_id: UserId) {
        self.calls.hangup(from_user_id, call_id, target_id);
    }

    pub fn set_notification_policy(&self, user_id: UserId, policy: NotificationPolicy) {
        self.batcher.set_policy(user_id, policy);
    }

    pub fn clear_notifications(&self, user_id: UserId, conversation_id: ConversationId) {
        self.batcher.clear(user_id, conversation_id);
    }

    pub fn badge_of(&self, user_id: UserId) -> u64 {
        self.batcher.badge_of(user_id)
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.registry.is_online(user_id)
    }

    pub fn last_seen(&self, user_id: UserId) -> Option<chrono::DateTime<chrono::Utc>> {
        self.registry.last_seen(user_id)
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn rooms(&self) -> &RoomManager {
        &self.rooms
    }

    pub fn calls(&self) -> &CallRelay {
        &self.calls
    }

    pub fn batcher(&self) -> &NotificationBatcher {
        &self.batcher
    }
}

impl Drop for RealtimeCore {
    fn drop(&mut self) {
        self.presence_worker.abort();
    }
}
