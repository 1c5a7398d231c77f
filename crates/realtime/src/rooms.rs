use dashmap::DashMap;
use shared::domain::{ConversationId, UserId};
use std::collections::HashSet;

/// Conversation → members and user → conversations, kept in lockstep.
///
/// Joins and leaves take effect for the next fan-out that snapshots the
/// membership; a fan-out already running against an older snapshot may or
/// may not include the change. Both maps use per-key locks only.
#[derive(Default)]
pub struct RoomManager {
    members: DashMap<ConversationId, HashSet<UserId>>,
    rooms: DashMap<UserId, HashSet<ConversationId>>,
}

impl RoomManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent: joining a room the user is already in changes nothing.
    pub fn join(&self, user_id: UserId, conversation_id: ConversationId) {
        self.members
            .entry(conversation_id)
            .or_default()
            .insert(user_id);
        self.rooms.entry(user_id).or_default().insert(conversation_id);
    }

    /// Idempotent: leaving a room the user is not in is a no-op.
    pub fn leave(&self, user_id: UserId, conversation_id: ConversationId) {
        if let Some(mut entry) = self.members.get_mut(&conversation_id) {
            entry.remove(&user_id);
        }
        if let Some(mut entry) = self.rooms.get_mut(&user_id) {
            entry.remove(&conversation_id);
        }
    }

    pub fn members_of(&self, conversation_id: ConversationId) -> HashSet<UserId> {
        self.members
            .get(&conversation_id)
            .map(|entry| entry.clone())
            .unwrap_or_default()
    }

    pub fn conversations_of(&self, user_id: UserId) -> HashSet<ConversationId> {
        self.rooms
            .get(&user_id)
            .map(|entry| entry.clone())
            .unwrap_or_default()
    }

    pub fn is_member(&self, user_id: UserId, conversation_id: ConversationId) -> bool {
        self.members
            .get(&conversation_id)
            .map(|entry| entry.contains(&user_id))
            .unwrap_or(false)
    }

    /// Bulk load of durable memberships at process start, so routing reflects
    /// the store before any client joins live.
    pub fn seed<I>(&self, memberships: I)
    where
        I: IntoIterator<Item = (ConversationId, UserId)>,
    {
        for (conversation_id, user_id) in memberships {
            self.join(user_id, conversation_id);
        }
    }
}
