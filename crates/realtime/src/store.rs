use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use shared::domain::{
    ConversationId, ConversationKind, MessageId, MessageStatus, ReactionAction, UserId,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};

#[derive(Debug, Clone)]
pub struct ConversationRecord {
    pub conversation_id: ConversationId,
    pub kind: ConversationKind,
    pub name: String,
}

/// Input to [`Store::persist_message`]; the store assigns the message id.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    /// Content as sealed by the conversation cipher.
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    /// Sealed form; callers run it back through the cipher before it goes
    /// anywhere near the wire.
    pub content: String,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub is_deleted: bool,
}

/// Persistence seam between the delivery core and whatever durable store
/// backs it. The core performs no retries of its own; a failed call surfaces
/// to the caller as a persistence error.
///
/// `update_message_status` and `append_receipt` carry the concurrency
/// contract: the former compare-and-advances (racing acknowledgments cannot
/// regress a status), the latter is idempotent (the first `read_at` wins).
#[async_trait]
pub trait Store: Send + Sync {
    /// Display name for notification bodies. `None` for unknown users;
    /// callers fall back to a generic label.
    async fn display_name(&self, user_id: UserId) -> Result<Option<String>>;

    async fn load_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<ConversationRecord>>;

    async fn load_membership(&self, conversation_id: ConversationId) -> Result<HashSet<UserId>>;

    /// Every (conversation, member) pair, for seeding live routing at start.
    async fn all_memberships(&self) -> Result<Vec<(ConversationId, UserId)>>;

    async fn add_member(&self, conversation_id: ConversationId, user_id: UserId) -> Result<()>;

    async fn remove_member(&self, conversation_id: ConversationId, user_id: UserId) -> Result<()>;

    /// Persists with the status carried by `NewMessage` flow (`sending`) and
    /// returns the stored record with its assigned id.
    async fn persist_message(&self, new: NewMessage) -> Result<MessageRecord>;

    async fn load_message(&self, message_id: MessageId) -> Result<Option<MessageRecord>>;

    /// Compare-and-advance: applies `next` only when the monotonic status
    /// ordering allows it, and returns the status now in effect either way.
    async fn update_message_status(
        &self,
        message_id: MessageId,
        next: MessageStatus,
    ) -> Result<MessageStatus>;

    /// Moves the previous content into the edit history and installs the new
    /// sealed content.
    async fn apply_edit(
        &self,
        message_id: MessageId,
        sealed_content: String,
        edited_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Tombstones the message: content is dropped, the row remains.
    async fn apply_delete(&self, message_id: MessageId) -> Result<()>;

    /// Actor-local delete; the message disappears from this user's view only.
    async fn hide_for_user(&self, message_id: MessageId, user_id: UserId) -> Result<()>;

    /// Toggle semantics: removes an existing (user, emoji) reaction, adds it
    /// otherwise, and reports which of the two happened.
    async fn toggle_reaction(
        &self,
        message_id: MessageId,
        user_id: UserId,
        emoji: &str,
    ) -> Result<ReactionAction>;

    /// Ids of messages in the conversation up to and including `up_to` that
    /// `reader_id` has not receipted yet, excluding the reader's own
    /// messages, in send order.
    async fn unread_ids_up_to(
        &self,
        conversation_id: ConversationId,
        reader_id: UserId,
        up_to: MessageId,
    ) -> Result<Vec<MessageId>>;

    /// Idempotent receipt insert; returns whether this call created it. A
    /// repeat insert leaves the original `read_at` untouched.
    async fn append_receipt(
        &self,
        message_id: MessageId,
        user_id: UserId,
        read_at: DateTime<Utc>,
    ) -> Result<bool>;

    async fn unread_count(&self, conversation_id: ConversationId, user_id: UserId) -> Result<u64>;

    /// Receipts everything unread up to the boundary and returns the ids this
    /// call newly receipted. Callers serialize per (reader, conversation), so
    /// the two-step default is race-free in practice.
    async fn mark_read_up_to(
        &self,
        conversation_id: ConversationId,
        reader_id: UserId,
        up_to: MessageId,
        read_at: DateTime<Utc>,
    ) -> Result<Vec<MessageId>> {
        let mut newly_read = Vec::new();
        for message_id in self
            .unread_ids_up_to(conversation_id, reader_id, up_to)
            .await?
        {
            if self.append_receipt(message_id, reader_id, read_at).await? {
                newly_read.push(message_id);
            }
        }
        Ok(newly_read)
    }
}

/// In-process store used as the default collaborator and test double. Same
/// contract as the sqlite implementation, minus durability.
#[derive(Default)]
pub struct MemoryStore {
    next_conversation_id: AtomicI64,
    next_message_id: AtomicI64,
    users: DashMap<UserId, String>,
    conversations: DashMap<ConversationId, ConversationRecord>,
    members: DashMap<ConversationId, HashSet<UserId>>,
    messages: DashMap<MessageId, MessageRecord>,
    edits: DashMap<MessageId, Vec<(String, DateTime<Utc>)>>,
    hidden: DashSet<(MessageId, UserId)>,
    reactions: DashMap<MessageId, Vec<(UserId, String)>>,
    receipts: DashMap<(MessageId, UserId), DateTime<Utc>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test/bootstrap helper; user CRUD is not part of the core's store
    /// contract.
    pub fn upsert_user(&self, user_id: UserId, name: &str) {
        self.users.insert(user_id, name.to_owned());
    }

    /// Test/bootstrap helper; conversation CRUD is not part of the core's
    /// store contract.
    pub fn create_conversation(
        &self,
        kind: ConversationKind,
        name: &str,
        members: &[UserId],
    ) -> ConversationId {
        let conversation_id =
            ConversationId(self.next_conversation_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.conversations.insert(
            conversation_id,
            ConversationRecord {
                conversation_id,
                kind,
                name: name.to_owned(),
            },
        );
        self.members
            .insert(conversation_id, members.iter().copied().collect());
        conversation_id
    }

    pub fn edit_history(&self, message_id: MessageId) -> Vec<String> {
        self.edits
            .get(&message_id)
            .map(|entry| entry.iter().map(|(content, _)| content.clone()).collect())
            .unwrap_or_default()
    }

    pub fn receipt_at(&self, message_id: MessageId, user_id: UserId) -> Option<DateTime<Utc>> {
        self.receipts.get(&(message_id, user_id)).map(|e| *e)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn display_name(&self, user_id: UserId) -> Result<Option<String>> {
        Ok(self.users.get(&user_id).map(|e| e.clone()))
    }

    async fn load_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<ConversationRecord>> {
        Ok(self.conversations.get(&conversation_id).map(|e| e.clone()))
    }

    async fn load_membership(&self, conversation_id: ConversationId) -> Result<HashSet<UserId>> {
        Ok(self
            .members
            .get(&conversation_id)
            .map(|e| e.clone())
            .unwrap_or_default())
    }

    async fn all_memberships(&self) -> Result<Vec<(ConversationId, UserId)>> {
        let mut pairs = Vec::new();
        for entry in self.members.iter() {
            for user_id in entry.value() {
                pairs.push((*entry.key(), *user_id));
            }
        }
        Ok(pairs)
    }

    async fn add_member(&self, conversation_id: ConversationId, user_id: UserId) -> Result<()> {
        if !self.conversations.contains_key(&conversation_id) {
            bail!("conversation {} does not exist", conversation_id.0);
        }
        self.members
            .entry(conversation_id)
            .or_default()
            .insert(user_id);
        Ok(())
    }

    async fn remove_member(&self, conversation_id: ConversationId, user_id: UserId) -> Result<()> {
        if let Some(mut entry) = self.members.get_mut(&conversation_id) {
            entry.remove(&user_id);
        }
        Ok(())
    }

    async fn persist_message(&self, new: NewMessage) -> Result<MessageRecord> {
        let record = MessageRecord {
            message_id: MessageId(self.next_message_id.fetch_add(1, Ordering::Relaxed) + 1),
            conversation_id: new.conversation_id,
            sender_id: new.sender_id,
            content: new.content,
            status: MessageStatus::Sending,
            created_at: new.created_at,
            edited_at: None,
            is_deleted: false,
        };
        self.messages.insert(record.message_id, record.clone());
        Ok(record)
    }

    async fn load_message(&self, message_id: MessageId) -> Result<Option<MessageRecord>> {
        Ok(self.messages.get(&message_id).map(|e| e.clone()))
    }

    async fn update_message_status(
        &self,
        message_id: MessageId,
        next: MessageStatus,
    ) -> Result<MessageStatus> {
        let Some(mut entry) = self.messages.get_mut(&message_id) else {
            bail!("message {} does not exist", message_id.0);
        };
        if let Some(advanced) = entry.status.advance(next) {
            entry.status = advanced;
        }
        Ok(entry.status)
    }

    async fn apply_edit(
        &self,
        message_id: MessageId,
        sealed_content: String,
        edited_at: DateTime<Utc>,
    ) -> Result<()> {
        let Some(mut entry) = self.messages.get_mut(&message_id) else {
            bail!("message {} does not exist", message_id.0);
        };
        let previous = std::mem::replace(&mut entry.content, sealed_content);
        entry.edited_at = Some(edited_at);
        self.edits
            .entry(message_id)
            .or_default()
            .push((previous, edited_at));
        Ok(())
    }

    async fn apply_delete(&self, message_id: MessageId) -> Result<()> {
        let Some(mut entry) = self.messages.get_mut(&message_id) else {
            bail!("message {} does not exist", message_id.0);
        };
        entry.content.clear();
        entry.is_deleted = true;
        Ok(())
    }

    async fn hide_for_user(&self, message_id: MessageId, user_id: UserId) -> Result<()> {
        self.hidden.insert((message_id, user_id));
        Ok(())
    }

    async fn toggle_reaction(
        &self,
        message_id: MessageId,
        user_id: UserId,
        emoji: &str,
    ) -> Result<ReactionAction> {
        let mut entry = self.reactions.entry(message_id).or_default();
        let existing = entry
            .iter()
            .position(|(u, e)| *u == user_id && e == emoji);
        Ok(match existing {
            Some(index) => {
                entry.remove(index);
                ReactionAction::Removed
            }
            None => {
                entry.push((user_id, emoji.to_owned()));
                ReactionAction::Added
            }
        })
    }

    async fn unread_ids_up_to(
        &self,
        conversation_id: ConversationId,
        reader_id: UserId,
        up_to: MessageId,
    ) -> Result<Vec<MessageId>> {
        let mut ids: Vec<MessageId> = self
            .messages
            .iter()
            .filter(|entry| {
                let m = entry.value();
                m.conversation_id == conversation_id
                    && m.message_id <= up_to
                    && m.sender_id != reader_id
                    && !self.receipts.contains_key(&(m.message_id, reader_id))
                    && !self.hidden.contains(&(m.message_id, reader_id))
            })
            .map(|entry| *entry.key())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn append_receipt(
        &self,
        message_id: MessageId,
        user_id: UserId,
        read_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inserted = false;
        self.receipts
            .entry((message_id, user_id))
            .or_insert_with(|| {
                inserted = true;
                read_at
            });
        Ok(inserted)
    }

    async fn unread_count(&self, conversation_id: ConversationId, user_id: UserId) -> Result<u64> {
        Ok(self
            .unread_ids_up_to(conversation_id, user_id, MessageId(i64::MAX))
            .await?
            .len() as u64)
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
