use crate::error::DeliveryError;
use crate::registry::{ConnectionRegistry, PresenceTransition};
use crate::rooms::RoomManager;
use shared::domain::{ConversationId, UserId};
use shared::protocol::ServerEvent;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Runs the presence broadcaster: consumes registry transitions and fans
/// `presence_changed` to everyone sharing a conversation with the user.
/// Returns the worker handle; the owner aborts it on shutdown.
pub(crate) fn spawn_broadcaster(
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RoomManager>,
) -> JoinHandle<()> {
    let mut feed = registry.subscribe();
    tokio::spawn(async move {
        loop {
            match feed.recv().await {
                Ok(transition) => fan_presence(&registry, &rooms, &transition),
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "presence feed lagged, transitions dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Best-effort, no retry. Peers that miss a transition re-synchronize when
/// they reconnect. A user sharing several conversations with the subject is
/// notified once, not once per conversation.
pub(crate) fn fan_presence(
    registry: &ConnectionRegistry,
    rooms: &RoomManager,
    transition: &PresenceTransition,
) {
    let event = ServerEvent::PresenceChanged {
        user_id: transition.user_id,
        is_online: transition.is_online,
        last_seen_at: transition.last_seen_at,
    };
    let mut notified: HashSet<UserId> = HashSet::new();
    for conversation_id in rooms.conversations_of(transition.user_id) {
        for member in rooms.members_of(conversation_id) {
            if member != transition.user_id && notified.insert(member) {
                registry.deliver(member, &event);
            }
        }
    }
    debug!(
        user_id = transition.user_id.0,
        is_online = transition.is_online,
        peers = notified.len(),
        "presence fanned"
    );
}

/// Ephemeral typing relay. Same membership gate and fan-out shape as
/// presence, nothing recorded anywhere.
pub(crate) fn fan_typing(
    registry: &ConnectionRegistry,
    rooms: &RoomManager,
    user_id: UserId,
    conversation_id: ConversationId,
    is_typing: bool,
) -> Result<(), DeliveryError> {
    if !rooms.is_member(user_id, conversation_id) {
        return Err(DeliveryError::NotAMember {
            user_id,
            conversation_id,
        });
    }
    let event = ServerEvent::TypingChanged {
        conversation_id,
        user_id,
        is_typing,
    };
    for member in rooms.members_of(conversation_id) {
        if member != user_id {
            registry.deliver(member, &event);
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;
