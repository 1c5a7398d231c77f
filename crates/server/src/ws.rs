use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use shared::{
    domain::{SessionId, UserId},
    error::{ErrorCode, ErrorReply},
    protocol::{ClientEvent, ServerEvent},
};
use tokio::sync::mpsc;
use tracing::debug;

use crate::AppState;

/// Outbound queue depth per session. A session that falls this far behind
/// starts losing events rather than stalling fan-out for everyone else.
const SESSION_BUFFER: usize = 64;

/// Owns one authenticated socket: registers the session, forwards queued
/// server events outbound, and dispatches inbound intents until the peer
/// goes away.
pub async fn connection(state: Arc<AppState>, socket: WebSocket, user_id: UserId) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerEvent>(SESSION_BUFFER);
    let session_id = state.core.connect(user_id, tx.clone());
    debug!(user_id = user_id.0, session_id = %session_id.0, "session connected");

    let send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = receiver.next().await {
        match message {
            Message::Text(text) => {
                let event = match serde_json::from_str::<ClientEvent>(&text) {
                    Ok(event) => event,
                    Err(err) => {
                        debug!(user_id = user_id.0, error = %err, "malformed client event");
                        let reply = ErrorReply::new(ErrorCode::Validation, "malformed event");
                        let _ = tx.send(ServerEvent::Error(reply)).await;
                        continue;
                    }
                };
                dispatch(&state, user_id, session_id, &tx, event).await;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.core.disconnect(session_id);
    send_task.abort();
    debug!(user_id = user_id.0, session_id = %session_id.0, "session closed");
}

/// Routes one inbound intent into the core. Failures go back to the
/// originating session only; successful sends are answered with the stored
/// message so the client can reconcile its optimistic copy.
async fn dispatch(
    state: &AppState,
    user_id: UserId,
    session_id: SessionId,
    reply: &mpsc::Sender<ServerEvent>,
    event: ClientEvent,
) {
    let outcome = match event {
        ClientEvent::SendMessage {
            conversation_id,
            content,
            temp_id,
        } => {
            let sent = state
                .core
                .send_message(user_id, conversation_id, content, temp_id.clone(), Some(session_id))
                .await;
            match sent {
                Ok(message) => {
                    let _ = reply.send(ServerEvent::MessageNew { message }).await;
                }
                Err(err) => {
                    let error =
                        ErrorReply::new(err.code(), err.to_string()).with_temp_id(temp_id);
                    let _ = reply.send(ServerEvent::Error(error)).await;
                }
            }
            return;
        }
        ClientEvent::JoinConversation { conversation_id } => {
            state.core.join_conversation(user_id, conversation_id).await
        }
        ClientEvent::LeaveConversation { conversation_id } => {
            state
                .core
                .leave_conversation(user_id, conversation_id)
                .await
        }
        ClientEvent::EditMessage {
            message_id,
            content,
        } => state.core.edit_message(user_id, message_id, content).await,
        ClientEvent::DeleteMessage {
            message_id,
            for_everyone,
        } => {
            state
                .core
                .delete_message(user_id, message_id, for_everyone)
                .await
        }
        ClientEvent::React { message_id, emoji } => {
            state.core.react(user_id, message_id, emoji).await
        }
        ClientEvent::MarkRead {
            conversation_id,
            up_to_message_id,
        } => {
            state
                .core
                .mark_read(user_id, conversation_id, up_to_message_id, Some(session_id))
                .await
        }
        ClientEvent::AckDelivered { message_id } => {
            state.core.ack_delivered(user_id, message_id).await
        }
        ClientEvent::TypingStart { conversation_id } => {
            state.core.typing(user_id, conversation_id, true)
        }
        ClientEvent::TypingStop { conversation_id } => {
            state.core.typing(user_id, conversation_id, false)
        }
        ClientEvent::CallOffer {
            call_id,
            target_user_id,
            kind,
            sdp,
        } => {
            state
                .core
                .call_offer(user_id, call_id, target_user_id, kind, sdp);
            Ok(())
        }
        ClientEvent::CallAnswer {
            call_id,
            target_user_id,
            sdp,
        } => {
            state.core.call_answer(user_id, call_id, target_user_id, sdp);
            Ok(())
        }
        ClientEvent::CallIceCandidate {
            call_id,
            target_user_id,
            candidate,
        } => {
            state
                .core
                .call_ice_candidate(user_id, call_id, target_user_id, candidate);
            Ok(())
        }
        ClientEvent::CallHangup {
            call_id,
            target_user_id,
        } => {
            state.core.call_hangup(user_id, call_id, target_user_id);
            Ok(())
        }
    };

    if let Err(err) = outcome {
        let error = ErrorReply::new(err.code(), err.to_string());
        let _ = reply.send(ServerEvent::Error(error)).await;
    }
}

#[cfg(test)]
#[path = "tests/ws_tests.rs"]
mod tests;
