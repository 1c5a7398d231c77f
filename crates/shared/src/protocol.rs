use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{
        CallId, CallKind, ConversationId, MessageId, MessageStatus, ReactionAction, UserId,
    },
    error::ErrorReply,
};

/// Events a connected session may send over its transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientEvent {
    JoinConversation {
        conversation_id: ConversationId,
    },
    LeaveConversation {
        conversation_id: ConversationId,
    },
    SendMessage {
        conversation_id: ConversationId,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        temp_id: Option<String>,
    },
    EditMessage {
        message_id: MessageId,
        content: String,
    },
    DeleteMessage {
        message_id: MessageId,
        for_everyone: bool,
    },
    React {
        message_id: MessageId,
        emoji: String,
    },
    MarkRead {
        conversation_id: ConversationId,
        up_to_message_id: MessageId,
    },
    AckDelivered {
        message_id: MessageId,
    },
    TypingStart {
        conversation_id: ConversationId,
    },
    TypingStop {
        conversation_id: ConversationId,
    },
    CallOffer {
        call_id: CallId,
        target_user_id: UserId,
        kind: CallKind,
        sdp: String,
    },
    CallAnswer {
        call_id: CallId,
        target_user_id: UserId,
        sdp: String,
    },
    CallIceCandidate {
        call_id: CallId,
        target_user_id: UserId,
        candidate: String,
    },
    CallHangup {
        call_id: CallId,
        target_user_id: UserId,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub conversation_id: ConversationId,
    pub title: String,
    pub body: String,
    pub message_count: usize,
    pub sender_count: usize,
}

/// Events the core pushes to a session's transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    MessageNew {
        message: MessagePayload,
    },
    MessageEdited {
        message_id: MessageId,
        conversation_id: ConversationId,
        content: String,
        edited_at: DateTime<Utc>,
    },
    MessageDeleted {
        message_id: MessageId,
        conversation_id: ConversationId,
    },
    MessageStatus {
        message_id: MessageId,
        conversation_id: ConversationId,
        status: MessageStatus,
    },
    ReactionChanged {
        message_id: MessageId,
        conversation_id: ConversationId,
        user_id: UserId,
        emoji: String,
        action: ReactionAction,
    },
    ReadReceiptsUpdated {
        conversation_id: ConversationId,
        reader_id: UserId,
        up_to_message_id: MessageId,
    },
    PresenceChanged {
        user_id: UserId,
        is_online: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_seen_at: Option<DateTime<Utc>>,
    },
    TypingChanged {
        conversation_id: ConversationId,
        user_id: UserId,
        is_typing: bool,
    },
    NotificationSummary {
        notification: NotificationPayload,
    },
    CallOffer {
        call_id: CallId,
        from_user_id: UserId,
        kind: CallKind,
        sdp: String,
    },
    CallAnswer {
        call_id: CallId,
        from_user_id: UserId,
        sdp: String,
    },
    CallIceCandidate {
        call_id: CallId,
        from_user_id: UserId,
        candidate: String,
    },
    CallHangup {
        call_id: CallId,
        from_user_id: UserId,
    },
    CallUnreachable {
        call_id: CallId,
        target_user_id: UserId,
    },
    Error(ErrorReply),
}
