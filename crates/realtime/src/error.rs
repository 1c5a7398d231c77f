use shared::domain::{ConversationId, MessageId, UserId};
use shared::error::ErrorCode;
use thiserror::Error;

/// Failures surfaced by the delivery pipeline and its neighbors.
///
/// Every variant maps onto a wire [`ErrorCode`] so transports can reply
/// without inspecting the variant themselves.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("user {user_id:?} is not a member of conversation {conversation_id:?}")]
    NotAMember {
        user_id: UserId,
        conversation_id: ConversationId,
    },

    #[error("message {0:?} not found")]
    MessageNotFound(MessageId),

    #[error("conversation {0:?} not found")]
    ConversationNotFound(ConversationId),

    #[error("edit window expired for message {0:?}")]
    EditWindowExpired(MessageId),

    #[error("delete window expired for message {0:?}")]
    DeleteWindowExpired(MessageId),

    #[error("only the author may modify message {0:?}")]
    NotAuthor(MessageId),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("persistence failure: {0}")]
    Persistence(anyhow::Error),
}

impl DeliveryError {
    pub fn code(&self) -> ErrorCode {
        match self {
            DeliveryError::NotAMember { .. } => ErrorCode::NotAMember,
            DeliveryError::MessageNotFound(_) | DeliveryError::ConversationNotFound(_) => {
                ErrorCode::NotFound
            }
            DeliveryError::EditWindowExpired(_) => ErrorCode::EditWindowExpired,
            DeliveryError::DeleteWindowExpired(_) => ErrorCode::DeleteWindowExpired,
            DeliveryError::NotAuthor(_) => ErrorCode::Forbidden,
            DeliveryError::Validation(_) => ErrorCode::Validation,
            DeliveryError::Persistence(_) => ErrorCode::Persistence,
        }
    }
}

impl From<anyhow::Error> for DeliveryError {
    fn from(err: anyhow::Error) -> Self {
        DeliveryError::Persistence(err)
    }
}
