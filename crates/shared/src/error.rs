use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    NotAMember,
    Forbidden,
    EditWindowExpired,
    DeleteWindowExpired,
    Persistence,
    NotFound,
    Validation,
    Internal,
}

/// Wire-level error sent back to the initiating session. `temp_id` is set
/// for failed sends so the client can mark its optimistic copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReply {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<String>,
}

impl ErrorReply {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            temp_id: None,
        }
    }

    pub fn with_temp_id(mut self, temp_id: Option<String>) -> Self {
        self.temp_id = temp_id;
        self
    }
}

/// Handshake rejection. Raised before a session ever enters the registry.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("credential invalid")]
    InvalidCredential,
    #[error("credential expired")]
    ExpiredCredential,
}
