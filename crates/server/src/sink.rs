use async_trait::async_trait;
use realtime::NotificationSink;
use shared::{domain::UserId, protocol::NotificationPayload};
use tracing::info;

/// Stand-in for a push gateway: what would leave for the user's devices is
/// written to the log instead.
pub struct LogNotificationSink;

#[async_trait]
impl NotificationSink for LogNotificationSink {
    async fn deliver(
        &self,
        user_id: UserId,
        title: &str,
        body: &str,
        payload: &NotificationPayload,
    ) {
        info!(
            user_id = user_id.0,
            conversation_id = payload.conversation_id.0,
            title,
            body,
            messages = payload.message_count,
            senders = payload.sender_count,
            "notification emitted"
        );
    }
}
