use anyhow::Result;
use shared::domain::ConversationId;

/// Per-conversation content protection the pipeline calls around the store.
///
/// The pipeline seals content just before persisting it; fan-out always
/// carries the plaintext already in hand, so sealed bytes stay at rest.
/// `open` is the inverse for whatever reads sealed rows back (history
/// reads live outside this core). What sealing actually is (group keys,
/// device trees, …) is the implementation's business. A seal failure
/// aborts the operation as a persistence-class error.
pub trait ConversationCipher: Send + Sync {
    fn seal(&self, conversation_id: ConversationId, plaintext: &str) -> Result<String>;
    fn open(&self, conversation_id: ConversationId, sealed: &str) -> Result<String>;
}

/// Stores content as-is. The default when no end-to-end layer is wired in.
pub struct PassthroughCipher;

impl ConversationCipher for PassthroughCipher {
    fn seal(&self, _conversation_id: ConversationId, plaintext: &str) -> Result<String> {
        Ok(plaintext.to_owned())
    }

    fn open(&self, _conversation_id: ConversationId, sealed: &str) -> Result<String> {
        Ok(sealed.to_owned())
    }
}
