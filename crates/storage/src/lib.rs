use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use realtime::store::{ConversationRecord, MessageRecord, NewMessage, Store};
use shared::domain::{
    ConversationId, ConversationKind, MessageId, MessageStatus, ReactionAction, UserId,
};

/// Sqlite-backed implementation of the delivery core's [`Store`] contract.
/// Message content lands here already sealed; this layer never sees
/// plaintext.
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // Every pooled connection to `:memory:` opens its own blank database,
        // so in-memory urls must keep the pool at a single connection.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn create_user(&self, username: &str) -> Result<UserId> {
        let rec = sqlx::query(
            "INSERT INTO users (username) VALUES (?)
             ON CONFLICT(username) DO UPDATE SET username=excluded.username
             RETURNING id",
        )
        .bind(username)
        .fetch_one(&self.pool)
        .await?;
        Ok(UserId(rec.get::<i64, _>(0)))
    }

    pub async fn create_conversation(
        &self,
        kind: ConversationKind,
        name: &str,
        members: &[UserId],
    ) -> Result<ConversationId> {
        let mut tx = self.pool.begin().await?;

        let rec = sqlx::query("INSERT INTO conversations (kind, name) VALUES (?, ?) RETURNING id")
            .bind(kind.as_str())
            .bind(name)
            .fetch_one(&mut *tx)
            .await?;
        let conversation_id = ConversationId(rec.get::<i64, _>(0));

        for user_id in members {
            sqlx::query(
                "INSERT INTO conversation_members (conversation_id, user_id) VALUES (?, ?)
                 ON CONFLICT DO NOTHING",
            )
            .bind(conversation_id.0)
            .bind(user_id.0)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(conversation_id)
    }

    pub async fn find_conversation_by_name(&self, name: &str) -> Result<Option<ConversationId>> {
        let row = sqlx::query("SELECT id FROM conversations WHERE name = ? ORDER BY id LIMIT 1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| ConversationId(r.get::<i64, _>(0))))
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn display_name(&self, user_id: UserId) -> Result<Option<String>> {
        let row = sqlx::query("SELECT username FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    async fn load_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<ConversationRecord>> {
        let row = sqlx::query("SELECT kind, name FROM conversations WHERE id = ?")
            .bind(conversation_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| {
            let kind = ConversationKind::parse(&r.get::<String, _>(0))
                .unwrap_or(ConversationKind::Group);
            ConversationRecord {
                conversation_id,
                kind,
                name: r.get::<String, _>(1),
            }
        }))
    }

    async fn load_membership(&self, conversation_id: ConversationId) -> Result<HashSet<UserId>> {
        let rows = sqlx::query("SELECT user_id FROM conversation_members WHERE conversation_id = ?")
            .bind(conversation_id.0)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| UserId(r.get::<i64, _>(0)))
            .collect())
    }

    async fn all_memberships(&self) -> Result<Vec<(ConversationId, UserId)>> {
        let rows = sqlx::query("SELECT conversation_id, user_id FROM conversation_members")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| {
                (
                    ConversationId(r.get::<i64, _>(0)),
                    UserId(r.get::<i64, _>(1)),
                )
            })
            .collect())
    }

    async fn add_member(&self, conversation_id: ConversationId, user_id: UserId) -> Result<()> {
        let exists = sqlx::query("SELECT 1 FROM conversations WHERE id = ?")
            .bind(conversation_id.0)
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            bail!("conversation {} does not exist", conversation_id.0);
        }

        sqlx::query(
            "INSERT INTO conversation_members (conversation_id, user_id) VALUES (?, ?)
             ON CONFLICT DO NOTHING",
        )
        .bind(conversation_id.0)
        .bind(user_id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_member(&self, conversation_id: ConversationId, user_id: UserId) -> Result<()> {
        sqlx::query("DELETE FROM conversation_members WHERE conversation_id = ? AND user_id = ?")
            .bind(conversation_id.0)
            .bind(user_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn persist_message(&self, new: NewMessage) -> Result<MessageRecord> {
        let rec = sqlx::query(
            "INSERT INTO messages (conversation_id, sender_user_id, content, status, created_at)
             VALUES (?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(new.conversation_id.0)
        .bind(new.sender_id.0)
        .bind(&new.content)
        .bind(MessageStatus::Sending.as_str())
        .bind(new.created_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(MessageRecord {
            message_id: MessageId(rec.get::<i64, _>(0)),
            conversation_id: new.conversation_id,
            sender_id: new.sender_id,
            content: new.content,
            status: MessageStatus::Sending,
            created_at: new.created_at,
            edited_at: None,
            is_deleted: false,
        })
    }

    async fn load_message(&self, message_id: MessageId) -> Result<Option<MessageRecord>> {
        let row = sqlx::query(
            "SELECT conversation_id, sender_user_id, content, status, created_at, edited_at, is_deleted
             FROM messages WHERE id = ?",
        )
        .bind(message_id.0)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let raw_status = row.get::<String, _>(3);
        let status = MessageStatus::parse(&raw_status)
            .with_context(|| format!("message {} has unknown status '{raw_status}'", message_id.0))?;

        Ok(Some(MessageRecord {
            message_id,
            conversation_id: ConversationId(row.get::<i64, _>(0)),
            sender_id: UserId(row.get::<i64, _>(1)),
            content: row.get::<String, _>(2),
            status,
            created_at: row.get::<DateTime<Utc>, _>(4),
            edited_at: row.get::<Option<DateTime<Utc>>, _>(5),
            is_deleted: row.get::<bool, _>(6),
        }))
    }

    async fn update_message_status(
        &self,
        message_id: MessageId,
        next: MessageStatus,
    ) -> Result<MessageStatus> {
        // Compare-and-advance: the UPDATE is guarded by the status we read,
        // so a racing writer makes us re-read instead of regressing the row.
        loop {
            let row = sqlx::query("SELECT status FROM messages WHERE id = ?")
                .bind(message_id.0)
                .fetch_optional(&self.pool)
                .await?;
            let Some(row) = row else {
                bail!("message {} does not exist", message_id.0);
            };

            let raw = row.get::<String, _>(0);
            let current = MessageStatus::parse(&raw)
                .with_context(|| format!("message {} has unknown status '{raw}'", message_id.0))?;
            let Some(advanced) = current.advance(next) else {
                return Ok(current);
            };

            let updated = sqlx::query("UPDATE messages SET status = ? WHERE id = ? AND status = ?")
                .bind(advanced.as_str())
                .bind(message_id.0)
                .bind(current.as_str())
                .execute(&self.pool)
                .await?
                .rows_affected();
            if updated == 1 {
                return Ok(advanced);
            }
        }
    }

    async fn apply_edit(
        &self,
        message_id: MessageId,
        sealed_content: String,
        edited_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT content FROM messages WHERE id = ?")
            .bind(message_id.0)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            bail!("message {} does not exist", message_id.0);
        };

        sqlx::query("INSERT INTO message_edits (message_id, content, edited_at) VALUES (?, ?, ?)")
            .bind(message_id.0)
            .bind(row.get::<String, _>(0))
            .bind(edited_at)
            .execute(&mut *tx)
            .await?;

        sqlx::query("UPDATE messages SET content = ?, edited_at = ? WHERE id = ?")
            .bind(&sealed_content)
            .bind(edited_at)
            .bind(message_id.0)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn apply_delete(&self, message_id: MessageId) -> Result<()> {
        let updated = sqlx::query("UPDATE messages SET content = '', is_deleted = 1 WHERE id = ?")
            .bind(message_id.0)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if updated == 0 {
            bail!("message {} does not exist", message_id.0);
        }
        Ok(())
    }

    async fn hide_for_user(&self, message_id: MessageId, user_id: UserId) -> Result<()> {
        sqlx::query(
            "INSERT INTO message_hides (message_id, user_id) VALUES (?, ?)
             ON CONFLICT DO NOTHING",
        )
        .bind(message_id.0)
        .bind(user_id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn toggle_reaction(
        &self,
        message_id: MessageId,
        user_id: UserId,
        emoji: &str,
    ) -> Result<ReactionAction> {
        let removed = sqlx::query(
            "DELETE FROM reactions WHERE message_id = ? AND user_id = ? AND emoji = ?",
        )
        .bind(message_id.0)
        .bind(user_id.0)
        .bind(emoji)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if removed > 0 {
            return Ok(ReactionAction::Removed);
        }

        sqlx::query(
            "INSERT INTO reactions (message_id, user_id, emoji) VALUES (?, ?, ?)
             ON CONFLICT DO NOTHING",
        )
        .bind(message_id.0)
        .bind(user_id.0)
        .bind(emoji)
        .execute(&self.pool)
        .await?;
        Ok(ReactionAction::Added)
    }

    async fn unread_ids_up_to(
        &self,
        conversation_id: ConversationId,
        reader_id: UserId,
        up_to: MessageId,
    ) -> Result<Vec<MessageId>> {
        let rows = sqlx::query(
            "SELECT m.id FROM messages m
             WHERE m.conversation_id = ? AND m.id <= ? AND m.sender_user_id != ?
               AND NOT EXISTS (
                   SELECT 1 FROM read_receipts r WHERE r.message_id = m.id AND r.user_id = ?
               )
               AND NOT EXISTS (
                   SELECT 1 FROM message_hides h WHERE h.message_id = m.id AND h.user_id = ?
               )
             ORDER BY m.id",
        )
        .bind(conversation_id.0)
        .bind(up_to.0)
        .bind(reader_id.0)
        .bind(reader_id.0)
        .bind(reader_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| MessageId(r.get::<i64, _>(0)))
            .collect())
    }

    async fn append_receipt(
        &self,
        message_id: MessageId,
        user_id: UserId,
        read_at: DateTime<Utc>,
    ) -> Result<bool> {
        let inserted = sqlx::query(
            "INSERT INTO read_receipts (message_id, user_id, read_at) VALUES (?, ?, ?)
             ON CONFLICT DO NOTHING",
        )
        .bind(message_id.0)
        .bind(user_id.0)
        .bind(read_at)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(inserted == 1)
    }

    async fn unread_count(&self, conversation_id: ConversationId, user_id: UserId) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages m
             WHERE m.conversation_id = ? AND m.sender_user_id != ?
               AND NOT EXISTS (
                   SELECT 1 FROM read_receipts r WHERE r.message_id = m.id AND r.user_id = ?
               )
               AND NOT EXISTS (
                   SELECT 1 FROM message_hides h WHERE h.message_id = m.id AND h.user_id = ?
               )",
        )
        .bind(conversation_id.0)
        .bind(user_id.0)
        .bind(user_id.0)
        .bind(user_id.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
