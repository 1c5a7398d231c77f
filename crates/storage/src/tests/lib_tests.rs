use super::*;

fn ts(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).expect("timestamp")
}

async fn store_with_pair() -> (SqliteStore, UserId, UserId, ConversationId) {
    let store = SqliteStore::new("sqlite::memory:").await.expect("db");
    let alice = store.create_user("alice").await.expect("alice");
    let bob = store.create_user("bob").await.expect("bob");
    let conversation = store
        .create_conversation(ConversationKind::Direct, "alice+bob", &[alice, bob])
        .await
        .expect("conversation");
    (store, alice, bob, conversation)
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let store = SqliteStore::new("sqlite::memory:").await.expect("db");
    store.health_check().await.expect("health check");
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let suffix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let temp_root = std::env::temp_dir().join(format!("delivery_storage_test_{suffix}"));
    let db_path = temp_root.join("nested").join("delivery.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let store = SqliteStore::new(&database_url).await.expect("db");
    drop(store);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );

    std::fs::remove_dir_all(temp_root).expect("cleanup");
}

#[tokio::test]
async fn create_user_upserts_on_username() {
    let store = SqliteStore::new("sqlite::memory:").await.expect("db");
    let first = store.create_user("alice").await.expect("first");
    let second = store.create_user("alice").await.expect("second");
    assert_eq!(first, second);
    assert_eq!(
        store.display_name(first).await.expect("name"),
        Some("alice".to_string())
    );
}

#[tokio::test]
async fn persists_and_reloads_a_message() {
    let (store, alice, _bob, conversation) = store_with_pair().await;

    let stored = store
        .persist_message(NewMessage {
            conversation_id: conversation,
            sender_id: alice,
            content: "sealed-bytes".to_string(),
            created_at: ts(1_700_000_000),
        })
        .await
        .expect("persist");
    assert!(stored.message_id.0 > 0);
    assert_eq!(stored.status, MessageStatus::Sending);

    let loaded = store
        .load_message(stored.message_id)
        .await
        .expect("load")
        .expect("present");
    assert_eq!(loaded.conversation_id, conversation);
    assert_eq!(loaded.sender_id, alice);
    assert_eq!(loaded.content, "sealed-bytes");
    assert_eq!(loaded.status, MessageStatus::Sending);
    assert_eq!(loaded.created_at, ts(1_700_000_000));
    assert_eq!(loaded.edited_at, None);
    assert!(!loaded.is_deleted);
}

#[tokio::test]
async fn status_updates_compare_and_advance() {
    let (store, alice, _bob, conversation) = store_with_pair().await;
    let message = store
        .persist_message(NewMessage {
            conversation_id: conversation,
            sender_id: alice,
            content: "x".to_string(),
            created_at: ts(1_700_000_000),
        })
        .await
        .expect("persist");

    let after_sent = store
        .update_message_status(message.message_id, MessageStatus::Sent)
        .await
        .expect("sent");
    assert_eq!(after_sent, MessageStatus::Sent);

    let after_read = store
        .update_message_status(message.message_id, MessageStatus::Read)
        .await
        .expect("read");
    assert_eq!(after_read, MessageStatus::Read);

    // A stale delivery ack arriving after the read must not regress the row.
    let after_stale = store
        .update_message_status(message.message_id, MessageStatus::Delivered)
        .await
        .expect("stale delivered");
    assert_eq!(after_stale, MessageStatus::Read);
}

#[tokio::test]
async fn failed_is_only_reachable_before_delivery() {
    let (store, alice, _bob, conversation) = store_with_pair().await;
    let message = store
        .persist_message(NewMessage {
            conversation_id: conversation,
            sender_id: alice,
            content: "x".to_string(),
            created_at: ts(1_700_000_000),
        })
        .await
        .expect("persist");

    store
        .update_message_status(message.message_id, MessageStatus::Delivered)
        .await
        .expect("delivered");
    let status = store
        .update_message_status(message.message_id, MessageStatus::Failed)
        .await
        .expect("failed attempt");
    assert_eq!(status, MessageStatus::Delivered);
}

#[tokio::test]
async fn append_receipt_is_idempotent_and_keeps_the_first_timestamp() {
    let (store, alice, bob, conversation) = store_with_pair().await;
    let message = store
        .persist_message(NewMessage {
            conversation_id: conversation,
            sender_id: alice,
            content: "x".to_string(),
            created_at: ts(1_700_000_000),
        })
        .await
        .expect("persist");

    let first = store
        .append_receipt(message.message_id, bob, ts(1_700_000_100))
        .await
        .expect("first receipt");
    let second = store
        .append_receipt(message.message_id, bob, ts(1_700_000_200))
        .await
        .expect("second receipt");
    assert!(first);
    assert!(!second);

    let read_at: DateTime<Utc> =
        sqlx::query_scalar("SELECT read_at FROM read_receipts WHERE message_id = ? AND user_id = ?")
            .bind(message.message_id.0)
            .bind(bob.0)
            .fetch_one(store.pool())
            .await
            .expect("read_at");
    assert_eq!(read_at, ts(1_700_000_100));
}

#[tokio::test]
async fn unread_ids_skip_own_receipted_and_hidden_messages() {
    let (store, alice, bob, conversation) = store_with_pair().await;

    let mut ids = Vec::new();
    for n in 0..3 {
        let message = store
            .persist_message(NewMessage {
                conversation_id: conversation,
                sender_id: alice,
                content: format!("m{n}"),
                created_at: ts(1_700_000_000 + n),
            })
            .await
            .expect("persist");
        ids.push(message.message_id);
    }
    let own = store
        .persist_message(NewMessage {
            conversation_id: conversation,
            sender_id: bob,
            content: "own".to_string(),
            created_at: ts(1_700_000_010),
        })
        .await
        .expect("persist own");

    store
        .append_receipt(ids[0], bob, ts(1_700_000_100))
        .await
        .expect("receipt");
    store.hide_for_user(ids[1], bob).await.expect("hide");

    let unread = store
        .unread_ids_up_to(conversation, bob, own.message_id)
        .await
        .expect("unread");
    assert_eq!(unread, vec![ids[2]]);
    assert_eq!(
        store.unread_count(conversation, bob).await.expect("count"),
        1
    );
}

#[tokio::test]
async fn mark_read_up_to_reports_only_newly_receipted_ids() {
    let (store, alice, bob, conversation) = store_with_pair().await;

    let mut ids = Vec::new();
    for n in 0..3 {
        let message = store
            .persist_message(NewMessage {
                conversation_id: conversation,
                sender_id: alice,
                content: format!("m{n}"),
                created_at: ts(1_700_000_000 + n),
            })
            .await
            .expect("persist");
        ids.push(message.message_id);
    }

    let first_pass = store
        .mark_read_up_to(conversation, bob, ids[1], ts(1_700_000_100))
        .await
        .expect("first pass");
    assert_eq!(first_pass, vec![ids[0], ids[1]]);

    let second_pass = store
        .mark_read_up_to(conversation, bob, ids[2], ts(1_700_000_200))
        .await
        .expect("second pass");
    assert_eq!(second_pass, vec![ids[2]]);
}

#[tokio::test]
async fn toggle_reaction_adds_then_removes() {
    let (store, alice, bob, conversation) = store_with_pair().await;
    let message = store
        .persist_message(NewMessage {
            conversation_id: conversation,
            sender_id: alice,
            content: "x".to_string(),
            created_at: ts(1_700_000_000),
        })
        .await
        .expect("persist");

    let added = store
        .toggle_reaction(message.message_id, bob, "+1")
        .await
        .expect("add");
    assert_eq!(added, ReactionAction::Added);

    let removed = store
        .toggle_reaction(message.message_id, bob, "+1")
        .await
        .expect("remove");
    assert_eq!(removed, ReactionAction::Removed);

    // A different emoji from the same user is an independent toggle.
    let other = store
        .toggle_reaction(message.message_id, bob, "eyes")
        .await
        .expect("other emoji");
    assert_eq!(other, ReactionAction::Added);
}

#[tokio::test]
async fn edit_keeps_prior_content_in_history() {
    let (store, alice, _bob, conversation) = store_with_pair().await;
    let message = store
        .persist_message(NewMessage {
            conversation_id: conversation,
            sender_id: alice,
            content: "before".to_string(),
            created_at: ts(1_700_000_000),
        })
        .await
        .expect("persist");

    store
        .apply_edit(message.message_id, "after".to_string(), ts(1_700_000_060))
        .await
        .expect("edit");

    let loaded = store
        .load_message(message.message_id)
        .await
        .expect("load")
        .expect("present");
    assert_eq!(loaded.content, "after");
    assert_eq!(loaded.edited_at, Some(ts(1_700_000_060)));

    let history: Vec<String> =
        sqlx::query_scalar("SELECT content FROM message_edits WHERE message_id = ? ORDER BY rowid")
            .bind(message.message_id.0)
            .fetch_all(store.pool())
            .await
            .expect("history");
    assert_eq!(history, vec!["before".to_string()]);
}

#[tokio::test]
async fn delete_tombstones_but_keeps_the_row() {
    let (store, alice, _bob, conversation) = store_with_pair().await;
    let message = store
        .persist_message(NewMessage {
            conversation_id: conversation,
            sender_id: alice,
            content: "secret".to_string(),
            created_at: ts(1_700_000_000),
        })
        .await
        .expect("persist");

    store.apply_delete(message.message_id).await.expect("delete");

    let loaded = store
        .load_message(message.message_id)
        .await
        .expect("load")
        .expect("row survives");
    assert!(loaded.is_deleted);
    assert!(loaded.content.is_empty());
}

#[tokio::test]
async fn add_member_rejects_unknown_conversation() {
    let store = SqliteStore::new("sqlite::memory:").await.expect("db");
    let alice = store.create_user("alice").await.expect("alice");

    let err = store.add_member(ConversationId(999), alice).await;
    assert!(err.is_err());
}

#[tokio::test]
async fn membership_changes_round_trip() {
    let (store, alice, bob, conversation) = store_with_pair().await;
    let carol = store.create_user("carol").await.expect("carol");

    store.add_member(conversation, carol).await.expect("add");
    store.add_member(conversation, carol).await.expect("re-add");

    let members = store.load_membership(conversation).await.expect("members");
    assert_eq!(members.len(), 3);
    assert!(members.contains(&carol));

    store
        .remove_member(conversation, alice)
        .await
        .expect("remove");
    let members = store.load_membership(conversation).await.expect("members");
    assert!(!members.contains(&alice));
    assert!(members.contains(&bob));
}

#[tokio::test]
async fn all_memberships_cover_every_conversation() {
    let store = SqliteStore::new("sqlite::memory:").await.expect("db");
    let alice = store.create_user("alice").await.expect("alice");
    let bob = store.create_user("bob").await.expect("bob");
    let first = store
        .create_conversation(ConversationKind::Group, "general", &[alice, bob])
        .await
        .expect("first");
    let second = store
        .create_conversation(ConversationKind::Direct, "alice+bob", &[alice])
        .await
        .expect("second");

    let mut pairs = store.all_memberships().await.expect("pairs");
    pairs.sort();
    assert_eq!(
        pairs,
        vec![(first, alice), (first, bob), (second, alice)]
    );
}

#[tokio::test]
async fn find_conversation_by_name_is_exact() {
    let store = SqliteStore::new("sqlite::memory:").await.expect("db");
    let alice = store.create_user("alice").await.expect("alice");
    let general = store
        .create_conversation(ConversationKind::Group, "general", &[alice])
        .await
        .expect("general");
    store
        .create_conversation(ConversationKind::Group, "random", &[alice])
        .await
        .expect("random");

    assert_eq!(
        store
            .find_conversation_by_name("general")
            .await
            .expect("find"),
        Some(general)
    );
    assert_eq!(
        store
            .find_conversation_by_name("missing")
            .await
            .expect("find"),
        None
    );
}

#[tokio::test]
async fn concurrent_status_advances_settle_on_the_furthest() {
    let (store, alice, _bob, conversation) = store_with_pair().await;
    let message = store
        .persist_message(NewMessage {
            conversation_id: conversation,
            sender_id: alice,
            content: "x".to_string(),
            created_at: ts(1_700_000_000),
        })
        .await
        .expect("persist");
    store
        .update_message_status(message.message_id, MessageStatus::Sent)
        .await
        .expect("sent");

    let store_a = store.clone();
    let store_b = store.clone();
    let id = message.message_id;
    let (left, right) = tokio::join!(
        async move {
            store_a
                .update_message_status(id, MessageStatus::Delivered)
                .await
                .expect("left advance")
        },
        async move {
            store_b
                .update_message_status(id, MessageStatus::Read)
                .await
                .expect("right advance")
        }
    );

    assert!(left == MessageStatus::Delivered || left == MessageStatus::Read);
    assert_eq!(right, MessageStatus::Read);
    let settled = store
        .load_message(message.message_id)
        .await
        .expect("load")
        .expect("present");
    assert_eq!(settled.status, MessageStatus::Read);
}
