use super::*;
use crate::{DeliveryPolicy, MemoryStore, PassthroughCipher, RealtimeCore};
use async_trait::async_trait;
use shared::domain::{ConversationKind, MessageStatus};
use shared::protocol::{MessagePayload, NotificationPayload};
use std::time::Duration;
use tokio::sync::mpsc;

struct NullSink;

#[async_trait]
impl crate::NotificationSink for NullSink {
    async fn deliver(
        &self,
        _user_id: UserId,
        _title: &str,
        _body: &str,
        _payload: &NotificationPayload,
    ) {
    }
}

async fn setup(members: &[UserId]) -> (RealtimeCore, Arc<MemoryStore>, ConversationId) {
    let store = Arc::new(MemoryStore::new());
    let conversation = store.create_conversation(ConversationKind::Group, "room", members);
    let core = RealtimeCore::new(
        store.clone(),
        Arc::new(PassthroughCipher),
        Arc::new(NullSink),
        DeliveryPolicy::default(),
    );
    core.seed_rooms().await.expect("seed");
    (core, store, conversation)
}

fn attach(core: &RealtimeCore, user: UserId) -> (SessionId, mpsc::Receiver<ServerEvent>) {
    let (tx, rx) = mpsc::channel(32);
    (core.connect(user, tx), rx)
}

fn drain(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

async fn send(core: &RealtimeCore, sender: UserId, conversation: ConversationId, text: &str) -> MessagePayload {
    core.send_message(sender, conversation, text.into(), None, None)
        .await
        .expect("send")
}

#[tokio::test]
async fn mark_read_rejects_outsiders() {
    let (core, _store, conversation) = setup(&[UserId(1), UserId(2)]).await;
    let result = core
        .mark_read(UserId(99), conversation, MessageId(1), None)
        .await;
    assert!(matches!(result, Err(DeliveryError::NotAMember { .. })));
}

#[tokio::test]
async fn boundary_mark_read_emits_one_event_and_advances_aggregates() {
    let alice = UserId(1);
    let bob = UserId(2);
    let (core, store, conversation) = setup(&[alice, bob]).await;
    let (_, mut rx_alice) = attach(&core, alice);

    let m1 = send(&core, alice, conversation, "one").await;
    let m2 = send(&core, alice, conversation, "two").await;
    drain(&mut rx_alice);

    core.mark_read(bob, conversation, m2.message_id, None)
        .await
        .expect("mark read");

    assert!(store.receipt_at(m1.message_id, bob).is_some());
    assert!(store.receipt_at(m2.message_id, bob).is_some());

    let events = drain(&mut rx_alice);
    let receipt_events: Vec<_> = events
        .iter()
        .filter(|event| matches!(event, ServerEvent::ReadReceiptsUpdated { .. }))
        .collect();
    assert_eq!(
        receipt_events.len(),
        1,
        "one batch event, never one per message"
    );
    assert!(matches!(
        receipt_events[0],
        ServerEvent::ReadReceiptsUpdated { reader_id, up_to_message_id, .. }
            if *reader_id == bob && *up_to_message_id == m2.message_id
    ));

    // Bob is the whole recipient set, so both messages advanced to read.
    let status_events = events
        .iter()
        .filter(|event| {
            matches!(
                event,
                ServerEvent::MessageStatus {
                    status: MessageStatus::Read,
                    ..
                }
            )
        })
        .count();
    assert_eq!(status_events, 2);
    let record = store
        .load_message(m1.message_id)
        .await
        .expect("load")
        .expect("present");
    assert_eq!(record.status, MessageStatus::Read);
}

#[tokio::test]
async fn repeat_mark_read_changes_nothing() {
    let alice = UserId(1);
    let bob = UserId(2);
    let (core, store, conversation) = setup(&[alice, bob]).await;
    let (_, mut rx_alice) = attach(&core, alice);

    let m1 = send(&core, alice, conversation, "one").await;
    core.mark_read(bob, conversation, m1.message_id, None)
        .await
        .expect("mark read");
    let first_at = store.receipt_at(m1.message_id, bob).expect("receipt");
    assert_eq!(core.unread_count(bob, conversation).await.expect("count"), 0);
    drain(&mut rx_alice);

    core.mark_read(bob, conversation, m1.message_id, None)
        .await
        .expect("repeat");

    assert_eq!(store.receipt_at(m1.message_id, bob), Some(first_at));
    assert_eq!(core.unread_count(bob, conversation).await.expect("count"), 0);
    assert!(
        drain(&mut rx_alice).is_empty(),
        "a no-op boundary re-announces nothing"
    );
}

#[tokio::test]
async fn readers_never_receipt_their_own_messages() {
    let alice = UserId(1);
    let bob = UserId(2);
    let (core, store, conversation) = setup(&[alice, bob]).await;

    let own = send(&core, bob, conversation, "mine").await;
    core.mark_read(bob, conversation, own.message_id, None)
        .await
        .expect("mark read");

    assert!(store.receipt_at(own.message_id, bob).is_none());
    assert_eq!(
        core.unread_count(alice, conversation).await.expect("count"),
        1,
        "alice still has bob's message unread"
    );
}

#[tokio::test]
async fn unread_count_follows_the_boundary() {
    let alice = UserId(1);
    let bob = UserId(2);
    let (core, _store, conversation) = setup(&[alice, bob]).await;

    send(&core, alice, conversation, "one").await;
    let m2 = send(&core, alice, conversation, "two").await;
    send(&core, alice, conversation, "three").await;

    assert_eq!(core.unread_count(bob, conversation).await.expect("count"), 3);

    core.mark_read(bob, conversation, m2.message_id, None)
        .await
        .expect("mark read");
    assert_eq!(core.unread_count(bob, conversation).await.expect("count"), 1);
}

#[tokio::test]
async fn readers_other_devices_are_synchronized() {
    let alice = UserId(1);
    let bob = UserId(2);
    let (core, _store, conversation) = setup(&[alice, bob]).await;

    let m1 = send(&core, alice, conversation, "one").await;
    let (origin, mut rx_origin) = attach(&core, bob);
    let (_, mut rx_second) = attach(&core, bob);
    drain(&mut rx_origin);
    drain(&mut rx_second);

    core.mark_read(bob, conversation, m1.message_id, Some(origin))
        .await
        .expect("mark read");

    assert!(
        drain(&mut rx_origin).is_empty(),
        "the device that marked read needs no echo"
    );
    let synced = drain(&mut rx_second);
    assert!(synced
        .iter()
        .any(|event| matches!(event, ServerEvent::ReadReceiptsUpdated { .. })));
}

#[tokio::test]
async fn aggregate_read_waits_for_the_slowest_recipient() {
    let (alice, bob, carol) = (UserId(1), UserId(2), UserId(3));
    let (core, store, conversation) = setup(&[alice, bob, carol]).await;
    let (_, mut rx_alice) = attach(&core, alice);

    let message = send(&core, alice, conversation, "hi").await;
    drain(&mut rx_alice);

    core.mark_read(bob, conversation, message.message_id, None)
        .await
        .expect("bob reads");
    assert!(
        !drain(&mut rx_alice)
            .iter()
            .any(|event| matches!(event, ServerEvent::MessageStatus { .. })),
        "minimum across recipients, not maximum of one"
    );

    core.mark_read(carol, conversation, message.message_id, None)
        .await
        .expect("carol reads");
    let events = drain(&mut rx_alice);
    assert!(events.iter().any(|event| matches!(
        event,
        ServerEvent::MessageStatus {
            status: MessageStatus::Read,
            ..
        }
    )));
    let record = store
        .load_message(message.message_id)
        .await
        .expect("load")
        .expect("present");
    assert_eq!(record.status, MessageStatus::Read);
}

#[tokio::test(start_paused = true)]
async fn opening_the_conversation_cancels_its_pending_notifications() {
    let alice = UserId(1);
    let bob = UserId(2);
    let (core, _store, conversation) = setup(&[alice, bob]).await;

    let m1 = send(&core, alice, conversation, "hi").await;
    assert!(core.batcher().has_pending(bob, conversation));

    core.mark_read(bob, conversation, m1.message_id, None)
        .await
        .expect("mark read");
    assert!(!core.batcher().has_pending(bob, conversation));

    let window = DeliveryPolicy::default().batch_window;
    tokio::time::sleep(window + Duration::from_millis(50)).await;
    assert_eq!(core.badge_of(bob), 0, "nothing flushed after the clear");
}
