use super::*;
use crate::auth::mint_token;
use crate::sink::LogNotificationSink;
use crate::{build_router, AppState};
use realtime::{DeliveryPolicy, PassthroughCipher, RealtimeCore};
use shared::domain::{ConversationId, ConversationKind, MessageStatus};
use std::time::Duration;
use storage::SqliteStore;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{connect_async, tungstenite, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_app() -> (String, Arc<AppState>, UserId, UserId, ConversationId) {
    let store = SqliteStore::new("sqlite::memory:").await.expect("db");
    let alice = store.create_user("socket-alice").await.expect("alice");
    let bob = store.create_user("socket-bob").await.expect("bob");
    let pair = store
        .create_conversation(ConversationKind::Direct, "socket-pair", &[alice, bob])
        .await
        .expect("conversation");

    let core = RealtimeCore::new(
        Arc::new(store.clone()),
        Arc::new(PassthroughCipher),
        Arc::new(LogNotificationSink),
        DeliveryPolicy::default(),
    );
    core.seed_rooms().await.expect("seed");

    let state = Arc::new(AppState {
        core: Arc::new(core),
        store,
        auth: crate::auth::AuthConfig {
            secret: "socket-secret".into(),
            ttl_seconds: 600,
        },
    });
    let app = build_router(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("{addr}"), state, alice, bob, pair)
}

async fn connect(addr: &str, state: &AppState, user: UserId) -> Socket {
    let token = mint_token(&state.auth, user).expect("token");
    let (socket, _) = connect_async(format!("ws://{addr}/ws?token={token}"))
        .await
        .expect("connect");
    socket
}

/// The upgrade response lands before the server task registers the session;
/// poll the registry so sends cannot outrun it.
async fn wait_until_online(state: &AppState, user: UserId) {
    for _ in 0..200 {
        if state.core.is_online(user) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("user {} never registered", user.0);
}

async fn next_event(socket: &mut Socket) -> ServerEvent {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), socket.next())
            .await
            .expect("event before timeout")
            .expect("open stream")
            .expect("frame");
        if let tungstenite::Message::Text(text) = frame {
            return serde_json::from_str(&text).expect("server event");
        }
    }
}

/// Presence and typing arrive on their own schedule; skip them when the
/// assertion is about the message flow.
async fn next_delivery(socket: &mut Socket) -> ServerEvent {
    loop {
        match next_event(socket).await {
            ServerEvent::PresenceChanged { .. } | ServerEvent::TypingChanged { .. } => continue,
            event => return event,
        }
    }
}

async fn send(socket: &mut Socket, event: &ClientEvent) {
    let text = serde_json::to_string(event).expect("encode");
    socket
        .send(tungstenite::Message::Text(text))
        .await
        .expect("send frame");
}

#[tokio::test]
async fn rejects_a_bad_token_before_the_upgrade() {
    let (addr, _state, ..) = spawn_app().await;
    let error = connect_async(format!("ws://{addr}/ws?token=garbage"))
        .await
        .expect_err("handshake must fail");
    match error {
        tungstenite::Error::Http(response) => assert_eq!(response.status().as_u16(), 401),
        other => panic!("unexpected handshake error: {other}"),
    }
}

#[tokio::test]
async fn two_sessions_exchange_a_message_and_its_receipts() {
    let (addr, state, alice, bob, pair) = spawn_app().await;
    let mut bob_socket = connect(&addr, &state, bob).await;
    let mut alice_socket = connect(&addr, &state, alice).await;
    wait_until_online(&state, bob).await;
    wait_until_online(&state, alice).await;

    send(
        &mut alice_socket,
        &ClientEvent::SendMessage {
            conversation_id: pair,
            content: "hello over the wire".into(),
            temp_id: Some("t-7".into()),
        },
    )
    .await;

    let ServerEvent::MessageNew { message: reply } = next_delivery(&mut alice_socket).await else {
        panic!("expected the send reply");
    };
    assert_eq!(reply.temp_id.as_deref(), Some("t-7"));
    assert_eq!(reply.conversation_id, pair);
    assert_eq!(reply.status, MessageStatus::Sent);
    let message_id = reply.message_id;

    let ServerEvent::MessageNew { message: received } = next_delivery(&mut bob_socket).await
    else {
        panic!("expected the recipient copy");
    };
    assert_eq!(received.message_id, message_id);
    assert_eq!(received.sender_id, alice);
    assert_eq!(received.content, "hello over the wire");
    assert!(received.temp_id.is_none());

    send(&mut bob_socket, &ClientEvent::AckDelivered { message_id }).await;
    let ServerEvent::MessageStatus { status, .. } = next_delivery(&mut alice_socket).await else {
        panic!("expected a delivery status");
    };
    assert_eq!(status, MessageStatus::Delivered);

    send(
        &mut bob_socket,
        &ClientEvent::MarkRead {
            conversation_id: pair,
            up_to_message_id: message_id,
        },
    )
    .await;
    let ServerEvent::ReadReceiptsUpdated {
        reader_id,
        up_to_message_id,
        ..
    } = next_delivery(&mut alice_socket).await
    else {
        panic!("expected a receipt update");
    };
    assert_eq!(reader_id, bob);
    assert_eq!(up_to_message_id, message_id);

    let ServerEvent::MessageStatus { status, .. } = next_delivery(&mut alice_socket).await else {
        panic!("expected a read status");
    };
    assert_eq!(status, MessageStatus::Read);
}

#[tokio::test]
async fn failed_send_reports_the_temp_id_back() {
    let (addr, state, alice, _bob, _pair) = spawn_app().await;
    let mut socket = connect(&addr, &state, alice).await;
    wait_until_online(&state, alice).await;

    send(
        &mut socket,
        &ClientEvent::SendMessage {
            conversation_id: ConversationId(999),
            content: "into the void".into(),
            temp_id: Some("t-9".into()),
        },
    )
    .await;

    let ServerEvent::Error(reply) = next_delivery(&mut socket).await else {
        panic!("expected an error reply");
    };
    assert_eq!(reply.code, ErrorCode::NotAMember);
    assert_eq!(reply.temp_id.as_deref(), Some("t-9"));
}

#[tokio::test]
async fn malformed_frames_get_a_validation_reply() {
    let (addr, state, alice, _bob, _pair) = spawn_app().await;
    let mut socket = connect(&addr, &state, alice).await;
    wait_until_online(&state, alice).await;

    socket
        .send(tungstenite::Message::Text("not an event".into()))
        .await
        .expect("send frame");

    let ServerEvent::Error(reply) = next_delivery(&mut socket).await else {
        panic!("expected an error reply");
    };
    assert_eq!(reply.code, ErrorCode::Validation);
}
