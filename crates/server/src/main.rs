use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use realtime::{PassthroughCipher, RealtimeCore};
use serde::{Deserialize, Serialize};
use shared::{
    domain::ConversationKind,
    error::{ErrorCode, ErrorReply},
};
use storage::SqliteStore;
use tracing::{error, info};

mod auth;
mod config;
mod sink;
mod ws;

use auth::AuthConfig;
use config::{load_settings, normalize_database_url};
use sink::LogNotificationSink;

/// Conversation every fresh login is placed into so a new deployment is
/// immediately usable.
const SEED_CONVERSATION: &str = "general";

#[derive(Clone)]
struct AppState {
    core: Arc<RealtimeCore>,
    store: SqliteStore,
    auth: AuthConfig,
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
}

#[derive(Debug, Serialize)]
struct LoginResponse {
    user_id: i64,
    token: String,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = normalize_database_url(&settings.database_url);
    let store = SqliteStore::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let core = RealtimeCore::new(
        Arc::new(store.clone()),
        Arc::new(PassthroughCipher),
        Arc::new(LogNotificationSink),
        settings.delivery_policy(),
    );
    let seeded = core.seed_rooms().await?;
    info!(memberships = seeded, "live routing seeded from storage");

    let state = AppState {
        core: Arc::new(core),
        store,
        auth: AuthConfig {
            secret: settings.auth_secret.clone(),
            ttl_seconds: settings.token_ttl_seconds,
        },
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/login", post(login))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, StatusCode> {
    match state.store.health_check().await {
        Ok(()) => Ok("ok"),
        Err(error) => {
            error!(%error, "health check failed");
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, (StatusCode, Json<ErrorReply>)> {
    let username = req.username.trim();
    if username.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorReply::new(ErrorCode::Validation, "username is empty")),
        ));
    }

    let user_id = state.store.create_user(username).await.map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorReply::new(ErrorCode::Validation, e.to_string())),
        )
    })?;

    let conversation_id = match state
        .store
        .find_conversation_by_name(SEED_CONVERSATION)
        .await
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorReply::new(ErrorCode::Internal, e.to_string())),
            )
        })? {
        Some(id) => id,
        None => state
            .store
            .create_conversation(ConversationKind::Group, SEED_CONVERSATION, &[])
            .await
            .map_err(|e| {
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorReply::new(ErrorCode::Internal, e.to_string())),
                )
            })?,
    };

    state
        .core
        .join_conversation(user_id, conversation_id)
        .await
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorReply::new(e.code(), e.to_string())),
            )
        })?;

    let token = auth::mint_token(&state.auth, user_id).map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorReply::new(ErrorCode::Internal, e.to_string())),
        )
    })?;

    Ok(Json(LoginResponse {
        user_id: user_id.0,
        token,
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorReply>)> {
    // Verified before the upgrade so a bad credential is refused as plain
    // HTTP instead of a doomed socket.
    let user_id = auth::verify_token(&state.auth, &q.token).map_err(|err| {
        (
            StatusCode::UNAUTHORIZED,
            Json(ErrorReply::new(ErrorCode::Unauthorized, err.to_string())),
        )
    })?;
    Ok(ws.on_upgrade(move |socket| ws::connection(state, socket, user_id)))
}
