use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, Method},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use arbor_shared::protocol::MessagePayload;
use arbor_shared::{MessageId, ThreadId, UserId};

use crate::chat::{ChatService, DeleteScope, ThreadSummary};
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::kem_api;
use crate::ws;

#[derive(Clone)]
pub struct AppState {
    pub chat: ChatService,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/chat/ws", get(ws::chat_ws))
        .route("/chat/unlock", post(unlock))
        .route("/chat/login-unlock", post(login_unlock))
        .route("/chat/lock", post(lock))
        .route("/chat/send", post(send_message))
        .route("/chat/threads", get(list_threads))
        .route("/chat/threads/dm", post(start_dm))
        .route("/chat/threads/group", post(create_group))
        .route("/chat/threads/:id", delete(delete_thread))
        .route("/chat/threads/:id/messages", get(thread_messages))
        .route("/chat/threads/:id/leave", post(leave_thread))
        .route("/chat/threads/:id/members", post(add_member))
        .route("/chat/threads/:id/members/:user_id", delete(kick_member))
        .route("/chat/messages/:id", delete(delete_message))
        .nest("/api/v1/kem", kem_api::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Authenticated caller identity, supplied by the fronting auth layer as
/// `x-arbor-user` (integer user id) and `x-arbor-session` (UUID). The core
/// does not authenticate; it only refuses to proceed without these.
pub fn require_auth(headers: &HeaderMap) -> Result<(UserId, Uuid), ServerError> {
    let user = headers
        .get("x-arbor-user")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok())
        .ok_or(ServerError::Unauthorized)?;
    let session = headers
        .get("x-arbor-session")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v).ok())
        .ok_or(ServerError::Unauthorized)?;
    Ok((UserId(user), session))
}

// ---------------------------------------------------------------------------
// DTOs
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    name: String,
    version: &'static str,
}

#[derive(Deserialize)]
struct UnlockRequest {
    passphrase: String,
}

#[derive(Serialize)]
struct LockStateResponse {
    locked: bool,
}

#[derive(Deserialize)]
struct SendRequest {
    thread_id: ThreadId,
    body: String,
}

#[derive(Serialize)]
struct SendResponse {
    message_id: MessageId,
}

#[derive(Serialize)]
struct ThreadsResponse {
    threads: Vec<ThreadSummary>,
}

#[derive(Serialize)]
struct MessagesResponse {
    messages: Vec<MessagePayload>,
}

#[derive(Deserialize)]
struct StartDmRequest {
    partner_id: UserId,
}

#[derive(Deserialize)]
struct CreateGroupRequest {
    #[serde(default)]
    title: String,
    member_ids: Vec<UserId>,
}

#[derive(Serialize)]
struct ThreadResponse {
    thread_id: ThreadId,
    is_group: bool,
    owner_id: UserId,
}

#[derive(Deserialize)]
struct AddMemberRequest {
    user_id: UserId,
}

#[derive(Deserialize)]
struct DeleteMessageParams {
    /// `all` (default) removes the message for everyone; `self` drops only
    /// the caller's key (DMs only).
    #[serde(default)]
    scope: Option<String>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        name: state.config.instance_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn unlock(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<UnlockRequest>,
) -> Result<Json<LockStateResponse>, ServerError> {
    let (user, session) = require_auth(&headers)?;
    // Explicit unlock never rotates: a wrong passphrase here is surfaced,
    // not papered over with a fresh keypair.
    state
        .chat
        .unlock_session(user, session, &req.passphrase, false)
        .await?;
    Ok(Json(LockStateResponse { locked: false }))
}

async fn login_unlock(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<UnlockRequest>,
) -> Result<Json<LockStateResponse>, ServerError> {
    let (user, session) = require_auth(&headers)?;
    // Login path: rotation on failure is allowed, trading old wrapped keys
    // for guaranteed access.
    state
        .chat
        .unlock_session(user, session, &req.passphrase, true)
        .await?;
    Ok(Json(LockStateResponse { locked: false }))
}

async fn lock(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<LockStateResponse>, ServerError> {
    let (_, session) = require_auth(&headers)?;
    state.chat.lock_session(session).await;
    Ok(Json(LockStateResponse { locked: true }))
}

async fn send_message(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<SendRequest>,
) -> Result<Json<SendResponse>, ServerError> {
    let (user, session) = require_auth(&headers)?;
    let message_id = state
        .chat
        .send_message(user, session, req.thread_id, &req.body)
        .await?;
    Ok(Json(SendResponse { message_id }))
}

async fn list_threads(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<ThreadsResponse>, ServerError> {
    let (user, session) = require_auth(&headers)?;
    let threads = state.chat.thread_summaries(user, session).await?;
    Ok(Json(ThreadsResponse { threads }))
}

async fn thread_messages(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(thread_id): Path<i64>,
) -> Result<Json<MessagesResponse>, ServerError> {
    let (user, session) = require_auth(&headers)?;
    let messages = state
        .chat
        .collect_history(user, session, ThreadId(thread_id))
        .await?;
    Ok(Json(MessagesResponse { messages }))
}

async fn start_dm(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<StartDmRequest>,
) -> Result<Json<ThreadResponse>, ServerError> {
    let (user, _) = require_auth(&headers)?;
    let thread = state.chat.start_dm(user, req.partner_id).await?;
    Ok(Json(ThreadResponse {
        thread_id: thread.id,
        is_group: false,
        owner_id: thread.creator_id,
    }))
}

async fn create_group(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<CreateGroupRequest>,
) -> Result<Json<ThreadResponse>, ServerError> {
    let (user, _) = require_auth(&headers)?;
    let thread = state
        .chat
        .create_group(user, &req.title, &req.member_ids)
        .await?;
    info!(thread = %thread.id, creator = %user, "group created");
    Ok(Json(ThreadResponse {
        thread_id: thread.id,
        is_group: true,
        owner_id: thread.creator_id,
    }))
}

async fn leave_thread(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(thread_id): Path<i64>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let (user, _) = require_auth(&headers)?;
    state.chat.leave_thread(user, ThreadId(thread_id)).await?;
    Ok(Json(serde_json::json!({ "left": true })))
}

async fn add_member(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(thread_id): Path<i64>,
    Json(req): Json<AddMemberRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let (user, _) = require_auth(&headers)?;
    state
        .chat
        .add_member(user, ThreadId(thread_id), req.user_id)
        .await?;
    Ok(Json(serde_json::json!({ "added": true })))
}

async fn kick_member(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path((thread_id, user_id)): Path<(i64, i64)>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let (user, _) = require_auth(&headers)?;
    state
        .chat
        .kick_member(user, ThreadId(thread_id), UserId(user_id))
        .await?;
    Ok(Json(serde_json::json!({ "removed": true })))
}

async fn delete_thread(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(thread_id): Path<i64>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let (user, _) = require_auth(&headers)?;
    state.chat.delete_thread(user, ThreadId(thread_id)).await?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}

async fn delete_message(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(message_id): Path<i64>,
    Query(params): Query<DeleteMessageParams>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let (user, _) = require_auth(&headers)?;
    let scope = match params.scope.as_deref() {
        None | Some("all") => DeleteScope::All,
        Some("self") => DeleteScope::SelfOnly,
        Some(other) => {
            return Err(ServerError::BadRequest(format!(
                "unknown delete scope: {other}"
            )))
        }
    };
    state
        .chat
        .delete_message(user, MessageId(message_id), scope)
        .await?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_auth_parses_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-arbor-user", "42".parse().unwrap());
        let session = Uuid::new_v4();
        headers.insert("x-arbor-session", session.to_string().parse().unwrap());

        let (user, parsed) = require_auth(&headers).unwrap();
        assert_eq!(user, UserId(42));
        assert_eq!(parsed, session);
    }

    #[test]
    fn test_require_auth_rejects_missing_or_garbled() {
        assert!(matches!(
            require_auth(&HeaderMap::new()),
            Err(ServerError::Unauthorized)
        ));

        let mut headers = HeaderMap::new();
        headers.insert("x-arbor-user", "not-a-number".parse().unwrap());
        headers.insert("x-arbor-session", "not-a-uuid".parse().unwrap());
        assert!(matches!(
            require_auth(&headers),
            Err(ServerError::Unauthorized)
        ));
    }
}
