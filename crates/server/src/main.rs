use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use server_api::{
    add_member, create_conversation, delete_conversation, find_users, list_conversations,
    list_messages, mark_seen, open_session, remove_member, send_message, ApiContext, CurrentUser,
    NewConversationRequest, SeenOutcome, SendMessageRequest,
};
use shared::{
    domain::{ConversationId, User, UserId},
    error::{ApiError, ErrorCode},
    protocol::{Conversation, MessagePayload},
};
use storage::Storage;
use tracing::info;

mod app_state;
mod auth;
mod broker;
mod config;
mod ws;

use app_state::AppState;
use auth::sign_channel_grant;
use broker::Broker;
use config::{load_settings, prepare_database_url};

#[derive(Debug, Deserialize)]
struct SessionRequest {
    email: String,
    name: Option<String>,
}

#[derive(Debug, Serialize)]
struct SessionResponse {
    user: User,
    token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewConversationHttpRequest {
    user_id: Option<String>,
    #[serde(default)]
    is_group: bool,
    #[serde(default)]
    members: Vec<String>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageHttpRequest {
    conversation_id: String,
    message: Option<String>,
    image: Option<String>,
    client_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddMemberRequest {
    user_id: String,
}

#[derive(Debug, Deserialize)]
struct ChannelAuthRequest {
    socket_id: Option<String>,
    channel_name: Option<String>,
}

#[derive(Debug, Serialize)]
struct ChannelAuthResponse {
    auth: String,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await?;
    let broker = Arc::new(Broker::new());
    let state = AppState {
        api: ApiContext {
            storage: storage.clone(),
            publisher: broker.clone(),
        },
        sessions: Arc::new(storage),
        broker,
        channel_auth_secret: settings.channel_auth_secret,
        channel_auth_ttl_seconds: settings.channel_auth_ttl_seconds,
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
        .route("/session", post(http_open_session))
        .route("/users", get(http_find_users))
        .route(
            "/conversations",
            get(http_list_conversations).post(http_create_conversation),
        )
        .route(
            "/conversations/:conversation_id",
            delete(http_delete_conversation),
        )
        .route(
            "/conversations/:conversation_id/messages",
            get(http_list_messages),
        )
        .route("/conversations/:conversation_id/seen", post(http_mark_seen))
        .route(
            "/conversations/:conversation_id/members",
            post(http_add_member),
        )
        .route(
            "/conversations/:conversation_id/members/:user_id",
            delete(http_remove_member),
        )
        .route("/messages", post(http_send_message))
        .route("/channels/auth", post(http_channel_auth))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

fn reject(error: ApiError) -> (StatusCode, Json<ApiError>) {
    let status = match error.code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(error))
}

async fn require_session(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<CurrentUser, (StatusCode, Json<ApiError>)> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| reject(ApiError::unauthorized("missing session token")))?;
    state
        .sessions
        .current_user(token)
        .await
        .map_err(|error| reject(ApiError::new(ErrorCode::Internal, error.to_string())))?
        .ok_or_else(|| reject(ApiError::unauthorized("invalid session token")))
}

async fn http_open_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SessionRequest>,
) -> Result<Json<SessionResponse>, (StatusCode, Json<ApiError>)> {
    let (user, token) = open_session(&state.api, &req.email, req.name.as_deref())
        .await
        .map_err(reject)?;
    Ok(Json(SessionResponse { user, token }))
}

async fn http_find_users(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<User>>, (StatusCode, Json<ApiError>)> {
    let current = require_session(&state, &headers).await?;
    let users = find_users(&state.api, &current).await.map_err(reject)?;
    Ok(Json(users))
}

async fn http_list_conversations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<Conversation>>, (StatusCode, Json<ApiError>)> {
    let current = require_session(&state, &headers).await?;
    let conversations = list_conversations(&state.api, &current)
        .await
        .map_err(reject)?;
    Ok(Json(conversations))
}

async fn http_create_conversation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<NewConversationHttpRequest>,
) -> Result<Json<Conversation>, (StatusCode, Json<ApiError>)> {
    let current = require_session(&state, &headers).await?;
    let conversation = create_conversation(
        &state.api,
        &current,
        NewConversationRequest {
            user_id: req.user_id.as_deref().map(UserId::from),
            is_group: req.is_group,
            members: req
                .members
                .iter()
                .map(|id| UserId::from(id.as_str()))
                .collect(),
            name: req.name,
        },
    )
    .await
    .map_err(reject)?;
    Ok(Json(conversation))
}

async fn http_delete_conversation(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Conversation>, (StatusCode, Json<ApiError>)> {
    let current = require_session(&state, &headers).await?;
    let removed = delete_conversation(
        &state.api,
        &current,
        &ConversationId::from(conversation_id.as_str()),
    )
    .await
    .map_err(reject)?;
    Ok(Json(removed))
}

async fn http_list_messages(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Vec<MessagePayload>>, (StatusCode, Json<ApiError>)> {
    let current = require_session(&state, &headers).await?;
    let messages = list_messages(
        &state.api,
        &current,
        &ConversationId::from(conversation_id.as_str()),
    )
    .await
    .map_err(reject)?;
    Ok(Json(messages))
}

/// Idempotent mark-seen trigger: returns the updated message, or the
/// unchanged conversation when there is nothing to record.
async fn http_mark_seen(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ApiError>)> {
    let current = require_session(&state, &headers).await?;
    let outcome = mark_seen(
        &state.api,
        &current,
        &ConversationId::from(conversation_id.as_str()),
    )
    .await
    .map_err(reject)?;
    let body = match outcome {
        SeenOutcome::Updated(message) => serde_json::to_value(message),
        SeenOutcome::Unchanged(conversation) => serde_json::to_value(conversation),
    }
    .map_err(|error| reject(ApiError::new(ErrorCode::Internal, error.to_string())))?;
    Ok(Json(body))
}

async fn http_add_member(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<AddMemberRequest>,
) -> Result<Json<Conversation>, (StatusCode, Json<ApiError>)> {
    let current = require_session(&state, &headers).await?;
    let conversation = add_member(
        &state.api,
        &current,
        &ConversationId::from(conversation_id.as_str()),
        &UserId::from(req.user_id.as_str()),
    )
    .await
    .map_err(reject)?;
    Ok(Json(conversation))
}

async fn http_remove_member(
    State(state): State<Arc<AppState>>,
    Path((conversation_id, user_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<Conversation>, (StatusCode, Json<ApiError>)> {
    let current = require_session(&state, &headers).await?;
    let conversation = remove_member(
        &state.api,
        &current,
        &ConversationId::from(conversation_id.as_str()),
        &UserId::from(user_id.as_str()),
    )
    .await
    .map_err(reject)?;
    Ok(Json(conversation))
}

async fn http_send_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<SendMessageHttpRequest>,
) -> Result<Json<MessagePayload>, (StatusCode, Json<ApiError>)> {
    let current = require_session(&state, &headers).await?;
    let message = send_message(
        &state.api,
        &current,
        &ConversationId::from(req.conversation_id.as_str()),
        SendMessageRequest {
            body: req.message,
            image: req.image,
            client_id: req.client_id,
        },
    )
    .await
    .map_err(reject)?;
    Ok(Json(message))
}

/// 401 without a session, 400 on missing parameters, otherwise a signed
/// grant bound to (socket, channel, handle).
async fn http_channel_auth(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ChannelAuthRequest>,
) -> Result<Json<ChannelAuthResponse>, (StatusCode, Json<ApiError>)> {
    let current = require_session(&state, &headers).await?;
    let socket_id = req
        .socket_id
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty());
    let channel_name = req
        .channel_name
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty());
    let (Some(socket_id), Some(channel_name)) = (socket_id, channel_name) else {
        return Err(reject(ApiError::validation("missing parameters")));
    };

    let auth = sign_channel_grant(
        &state.channel_auth_secret,
        socket_id,
        channel_name,
        &current.email,
        state.channel_auth_ttl_seconds,
    )
    .map_err(|error| reject(ApiError::new(ErrorCode::Internal, error.to_string())))?;
    Ok(Json(ChannelAuthResponse { auth }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
) -> Result<impl IntoResponse, (StatusCode, Json<ApiError>)> {
    let user = state
        .sessions
        .current_user(&q.token)
        .await
        .map_err(|error| reject(ApiError::new(ErrorCode::Internal, error.to_string())))?
        .ok_or_else(|| reject(ApiError::unauthorized("invalid session token")))?;
    Ok(ws.on_upgrade(move |socket| ws::ws_connection(state, socket, user)))
}
