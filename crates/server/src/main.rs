use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use realtime::RealtimeHub;
use serde::{Deserialize, Serialize};
use server_api::{
    catch_up, clear_conversation, delete_message, list_users, send_message, ApiContext,
    SendMessageRequest, StorageMediaStore,
};
use shared::{
    domain::{MediaId, MessageId, PresenceSnapshot, UserId, UserSummary},
    error::{ApiError, ErrorCode},
    protocol::MessagePayload,
};
use storage::Storage;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info};

mod app_state;
mod auth;
mod config;
mod ws;

use app_state::AppState;
use auth::Authenticator;
use config::{load_settings, prepare_database_url};

/// Generous enough for a base64 image payload.
const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    user_id: UserId,
    token: String,
}

#[derive(Debug, Deserialize)]
struct CatchUpQuery {
    since: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClearResponse {
    deleted_count: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let public_base = settings
        .public_url
        .clone()
        .unwrap_or_else(|| format!("http://{}", settings.server_bind));
    let api = ApiContext {
        media: Arc::new(StorageMediaStore::new(storage.clone(), public_base)),
        storage,
        hub: Arc::new(RealtimeHub::new()),
    };
    let auth = Authenticator::new(settings.jwt_secret, settings.token_ttl_seconds);

    let state = AppState { api, auth };
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
        .route("/users", get(http_list_users))
        .route("/presence/:user_id", get(http_presence))
        .route("/messages/:id", get(http_catch_up))
        .route("/messages/send/:id", post(http_send_message))
        .route("/messages/delete/:id", delete(http_delete_message))
        .route("/messages/clear/:id", delete(http_clear_conversation))
        .route("/media/:media_id", get(http_download_media))
        .route("/ws", get(ws::ws_handler))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::InvalidHandshake | ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::EmptyMessage | ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::MediaUploadFailed => StatusCode::BAD_GATEWAY,
        ErrorCode::PersistenceFailed => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(error: ApiError) -> (StatusCode, Json<ApiError>) {
    (status_for(error.code), Json(error))
}

/// Resolves the verified identity from the `Authorization: Bearer` header.
fn bearer_identity(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<UserId, (StatusCode, Json<ApiError>)> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| {
            reject(ApiError::new(
                ErrorCode::Unauthorized,
                "missing bearer token",
            ))
        })?;
    state
        .auth
        .verify(token)
        .map_err(|error| reject(error.into()))
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, (StatusCode, Json<ApiError>)> {
    let user_id = state
        .api
        .storage
        .create_user(&req.username)
        .await
        .map_err(|e| reject(ApiError::new(ErrorCode::Validation, e.to_string())))?;
    let token = state
        .auth
        .issue(user_id)
        .map_err(|error| reject(error.into()))?;
    Ok(Json(LoginResponse { user_id, token }))
}

async fn http_list_users(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<UserSummary>>, (StatusCode, Json<ApiError>)> {
    let user_id = bearer_identity(&state, &headers)?;
    let users = list_users(&state.api, user_id).await.map_err(reject)?;
    Ok(Json(users))
}

async fn http_presence(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(user_id): Path<i64>,
) -> Result<Json<PresenceSnapshot>, (StatusCode, Json<ApiError>)> {
    bearer_identity(&state, &headers)?;
    Ok(Json(state.api.hub.presence_of(UserId(user_id))))
}

async fn http_catch_up(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(other_user_id): Path<i64>,
    Query(q): Query<CatchUpQuery>,
) -> Result<Json<Vec<MessagePayload>>, (StatusCode, Json<ApiError>)> {
    let user_id = bearer_identity(&state, &headers)?;
    let messages = catch_up(&state.api, user_id, UserId(other_user_id), q.since)
        .await
        .map_err(reject)?;
    Ok(Json(messages))
}

async fn http_send_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(receiver_id): Path<i64>,
    Json(req): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<MessagePayload>), (StatusCode, Json<ApiError>)> {
    let sender_id = bearer_identity(&state, &headers)?;
    let message = send_message(&state.api, sender_id, UserId(receiver_id), req)
        .await
        .map_err(reject)?;
    Ok((StatusCode::CREATED, Json(message)))
}

async fn http_delete_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(message_id): Path<i64>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    let requester_id = bearer_identity(&state, &headers)?;
    delete_message(&state.api, requester_id, MessageId(message_id))
        .await
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_clear_conversation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(other_user_id): Path<i64>,
) -> Result<Json<ClearResponse>, (StatusCode, Json<ApiError>)> {
    let requester_id = bearer_identity(&state, &headers)?;
    let deleted_count = clear_conversation(&state.api, requester_id, UserId(other_user_id))
        .await
        .map_err(reject)?;
    Ok(Json(ClearResponse { deleted_count }))
}

async fn http_download_media(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(media_id): Path<i64>,
) -> Result<impl IntoResponse, (StatusCode, Json<ApiError>)> {
    bearer_identity(&state, &headers)?;
    let media = state
        .api
        .storage
        .load_media(MediaId(media_id))
        .await
        .map_err(|e| reject(ApiError::new(ErrorCode::PersistenceFailed, e.to_string())))?
        .ok_or_else(|| reject(ApiError::new(ErrorCode::NotFound, "media not found")))?;

    let mut response_headers = HeaderMap::new();
    let content_type = media
        .content_type
        .as_deref()
        .unwrap_or("application/octet-stream");
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    Ok((StatusCode::OK, response_headers, media.bytes))
}
