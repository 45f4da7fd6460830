//! REST surface and the WebSocket upgrade endpoint.

use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Path, Query, State, WebSocketUpgrade, ws},
    http::{HeaderMap, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use futures_util::SinkExt as _;
use jsonwebtoken::{DecodingKey, Validation, decode};
use tracing::debug;
use uuid::Uuid;

use agora_chat::{ChatError, ChatService};
use agora_gateway::{ConnectionRegistry, PresencePropagator, auth, connection};
use agora_types::api::{
    AddParticipantRequest, Claims, CreateDirectRequest, CreateGroupRequest, ErrorBody,
    MessagePageQuery,
};

#[derive(Clone)]
pub struct AppState {
    pub chat: Arc<ChatService>,
    pub registry: ConnectionRegistry,
    pub presence: Arc<PresencePropagator>,
    pub session_secret: String,
    pub jwt_secret: String,
}

/// Extract and validate the JWT from the Authorization header.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: axum::extract::Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;
    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(state.jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| StatusCode::UNAUTHORIZED)?;

    req.extensions_mut().insert(token_data.claims);
    Ok(next.run(req).await)
}

// -- Handlers --

pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, Response> {
    let summaries = state
        .chat
        .list_conversations(claims.sub)
        .await
        .map_err(error_response)?;
    Ok(Json(summaries))
}

pub async fn list_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<MessagePageQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, Response> {
    let messages = state
        .chat
        .list_messages(conversation_id, claims.sub, query.page, query.limit)
        .await
        .map_err(error_response)?;
    Ok(Json(messages))
}

pub async fn create_direct(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateDirectRequest>,
) -> Result<impl IntoResponse, Response> {
    let conversation = state
        .chat
        .create_or_get_direct(claims.sub, req.recipient_id)
        .await
        .map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(conversation)))
}

pub async fn create_group(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateGroupRequest>,
) -> Result<impl IntoResponse, Response> {
    let conversation = state
        .chat
        .create_group(claims.sub, req)
        .await
        .map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(conversation)))
}

pub async fn add_participant(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<AddParticipantRequest>,
) -> Result<impl IntoResponse, Response> {
    state
        .chat
        .add_participant(conversation_id, claims.sub, req.user_id)
        .await
        .map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn remove_participant(
    State(state): State<AppState>,
    Path((conversation_id, user_id)): Path<(Uuid, Uuid)>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, Response> {
    state
        .chat
        .remove_participant(conversation_id, claims.sub, user_id)
        .await
        .map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

/// WebSocket upgrade. Authentication failures still complete the upgrade so
/// the client receives a machine-readable close code instead of an opaque
/// HTTP error from whatever proxy sits in front.
pub async fn gateway_upgrade(
    State(state): State<AppState>,
    headers: HeaderMap,
    upgrade: WebSocketUpgrade,
) -> Response {
    match auth::authenticate(&headers, &state.session_secret, &state.jwt_secret) {
        Ok(user_id) => upgrade.on_upgrade(move |socket| {
            connection::serve(
                socket,
                state.registry.clone(),
                state.chat.clone(),
                state.presence.clone(),
                user_id,
            )
        }),
        Err(err) => {
            debug!(error = %err, "gateway handshake rejected");
            upgrade.on_upgrade(close_unauthorized)
        }
    }
}

async fn close_unauthorized(socket: ws::WebSocket) {
    let (mut sender, _receiver) = futures_util::StreamExt::split(socket);
    let _ = sender
        .send(ws::Message::Close(Some(ws::CloseFrame {
            code: ws::close_code::POLICY,
            reason: "authentication failed".into(),
        })))
        .await;
}

// -- Error mapping --

fn error_response(err: ChatError) -> Response {
    let status = match &err {
        ChatError::Forbidden => StatusCode::FORBIDDEN,
        ChatError::NotFound => StatusCode::NOT_FOUND,
        ChatError::BadRequest(_) => StatusCode::BAD_REQUEST,
        ChatError::Conflict(_) => StatusCode::CONFLICT,
        ChatError::Upstream(_) => StatusCode::BAD_GATEWAY,
        ChatError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(error = %err, "request failed");
    }
    let body = ErrorBody {
        error: err.to_string(),
        fields: Vec::new(),
    };
    (status, Json(body)).into_response()
}
