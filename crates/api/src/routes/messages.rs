//! Message routes
//!
//! HTTP mirror of the WebSocket message frames, for clients that post over
//! REST while listening on a socket. Accepted messages are fanned out to
//! room subscribers here since the engine only persists.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use chatwire_shared::{Message, MessageKind, ReadCursor};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use chatwire_engine::messaging::SendMessage;

use crate::auth::AuthedUser;
use crate::error::ApiResult;
use crate::state::AppState;
use crate::websocket::ServerEvent;

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub client_msg_id: String,
    #[serde(default)]
    pub kind: Option<MessageKind>,
    pub body: String,
    #[serde(default)]
    pub attachment_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct SendMessageResponse {
    pub message: Message,
    pub duplicate: bool,
    pub reopened: bool,
}

pub async fn send(
    State(state): State<AppState>,
    AuthedUser(claims): AuthedUser,
    Path(id): Path<Uuid>,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<Json<SendMessageResponse>> {
    let outcome = state
        .engine
        .send_message(
            &claims,
            SendMessage {
                conversation_id: id,
                client_msg_id: req.client_msg_id,
                kind: req.kind.unwrap_or(MessageKind::Text),
                body: req.body,
                attachment_id: req.attachment_id,
            },
        )
        .await?;

    if outcome.inserted {
        state
            .hub
            .broadcast_conversation(
                &id,
                ServerEvent::Msg {
                    message: outcome.message.clone(),
                },
                None,
            )
            .await;
    }

    Ok(Json(SendMessageResponse {
        message: outcome.message,
        duplicate: !outcome.inserted,
        reopened: outcome.reopened,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ListMessagesQuery {
    #[serde(default)]
    pub after: Option<Uuid>,
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct MessagesResponse {
    pub messages: Vec<Message>,
    /// True when `after` no longer exists and the page restarted from the top
    pub reset: bool,
}

pub async fn list(
    State(state): State<AppState>,
    AuthedUser(claims): AuthedUser,
    Path(id): Path<Uuid>,
    Query(query): Query<ListMessagesQuery>,
) -> ApiResult<Json<MessagesResponse>> {
    let page = state
        .engine
        .list_messages(&claims, id, query.after, query.limit.unwrap_or(50))
        .await?;
    Ok(Json(MessagesResponse {
        messages: page.messages,
        reset: page.reset,
    }))
}

#[derive(Debug, Deserialize)]
pub struct MarkReadRequest {
    pub message_id: Uuid,
}

pub async fn mark_read(
    State(state): State<AppState>,
    AuthedUser(claims): AuthedUser,
    Path(id): Path<Uuid>,
    Json(req): Json<MarkReadRequest>,
) -> ApiResult<Json<ReadCursor>> {
    let cursor = state.engine.mark_read(&claims, id, req.message_id).await?;
    state
        .hub
        .broadcast_conversation(
            &id,
            ServerEvent::Read {
                conversation_id: id,
                user_id: claims.user_id,
                message_id: req.message_id,
            },
            None,
        )
        .await;
    Ok(Json(cursor))
}
