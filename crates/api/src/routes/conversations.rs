//! Conversation lifecycle routes
//!
//! Thin HTTP wrappers over the engine: each handler authenticates, calls
//! one engine operation, and serializes the result. Live fan-out of the
//! resulting lifecycle events happens through the hub sink, not here.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use chatwire_shared::{Conversation, LifecycleEvent, Role};
use serde::Deserialize;
use uuid::Uuid;

use chatwire_engine::store::NewConversation;

use crate::auth::AuthedUser;
use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateConversationRequest {
    #[serde(default)]
    pub skill_group_id: Option<Uuid>,
    #[serde(default)]
    pub customer_ref: Option<String>,
}

/// Open a new conversation as the calling participant
pub async fn create(
    State(state): State<AppState>,
    AuthedUser(claims): AuthedUser,
    Json(req): Json<CreateConversationRequest>,
) -> ApiResult<Json<Conversation>> {
    let customer_ref = match claims.role {
        Role::Customer => Some(claims.user_id.to_string()),
        _ => req.customer_ref,
    };
    let new = NewConversation {
        tenant_id: claims.tenant_id,
        customer_ref,
        skill_group_id: req.skill_group_id,
        site_id: claims.site_id,
        visitor_id: (claims.role == Role::Visitor).then_some(claims.user_id),
    };
    let conversation = state.engine.create_conversation(new).await?;
    Ok(Json(conversation))
}

pub async fn get_one(
    State(state): State<AppState>,
    AuthedUser(claims): AuthedUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Conversation>> {
    let conversation = state.engine.authorized_conversation(&claims, id).await?;
    Ok(Json(conversation))
}

/// Pull an unassigned conversation to the calling staff member
pub async fn claim(
    State(state): State<AppState>,
    AuthedUser(claims): AuthedUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Conversation>> {
    let conversation = state.engine.claim(&claims, id).await?;
    Ok(Json(conversation))
}

#[derive(Debug, Deserialize)]
pub struct AssignRequest {
    pub agent_id: Uuid,
}

/// Hand the conversation to a specific agent, overriding its current state
pub async fn assign(
    State(state): State<AppState>,
    AuthedUser(claims): AuthedUser,
    Path(id): Path<Uuid>,
    Json(req): Json<AssignRequest>,
) -> ApiResult<Json<Conversation>> {
    let conversation = state.engine.assign(&claims, id, req.agent_id).await?;
    Ok(Json(conversation))
}

#[derive(Debug, Deserialize)]
pub struct CloseRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn close(
    State(state): State<AppState>,
    AuthedUser(claims): AuthedUser,
    Path(id): Path<Uuid>,
    Json(req): Json<CloseRequest>,
) -> ApiResult<Json<Conversation>> {
    let reason = req.reason.as_deref().unwrap_or("resolved");
    let conversation = state.engine.close_conversation(&claims, id, reason).await?;
    Ok(Json(conversation))
}

pub async fn reopen(
    State(state): State<AppState>,
    AuthedUser(claims): AuthedUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Conversation>> {
    let conversation = state.engine.reopen_conversation(&claims, id).await?;
    Ok(Json(conversation))
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(default = "default_events_limit")]
    pub limit: i64,
}

fn default_events_limit() -> i64 {
    100
}

pub async fn events(
    State(state): State<AppState>,
    AuthedUser(claims): AuthedUser,
    Path(id): Path<Uuid>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Json<Vec<LifecycleEvent>>> {
    let events = state
        .engine
        .conversation_events(&claims, id, query.limit.clamp(1, 500))
        .await?;
    Ok(Json(events))
}

#[derive(Debug, Deserialize)]
pub struct PageViewRequest {
    pub url: String,
}

pub async fn page_view(
    State(state): State<AppState>,
    AuthedUser(claims): AuthedUser,
    Path(id): Path<Uuid>,
    Json(req): Json<PageViewRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    state.engine.record_page_view(&claims, id, &req.url).await?;
    Ok(Json(serde_json::json!({ "recorded": true })))
}
