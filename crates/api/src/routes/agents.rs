//! Agent availability routes

use axum::{extract::State, Json};
use chatwire_shared::{AgentStatus, EffectiveStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::AuthedUser;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use crate::websocket::ServerEvent;

#[derive(Debug, Deserialize)]
pub struct SetStatusRequest {
    pub status: AgentStatus,
}

#[derive(Debug, Serialize)]
pub struct AgentPresence {
    pub user_id: Uuid,
    pub status: EffectiveStatus,
}

/// Set the caller's declared availability and broadcast the effective
/// result to the tenant's staff.
pub async fn set_status(
    State(state): State<AppState>,
    AuthedUser(claims): AuthedUser,
    Json(req): Json<SetStatusRequest>,
) -> ApiResult<Json<AgentPresence>> {
    if !claims.role.is_staff() {
        return Err(ApiError::Forbidden);
    }
    state
        .engine
        .set_agent_status(claims.tenant_id, claims.user_id, req.status)
        .await?;
    let status = state
        .engine
        .effective_status(claims.tenant_id, claims.user_id)
        .await?;
    state
        .hub
        .broadcast_tenant_staff(
            claims.tenant_id,
            ServerEvent::PresenceUpdate {
                user_id: claims.user_id,
                status,
            },
        )
        .await;
    Ok(Json(AgentPresence {
        user_id: claims.user_id,
        status,
    }))
}

/// The caller's own effective availability.
pub async fn get_status(
    State(state): State<AppState>,
    AuthedUser(claims): AuthedUser,
) -> ApiResult<Json<AgentPresence>> {
    if !claims.role.is_staff() {
        return Err(ApiError::Forbidden);
    }
    let status = state
        .engine
        .effective_status(claims.tenant_id, claims.user_id)
        .await?;
    Ok(Json(AgentPresence {
        user_id: claims.user_id,
        status,
    }))
}

/// List staff of the tenant with a live session, with their effective
/// availability.
pub async fn online(
    State(state): State<AppState>,
    AuthedUser(claims): AuthedUser,
) -> ApiResult<Json<Vec<AgentPresence>>> {
    if !claims.role.is_staff() {
        return Err(ApiError::Forbidden);
    }
    let users = state.engine.presence().online_users(claims.tenant_id).await?;
    let mut agents = Vec::with_capacity(users.len());
    for user_id in users {
        let status = state
            .engine
            .effective_status(claims.tenant_id, user_id)
            .await?;
        agents.push(AgentPresence { user_id, status });
    }
    Ok(Json(agents))
}
