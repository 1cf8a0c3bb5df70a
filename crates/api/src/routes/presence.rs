//! Presence session routes
//!
//! REST mirror of the liveness lifecycle the WebSocket handler drives
//! implicitly: clients without a socket (or testing harnesses) create a
//! session, keep it alive, and drop it here.

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::AuthedUser;
use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub session_id: Uuid,
}

pub async fn create_session(
    State(state): State<AppState>,
    AuthedUser(claims): AuthedUser,
) -> ApiResult<Json<SessionResponse>> {
    let session_id = state
        .engine
        .presence()
        .create_session(claims.tenant_id, claims.user_id)
        .await?;
    Ok(Json(SessionResponse { session_id }))
}

#[derive(Debug, Deserialize)]
pub struct SessionRequest {
    pub session_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct HeartbeatResponse {
    /// False when the session already expired; the caller must create a
    /// new one.
    pub alive: bool,
}

pub async fn heartbeat(
    State(state): State<AppState>,
    AuthedUser(claims): AuthedUser,
    Json(req): Json<SessionRequest>,
) -> ApiResult<Json<HeartbeatResponse>> {
    let alive = state
        .engine
        .presence()
        .heartbeat(req.session_id, claims.user_id)
        .await?;
    Ok(Json(HeartbeatResponse { alive }))
}

pub async fn logout(
    State(state): State<AppState>,
    AuthedUser(claims): AuthedUser,
    Json(req): Json<SessionRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    state
        .engine
        .presence()
        .logout(req.session_id, claims.user_id)
        .await?;
    Ok(Json(serde_json::json!({ "logged_out": true })))
}
