//! API routes

pub mod agents;
pub mod conversations;
pub mod health;
pub mod messages;
pub mod presence;

use axum::{
    routing::{get, post, put},
    Router,
};

use crate::{state::AppState, websocket::ws_handler};

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/ws", get(ws_handler))
        .route("/api/conversations", post(conversations::create))
        .route("/api/conversations/:id", get(conversations::get_one))
        .route("/api/conversations/:id/claim", post(conversations::claim))
        .route("/api/conversations/:id/assign", post(conversations::assign))
        .route("/api/conversations/:id/close", post(conversations::close))
        .route("/api/conversations/:id/reopen", post(conversations::reopen))
        .route("/api/conversations/:id/events", get(conversations::events))
        .route(
            "/api/conversations/:id/page-view",
            post(conversations::page_view),
        )
        .route(
            "/api/conversations/:id/messages",
            get(messages::list).post(messages::send),
        )
        .route("/api/conversations/:id/read", post(messages::mark_read))
        .route(
            "/api/agents/status",
            get(agents::get_status).put(agents::set_status),
        )
        .route("/api/agents/online", get(agents::online))
        .route("/api/presence/session", post(presence::create_session))
        .route("/api/presence/heartbeat", post(presence::heartbeat))
        .route("/api/presence/logout", post(presence::logout))
        .with_state(state)
}
