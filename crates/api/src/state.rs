//! Shared application state

use std::sync::Arc;

use chatwire_engine::Engine;
use sqlx::PgPool;

use crate::auth::JwtVerifier;
use crate::config::Config;
use crate::websocket::hub::SessionHub;

/// State shared across all routes and WebSocket connections
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<Config>,
    pub engine: Engine,
    pub hub: SessionHub,
    pub verifier: Arc<JwtVerifier>,
}
