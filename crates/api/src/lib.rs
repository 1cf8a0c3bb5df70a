//! Chatwire API server library
//!
//! HTTP and WebSocket surface over the routing engine: REST routes for
//! conversation and message operations, the real-time session hub, and the
//! JWT verification layer.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;
pub mod websocket;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
