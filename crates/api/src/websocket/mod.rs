//! Real-time session hub
//!
//! One WebSocket connection per device. Connections authenticate, subscribe
//! to conversations, exchange messages and typing signals, and receive
//! lifecycle events as they happen. The hub also backs two engine seams:
//! post-commit event fan-out ([`sink::HubSink`]) and the staff-engagement
//! signal used by message authorization.

pub mod connection;
pub mod events;
pub mod handler;
pub mod hub;
pub mod sink;

pub use events::ServerEvent;
pub use handler::ws_handler;
pub use hub::SessionHub;
