//! Connection registry and fan-out
//!
//! Tracks every live connection and the per-conversation rooms they joined.
//! The hub is also the engine's engagement signal: a staff member counts as
//! engaged with a conversation while any of their connections sits in its
//! room.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chatwire_engine::messaging::Engagement;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::connection::Connection;
use super::events::ServerEvent;

#[derive(Clone)]
pub struct SessionHub {
    /// All active connections indexed by connection id
    connections: Arc<RwLock<HashMap<Uuid, Arc<Connection>>>>,
    /// Conversation rooms: conversation id to subscribed connections
    rooms: Arc<RwLock<HashMap<Uuid, Vec<Arc<Connection>>>>>,
}

impl Default for SessionHub {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionHub {
    pub fn new() -> Self {
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
            rooms: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn add_connection(&self, conn: Connection) -> Arc<Connection> {
        let conn = Arc::new(conn);
        let mut connections = self.connections.write().await;
        connections.insert(conn.conn_id, Arc::clone(&conn));
        tracing::info!(
            conn_id = %conn.conn_id,
            user_id = %conn.user_id,
            total_connections = connections.len(),
            "WebSocket connection added"
        );
        conn
    }

    pub async fn remove_connection(&self, conn_id: &Uuid) {
        let removed = self.connections.write().await.remove(conn_id);
        if removed.is_some() {
            let mut rooms = self.rooms.write().await;
            rooms.retain(|_, conns| {
                conns.retain(|c| c.conn_id != *conn_id);
                !conns.is_empty()
            });
            tracing::info!(conn_id = %conn_id, "WebSocket connection removed");
        }
    }

    pub async fn join(&self, conversation_id: Uuid, conn: Arc<Connection>) {
        let mut rooms = self.rooms.write().await;
        let room = rooms.entry(conversation_id).or_default();
        if !room.iter().any(|c| c.conn_id == conn.conn_id) {
            room.push(conn);
        }
    }

    pub async fn leave(&self, conversation_id: &Uuid, conn_id: &Uuid) {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get_mut(conversation_id) {
            room.retain(|c| c.conn_id != *conn_id);
            if room.is_empty() {
                rooms.remove(conversation_id);
            }
        }
    }

    /// Deliver to every subscriber of a conversation, optionally skipping
    /// the originating connection.
    pub async fn broadcast_conversation(
        &self,
        conversation_id: &Uuid,
        event: ServerEvent,
        exclude_conn: Option<Uuid>,
    ) {
        let rooms = self.rooms.read().await;
        if let Some(room) = rooms.get(conversation_id) {
            for conn in room {
                if Some(conn.conn_id) == exclude_conn {
                    continue;
                }
                conn.send(event.clone());
            }
        }
    }

    /// Deliver a lifecycle frame once per connection: to every subscriber
    /// of the conversation, plus the tenant's staff connections not already
    /// in its room.
    pub async fn broadcast_lifecycle(
        &self,
        tenant_id: Uuid,
        conversation_id: &Uuid,
        event: ServerEvent,
    ) {
        let mut reached = HashSet::new();
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(conversation_id) {
                for conn in room {
                    reached.insert(conn.conn_id);
                    conn.send(event.clone());
                }
            }
        }
        let connections = self.connections.read().await;
        for conn in connections.values() {
            if conn.tenant_id == tenant_id
                && conn.role.is_staff()
                && !reached.contains(&conn.conn_id)
            {
                conn.send(event.clone());
            }
        }
    }

    /// Deliver to every staff connection of a tenant.
    pub async fn broadcast_tenant_staff(&self, tenant_id: Uuid, event: ServerEvent) {
        let connections = self.connections.read().await;
        for conn in connections.values() {
            if conn.tenant_id == tenant_id && conn.role.is_staff() {
                conn.send(event.clone());
            }
        }
    }

    /// Deliver to every connection of one user.
    pub async fn broadcast_user(&self, tenant_id: Uuid, user_id: Uuid, event: ServerEvent) {
        let connections = self.connections.read().await;
        for conn in connections.values() {
            if conn.tenant_id == tenant_id && conn.user_id == user_id {
                conn.send(event.clone());
            }
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }
}

#[async_trait]
impl Engagement for SessionHub {
    async fn is_engaged(&self, tenant_id: Uuid, conversation_id: Uuid, user_id: Uuid) -> bool {
        let rooms = self.rooms.read().await;
        rooms
            .get(&conversation_id)
            .is_some_and(|room| {
                room.iter()
                    .any(|c| c.tenant_id == tenant_id && c.user_id == user_id)
            })
    }
}
