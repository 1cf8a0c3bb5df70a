//! A single authenticated WebSocket connection

use std::collections::HashSet;

use chatwire_shared::Role;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use super::events::ServerEvent;

pub struct Connection {
    /// Hub-local id of this socket
    pub conn_id: Uuid,
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub role: Role,
    /// Channel into this connection's writer task
    pub sender: mpsc::UnboundedSender<ServerEvent>,
    /// Conversations this connection is subscribed to
    pub subscriptions: RwLock<HashSet<Uuid>>,
}

impl Connection {
    pub fn new(
        user_id: Uuid,
        tenant_id: Uuid,
        role: Role,
        sender: mpsc::UnboundedSender<ServerEvent>,
    ) -> Self {
        Self {
            conn_id: Uuid::new_v4(),
            user_id,
            tenant_id,
            role,
            sender,
            subscriptions: RwLock::new(HashSet::new()),
        }
    }

    /// Queue an event for delivery. A send error means the socket already
    /// closed; cleanup happens in the handler's teardown.
    pub fn send(&self, event: ServerEvent) {
        let _ = self.sender.send(event);
    }

    pub async fn subscribe(&self, conversation_id: Uuid) {
        self.subscriptions.write().await.insert(conversation_id);
    }

    pub async fn unsubscribe(&self, conversation_id: Uuid) {
        self.subscriptions.write().await.remove(&conversation_id);
    }
}
