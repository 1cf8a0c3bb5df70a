//! Bridge from the engine's post-commit events to live connections

use async_trait::async_trait;
use chatwire_engine::events::EventSink;
use chatwire_shared::LifecycleEvent;

use super::events::ServerEvent;
use super::hub::SessionHub;

/// Fans persisted lifecycle events out to conversation subscribers and to
/// the tenant's staff. Delivery is best-effort by contract: anything missed
/// here is reconciled by clients through SYNC replay.
pub struct HubSink {
    hub: SessionHub,
}

impl HubSink {
    pub fn new(hub: SessionHub) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl EventSink for HubSink {
    async fn notify(&self, event: &LifecycleEvent) {
        let frame = ServerEvent::Event {
            event: event.clone(),
        };
        // Staff dashboards track queue and assignment movement for the
        // whole tenant, not only subscribed conversations; staff sitting in
        // the room still get the frame exactly once.
        self.hub
            .broadcast_lifecycle(event.tenant_id, &event.conversation_id, frame)
            .await;
    }
}
