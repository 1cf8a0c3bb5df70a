//! Post-commit event fan-out seam
//!
//! Lifecycle events are persisted first, then handed to the sink. Sink
//! delivery is best-effort: a failed or missing notification is reconciled
//! by clients through SYNC replay, never by rolling back the state change.

use async_trait::async_trait;
use chatwire_shared::{EventKind, LifecycleEvent};
use serde_json::json;
use uuid::Uuid;

use crate::Engine;

/// Receives lifecycle events after they are durably recorded.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn notify(&self, event: &LifecycleEvent);
}

/// Sink for processes without live connections (the worker). Events are
/// still persisted; attached clients learn of them via SYNC.
pub struct NullSink;

#[async_trait]
impl EventSink for NullSink {
    async fn notify(&self, _event: &LifecycleEvent) {}
}

impl Engine {
    /// Persist a lifecycle event, then notify the sink. Both steps are
    /// best-effort side channels: failures are logged and swallowed so they
    /// can never fail the primary state mutation.
    pub(crate) async fn emit(
        &self,
        tenant_id: Uuid,
        conversation_id: Uuid,
        kind: EventKind,
        payload: serde_json::Value,
    ) {
        let payload = if payload.is_null() { json!({}) } else { payload };
        match self
            .store
            .insert_event(tenant_id, conversation_id, kind, payload)
            .await
        {
            Ok(event) => self.sink.notify(&event).await,
            Err(e) => {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    kind = kind.as_str(),
                    error = %e,
                    "Failed to persist lifecycle event"
                );
            }
        }
    }
}
