//! Per-tenant scheduler thresholds

use chatwire_shared::{CoreResult, TenantSettings};
use uuid::Uuid;

use crate::Engine;

impl Engine {
    /// The tenant's scheduler thresholds: stored overrides when present,
    /// global defaults otherwise, always clamped into the supported range.
    pub async fn settings_for(&self, tenant_id: Uuid) -> CoreResult<TenantSettings> {
        let settings = self
            .store
            .tenant_settings(tenant_id)
            .await?
            .unwrap_or_default();
        Ok(settings.clamped())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chatwire_shared::MIN_THRESHOLD_MINUTES;

    use super::*;
    use crate::lock::MemoryLock;
    use crate::presence::MemoryPresence;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_defaults_and_clamping() {
        let store = Arc::new(MemoryStore::new());
        let engine = Engine::new(
            store.clone(),
            Arc::new(MemoryPresence::new(Duration::from_secs(30))),
            Arc::new(MemoryLock::new()),
        );

        let tenant = Uuid::new_v4();
        // No stored row: global defaults apply
        let settings = engine.settings_for(tenant).await.unwrap();
        assert_eq!(settings, TenantSettings::default());

        // Stored overrides come back clamped
        store.put_tenant_settings(
            tenant,
            TenantSettings {
                idle_after_minutes: 0,
                archive_after_minutes: 2880,
                no_reply_after_minutes: 20,
                queue_drain_batch: 10_000,
            },
        ).await;
        let settings = engine.settings_for(tenant).await.unwrap();
        assert_eq!(settings.idle_after_minutes, MIN_THRESHOLD_MINUTES);
        assert_eq!(settings.archive_after_minutes, 2880);
        assert_eq!(settings.no_reply_after_minutes, 20);
        assert_eq!(settings.queue_drain_batch, 500);
    }
}
