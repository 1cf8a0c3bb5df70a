//! Idle watch job
//!
//! Emits one idle event per inactivity window for open conversations whose
//! customer went quiet. The store-side guard keeps the event single-shot
//! until the customer speaks again.

use time::{Duration, OffsetDateTime};

use super::JobContext;

pub async fn run(ctx: &JobContext) {
    super::for_each_tenant(ctx, "idle_watch", |tenant_id| async move {
        let settings = ctx.engine.settings_for(tenant_id).await?;
        let cutoff = OffsetDateTime::now_utc() - Duration::minutes(settings.idle_after_minutes);
        let candidates = ctx.engine.store().idle_candidates(tenant_id, cutoff).await?;

        let mut fired = 0;
        for conversation in candidates {
            if ctx
                .engine
                .fire_idle_event(tenant_id, conversation.id, settings.idle_after_minutes)
                .await?
            {
                fired += 1;
            }
        }
        if fired > 0 {
            tracing::info!(tenant_id = %tenant_id, fired, "idle events emitted");
        }
        Ok(())
    })
    .await;
}
