//! Auto-archive job
//!
//! Closes open conversations with no traffic at all past the tenant's
//! archive threshold.

use time::{Duration, OffsetDateTime};

use super::JobContext;

pub async fn run(ctx: &JobContext) {
    super::for_each_tenant(ctx, "auto_archive", |tenant_id| async move {
        let settings = ctx.engine.settings_for(tenant_id).await?;
        let cutoff = OffsetDateTime::now_utc() - Duration::minutes(settings.archive_after_minutes);
        let stale = ctx.engine.store().inactive_open(tenant_id, cutoff).await?;

        let mut closed = 0;
        for conversation in stale {
            if ctx
                .engine
                .close_for_inactivity(tenant_id, conversation.id, settings.archive_after_minutes)
                .await?
            {
                closed += 1;
            }
        }
        if closed > 0 {
            tracing::info!(tenant_id = %tenant_id, closed, "archived inactive conversations");
        }
        Ok(())
    })
    .await;
}
