//! Queue drain job
//!
//! Periodic safety net behind the event-driven assignment paths: anything
//! still queued (capacity freed up, agents came online, an earlier pass
//! raced and lost) gets another placement attempt, oldest first.

use super::JobContext;

pub async fn run(ctx: &JobContext) {
    super::for_each_tenant(ctx, "queue_drain", |tenant_id| async move {
        let settings = ctx.engine.settings_for(tenant_id).await?;
        let placed = ctx
            .engine
            .try_assign_from_queue(tenant_id, settings.queue_drain_batch)
            .await?;
        if placed > 0 {
            tracing::info!(tenant_id = %tenant_id, placed, "drained queued conversations");
        }
        Ok(())
    })
    .await;
}
