//! No-reply transfer job
//!
//! Moves assigned conversations away from agents who left the customer's
//! last message unanswered past the tenant's threshold. When no colleague
//! can take the conversation it stays with the current agent.

use time::{Duration, OffsetDateTime};

use super::JobContext;

pub async fn run(ctx: &JobContext) {
    super::for_each_tenant(ctx, "no_reply", |tenant_id| async move {
        let settings = ctx.engine.settings_for(tenant_id).await?;
        let cutoff = OffsetDateTime::now_utc() - Duration::minutes(settings.no_reply_after_minutes);
        let stalled = ctx
            .engine
            .store()
            .no_reply_candidates(tenant_id, cutoff)
            .await?;

        for conversation in stalled {
            let Some(agent) = conversation.assigned_agent_id else {
                continue;
            };
            match ctx
                .engine
                .transfer_no_reply(tenant_id, conversation.id, agent)
                .await?
            {
                Some(new_agent) => tracing::info!(
                    tenant_id = %tenant_id,
                    conversation_id = %conversation.id,
                    from = %agent,
                    to = %new_agent,
                    "transferred unanswered conversation"
                ),
                None => tracing::debug!(
                    tenant_id = %tenant_id,
                    conversation_id = %conversation.id,
                    "no colleague available, conversation stays put"
                ),
            }
        }
        Ok(())
    })
    .await;
}
