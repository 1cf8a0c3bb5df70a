//! Scheduled jobs
//!
//! Every job iterates the active tenants and does its work under a named
//! mutex scoped to (job, tenant), so overlapping worker instances never
//! process the same tenant twice. A busy lock means another instance got
//! there first and the tenant is skipped; an unavailable lock backend
//! degrades to unprotected execution rather than stalling the schedule.

pub mod auto_archive;
pub mod idle_watch;
pub mod no_reply;
pub mod queue_drain;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chatwire_engine::lock::{LockAttempt, LockManager};
use chatwire_engine::Engine;
use chatwire_shared::CoreResult;
use uuid::Uuid;

const JOB_LOCK_TTL: Duration = Duration::from_secs(55);

#[derive(Clone)]
pub struct JobContext {
    pub engine: Engine,
    pub locks: Arc<dyn LockManager>,
}

/// Run `work` for every active tenant, isolating failures per tenant.
pub async fn for_each_tenant<F, Fut>(ctx: &JobContext, job: &str, work: F)
where
    F: Fn(Uuid) -> Fut,
    Fut: Future<Output = CoreResult<()>>,
{
    let tenants = match ctx.engine.store().list_active_tenants().await {
        Ok(tenants) => tenants,
        Err(e) => {
            tracing::error!(job, error = %e, "failed to list active tenants");
            return;
        }
    };

    for tenant_id in tenants {
        let key = format!("job:{job}:{tenant_id}");
        let token = match ctx.locks.try_lock(&key, JOB_LOCK_TTL).await {
            LockAttempt::Acquired(token) => Some(token),
            LockAttempt::Busy => {
                tracing::debug!(job, tenant_id = %tenant_id, "tenant locked by another instance, skipping");
                continue;
            }
            LockAttempt::Unavailable => {
                tracing::warn!(job, tenant_id = %tenant_id, "lock backend unavailable, running unprotected");
                None
            }
        };

        if let Err(e) = work(tenant_id).await {
            tracing::error!(job, tenant_id = %tenant_id, error = %e, "job failed for tenant");
        }

        if let Some(token) = token {
            ctx.locks.unlock(&key, &token).await;
        }
    }
}
