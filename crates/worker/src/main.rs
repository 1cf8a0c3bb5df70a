//! Chatwire background worker
//!
//! Runs the scheduled maintenance jobs: draining the assignment queue,
//! emitting idle events, archiving dead conversations, and transferring
//! unanswered ones. Safe to run alongside any number of API instances and
//! other workers; per-tenant job mutexes keep the passes from overlapping.

mod jobs;

use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chatwire_engine::{
    lock::{LockManager, RedisLock},
    presence::RedisPresence,
    store::PgStore,
    Engine,
};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing_subscriber::EnvFilter;

use jobs::JobContext;

// Second-resolution cron expressions, overridable per deployment.
const QUEUE_DRAIN_DEFAULT: &str = "*/15 * * * * *";
const IDLE_WATCH_DEFAULT: &str = "0 * * * * *";
const NO_REPLY_DEFAULT: &str = "30 * * * * *";
const AUTO_ARCHIVE_DEFAULT: &str = "0 */5 * * * *";

struct WorkerConfig {
    database_url: String,
    database_max_connections: u32,
    redis_url: String,
    presence_ttl: Duration,
    queue_drain_schedule: String,
    idle_watch_schedule: String,
    no_reply_schedule: String,
    auto_archive_schedule: String,
}

impl WorkerConfig {
    fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL is required")?,
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .unwrap_or(5),
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            presence_ttl: Duration::from_secs(
                env::var("PRESENCE_TTL_SECONDS")
                    .unwrap_or_else(|_| "45".to_string())
                    .parse()
                    .unwrap_or(45),
            ),
            queue_drain_schedule: env::var("QUEUE_DRAIN_SCHEDULE")
                .unwrap_or_else(|_| QUEUE_DRAIN_DEFAULT.to_string()),
            idle_watch_schedule: env::var("IDLE_WATCH_SCHEDULE")
                .unwrap_or_else(|_| IDLE_WATCH_DEFAULT.to_string()),
            no_reply_schedule: env::var("NO_REPLY_SCHEDULE")
                .unwrap_or_else(|_| NO_REPLY_DEFAULT.to_string()),
            auto_archive_schedule: env::var("AUTO_ARCHIVE_SCHEDULE")
                .unwrap_or_else(|_| AUTO_ARCHIVE_DEFAULT.to_string()),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = WorkerConfig::from_env()?;

    let pool = chatwire_shared::db::create_pool(&config.database_url, config.database_max_connections)
        .await
        .context("failed to connect to database")?;

    let redis_client =
        redis::Client::open(config.redis_url.as_str()).context("invalid REDIS_URL")?;
    let redis_conn = redis::aio::ConnectionManager::new(redis_client)
        .await
        .context("failed to connect to redis")?;

    // The worker never fans events out itself; clients catch up over SYNC.
    let locks: Arc<dyn LockManager> = Arc::new(RedisLock::new(redis_conn.clone()));
    let engine = Engine::new(
        Arc::new(PgStore::new(pool)),
        Arc::new(RedisPresence::new(redis_conn, config.presence_ttl)),
        Arc::clone(&locks),
    );
    let ctx = JobContext { engine, locks };

    let scheduler = JobScheduler::new()
        .await
        .context("failed to create job scheduler")?;

    add_job(&scheduler, &config.queue_drain_schedule, {
        let ctx = ctx.clone();
        move || {
            let ctx = ctx.clone();
            async move { jobs::queue_drain::run(&ctx).await }
        }
    })
    .await
    .context("invalid queue drain schedule")?;

    add_job(&scheduler, &config.idle_watch_schedule, {
        let ctx = ctx.clone();
        move || {
            let ctx = ctx.clone();
            async move { jobs::idle_watch::run(&ctx).await }
        }
    })
    .await
    .context("invalid idle watch schedule")?;

    add_job(&scheduler, &config.no_reply_schedule, {
        let ctx = ctx.clone();
        move || {
            let ctx = ctx.clone();
            async move { jobs::no_reply::run(&ctx).await }
        }
    })
    .await
    .context("invalid no-reply schedule")?;

    add_job(&scheduler, &config.auto_archive_schedule, {
        let ctx = ctx.clone();
        move || {
            let ctx = ctx.clone();
            async move { jobs::auto_archive::run(&ctx).await }
        }
    })
    .await
    .context("invalid auto-archive schedule")?;

    scheduler.start().await.context("scheduler failed to start")?;
    tracing::info!("chatwire-worker running");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutting down");
    Ok(())
}

async fn add_job<F, Fut>(
    scheduler: &JobScheduler,
    schedule: &str,
    job: F,
) -> anyhow::Result<()>
where
    F: Fn() -> Fut + Send + Sync + Clone + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let job = Job::new_async(schedule, move |_id, _scheduler| {
        let job = job.clone();
        Box::pin(async move { job().await })
    })?;
    scheduler.add(job).await?;
    Ok(())
}
