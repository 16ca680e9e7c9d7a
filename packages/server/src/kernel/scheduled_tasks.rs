//! Scheduled background tasks using tokio-cron-scheduler.
//!
//! Each task dispatches jobs or runs small maintenance statements; none
//! of them do upstream work inline. The entity-refresh tick checks its
//! queue first and skips the tick entirely while jobs are still waiting
//! or running, so a slow upstream cannot pile up refresh work.

use std::sync::Arc;

use anyhow::Result;
use tokio_cron_scheduler::{Job, JobScheduler};

use crate::domains::entities;
use crate::kernel::jobs::queues;
use crate::kernel::{esi_cache, ServerDeps};

/// Terminal jobs older than this are deleted nightly.
const JOB_RETENTION_DAYS: i64 = 7;

/// Start all scheduled tasks.
pub async fn start_scheduler(deps: Arc<ServerDeps>) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;

    // Cache sweep - every 30 minutes.
    let sweep_deps = deps.clone();
    let sweep_job = Job::new_async("0 */30 * * * *", move |_uuid, _lock| {
        let deps = sweep_deps.clone();
        Box::pin(async move {
            if let Err(e) = esi_cache::sweep_expired(&deps.db).await {
                tracing::error!("cache sweep failed: {}", e);
            }
        })
    })?;
    scheduler.add(sweep_job).await?;

    // Terminal job cleanup - daily at 03:10.
    let cleanup_deps = deps.clone();
    let cleanup_job = Job::new_async("0 10 3 * * *", move |_uuid, _lock| {
        let deps = cleanup_deps.clone();
        Box::pin(async move {
            match deps
                .jobs
                .cleanup(std::time::Duration::from_secs(
                    (JOB_RETENTION_DAYS * 24 * 3600) as u64,
                ))
                .await
            {
                Ok(deleted) if deleted > 0 => {
                    tracing::info!("cleaned up {} terminal jobs", deleted);
                }
                Ok(_) => {}
                Err(e) => tracing::error!("job cleanup failed: {}", e),
            }
        })
    })?;
    scheduler.add(cleanup_job).await?;

    // Stale entity refresh - hourly.
    let refresh_deps = deps.clone();
    let refresh_job = Job::new_async("0 5 * * * *", move |_uuid, _lock| {
        let deps = refresh_deps.clone();
        Box::pin(async move {
            if let Err(e) = run_entity_refresh(&deps).await {
                tracing::error!("entity refresh tick failed: {}", e);
            }
        })
    })?;
    scheduler.add(refresh_job).await?;

    // Type repair - hourly, offset from the refresh tick.
    let repair_deps = deps.clone();
    let repair_job = Job::new_async("0 35 * * * *", move |_uuid, _lock| {
        let deps = repair_deps.clone();
        Box::pin(async move {
            match entities::repair_unclassified_types(&deps).await {
                Ok(enqueued) if enqueued > 0 => {
                    tracing::info!("enqueued {} type repairs", enqueued);
                }
                Ok(_) => {}
                Err(e) => tracing::error!("type repair tick failed: {}", e),
            }
        })
    })?;
    scheduler.add(repair_job).await?;

    scheduler.start().await?;
    tracing::info!("scheduled tasks started (cache sweep, job cleanup, entity refresh, type repair)");
    Ok(scheduler)
}

/// One entity-refresh tick. Skipped while the entities queue is still
/// draining.
async fn run_entity_refresh(deps: &ServerDeps) -> Result<()> {
    let backlog = deps.jobs.waiting_or_active(queues::ENTITIES).await?;
    if backlog > 0 {
        tracing::info!(backlog, "entities queue busy, skipping refresh tick");
        return Ok(());
    }

    let enqueued = entities::refresh_stale_entities(deps).await?;
    if enqueued > 0 {
        tracing::info!(enqueued, "enqueued stale entity refreshes");
    }
    Ok(())
}
