//! Killmail job payloads and handlers.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::ingest::ingest_killmail;
use super::models::{Item, Killmail, Victim};
use super::publish::build_document;
use super::values::calculate_values;
use crate::domains::prices::fetcher::PgPriceSource;
use crate::kernel::jobs::{queues, JobPayload, JobRegistry};
use crate::kernel::ServerDeps;
use std::sync::Arc;

/// Fetch the canonical record from upstream and ingest it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchKillmail {
    pub killmail_id: i64,
    pub hash: String,
}

impl JobPayload for FetchKillmail {
    const QUEUE: &'static str = queues::KILLMAILS;
    const JOB_TYPE: &'static str = "fetch_killmail";

    fn dedup(&self) -> bool {
        true
    }
}

/// Compute the five ISK value fields for a persisted killmail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalculateValues {
    pub killmail_id: i64,
    pub kill_time: DateTime<Utc>,
}

impl JobPayload for CalculateValues {
    const QUEUE: &'static str = queues::VALUES;
    const JOB_TYPE: &'static str = "calculate_values";

    fn dedup(&self) -> bool {
        true
    }
}

/// Republish the enriched document downstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishKillmail {
    pub killmail_id: i64,
}

impl JobPayload for PublishKillmail {
    const QUEUE: &'static str = queues::PUBLISH;
    const JOB_TYPE: &'static str = "publish_killmail";

    fn dedup(&self) -> bool {
        true
    }
}

pub fn register_jobs(registry: &mut JobRegistry) {
    registry.register::<FetchKillmail, _, _>(handle_fetch);
    registry.register::<CalculateValues, _, _>(handle_calculate_values);
    registry.register::<PublishKillmail, _, _>(handle_publish);
}

async fn handle_fetch(job: FetchKillmail, deps: Arc<ServerDeps>) -> Result<()> {
    match deps.esi.get_killmail(job.killmail_id, &job.hash).await {
        Ok(killmail) => {
            ingest_killmail(&deps, &killmail, &job.hash).await?;
            Ok(())
        }
        Err(esi::EsiError::NotFound) => {
            warn!(upstream_id = job.killmail_id, "killmail not found upstream, skipping");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn handle_calculate_values(job: CalculateValues, deps: Arc<ServerDeps>) -> Result<()> {
    let Some(killmail) = Killmail::find_by_id(job.killmail_id, &deps.db).await? else {
        warn!(killmail_id = job.killmail_id, "killmail vanished before value calculation");
        return Ok(());
    };
    let Some(victim) = Victim::find_by_killmail(job.killmail_id, &deps.db).await? else {
        warn!(killmail_id = job.killmail_id, "killmail has no victim row, skipping values");
        return Ok(());
    };

    let items = Item::load_tree(job.killmail_id, &deps.db).await?;
    let prices = PgPriceSource::new(deps.db.clone());
    let values = calculate_values(
        victim.ship_type_id,
        &items,
        job.kill_time.date_naive(),
        &prices,
    )
    .await?;

    Killmail::update_values(job.killmail_id, &values, &deps.db).await?;
    info!(
        killmail_id = job.killmail_id,
        total_value = %values.total_value,
        "killmail values calculated"
    );

    deps.jobs
        .dispatch(&PublishKillmail {
            killmail_id: killmail.id,
        })
        .await?;

    Ok(())
}

async fn handle_publish(job: PublishKillmail, deps: Arc<ServerDeps>) -> Result<()> {
    let Some(document) = build_document(&deps.db, job.killmail_id).await? else {
        warn!(killmail_id = job.killmail_id, "killmail vanished before publish");
        return Ok(());
    };

    deps.publisher.publish(&document).await?;
    Ok(())
}
