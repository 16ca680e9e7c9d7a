//! Entity fetchers: freshness-gated fetch + upsert per entity kind.
//!
//! A missing entity (upstream 404) fails soft: the handler logs, returns
//! nothing, and the job succeeds. NPC corporations are satisfied from the
//! static reference table and never hit the upstream.

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::models::{
    is_npc_corporation, Alliance, Character, Corporation, ItemType, NpcCorporation,
};
use crate::kernel::jobs::{queues, JobPayload, JobRegistry};
use crate::kernel::ServerDeps;

/// Ids enqueued per kind on each stale-refresh tick.
const REFRESH_BATCH: i64 = 200;

pub async fn ensure_character(deps: &ServerDeps, character_id: i64) -> Result<Option<Character>> {
    if let Some(character) = Character::find_fresh(character_id, &deps.db).await? {
        return Ok(Some(character));
    }

    match deps.esi.get_character(character_id).await {
        Ok(data) => Ok(Some(Character::upsert(character_id, &data, &deps.db).await?)),
        Err(esi::EsiError::NotFound) => {
            warn!(character_id, "character not found upstream");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn ensure_corporation(
    deps: &ServerDeps,
    corporation_id: i64,
) -> Result<Option<Corporation>> {
    if let Some(corporation) = Corporation::find_fresh(corporation_id, &deps.db).await? {
        return Ok(Some(corporation));
    }

    if is_npc_corporation(corporation_id) {
        return match NpcCorporation::find(corporation_id, &deps.db).await? {
            Some(npc) => Ok(Some(Corporation::upsert_npc(&npc, &deps.db).await?)),
            None => {
                warn!(corporation_id, "NPC corporation missing from reference table");
                Ok(None)
            }
        };
    }

    match deps.esi.get_corporation(corporation_id).await {
        Ok(data) => Ok(Some(
            Corporation::upsert(corporation_id, &data, &deps.db).await?,
        )),
        Err(esi::EsiError::NotFound) => {
            warn!(corporation_id, "corporation not found upstream");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn ensure_alliance(deps: &ServerDeps, alliance_id: i64) -> Result<Option<Alliance>> {
    if let Some(alliance) = Alliance::find_fresh(alliance_id, &deps.db).await? {
        return Ok(Some(alliance));
    }

    match deps.esi.get_alliance(alliance_id).await {
        Ok(data) => Ok(Some(Alliance::upsert(alliance_id, &data, &deps.db).await?)),
        Err(esi::EsiError::NotFound) => {
            warn!(alliance_id, "alliance not found upstream");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn ensure_item_type(deps: &ServerDeps, type_id: i64) -> Result<Option<ItemType>> {
    if let Some(item_type) = ItemType::find(type_id, &deps.db).await? {
        if item_type.category_id.is_some() {
            return Ok(Some(item_type));
        }
    }

    let data = match deps.esi.get_type(type_id).await {
        Ok(data) => data,
        Err(esi::EsiError::NotFound) => {
            warn!(type_id, "type not found upstream");
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };

    let category_id = resolve_category(deps, data.group_id).await?;
    Ok(Some(ItemType::upsert(type_id, &data, category_id, &deps.db).await?))
}

/// Category comes via the group: the static table first, then upstream.
/// Unresolvable groups leave the category null so the repair tick retries
/// later.
async fn resolve_category(deps: &ServerDeps, group_id: i64) -> Result<Option<i64>> {
    let known: Option<i64> =
        sqlx::query_scalar("SELECT category_id FROM groups WHERE group_id = $1")
            .bind(group_id)
            .fetch_optional(&deps.db)
            .await?;
    if known.is_some() {
        return Ok(known);
    }

    match deps.esi.get_group(group_id).await {
        Ok(group) => {
            sqlx::query(
                r#"
                INSERT INTO groups (group_id, name, category_id)
                VALUES ($1, $2, $3)
                ON CONFLICT (group_id) DO UPDATE SET
                    name = EXCLUDED.name,
                    category_id = EXCLUDED.category_id
                "#,
            )
            .bind(group_id)
            .bind(&group.name)
            .bind(group.category_id)
            .execute(&deps.db)
            .await?;
            Ok(Some(group.category_id))
        }
        Err(esi::EsiError::NotFound) => {
            debug!(group_id, "group not found upstream, leaving category unresolved");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

// ============================================================================
// Job payloads
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshCharacter {
    pub character_id: i64,
}

impl JobPayload for RefreshCharacter {
    const QUEUE: &'static str = queues::ENTITIES;
    const JOB_TYPE: &'static str = "refresh_character";

    fn dedup(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshCorporation {
    pub corporation_id: i64,
}

impl JobPayload for RefreshCorporation {
    const QUEUE: &'static str = queues::ENTITIES;
    const JOB_TYPE: &'static str = "refresh_corporation";

    fn dedup(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshAlliance {
    pub alliance_id: i64,
}

impl JobPayload for RefreshAlliance {
    const QUEUE: &'static str = queues::ENTITIES;
    const JOB_TYPE: &'static str = "refresh_alliance";

    fn dedup(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshType {
    pub type_id: i64,
}

impl JobPayload for RefreshType {
    const QUEUE: &'static str = queues::ENTITIES;
    const JOB_TYPE: &'static str = "refresh_type";

    fn dedup(&self) -> bool {
        true
    }
}

pub fn register_jobs(registry: &mut JobRegistry) {
    registry.register::<RefreshCharacter, _, _>(|job, deps: Arc<ServerDeps>| async move {
        ensure_character(&deps, job.character_id).await?;
        Ok(())
    });
    registry.register::<RefreshCorporation, _, _>(|job, deps: Arc<ServerDeps>| async move {
        ensure_corporation(&deps, job.corporation_id).await?;
        Ok(())
    });
    registry.register::<RefreshAlliance, _, _>(|job, deps: Arc<ServerDeps>| async move {
        ensure_alliance(&deps, job.alliance_id).await?;
        Ok(())
    });
    registry.register::<RefreshType, _, _>(|job, deps: Arc<ServerDeps>| async move {
        ensure_item_type(&deps, job.type_id).await?;
        Ok(())
    });
}

// ============================================================================
// Scheduled refresh
// ============================================================================

/// Enqueue refresh jobs for stale entities. Called from the scheduler
/// once the entities queue has drained.
pub async fn refresh_stale_entities(deps: &ServerDeps) -> Result<u64> {
    let mut enqueued = 0u64;

    for character_id in Character::stale_ids(REFRESH_BATCH, &deps.db).await? {
        if deps.jobs.dispatch(&RefreshCharacter { character_id }).await?.is_some() {
            enqueued += 1;
        }
    }
    for corporation_id in Corporation::stale_ids(REFRESH_BATCH, &deps.db).await? {
        if deps.jobs.dispatch(&RefreshCorporation { corporation_id }).await?.is_some() {
            enqueued += 1;
        }
    }
    for alliance_id in Alliance::stale_ids(REFRESH_BATCH, &deps.db).await? {
        if deps.jobs.dispatch(&RefreshAlliance { alliance_id }).await?.is_some() {
            enqueued += 1;
        }
    }

    Ok(enqueued)
}

/// Re-enqueue type fetches for rows whose category never resolved.
pub async fn repair_unclassified_types(deps: &ServerDeps) -> Result<u64> {
    let mut enqueued = 0u64;
    for type_id in ItemType::unclassified_ids(REFRESH_BATCH, &deps.db).await? {
        if deps.jobs.dispatch(&RefreshType { type_id }).await?.is_some() {
            enqueued += 1;
        }
    }
    Ok(enqueued)
}
