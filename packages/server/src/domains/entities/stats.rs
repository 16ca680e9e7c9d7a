//! Per-entity rolling counters.
//!
//! Every killmail updates the stats row of each associated entity: kill
//! counters for attacker-side entities, loss counters for victim-side
//! ones, bucketed all-time / 90d / 30d / 14d by the killmail's age at
//! processing time. All updates for one killmail commit in a single
//! transaction and the upsert adds deltas to existing columns, so
//! concurrent killmails touching the same hot entity compose.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};
use tracing::warn;

use crate::kernel::jobs::{queues, JobPayload, JobRegistry};
use crate::kernel::ServerDeps;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "entity_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Character,
    Corporation,
    Alliance,
    Faction,
    Group,
    Type,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    pub id: i64,
    pub kind: EntityKind,
}

impl EntityRef {
    pub fn new(id: i64, kind: EntityKind) -> Self {
        Self { id, kind }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct KillmailAggregates {
    pub kill_time: DateTime<Utc>,
    pub total_value: Decimal,
    pub is_solo: bool,
    pub is_npc: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Kill,
    Loss,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgeBuckets {
    pub in_90d: bool,
    pub in_30d: bool,
    pub in_14d: bool,
}

/// Bucket membership by the killmail's age at processing time. Buckets
/// never demote in-line; offline recomputation owns that.
pub fn age_buckets(kill_time: DateTime<Utc>, now: DateTime<Utc>) -> AgeBuckets {
    let age = now - kill_time;
    AgeBuckets {
        in_90d: age <= chrono::Duration::days(90),
        in_30d: age <= chrono::Duration::days(30),
        in_14d: age <= chrono::Duration::days(14),
    }
}

/// Apply one killmail's deltas to every associated entity, in one
/// transaction.
pub async fn apply_killmail_stats(
    db: &PgPool,
    victim_entities: &[EntityRef],
    attacker_entities: &[EntityRef],
    aggregates: &KillmailAggregates,
) -> Result<()> {
    let buckets = age_buckets(aggregates.kill_time, Utc::now());

    let mut tx = db.begin().await?;
    for entity in attacker_entities {
        upsert_delta(&mut tx, entity, Side::Kill, aggregates, buckets).await?;
    }
    for entity in victim_entities {
        upsert_delta(&mut tx, entity, Side::Loss, aggregates, buckets).await?;
    }
    tx.commit().await?;

    Ok(())
}

async fn upsert_delta(
    conn: &mut PgConnection,
    entity: &EntityRef,
    side: Side,
    aggregates: &KillmailAggregates,
    buckets: AgeBuckets,
) -> Result<()> {
    let kill = side == Side::Kill;
    let one = |condition: bool| if condition { 1i64 } else { 0 };
    let isk = |condition: bool| {
        if condition {
            aggregates.total_value
        } else {
            Decimal::ZERO
        }
    };

    sqlx::query(
        r#"
        INSERT INTO entity_stats (
            entity_id, entity_kind,
            kills_all, kills_90d, kills_30d, kills_14d,
            losses_all, losses_90d, losses_30d, losses_14d,
            isk_destroyed_all, isk_destroyed_90d, isk_destroyed_30d, isk_destroyed_14d,
            isk_lost_all, isk_lost_90d, isk_lost_30d, isk_lost_14d,
            solo_kills, solo_losses, npc_kills, npc_losses,
            last_kill_time, last_loss_time
        )
        VALUES (
            $1, $2,
            $3, $4, $5, $6,
            $7, $8, $9, $10,
            $11, $12, $13, $14,
            $15, $16, $17, $18,
            $19, $20, $21, $22,
            $23, $24
        )
        ON CONFLICT (entity_id, entity_kind) DO UPDATE SET
            kills_all = entity_stats.kills_all + EXCLUDED.kills_all,
            kills_90d = entity_stats.kills_90d + EXCLUDED.kills_90d,
            kills_30d = entity_stats.kills_30d + EXCLUDED.kills_30d,
            kills_14d = entity_stats.kills_14d + EXCLUDED.kills_14d,
            losses_all = entity_stats.losses_all + EXCLUDED.losses_all,
            losses_90d = entity_stats.losses_90d + EXCLUDED.losses_90d,
            losses_30d = entity_stats.losses_30d + EXCLUDED.losses_30d,
            losses_14d = entity_stats.losses_14d + EXCLUDED.losses_14d,
            isk_destroyed_all = entity_stats.isk_destroyed_all + EXCLUDED.isk_destroyed_all,
            isk_destroyed_90d = entity_stats.isk_destroyed_90d + EXCLUDED.isk_destroyed_90d,
            isk_destroyed_30d = entity_stats.isk_destroyed_30d + EXCLUDED.isk_destroyed_30d,
            isk_destroyed_14d = entity_stats.isk_destroyed_14d + EXCLUDED.isk_destroyed_14d,
            isk_lost_all = entity_stats.isk_lost_all + EXCLUDED.isk_lost_all,
            isk_lost_90d = entity_stats.isk_lost_90d + EXCLUDED.isk_lost_90d,
            isk_lost_30d = entity_stats.isk_lost_30d + EXCLUDED.isk_lost_30d,
            isk_lost_14d = entity_stats.isk_lost_14d + EXCLUDED.isk_lost_14d,
            solo_kills = entity_stats.solo_kills + EXCLUDED.solo_kills,
            solo_losses = entity_stats.solo_losses + EXCLUDED.solo_losses,
            npc_kills = entity_stats.npc_kills + EXCLUDED.npc_kills,
            npc_losses = entity_stats.npc_losses + EXCLUDED.npc_losses,
            last_kill_time = GREATEST(entity_stats.last_kill_time, EXCLUDED.last_kill_time),
            last_loss_time = GREATEST(entity_stats.last_loss_time, EXCLUDED.last_loss_time),
            updated_at = NOW()
        "#,
    )
    .bind(entity.id)
    .bind(entity.kind)
    .bind(one(kill))
    .bind(one(kill && buckets.in_90d))
    .bind(one(kill && buckets.in_30d))
    .bind(one(kill && buckets.in_14d))
    .bind(one(!kill))
    .bind(one(!kill && buckets.in_90d))
    .bind(one(!kill && buckets.in_30d))
    .bind(one(!kill && buckets.in_14d))
    .bind(isk(kill))
    .bind(isk(kill && buckets.in_90d))
    .bind(isk(kill && buckets.in_30d))
    .bind(isk(kill && buckets.in_14d))
    .bind(isk(!kill))
    .bind(isk(!kill && buckets.in_90d))
    .bind(isk(!kill && buckets.in_30d))
    .bind(isk(!kill && buckets.in_14d))
    .bind(one(kill && aggregates.is_solo))
    .bind(one(!kill && aggregates.is_solo))
    .bind(one(kill && aggregates.is_npc))
    .bind(one(!kill && aggregates.is_npc))
    .bind(if kill { Some(aggregates.kill_time) } else { None })
    .bind(if kill { None } else { Some(aggregates.kill_time) })
    .execute(&mut *conn)
    .await?;

    Ok(())
}

// ============================================================================
// Job payload
// ============================================================================

/// Fan-out payload carrying the affected entities; the killmail's value
/// is read fresh at processing time so a finished value calculation is
/// picked up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateEntityStats {
    pub killmail_id: i64,
    pub kill_time: DateTime<Utc>,
    pub is_solo: bool,
    pub is_npc: bool,
    pub victim_entities: Vec<EntityRef>,
    pub attacker_entities: Vec<EntityRef>,
}

impl JobPayload for UpdateEntityStats {
    const QUEUE: &'static str = queues::STATS;
    const JOB_TYPE: &'static str = "update_entity_stats";

    fn dedup(&self) -> bool {
        true
    }
}

pub fn register_jobs(registry: &mut JobRegistry) {
    registry.register::<UpdateEntityStats, _, _>(handle_update_stats);
}

async fn handle_update_stats(job: UpdateEntityStats, deps: Arc<ServerDeps>) -> Result<()> {
    let total_value: Option<Decimal> =
        sqlx::query_scalar("SELECT total_value FROM killmails WHERE id = $1")
            .bind(job.killmail_id)
            .fetch_optional(&deps.db)
            .await?;

    let Some(total_value) = total_value else {
        warn!(killmail_id = job.killmail_id, "killmail vanished before stats update");
        return Ok(());
    };

    let mut victim_entities: BTreeSet<EntityRef> = job.victim_entities.iter().copied().collect();
    let mut attacker_entities: BTreeSet<EntityRef> =
        job.attacker_entities.iter().copied().collect();
    add_group_refs(&deps.db, &mut victim_entities).await?;
    add_group_refs(&deps.db, &mut attacker_entities).await?;

    let victim_entities: Vec<EntityRef> = victim_entities.into_iter().collect();
    let attacker_entities: Vec<EntityRef> = attacker_entities.into_iter().collect();

    apply_killmail_stats(
        &deps.db,
        &victim_entities,
        &attacker_entities,
        &KillmailAggregates {
            kill_time: job.kill_time,
            total_value,
            is_solo: job.is_solo,
            is_npc: job.is_npc,
        },
    )
    .await
}

/// Expand ship-type refs with their group, where the type is already
/// enriched. Unknown types simply contribute no group row.
async fn add_group_refs(db: &PgPool, entities: &mut BTreeSet<EntityRef>) -> Result<()> {
    let type_ids: Vec<i64> = entities
        .iter()
        .filter(|e| e.kind == EntityKind::Type)
        .map(|e| e.id)
        .collect();
    if type_ids.is_empty() {
        return Ok(());
    }

    let group_ids: Vec<i64> =
        sqlx::query_scalar("SELECT DISTINCT group_id FROM types WHERE type_id = ANY($1)")
            .bind(&type_ids)
            .fetch_all(db)
            .await?;

    for group_id in group_ids {
        entities.insert(EntityRef::new(group_id, EntityKind::Group));
    }
    Ok(())
}
