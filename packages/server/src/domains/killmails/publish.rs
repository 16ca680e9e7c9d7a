//! Enriched document assembly for the downstream publish channel.
//!
//! The document is built from the persisted killmail joined with whatever
//! entity names have been enriched so far; names that have not arrived
//! yet are null and downstream consumers treat them as pending.

use std::collections::{BTreeSet, HashMap};

use anyhow::Result;
use sqlx::PgPool;

use super::models::{Attacker, Killmail, Victim};

/// Assemble the publish document for one killmail. `None` when the
/// killmail no longer exists.
pub async fn build_document(db: &PgPool, killmail_id: i64) -> Result<Option<serde_json::Value>> {
    let Some(killmail) = Killmail::find_by_id(killmail_id, db).await? else {
        return Ok(None);
    };
    let victim = Victim::find_by_killmail(killmail_id, db).await?;
    let attackers = Attacker::find_by_killmail(killmail_id, db).await?;

    let mut character_ids = BTreeSet::new();
    let mut corporation_ids = BTreeSet::new();
    let mut alliance_ids = BTreeSet::new();
    let mut type_ids = BTreeSet::new();

    if let Some(victim) = &victim {
        character_ids.extend(victim.character_id);
        corporation_ids.insert(victim.corporation_id);
        alliance_ids.extend(victim.alliance_id);
        type_ids.insert(victim.ship_type_id);
    }
    for attacker in &attackers {
        character_ids.extend(attacker.character_id);
        corporation_ids.extend(attacker.corporation_id);
        alliance_ids.extend(attacker.alliance_id);
        type_ids.extend(attacker.ship_type_id);
        type_ids.extend(attacker.weapon_type_id);
    }

    let characters = name_map(db, "characters", "character_id", &ids(&character_ids)).await?;
    let corporations = name_map(db, "corporations", "corporation_id", &ids(&corporation_ids)).await?;
    let alliances = name_map(db, "alliances", "alliance_id", &ids(&alliance_ids)).await?;
    let types = name_map(db, "types", "type_id", &ids(&type_ids)).await?;

    let system_name: Option<String> =
        sqlx::query_scalar("SELECT name FROM solar_systems WHERE system_id = $1")
            .bind(killmail.solar_system_id)
            .fetch_optional(db)
            .await?;

    let victim_doc = victim.map(|victim| {
        serde_json::json!({
            "character_id": victim.character_id,
            "character_name": lookup(&characters, victim.character_id),
            "corporation_id": victim.corporation_id,
            "corporation_name": lookup(&corporations, Some(victim.corporation_id)),
            "alliance_id": victim.alliance_id,
            "alliance_name": lookup(&alliances, victim.alliance_id),
            "faction_id": victim.faction_id,
            "ship_type_id": victim.ship_type_id,
            "ship_name": lookup(&types, Some(victim.ship_type_id)),
            "damage_taken": victim.damage_taken,
        })
    });

    let attacker_docs: Vec<serde_json::Value> = attackers
        .iter()
        .map(|attacker| {
            serde_json::json!({
                "character_id": attacker.character_id,
                "character_name": lookup(&characters, attacker.character_id),
                "corporation_id": attacker.corporation_id,
                "corporation_name": lookup(&corporations, attacker.corporation_id),
                "alliance_id": attacker.alliance_id,
                "alliance_name": lookup(&alliances, attacker.alliance_id),
                "faction_id": attacker.faction_id,
                "ship_type_id": attacker.ship_type_id,
                "ship_name": lookup(&types, attacker.ship_type_id),
                "weapon_type_id": attacker.weapon_type_id,
                "damage_done": attacker.damage_done,
                "final_blow": attacker.final_blow,
            })
        })
        .collect();

    Ok(Some(serde_json::json!({
        "killmail_id": killmail.upstream_id,
        "hash": killmail.hash,
        "kill_time": killmail.kill_time,
        "solar_system": {
            "id": killmail.solar_system_id,
            "name": system_name,
        },
        "war_id": killmail.war_id,
        "attacker_count": killmail.attacker_count,
        "is_solo": killmail.is_solo,
        "is_npc": killmail.is_npc,
        "is_awox": killmail.is_awox,
        "ship_value": killmail.ship_value,
        "fitted_value": killmail.fitted_value,
        "dropped_value": killmail.dropped_value,
        "destroyed_value": killmail.destroyed_value,
        "total_value": killmail.total_value,
        "victim": victim_doc,
        "attackers": attacker_docs,
    })))
}

fn ids(set: &BTreeSet<i64>) -> Vec<i64> {
    set.iter().copied().collect()
}

fn lookup(names: &HashMap<i64, String>, id: Option<i64>) -> Option<&String> {
    id.and_then(|id| names.get(&id))
}

async fn name_map(
    db: &PgPool,
    table: &str,
    id_column: &str,
    ids: &[i64],
) -> Result<HashMap<i64, String>> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }

    let rows: Vec<(i64, String)> = sqlx::query_as(&format!(
        "SELECT {id_column}, name FROM {table} WHERE {id_column} = ANY($1)"
    ))
    .bind(ids)
    .fetch_all(db)
    .await?;

    Ok(rows.into_iter().collect())
}
