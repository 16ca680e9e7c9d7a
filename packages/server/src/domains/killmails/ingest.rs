//! Killmail ingestion: the critical flow.
//!
//! ```text
//! ingest_killmail
//!     │
//!     ├─► dedup by upstream id (duplicate ⇒ touch updated_at, stop)
//!     ├─► derive flags + normalise the final blow
//!     ├─► one transaction: parent, victim, attackers, items
//!     └─► post-commit fan-out: entity refresh, prices, values,
//!         publish, stats
//! ```
//!
//! Fan-out happens strictly after commit so no consumer can observe a job
//! before its parent row is visible. Re-ingesting a known upstream id
//! only advances `updated_at`: no child writes, no new jobs.

use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::{Context, Result};
use esi::{EsiAttacker, EsiItem, EsiKillmail, EsiVictim};
use tracing::{debug, info};

use super::jobs::{CalculateValues, PublishKillmail};
use super::models::{killmail::NewKillmail, Attacker, Item, Killmail, Victim};
use crate::domains::entities::fetcher::{
    RefreshAlliance, RefreshCharacter, RefreshCorporation, RefreshType,
};
use crate::domains::entities::stats::{EntityKind, EntityRef, UpdateEntityStats};
use crate::domains::prices::fetcher::FetchPrices;
use crate::kernel::jobs::DispatchOptions;
use crate::kernel::ServerDeps;

/// Head start for price fetches before the value calculation runs.
const VALUE_CALC_DELAY: Duration = Duration::from_secs(30);

/// Stats run last so the value calculation has usually landed.
const STATS_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Inserted { killmail_id: i64 },
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DerivedFlags {
    pub attacker_count: i32,
    pub is_solo: bool,
    pub is_npc: bool,
    pub is_awox: bool,
}

/// Ingest one killmail. `hash` is opaque metadata from the feed.
pub async fn ingest_killmail(
    deps: &ServerDeps,
    killmail: &EsiKillmail,
    hash: &str,
) -> Result<IngestOutcome> {
    if Killmail::exists_upstream(killmail.killmail_id, &deps.db).await? {
        Killmail::touch(killmail.killmail_id, &deps.db).await?;
        debug!(upstream_id = killmail.killmail_id, "duplicate killmail, touched");
        return Ok(IngestOutcome::Duplicate);
    }

    if killmail.attackers.is_empty() {
        return Err(anyhow::Error::new(esi::EsiError::Contract(format!(
            "killmail {} has no attackers",
            killmail.killmail_id
        ))));
    }

    let mut attackers = killmail.attackers.clone();
    normalize_final_blow(&mut attackers);
    let flags = derive_flags(&killmail.victim, &attackers);

    let mut tx = deps.db.begin().await.context("failed to open ingest transaction")?;

    let inserted = Killmail::insert_new(
        &mut tx,
        &NewKillmail {
            upstream_id: killmail.killmail_id,
            hash: hash.to_string(),
            kill_time: killmail.killmail_time,
            solar_system_id: killmail.solar_system_id,
            war_id: killmail.war_id,
            attacker_count: flags.attacker_count,
            is_solo: flags.is_solo,
            is_npc: flags.is_npc,
            is_awox: flags.is_awox,
        },
    )
    .await?;

    let Some(killmail_id) = inserted else {
        // Another writer committed this upstream id between our dedup
        // check and the insert.
        tx.rollback().await?;
        Killmail::touch(killmail.killmail_id, &deps.db).await?;
        return Ok(IngestOutcome::Duplicate);
    };

    Victim::insert(&mut tx, killmail_id, &killmail.victim).await?;
    Attacker::insert_many(&mut tx, killmail_id, &attackers).await?;
    if let Some(items) = &killmail.victim.items {
        Item::insert_tree(&mut tx, killmail_id, items).await?;
    }

    tx.commit().await.context("failed to commit ingest transaction")?;

    fan_out(deps, killmail_id, killmail, &attackers, &flags).await?;

    info!(
        killmail_id,
        upstream_id = killmail.killmail_id,
        attackers = flags.attacker_count,
        is_solo = flags.is_solo,
        is_npc = flags.is_npc,
        is_awox = flags.is_awox,
        "killmail ingested"
    );

    Ok(IngestOutcome::Inserted { killmail_id })
}

/// Derive the parent-row flags from the normalised attacker list.
pub fn derive_flags(victim: &EsiVictim, attackers: &[EsiAttacker]) -> DerivedFlags {
    let attacker_count = attackers.len() as i32;

    let is_solo = attacker_count == 1 && attackers[0].faction_id.is_none();

    let is_npc = attackers
        .iter()
        .all(|a| a.faction_id.is_some() || a.character_id.is_none());

    let is_awox = match victim.alliance_id {
        Some(alliance_id) => attackers.iter().any(|a| a.alliance_id == Some(alliance_id)),
        None => false,
    };

    DerivedFlags {
        attacker_count,
        is_solo,
        is_npc,
        is_awox,
    }
}

/// Ensure exactly one attacker carries the final blow.
///
/// If zero or several claim it, the highest `damage_done` among the
/// claimants (or among everyone, when none claim it) wins; remaining ties
/// resolve to the first in input order.
pub fn normalize_final_blow(attackers: &mut [EsiAttacker]) {
    if attackers.is_empty() {
        return;
    }

    let claimed: Vec<usize> = attackers
        .iter()
        .enumerate()
        .filter(|(_, a)| a.final_blow)
        .map(|(i, _)| i)
        .collect();

    if claimed.len() == 1 {
        return;
    }

    let candidates: Vec<usize> = if claimed.is_empty() {
        (0..attackers.len()).collect()
    } else {
        claimed
    };

    let winner = candidates
        .iter()
        .copied()
        .max_by(|&a, &b| {
            attackers[a]
                .damage_done
                .cmp(&attackers[b].damage_done)
                // On equal damage, prefer the earlier row.
                .then(b.cmp(&a))
        })
        .unwrap_or(0);

    for (index, attacker) in attackers.iter_mut().enumerate() {
        attacker.final_blow = index == winner;
    }
}

/// Enqueue enrichment work after the ingest transaction committed.
async fn fan_out(
    deps: &ServerDeps,
    killmail_id: i64,
    killmail: &EsiKillmail,
    attackers: &[EsiAttacker],
    flags: &DerivedFlags,
) -> Result<()> {
    let mut character_ids = BTreeSet::new();
    let mut corporation_ids = BTreeSet::new();
    let mut alliance_ids = BTreeSet::new();
    let mut type_ids = BTreeSet::new();

    let victim = &killmail.victim;
    character_ids.extend(victim.character_id);
    corporation_ids.insert(victim.corporation_id);
    alliance_ids.extend(victim.alliance_id);
    type_ids.insert(victim.ship_type_id);
    if let Some(items) = &victim.items {
        collect_item_types(items, &mut type_ids);
    }

    for attacker in attackers {
        character_ids.extend(attacker.character_id);
        corporation_ids.extend(attacker.corporation_id);
        alliance_ids.extend(attacker.alliance_id);
        type_ids.extend(attacker.ship_type_id);
        type_ids.extend(attacker.weapon_type_id);
    }

    for &character_id in &character_ids {
        deps.jobs.dispatch(&RefreshCharacter { character_id }).await?;
    }
    for &corporation_id in &corporation_ids {
        deps.jobs.dispatch(&RefreshCorporation { corporation_id }).await?;
    }
    for &alliance_id in &alliance_ids {
        deps.jobs.dispatch(&RefreshAlliance { alliance_id }).await?;
    }
    for &type_id in &type_ids {
        deps.jobs.dispatch(&RefreshType { type_id }).await?;
    }

    let kill_date = killmail.killmail_time.date_naive();
    for &type_id in &type_ids {
        deps.jobs
            .dispatch(&FetchPrices {
                type_id,
                reference_date: Some(kill_date),
            })
            .await?;
    }

    deps.jobs
        .dispatch_with(
            &CalculateValues {
                killmail_id,
                kill_time: killmail.killmail_time,
            },
            DispatchOptions {
                delay: VALUE_CALC_DELAY,
                ..Default::default()
            },
        )
        .await?;

    deps.jobs.dispatch(&PublishKillmail { killmail_id }).await?;

    deps.jobs
        .dispatch_with(
            &UpdateEntityStats {
                killmail_id,
                kill_time: killmail.killmail_time,
                is_solo: flags.is_solo,
                is_npc: flags.is_npc,
                victim_entities: victim_entity_refs(victim),
                attacker_entities: attacker_entity_refs(attackers),
            },
            DispatchOptions {
                delay: STATS_DELAY,
                ..Default::default()
            },
        )
        .await?;

    Ok(())
}

fn collect_item_types(items: &[EsiItem], type_ids: &mut BTreeSet<i64>) {
    for item in items {
        type_ids.insert(item.item_type_id);
        if let Some(contents) = &item.items {
            collect_item_types(contents, type_ids);
        }
    }
}

fn victim_entity_refs(victim: &EsiVictim) -> Vec<EntityRef> {
    let mut refs = Vec::new();
    if let Some(id) = victim.character_id {
        refs.push(EntityRef::new(id, EntityKind::Character));
    }
    refs.push(EntityRef::new(victim.corporation_id, EntityKind::Corporation));
    if let Some(id) = victim.alliance_id {
        refs.push(EntityRef::new(id, EntityKind::Alliance));
    }
    if let Some(id) = victim.faction_id {
        refs.push(EntityRef::new(id, EntityKind::Faction));
    }
    refs.push(EntityRef::new(victim.ship_type_id, EntityKind::Type));
    refs
}

fn attacker_entity_refs(attackers: &[EsiAttacker]) -> Vec<EntityRef> {
    let mut refs = BTreeSet::new();
    for attacker in attackers {
        if let Some(id) = attacker.character_id {
            refs.insert(EntityRef::new(id, EntityKind::Character));
        }
        if let Some(id) = attacker.corporation_id {
            refs.insert(EntityRef::new(id, EntityKind::Corporation));
        }
        if let Some(id) = attacker.alliance_id {
            refs.insert(EntityRef::new(id, EntityKind::Alliance));
        }
        if let Some(id) = attacker.faction_id {
            refs.insert(EntityRef::new(id, EntityKind::Faction));
        }
        if let Some(id) = attacker.ship_type_id {
            refs.insert(EntityRef::new(id, EntityKind::Type));
        }
    }
    refs.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attacker(
        character_id: Option<i64>,
        alliance_id: Option<i64>,
        faction_id: Option<i64>,
        damage_done: i64,
        final_blow: bool,
    ) -> EsiAttacker {
        serde_json::from_value(serde_json::json!({
            "character_id": character_id,
            "alliance_id": alliance_id,
            "faction_id": faction_id,
            "damage_done": damage_done,
            "final_blow": final_blow,
        }))
        .unwrap()
    }

    fn victim(alliance_id: Option<i64>) -> EsiVictim {
        serde_json::from_value(serde_json::json!({
            "corporation_id": 67890,
            "alliance_id": alliance_id,
            "ship_type_id": 587,
            "damage_taken": 15000,
        }))
        .unwrap()
    }

    #[test]
    fn single_attacker_with_character_is_solo() {
        let attackers = vec![attacker(Some(54321), None, None, 15000, true)];
        let flags = derive_flags(&victim(None), &attackers);
        assert_eq!(flags.attacker_count, 1);
        assert!(flags.is_solo);
        assert!(!flags.is_npc);
        assert!(!flags.is_awox);
    }

    #[test]
    fn faction_attacker_is_not_solo() {
        let attackers = vec![attacker(None, None, Some(500024), 5000, true)];
        let flags = derive_flags(&victim(None), &attackers);
        assert!(!flags.is_solo);
        assert!(flags.is_npc);
    }

    #[test]
    fn npc_when_every_attacker_lacks_a_character_or_has_a_faction() {
        let attackers = vec![
            attacker(None, None, None, 100, false),
            attacker(Some(1), None, Some(500024), 200, true),
        ];
        assert!(derive_flags(&victim(None), &attackers).is_npc);

        let mixed = vec![
            attacker(None, None, None, 100, false),
            attacker(Some(1), None, None, 200, true),
        ];
        assert!(!derive_flags(&victim(None), &mixed).is_npc);
    }

    #[test]
    fn awox_when_an_attacker_shares_the_victim_alliance() {
        let attackers = vec![
            attacker(Some(1), Some(99000001), None, 100, false),
            attacker(Some(2), Some(99000002), None, 200, true),
            attacker(Some(3), None, None, 300, false),
        ];
        assert!(derive_flags(&victim(Some(99000001)), &attackers).is_awox);
        assert!(!derive_flags(&victim(Some(99000099)), &attackers).is_awox);
        assert!(!derive_flags(&victim(None), &attackers).is_awox);
    }

    #[test]
    fn final_blow_left_alone_when_exactly_one_claims_it() {
        let mut attackers = vec![
            attacker(Some(1), None, None, 100, false),
            attacker(Some(2), None, None, 50, true),
        ];
        normalize_final_blow(&mut attackers);
        assert!(!attackers[0].final_blow);
        assert!(attackers[1].final_blow);
    }

    #[test]
    fn final_blow_assigned_to_top_damage_when_none_claims_it() {
        let mut attackers = vec![
            attacker(Some(1), None, None, 100, false),
            attacker(Some(2), None, None, 900, false),
            attacker(Some(3), None, None, 300, false),
        ];
        normalize_final_blow(&mut attackers);
        let marked: Vec<bool> = attackers.iter().map(|a| a.final_blow).collect();
        assert_eq!(marked, vec![false, true, false]);
    }

    #[test]
    fn final_blow_tie_breaks_by_damage_among_claimants() {
        let mut attackers = vec![
            attacker(Some(1), None, None, 100, true),
            attacker(Some(2), None, None, 900, true),
        ];
        normalize_final_blow(&mut attackers);
        assert!(!attackers[0].final_blow);
        assert!(attackers[1].final_blow);
    }

    #[test]
    fn final_blow_equal_damage_resolves_to_first() {
        let mut attackers = vec![
            attacker(Some(1), None, None, 500, true),
            attacker(Some(2), None, None, 500, true),
        ];
        normalize_final_blow(&mut attackers);
        assert!(attackers[0].final_blow);
        assert!(!attackers[1].final_blow);
        assert_eq!(attackers.iter().filter(|a| a.final_blow).count(), 1);
    }

    #[test]
    fn attacker_refs_deduplicate_entities() {
        let attackers: Vec<EsiAttacker> = (0..500)
            .map(|i| attacker(Some(i), Some(99000001), None, 10, false))
            .collect();
        let refs = attacker_entity_refs(&attackers);
        let alliance_refs = refs
            .iter()
            .filter(|r| r.kind == EntityKind::Alliance)
            .count();
        assert_eq!(alliance_refs, 1);
        let character_refs = refs
            .iter()
            .filter(|r| r.kind == EntityKind::Character)
            .count();
        assert_eq!(character_refs, 500);
    }
}
