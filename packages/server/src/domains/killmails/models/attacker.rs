//! Attacker rows, 1:N with their killmail.

use anyhow::Result;
use serde::Serialize;
use sqlx::{FromRow, PgConnection, PgPool};

use crate::common::batch::{insert_many, OnConflict};

#[derive(FromRow, Debug, Clone, Serialize)]
pub struct Attacker {
    pub id: i64,
    pub killmail_id: i64,
    pub character_id: Option<i64>,
    pub corporation_id: Option<i64>,
    pub alliance_id: Option<i64>,
    pub faction_id: Option<i64>,
    pub ship_type_id: Option<i64>,
    pub weapon_type_id: Option<i64>,
    pub damage_done: i64,
    pub final_blow: bool,
}

impl Attacker {
    pub async fn find_by_killmail(killmail_id: i64, db: &PgPool) -> Result<Vec<Self>> {
        let attackers = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, killmail_id, character_id, corporation_id, alliance_id, faction_id,
                   ship_type_id, weapon_type_id, damage_done, final_blow
            FROM attackers
            WHERE killmail_id = $1
            ORDER BY damage_done DESC, id ASC
            "#,
        )
        .bind(killmail_id)
        .fetch_all(db)
        .await?;
        Ok(attackers)
    }

    pub async fn count_for_killmail(killmail_id: i64, db: &PgPool) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM attackers WHERE killmail_id = $1")
            .bind(killmail_id)
            .fetch_one(db)
            .await?;
        Ok(count)
    }

    /// Bulk insert inside the ingest transaction, chunked under the
    /// parameter limit.
    pub async fn insert_many(
        conn: &mut PgConnection,
        killmail_id: i64,
        attackers: &[esi::EsiAttacker],
    ) -> Result<u64> {
        insert_many(
            conn,
            "attackers",
            &[
                "killmail_id",
                "character_id",
                "corporation_id",
                "alliance_id",
                "faction_id",
                "ship_type_id",
                "weapon_type_id",
                "damage_done",
                "final_blow",
            ],
            OnConflict::Error,
            attackers,
            |b, attacker| {
                b.push_bind(killmail_id)
                    .push_bind(attacker.character_id)
                    .push_bind(attacker.corporation_id)
                    .push_bind(attacker.alliance_id)
                    .push_bind(attacker.faction_id)
                    .push_bind(attacker.ship_type_id)
                    .push_bind(attacker.weapon_type_id)
                    .push_bind(attacker.damage_done)
                    .push_bind(attacker.final_blow);
            },
        )
        .await
    }
}
