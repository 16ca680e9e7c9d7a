//! Victim row, 1:1 with its killmail.

use anyhow::Result;
use serde::Serialize;
use sqlx::{FromRow, PgConnection, PgPool};

#[derive(FromRow, Debug, Clone, Serialize)]
pub struct Victim {
    pub id: i64,
    pub killmail_id: i64,
    pub character_id: Option<i64>,
    pub corporation_id: i64,
    pub alliance_id: Option<i64>,
    pub faction_id: Option<i64>,
    pub ship_type_id: i64,
    pub damage_taken: i64,
    pub position_x: Option<f64>,
    pub position_y: Option<f64>,
    pub position_z: Option<f64>,
}

impl Victim {
    pub async fn find_by_killmail(killmail_id: i64, db: &PgPool) -> Result<Option<Self>> {
        let victim = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, killmail_id, character_id, corporation_id, alliance_id, faction_id,
                   ship_type_id, damage_taken, position_x, position_y, position_z
            FROM victims
            WHERE killmail_id = $1
            "#,
        )
        .bind(killmail_id)
        .fetch_optional(db)
        .await?;
        Ok(victim)
    }

    pub async fn insert(
        conn: &mut PgConnection,
        killmail_id: i64,
        victim: &esi::EsiVictim,
    ) -> Result<()> {
        let position = victim.position;
        sqlx::query(
            r#"
            INSERT INTO victims (
                killmail_id, character_id, corporation_id, alliance_id, faction_id,
                ship_type_id, damage_taken, position_x, position_y, position_z
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (killmail_id) DO NOTHING
            "#,
        )
        .bind(killmail_id)
        .bind(victim.character_id)
        .bind(victim.corporation_id)
        .bind(victim.alliance_id)
        .bind(victim.faction_id)
        .bind(victim.ship_type_id)
        .bind(victim.damage_taken)
        .bind(position.map(|p| p.x))
        .bind(position.map(|p| p.y))
        .bind(position.map(|p| p.z))
        .execute(&mut *conn)
        .await?;
        Ok(())
    }
}
