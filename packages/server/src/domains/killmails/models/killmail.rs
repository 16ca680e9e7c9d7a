//! Killmail parent row.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::{FromRow, PgConnection, PgPool};

use crate::domains::killmails::values::KillmailValues;

const COLUMNS: &str = "id, upstream_id, hash, kill_time, solar_system_id, war_id, \
                       attacker_count, is_solo, is_npc, is_awox, ship_value, fitted_value, \
                       dropped_value, destroyed_value, total_value, created_at, updated_at";

#[derive(FromRow, Debug, Clone, Serialize)]
pub struct Killmail {
    pub id: i64,
    pub upstream_id: i64,
    pub hash: String,
    pub kill_time: DateTime<Utc>,
    pub solar_system_id: i64,
    pub war_id: Option<i64>,
    pub attacker_count: i32,
    pub is_solo: bool,
    pub is_npc: bool,
    pub is_awox: bool,
    pub ship_value: Decimal,
    pub fitted_value: Decimal,
    pub dropped_value: Decimal,
    pub destroyed_value: Decimal,
    pub total_value: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for a first-sighting insert. Values start at zero and are
/// filled in asynchronously by the value calculator.
#[derive(Debug, Clone)]
pub struct NewKillmail {
    pub upstream_id: i64,
    pub hash: String,
    pub kill_time: DateTime<Utc>,
    pub solar_system_id: i64,
    pub war_id: Option<i64>,
    pub attacker_count: i32,
    pub is_solo: bool,
    pub is_npc: bool,
    pub is_awox: bool,
}

impl Killmail {
    pub async fn find_by_id(id: i64, db: &PgPool) -> Result<Option<Self>> {
        let killmail =
            sqlx::query_as::<_, Self>(&format!("SELECT {COLUMNS} FROM killmails WHERE id = $1"))
                .bind(id)
                .fetch_optional(db)
                .await?;
        Ok(killmail)
    }

    pub async fn find_by_upstream_id(upstream_id: i64, db: &PgPool) -> Result<Option<Self>> {
        let killmail = sqlx::query_as::<_, Self>(&format!(
            "SELECT {COLUMNS} FROM killmails WHERE upstream_id = $1"
        ))
        .bind(upstream_id)
        .fetch_optional(db)
        .await?;
        Ok(killmail)
    }

    pub async fn exists_upstream(upstream_id: i64, db: &PgPool) -> Result<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM killmails WHERE upstream_id = $1)")
                .bind(upstream_id)
                .fetch_one(db)
                .await?;
        Ok(exists)
    }

    /// Which of `upstream_ids` are already persisted. Used by the
    /// backfill dedup pass.
    pub async fn existing_upstream_ids(upstream_ids: &[i64], db: &PgPool) -> Result<Vec<i64>> {
        if upstream_ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<i64> =
            sqlx::query_scalar("SELECT upstream_id FROM killmails WHERE upstream_id = ANY($1)")
                .bind(upstream_ids)
                .fetch_all(db)
                .await?;
        Ok(ids)
    }

    /// Advance `updated_at` on an idempotent re-insert.
    pub async fn touch(upstream_id: i64, db: &PgPool) -> Result<()> {
        sqlx::query("UPDATE killmails SET updated_at = NOW() WHERE upstream_id = $1")
            .bind(upstream_id)
            .execute(db)
            .await?;
        Ok(())
    }

    /// Insert the parent row inside the ingest transaction. Returns the
    /// new database id, or `None` when another writer beat us to the
    /// upstream id.
    pub async fn insert_new(conn: &mut PgConnection, new: &NewKillmail) -> Result<Option<i64>> {
        let id: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO killmails (
                upstream_id, hash, kill_time, solar_system_id, war_id,
                attacker_count, is_solo, is_npc, is_awox
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (upstream_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(new.upstream_id)
        .bind(&new.hash)
        .bind(new.kill_time)
        .bind(new.solar_system_id)
        .bind(new.war_id)
        .bind(new.attacker_count)
        .bind(new.is_solo)
        .bind(new.is_npc)
        .bind(new.is_awox)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(id)
    }

    /// Write the five value fields computed by the value calculator.
    pub async fn update_values(id: i64, values: &KillmailValues, db: &PgPool) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE killmails
            SET ship_value = $2,
                fitted_value = $3,
                dropped_value = $4,
                destroyed_value = $5,
                total_value = $6,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(values.ship_value)
        .bind(values.fitted_value)
        .bind(values.dropped_value)
        .bind(values.destroyed_value)
        .bind(values.total_value)
        .execute(db)
        .await?;
        Ok(())
    }
}
