//! Enrichment entity models.
//!
//! An entity is FRESH while `updated_at` is within the freshness window;
//! reads return the cached row and STALE rows trigger an upstream
//! refresh. NPC corporations come from the static reference table and are
//! never fetched upstream.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, PgPool};

/// Entities older than this are STALE.
pub const FRESHNESS_DAYS: i64 = 14;

/// Reserved NPC corporation id range.
pub fn is_npc_corporation(corporation_id: i64) -> bool {
    (1_000_000..2_000_000).contains(&corporation_id)
}

#[derive(FromRow, Debug, Clone, Serialize)]
pub struct Character {
    pub character_id: i64,
    pub name: String,
    pub corporation_id: Option<i64>,
    pub alliance_id: Option<i64>,
    pub faction_id: Option<i64>,
    pub security_status: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Character {
    pub async fn find_fresh(character_id: i64, db: &PgPool) -> Result<Option<Self>> {
        let character = sqlx::query_as::<_, Self>(&format!(
            r#"
            SELECT character_id, name, corporation_id, alliance_id, faction_id,
                   security_status, created_at, updated_at
            FROM characters
            WHERE character_id = $1
              AND updated_at > NOW() - INTERVAL '{FRESHNESS_DAYS} days'
            "#,
        ))
        .bind(character_id)
        .fetch_optional(db)
        .await?;
        Ok(character)
    }

    pub async fn upsert(character_id: i64, data: &esi::Character, db: &PgPool) -> Result<Self> {
        let character = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO characters (character_id, name, corporation_id, alliance_id, faction_id, security_status)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (character_id) DO UPDATE SET
                name = EXCLUDED.name,
                corporation_id = EXCLUDED.corporation_id,
                alliance_id = EXCLUDED.alliance_id,
                faction_id = EXCLUDED.faction_id,
                security_status = EXCLUDED.security_status,
                updated_at = NOW()
            RETURNING character_id, name, corporation_id, alliance_id, faction_id,
                      security_status, created_at, updated_at
            "#,
        )
        .bind(character_id)
        .bind(&data.name)
        .bind(data.corporation_id)
        .bind(data.alliance_id)
        .bind(data.faction_id)
        .bind(data.security_status)
        .fetch_one(db)
        .await?;
        Ok(character)
    }

    pub async fn stale_ids(limit: i64, db: &PgPool) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar(&format!(
            r#"
            SELECT character_id FROM characters
            WHERE updated_at < NOW() - INTERVAL '{FRESHNESS_DAYS} days'
            ORDER BY updated_at ASC
            LIMIT $1
            "#,
        ))
        .bind(limit)
        .fetch_all(db)
        .await?;
        Ok(ids)
    }
}

#[derive(FromRow, Debug, Clone, Serialize)]
pub struct Corporation {
    pub corporation_id: i64,
    pub name: String,
    pub ticker: Option<String>,
    pub alliance_id: Option<i64>,
    pub faction_id: Option<i64>,
    pub ceo_id: Option<i64>,
    pub member_count: Option<i32>,
    pub npc: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const CORPORATION_COLUMNS: &str = "corporation_id, name, ticker, alliance_id, faction_id, \
                                   ceo_id, member_count, npc, created_at, updated_at";

impl Corporation {
    pub async fn find_fresh(corporation_id: i64, db: &PgPool) -> Result<Option<Self>> {
        let corporation = sqlx::query_as::<_, Self>(&format!(
            r#"
            SELECT {CORPORATION_COLUMNS}
            FROM corporations
            WHERE corporation_id = $1
              AND (npc OR updated_at > NOW() - INTERVAL '{FRESHNESS_DAYS} days')
            "#,
        ))
        .bind(corporation_id)
        .fetch_optional(db)
        .await?;
        Ok(corporation)
    }

    pub async fn upsert(corporation_id: i64, data: &esi::Corporation, db: &PgPool) -> Result<Self> {
        let corporation = sqlx::query_as::<_, Self>(&format!(
            r#"
            INSERT INTO corporations (corporation_id, name, ticker, alliance_id, faction_id, ceo_id, member_count, npc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, FALSE)
            ON CONFLICT (corporation_id) DO UPDATE SET
                name = EXCLUDED.name,
                ticker = EXCLUDED.ticker,
                alliance_id = EXCLUDED.alliance_id,
                faction_id = EXCLUDED.faction_id,
                ceo_id = EXCLUDED.ceo_id,
                member_count = EXCLUDED.member_count,
                updated_at = NOW()
            RETURNING {CORPORATION_COLUMNS}
            "#,
        ))
        .bind(corporation_id)
        .bind(&data.name)
        .bind(&data.ticker)
        .bind(data.alliance_id)
        .bind(data.faction_id)
        .bind(data.ceo_id)
        .bind(data.member_count)
        .fetch_one(db)
        .await?;
        Ok(corporation)
    }

    /// Upsert an NPC corporation from the static reference row.
    pub async fn upsert_npc(npc: &NpcCorporation, db: &PgPool) -> Result<Self> {
        let corporation = sqlx::query_as::<_, Self>(&format!(
            r#"
            INSERT INTO corporations (corporation_id, name, ticker, faction_id, npc)
            VALUES ($1, $2, $3, $4, TRUE)
            ON CONFLICT (corporation_id) DO UPDATE SET
                name = EXCLUDED.name,
                ticker = EXCLUDED.ticker,
                faction_id = EXCLUDED.faction_id,
                npc = TRUE,
                updated_at = NOW()
            RETURNING {CORPORATION_COLUMNS}
            "#,
        ))
        .bind(npc.corporation_id)
        .bind(&npc.name)
        .bind(&npc.ticker)
        .bind(npc.faction_id)
        .fetch_one(db)
        .await?;
        Ok(corporation)
    }

    /// Player corporations due a refresh. NPC rows never go stale.
    pub async fn stale_ids(limit: i64, db: &PgPool) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar(&format!(
            r#"
            SELECT corporation_id FROM corporations
            WHERE NOT npc
              AND updated_at < NOW() - INTERVAL '{FRESHNESS_DAYS} days'
            ORDER BY updated_at ASC
            LIMIT $1
            "#,
        ))
        .bind(limit)
        .fetch_all(db)
        .await?;
        Ok(ids)
    }
}

#[derive(FromRow, Debug, Clone, Serialize)]
pub struct Alliance {
    pub alliance_id: i64,
    pub name: String,
    pub ticker: Option<String>,
    pub executor_corporation_id: Option<i64>,
    pub faction_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Alliance {
    pub async fn find_fresh(alliance_id: i64, db: &PgPool) -> Result<Option<Self>> {
        let alliance = sqlx::query_as::<_, Self>(&format!(
            r#"
            SELECT alliance_id, name, ticker, executor_corporation_id, faction_id,
                   created_at, updated_at
            FROM alliances
            WHERE alliance_id = $1
              AND updated_at > NOW() - INTERVAL '{FRESHNESS_DAYS} days'
            "#,
        ))
        .bind(alliance_id)
        .fetch_optional(db)
        .await?;
        Ok(alliance)
    }

    pub async fn upsert(alliance_id: i64, data: &esi::Alliance, db: &PgPool) -> Result<Self> {
        let alliance = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO alliances (alliance_id, name, ticker, executor_corporation_id, faction_id)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (alliance_id) DO UPDATE SET
                name = EXCLUDED.name,
                ticker = EXCLUDED.ticker,
                executor_corporation_id = EXCLUDED.executor_corporation_id,
                faction_id = EXCLUDED.faction_id,
                updated_at = NOW()
            RETURNING alliance_id, name, ticker, executor_corporation_id, faction_id,
                      created_at, updated_at
            "#,
        )
        .bind(alliance_id)
        .bind(&data.name)
        .bind(&data.ticker)
        .bind(data.executor_corporation_id)
        .bind(data.faction_id)
        .fetch_one(db)
        .await?;
        Ok(alliance)
    }

    pub async fn stale_ids(limit: i64, db: &PgPool) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar(&format!(
            r#"
            SELECT alliance_id FROM alliances
            WHERE updated_at < NOW() - INTERVAL '{FRESHNESS_DAYS} days'
            ORDER BY updated_at ASC
            LIMIT $1
            "#,
        ))
        .bind(limit)
        .fetch_all(db)
        .await?;
        Ok(ids)
    }
}

#[derive(FromRow, Debug, Clone, Serialize)]
pub struct ItemType {
    pub type_id: i64,
    pub name: String,
    pub group_id: i64,
    pub category_id: Option<i64>,
    pub published: Option<bool>,
    pub updated_at: DateTime<Utc>,
}

impl ItemType {
    pub async fn find(type_id: i64, db: &PgPool) -> Result<Option<Self>> {
        let item_type = sqlx::query_as::<_, Self>(
            "SELECT type_id, name, group_id, category_id, published, updated_at \
             FROM types WHERE type_id = $1",
        )
        .bind(type_id)
        .fetch_optional(db)
        .await?;
        Ok(item_type)
    }

    pub async fn upsert(
        type_id: i64,
        data: &esi::UniverseType,
        category_id: Option<i64>,
        db: &PgPool,
    ) -> Result<Self> {
        let item_type = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO types (type_id, name, group_id, category_id, published)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (type_id) DO UPDATE SET
                name = EXCLUDED.name,
                group_id = EXCLUDED.group_id,
                category_id = COALESCE(EXCLUDED.category_id, types.category_id),
                published = EXCLUDED.published,
                updated_at = NOW()
            RETURNING type_id, name, group_id, category_id, published, updated_at
            "#,
        )
        .bind(type_id)
        .bind(&data.name)
        .bind(data.group_id)
        .bind(category_id)
        .bind(data.published)
        .fetch_one(db)
        .await?;
        Ok(item_type)
    }

    /// Types flagged for re-fetch because their category is unresolved.
    pub async fn unclassified_ids(limit: i64, db: &PgPool) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar(
            "SELECT type_id FROM types WHERE category_id IS NULL ORDER BY updated_at ASC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(db)
        .await?;
        Ok(ids)
    }
}

/// Static NPC corporation reference row.
#[derive(FromRow, Debug, Clone)]
pub struct NpcCorporation {
    pub corporation_id: i64,
    pub name: String,
    pub ticker: Option<String>,
    pub faction_id: Option<i64>,
}

impl NpcCorporation {
    pub async fn find(corporation_id: i64, db: &PgPool) -> Result<Option<Self>> {
        let npc = sqlx::query_as::<_, Self>(
            "SELECT corporation_id, name, ticker, faction_id FROM npc_corporations \
             WHERE corporation_id = $1",
        )
        .bind(corporation_id)
        .fetch_optional(db)
        .await?;
        Ok(npc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn npc_corporation_range_is_inclusive_of_the_reserved_block() {
        assert!(is_npc_corporation(1_000_000));
        assert!(is_npc_corporation(1_999_999));
        assert!(!is_npc_corporation(999_999));
        assert!(!is_npc_corporation(2_000_000));
        assert!(!is_npc_corporation(98_000_001));
    }
}
