//! Historical price rows.

use anyhow::Result;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::{FromRow, PgPool};

use crate::common::batch::{insert_many, OnConflict};

/// Region the market history is sourced from (The Forge).
pub const DEFAULT_REGION_ID: i64 = 10_000_002;

/// Returned when nothing at all is stored for a type.
pub fn fallback_price() -> Decimal {
    Decimal::new(1, 2) // 0.01
}

#[derive(FromRow, Debug, Clone, Serialize)]
pub struct Price {
    pub type_id: i64,
    pub region_id: i64,
    pub price_date: NaiveDate,
    pub average: Decimal,
    pub highest: Decimal,
    pub lowest: Decimal,
    pub order_count: i64,
    pub volume: i64,
}

impl Price {
    /// Average price for `type_id` on the stored date nearest to
    /// `target_date`; ties prefer the earlier date. Falls back to 0.01
    /// when the type has no rows at all.
    pub async fn price_for(type_id: i64, target_date: NaiveDate, db: &PgPool) -> Result<Decimal> {
        let average: Option<Decimal> = sqlx::query_scalar(
            r#"
            SELECT average
            FROM prices
            WHERE type_id = $1
            ORDER BY ABS(price_date - $2) ASC, price_date ASC
            LIMIT 1
            "#,
        )
        .bind(type_id)
        .bind(target_date)
        .fetch_optional(db)
        .await?;

        Ok(average.unwrap_or_else(fallback_price))
    }

    pub async fn find(
        type_id: i64,
        region_id: i64,
        price_date: NaiveDate,
        db: &PgPool,
    ) -> Result<Option<Self>> {
        let price = sqlx::query_as::<_, Self>(
            r#"
            SELECT type_id, region_id, price_date, average, highest, lowest, order_count, volume
            FROM prices
            WHERE type_id = $1 AND region_id = $2 AND price_date = $3
            "#,
        )
        .bind(type_id)
        .bind(region_id)
        .bind(price_date)
        .fetch_optional(db)
        .await?;
        Ok(price)
    }

    /// Store one market-history window, upserting by day.
    pub async fn upsert_history(
        type_id: i64,
        region_id: i64,
        entries: &[esi::MarketHistoryEntry],
        db: &PgPool,
    ) -> Result<u64> {
        let mut conn = db.acquire().await?;
        insert_many(
            &mut conn,
            "prices",
            &[
                "type_id",
                "region_id",
                "price_date",
                "average",
                "highest",
                "lowest",
                "order_count",
                "volume",
            ],
            OnConflict::Update {
                target: "type_id, region_id, price_date",
                columns: &["average", "highest", "lowest", "order_count", "volume"],
            },
            entries,
            |b, entry| {
                b.push_bind(type_id)
                    .push_bind(region_id)
                    .push_bind(entry.date)
                    .push_bind(decimal(entry.average))
                    .push_bind(decimal(entry.highest))
                    .push_bind(decimal(entry.lowest))
                    .push_bind(entry.order_count)
                    .push_bind(entry.volume);
            },
        )
        .await
    }
}

fn decimal(value: f64) -> Decimal {
    Decimal::from_f64_retain(value).unwrap_or_default()
}
