//! Price fetching: windowed fallback cascade plus the oracle backing the
//! value calculator.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::debug;

use super::models::{Price, DEFAULT_REGION_ID};
use crate::domains::killmails::values::PriceSource;
use crate::kernel::jobs::{queues, JobPayload, JobRegistry};
use crate::kernel::ServerDeps;

/// Blueprint category in the type tree.
pub const BLUEPRINT_CATEGORY_ID: i64 = 9;

/// Fetch history for a type, trying windows in order until one returns
/// data: 14 days around the reference, then 30, then 90, then 14 days
/// unanchored. The first non-empty window is stored and returned.
pub async fn fetch_prices(
    deps: &ServerDeps,
    type_id: i64,
    reference_date: Option<NaiveDate>,
) -> Result<Vec<esi::MarketHistoryEntry>> {
    let windows: &[(u32, bool)] = match reference_date {
        Some(_) => &[(14, true), (30, true), (90, true), (14, false)],
        None => &[(14, false), (30, false), (90, false)],
    };

    for &(days, anchored) in windows {
        let anchor = if anchored { reference_date } else { None };
        match deps.esi.get_market_history(type_id, days, anchor).await {
            Ok(entries) if !entries.is_empty() => {
                Price::upsert_history(type_id, DEFAULT_REGION_ID, &entries, &deps.db).await?;
                return Ok(entries);
            }
            Ok(_) => continue,
            Err(esi::EsiError::NotFound) => {
                debug!(type_id, days, "no market history for window");
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(Vec::new())
}

/// Price oracle over the prices and types tables.
pub struct PgPriceSource {
    db: PgPool,
}

impl PgPriceSource {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl PriceSource for PgPriceSource {
    async fn price_for(&self, type_id: i64, date: NaiveDate) -> Result<Decimal> {
        Price::price_for(type_id, date, &self.db).await
    }

    async fn is_blueprint(&self, type_id: i64) -> Result<bool> {
        let is_blueprint: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM types WHERE type_id = $1 AND category_id = $2)",
        )
        .bind(type_id)
        .bind(BLUEPRINT_CATEGORY_ID)
        .fetch_one(&self.db)
        .await?;
        Ok(is_blueprint)
    }
}

// ============================================================================
// Job payload
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchPrices {
    pub type_id: i64,
    pub reference_date: Option<NaiveDate>,
}

impl JobPayload for FetchPrices {
    const QUEUE: &'static str = queues::PRICES;
    const JOB_TYPE: &'static str = "fetch_prices";

    fn dedup(&self) -> bool {
        true
    }
}

pub fn register_jobs(registry: &mut JobRegistry) {
    registry.register::<FetchPrices, _, _>(|job: FetchPrices, deps: Arc<ServerDeps>| async move {
        fetch_prices(&deps, job.type_id, job.reference_date).await?;
        Ok(())
    });
}
