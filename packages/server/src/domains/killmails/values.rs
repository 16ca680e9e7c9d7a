//! ISK value calculation.
//!
//! Containers contribute nothing themselves; only their leaves do. A leaf
//! is worth `price × (dropped + destroyed)`, partitioned into the dropped
//! and destroyed buckets by quantity. Blueprint originals are pinned at a
//! nominal 0.01 ISK and blueprint copies (singleton flag 2) divide the
//! type price by 100.

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;

use super::models::ItemNode;

/// Singleton flag marking a blueprint copy.
pub const BPC_SINGLETON: i32 = 2;

/// Price oracle seam: backed by the prices table in production, by a map
/// in tests.
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Average price of `type_id` nearest to `date`; 0.01 when nothing is
    /// stored.
    async fn price_for(&self, type_id: i64, date: NaiveDate) -> Result<Decimal>;

    /// Whether the type is a blueprint original.
    async fn is_blueprint(&self, type_id: i64) -> Result<bool>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KillmailValues {
    pub ship_value: Decimal,
    pub fitted_value: Decimal,
    pub dropped_value: Decimal,
    pub destroyed_value: Decimal,
    pub total_value: Decimal,
}

/// Compute the five value fields for a killmail.
pub async fn calculate_values<P: PriceSource + ?Sized>(
    ship_type_id: i64,
    items: &[ItemNode],
    kill_date: NaiveDate,
    prices: &P,
) -> Result<KillmailValues> {
    let ship_value = unit_price(prices, ship_type_id, 0, kill_date).await?;

    let mut dropped_value = Decimal::ZERO;
    let mut destroyed_value = Decimal::ZERO;
    accumulate_items(items, kill_date, prices, &mut dropped_value, &mut destroyed_value).await?;

    let fitted_value = dropped_value + destroyed_value;

    Ok(KillmailValues {
        ship_value,
        fitted_value,
        dropped_value,
        destroyed_value,
        total_value: ship_value + fitted_value,
    })
}

/// Walk the item tree one container level deep. Written iteratively
/// because the nesting is bounded and async recursion would need boxing.
async fn accumulate_items<P: PriceSource + ?Sized>(
    items: &[ItemNode],
    kill_date: NaiveDate,
    prices: &P,
    dropped_value: &mut Decimal,
    destroyed_value: &mut Decimal,
) -> Result<()> {
    let mut queue: Vec<&ItemNode> = items.iter().collect();

    while let Some(item) = queue.pop() {
        if !item.children.is_empty() {
            // Containers contribute no value of their own.
            queue.extend(item.children.iter());
            continue;
        }

        let price = unit_price(prices, item.item_type_id, item.singleton, kill_date).await?;
        *dropped_value += price * Decimal::from(item.quantity_dropped.max(0));
        *destroyed_value += price * Decimal::from(item.quantity_destroyed.max(0));
    }

    Ok(())
}

async fn unit_price<P: PriceSource + ?Sized>(
    prices: &P,
    type_id: i64,
    singleton: i32,
    kill_date: NaiveDate,
) -> Result<Decimal> {
    let mut price = if prices.is_blueprint(type_id).await? {
        Decimal::new(1, 2) // 0.01
    } else {
        prices.price_for(type_id, kill_date).await?
    };

    if singleton == BPC_SINGLETON {
        price /= Decimal::from(100);
    }

    Ok(price)
}
