//! Price store lookups: nearest-date selection and fallbacks.

mod common;

use chrono::NaiveDate;
use common::TestApp;
use killfeed_core::domains::killmails::values::{calculate_values, PriceSource};
use killfeed_core::domains::killmails::models::ItemNode;
use killfeed_core::domains::prices::{PgPriceSource, Price};
use rust_decimal::Decimal;

const REGION: i64 = 10_000_002;

fn day(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

async fn seed_price(app: &TestApp, type_id: i64, date: NaiveDate, average: i64) {
    sqlx::query(
        r#"
        INSERT INTO prices (type_id, region_id, price_date, average, highest, lowest, order_count, volume)
        VALUES ($1, $2, $3, $4, $4, $4, 10, 100)
        "#,
    )
    .bind(type_id)
    .bind(REGION)
    .bind(date)
    .bind(Decimal::from(average))
    .execute(&app.pool)
    .await
    .unwrap();
}

#[tokio::test]
async fn price_for_picks_the_nearest_date() {
    let app = TestApp::spawn().await;

    seed_price(&app, 587, day(2025, 10, 1), 100).await;
    seed_price(&app, 587, day(2025, 10, 10), 200).await;
    seed_price(&app, 587, day(2025, 10, 20), 300).await;

    // Exact hit.
    let price = Price::price_for(587, day(2025, 10, 10), &app.pool).await.unwrap();
    assert_eq!(price, Decimal::from(200));

    // Nearest by absolute distance: the 12th is 2 days from the 10th and
    // 8 from the 20th.
    let price = Price::price_for(587, day(2025, 10, 12), &app.pool).await.unwrap();
    assert_eq!(price, Decimal::from(200));

    // Target far after every record: the latest wins.
    let price = Price::price_for(587, day(2025, 12, 1), &app.pool).await.unwrap();
    assert_eq!(price, Decimal::from(300));

    // Target before every record: the earliest wins.
    let price = Price::price_for(587, day(2025, 9, 1), &app.pool).await.unwrap();
    assert_eq!(price, Decimal::from(100));

    // Equidistant ties prefer the earlier date.
    let price = Price::price_for(587, day(2025, 10, 15), &app.pool).await.unwrap();
    assert_eq!(price, Decimal::from(200));
}

#[tokio::test]
async fn unknown_types_fall_back_to_a_cent() {
    let app = TestApp::spawn().await;

    let price = Price::price_for(999_999, day(2025, 10, 10), &app.pool).await.unwrap();
    assert_eq!(price, Decimal::new(1, 2));
}

#[tokio::test]
async fn pg_price_source_feeds_the_value_calculator() {
    let app = TestApp::spawn().await;

    seed_price(&app, 587, day(2025, 10, 14), 1_000_000).await;
    seed_price(&app, 34, day(2025, 10, 14), 10).await;

    // A blueprint type: category 9.
    sqlx::query(
        "INSERT INTO types (type_id, name, group_id, category_id) VALUES (691, 'Merlin Blueprint', 105, 9)",
    )
    .execute(&app.pool)
    .await
    .unwrap();
    seed_price(&app, 691, day(2025, 10, 14), 5_000_000).await;

    let source = PgPriceSource::new(app.pool.clone());
    assert!(source.is_blueprint(691).await.unwrap());
    assert!(!source.is_blueprint(587).await.unwrap());

    let items = vec![
        ItemNode::leaf(34, 100, 0),
        ItemNode::leaf(691, 0, 1), // blueprint original: 0.01, not 5M
    ];
    let values = calculate_values(587, &items, day(2025, 10, 15), &source)
        .await
        .unwrap();

    assert_eq!(values.ship_value, Decimal::from(1_000_000));
    assert_eq!(values.dropped_value, Decimal::from(1_000));
    assert_eq!(values.destroyed_value, Decimal::new(1, 2));
    assert_eq!(
        values.total_value,
        Decimal::from(1_001_000) + Decimal::new(1, 2)
    );
}

#[tokio::test]
async fn history_upserts_are_idempotent_per_day() {
    let app = TestApp::spawn().await;

    let entries: Vec<esi::MarketHistoryEntry> = serde_json::from_value(serde_json::json!([
        {"date": "2025-10-14", "average": 99.5, "highest": 110.0, "lowest": 90.0, "order_count": 12, "volume": 3400},
        {"date": "2025-10-15", "average": 101.0, "highest": 112.0, "lowest": 95.0, "order_count": 9, "volume": 2100}
    ]))
    .unwrap();

    Price::upsert_history(34, REGION, &entries, &app.pool).await.unwrap();
    // Re-ingesting the same window updates in place.
    Price::upsert_history(34, REGION, &entries, &app.pool).await.unwrap();

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM prices WHERE type_id = 34")
        .fetch_one(&app.pool)
        .await
        .unwrap();
    assert_eq!(count, 2);

    let row = Price::find(34, REGION, day(2025, 10, 15), &app.pool)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.order_count, 9);
    assert_eq!(row.volume, 2100);
}
