//! Entity-stats aggregation: additive upserts, side assignment, and age
//! buckets.

mod common;

use chrono::{Duration, Utc};
use common::TestApp;
use killfeed_core::domains::entities::stats::{
    apply_killmail_stats, EntityKind, EntityRef, KillmailAggregates,
};
use rust_decimal::Decimal;
use sqlx::FromRow;

#[derive(FromRow, Debug)]
struct StatsRow {
    kills_all: i64,
    kills_90d: i64,
    kills_30d: i64,
    kills_14d: i64,
    losses_all: i64,
    isk_destroyed_all: Decimal,
    isk_lost_all: Decimal,
    solo_kills: i64,
    npc_losses: i64,
}

async fn stats_row(app: &TestApp, entity_id: i64, kind: EntityKind) -> Option<StatsRow> {
    sqlx::query_as(
        r#"
        SELECT kills_all, kills_90d, kills_30d, kills_14d, losses_all,
               isk_destroyed_all, isk_lost_all, solo_kills, npc_losses
        FROM entity_stats
        WHERE entity_id = $1 AND entity_kind = $2
        "#,
    )
    .bind(entity_id)
    .bind(kind)
    .fetch_optional(&app.pool)
    .await
    .unwrap()
}

#[tokio::test]
async fn kills_and_losses_land_on_the_right_side() {
    let app = TestApp::spawn().await;

    let aggregates = KillmailAggregates {
        kill_time: Utc::now() - Duration::days(1),
        total_value: Decimal::from(1_000_000),
        is_solo: true,
        is_npc: false,
    };
    let victim = vec![EntityRef::new(12345, EntityKind::Character)];
    let attackers = vec![EntityRef::new(54321, EntityKind::Character)];

    apply_killmail_stats(&app.pool, &victim, &attackers, &aggregates)
        .await
        .unwrap();

    let killer = stats_row(&app, 54321, EntityKind::Character).await.unwrap();
    assert_eq!(killer.kills_all, 1);
    assert_eq!(killer.kills_14d, 1);
    assert_eq!(killer.losses_all, 0);
    assert_eq!(killer.isk_destroyed_all, Decimal::from(1_000_000));
    assert_eq!(killer.isk_lost_all, Decimal::ZERO);
    assert_eq!(killer.solo_kills, 1);

    let loser = stats_row(&app, 12345, EntityKind::Character).await.unwrap();
    assert_eq!(loser.losses_all, 1);
    assert_eq!(loser.kills_all, 0);
    assert_eq!(loser.isk_lost_all, Decimal::from(1_000_000));
    assert_eq!(loser.npc_losses, 0);
}

#[tokio::test]
async fn repeated_killmails_accumulate_deltas() {
    let app = TestApp::spawn().await;

    let attackers = vec![EntityRef::new(54321, EntityKind::Character)];
    for value in [100, 200, 300] {
        let aggregates = KillmailAggregates {
            kill_time: Utc::now() - Duration::days(1),
            total_value: Decimal::from(value),
            is_solo: false,
            is_npc: false,
        };
        apply_killmail_stats(&app.pool, &[], &attackers, &aggregates)
            .await
            .unwrap();
    }

    let row = stats_row(&app, 54321, EntityKind::Character).await.unwrap();
    assert_eq!(row.kills_all, 3);
    assert_eq!(row.isk_destroyed_all, Decimal::from(600));
}

#[tokio::test]
async fn old_killmails_only_hit_the_wide_buckets() {
    let app = TestApp::spawn().await;

    let aggregates = KillmailAggregates {
        kill_time: Utc::now() - Duration::days(45),
        total_value: Decimal::from(500),
        is_solo: false,
        is_npc: false,
    };
    let attackers = vec![EntityRef::new(77, EntityKind::Corporation)];

    apply_killmail_stats(&app.pool, &[], &attackers, &aggregates)
        .await
        .unwrap();

    let row = stats_row(&app, 77, EntityKind::Corporation).await.unwrap();
    assert_eq!(row.kills_all, 1);
    assert_eq!(row.kills_90d, 1);
    assert_eq!(row.kills_30d, 0);
    assert_eq!(row.kills_14d, 0);
}

#[tokio::test]
async fn npc_losses_count_on_the_victim_side() {
    let app = TestApp::spawn().await;

    let aggregates = KillmailAggregates {
        kill_time: Utc::now(),
        total_value: Decimal::from(42),
        is_solo: false,
        is_npc: true,
    };
    let victim = vec![EntityRef::new(12345, EntityKind::Character)];

    apply_killmail_stats(&app.pool, &victim, &[], &aggregates)
        .await
        .unwrap();

    let row = stats_row(&app, 12345, EntityKind::Character).await.unwrap();
    assert_eq!(row.npc_losses, 1);
    assert_eq!(row.losses_all, 1);
}

#[tokio::test]
async fn last_kill_time_only_moves_forward() {
    let app = TestApp::spawn().await;

    let attackers = vec![EntityRef::new(9, EntityKind::Alliance)];
    let newer = Utc::now() - Duration::days(1);
    let older = Utc::now() - Duration::days(10);

    for kill_time in [newer, older] {
        let aggregates = KillmailAggregates {
            kill_time,
            total_value: Decimal::ZERO,
            is_solo: false,
            is_npc: false,
        };
        apply_killmail_stats(&app.pool, &[], &attackers, &aggregates)
            .await
            .unwrap();
    }

    let last_kill: chrono::DateTime<Utc> = sqlx::query_scalar(
        "SELECT last_kill_time FROM entity_stats WHERE entity_id = 9 AND entity_kind = 'alliance'",
    )
    .fetch_one(&app.pool)
    .await
    .unwrap();
    // Postgres stores microseconds; compare with a millisecond tolerance.
    assert!((last_kill - newer).num_milliseconds().abs() < 1);
}
