//! Serde models for every upstream payload the pipeline consumes.
//!
//! Kept deliberately loose where the feeds are loose: realtime frames and
//! export rows tolerate missing fields so that one malformed message does
//! not wedge a stream.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Entities
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct Character {
    pub name: String,
    pub corporation_id: i64,
    #[serde(default)]
    pub alliance_id: Option<i64>,
    #[serde(default)]
    pub faction_id: Option<i64>,
    #[serde(default)]
    pub security_status: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Corporation {
    pub name: String,
    pub ticker: String,
    #[serde(default)]
    pub alliance_id: Option<i64>,
    #[serde(default)]
    pub faction_id: Option<i64>,
    #[serde(default)]
    pub ceo_id: Option<i64>,
    #[serde(default)]
    pub member_count: Option<i32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Alliance {
    pub name: String,
    pub ticker: String,
    #[serde(default)]
    pub executor_corporation_id: Option<i64>,
    #[serde(default)]
    pub faction_id: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UniverseType {
    pub name: String,
    pub group_id: i64,
    #[serde(default)]
    pub published: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UniverseGroup {
    pub name: String,
    pub category_id: i64,
}

// ============================================================================
// Market history
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct MarketHistoryEntry {
    pub date: NaiveDate,
    pub average: f64,
    pub highest: f64,
    pub lowest: f64,
    pub order_count: i64,
    pub volume: i64,
}

// ============================================================================
// Killmails
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EsiKillmail {
    pub killmail_id: i64,
    pub killmail_time: DateTime<Utc>,
    pub solar_system_id: i64,
    pub victim: EsiVictim,
    pub attackers: Vec<EsiAttacker>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub war_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EsiVictim {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character_id: Option<i64>,
    pub corporation_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alliance_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub faction_id: Option<i64>,
    pub ship_type_id: i64,
    pub damage_taken: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<EsiItem>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EsiAttacker {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corporation_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alliance_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub faction_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ship_type_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weapon_type_id: Option<i64>,
    #[serde(default)]
    pub damage_done: i64,
    #[serde(default)]
    pub final_blow: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EsiItem {
    pub item_type_id: i64,
    pub flag: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity_dropped: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity_destroyed: Option<i64>,
    #[serde(default)]
    pub singleton: i32,
    /// Container contents, one level of nesting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<EsiItem>>,
}

// ============================================================================
// Realtime feeds
// ============================================================================

/// zkb-style metadata envelope attached to stream and poll messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZkbMeta {
    pub hash: String,
    #[serde(default, rename = "totalValue")]
    pub total_value: Option<f64>,
    #[serde(default)]
    pub npc: Option<bool>,
    #[serde(default)]
    pub solo: Option<bool>,
}

/// Response of the long-poll endpoint: `package` is null when no kill is
/// waiting.
#[derive(Debug, Clone, Deserialize)]
pub struct RedisqResponse {
    pub package: Option<RedisqPackage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisqPackage {
    #[serde(rename = "killID")]
    pub kill_id: i64,
    pub zkb: ZkbMeta,
    pub killmail: EsiKillmail,
}

/// One frame off the streaming endpoint. Frames without a killmail id
/// (heartbeats, acks) decode with everything unset and are skipped.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamFrame {
    #[serde(default, rename = "type")]
    pub frame_type: Option<String>,
    #[serde(default)]
    pub killmail_id: Option<i64>,
    #[serde(default)]
    pub zkb: Option<ZkbMeta>,
    #[serde(default)]
    pub killmail: Option<EsiKillmail>,
}

// ============================================================================
// Historical export
// ============================================================================

/// One page of the POST export endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ExportPage<T> {
    pub data: Vec<T>,
    #[serde(default)]
    pub pagination: Option<Pagination>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Pagination {
    #[serde(rename = "hasMore")]
    pub has_more: bool,
}

/// Reference row used by the enqueue-only backfill mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillmailRef {
    pub killmail_id: i64,
    pub hash: String,
}

/// Full-body row used by the direct-insert backfill mode.
#[derive(Debug, Clone, Deserialize)]
pub struct ExportKillmail {
    pub killmail_id: i64,
    #[serde(default)]
    pub hash: Option<String>,
    pub killmail: EsiKillmail,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn killmail_decodes_with_nested_items() {
        let json = serde_json::json!({
            "killmail_id": 123456789_i64,
            "killmail_time": "2025-10-15T14:30:00Z",
            "solar_system_id": 30000142,
            "victim": {
                "corporation_id": 67890,
                "character_id": 12345,
                "ship_type_id": 587,
                "damage_taken": 15000,
                "items": [
                    {"item_type_id": 3520, "flag": 5, "quantity_dropped": 2, "singleton": 0,
                     "items": [{"item_type_id": 34, "flag": 0, "quantity_destroyed": 100, "singleton": 0}]}
                ]
            },
            "attackers": [
                {"character_id": 54321, "corporation_id": 11111, "ship_type_id": 597,
                 "weapon_type_id": 2488, "damage_done": 15000, "final_blow": true}
            ]
        });

        let km: EsiKillmail = serde_json::from_value(json).unwrap();
        assert_eq!(km.killmail_id, 123456789);
        assert_eq!(km.attackers.len(), 1);
        assert!(km.attackers[0].final_blow);

        let items = km.victim.items.as_ref().unwrap();
        let nested = items[0].items.as_ref().unwrap();
        assert_eq!(nested[0].quantity_destroyed, Some(100));
    }

    #[test]
    fn redisq_empty_package_decodes_to_none() {
        let resp: RedisqResponse = serde_json::from_str(r#"{"package": null}"#).unwrap();
        assert!(resp.package.is_none());
    }

    #[test]
    fn stream_heartbeat_frame_is_tolerated() {
        let frame: StreamFrame = serde_json::from_str(r#"{"type": "pong"}"#).unwrap();
        assert_eq!(frame.frame_type.as_deref(), Some("pong"));
        assert!(frame.killmail_id.is_none());
    }

    #[test]
    fn export_page_reads_has_more() {
        let json = r#"{"data": [{"killmail_id": 1, "hash": "h"}], "pagination": {"hasMore": true}}"#;
        let page: ExportPage<KillmailRef> = serde_json::from_str(json).unwrap();
        assert_eq!(page.data.len(), 1);
        assert!(page.pagination.unwrap().has_more);
    }
}
