//! Environment-driven configuration.
//!
//! Missing required values are a fatal startup error; the binaries exit
//! non-zero. Everything else falls back to a sensible default.

use std::collections::HashSet;

use anyhow::{Context, Result};

/// Default primary upstream.
const DEFAULT_ESI_BASE_URL: &str = "https://esi.evetech.net/latest";

/// Sent as the compatibility-date header on every upstream request.
const DEFAULT_COMPATIBILITY_DATE: &str = "2025-07-01";

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub nats_url: Option<String>,
    pub esi_base_url: String,
    pub compatibility_date: String,
    /// Long-poll feed delivering full killmail bodies.
    pub redisq_url: Option<String>,
    /// Streaming feed delivering kill references.
    pub stream_url: Option<String>,
    /// Paged historical export API.
    pub export_base_url: Option<String>,
    pub followed: FollowedIds,
    pub workers: WorkerTuning,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let database_url =
            std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

        Ok(Self {
            database_url,
            nats_url: optional("NATS_URL"),
            esi_base_url: optional("ESI_BASE_URL")
                .unwrap_or_else(|| DEFAULT_ESI_BASE_URL.to_string()),
            compatibility_date: optional("COMPATIBILITY_DATE")
                .unwrap_or_else(|| DEFAULT_COMPATIBILITY_DATE.to_string()),
            redisq_url: optional("REDISQ_URL"),
            stream_url: optional("STREAM_URL"),
            export_base_url: optional("EXPORT_BASE_URL"),
            followed: FollowedIds {
                characters: id_list("FOLLOWED_CHARACTERS"),
                corporations: id_list("FOLLOWED_CORPORATIONS"),
                alliances: id_list("FOLLOWED_ALLIANCES"),
            },
            workers: WorkerTuning::from_env(),
        })
    }
}

/// Entity ids the realtime listener filters on. Empty sets pass everything
/// through.
#[derive(Debug, Clone, Default)]
pub struct FollowedIds {
    pub characters: HashSet<i64>,
    pub corporations: HashSet<i64>,
    pub alliances: HashSet<i64>,
}

impl FollowedIds {
    pub fn is_empty(&self) -> bool {
        self.characters.is_empty() && self.corporations.is_empty() && self.alliances.is_empty()
    }

    /// A killmail matches when the victim or any attacker intersects the
    /// followed sets.
    pub fn matches(&self, killmail: &esi::EsiKillmail) -> bool {
        if self.is_empty() {
            return true;
        }

        let victim = &killmail.victim;
        if self.contains(victim.character_id, Some(victim.corporation_id), victim.alliance_id) {
            return true;
        }

        killmail
            .attackers
            .iter()
            .any(|a| self.contains(a.character_id, a.corporation_id, a.alliance_id))
    }

    fn contains(
        &self,
        character_id: Option<i64>,
        corporation_id: Option<i64>,
        alliance_id: Option<i64>,
    ) -> bool {
        character_id.is_some_and(|id| self.characters.contains(&id))
            || corporation_id.is_some_and(|id| self.corporations.contains(&id))
            || alliance_id.is_some_and(|id| self.alliances.contains(&id))
    }
}

/// Per-queue worker counts. Tuned together with the upstream error budget:
/// every entity/price worker shares the same limiter.
#[derive(Debug, Clone)]
pub struct WorkerTuning {
    pub killmail_workers: usize,
    pub entity_workers: usize,
    pub price_workers: usize,
    pub value_workers: usize,
    pub publish_workers: usize,
    pub stats_workers: usize,
}

impl Default for WorkerTuning {
    fn default() -> Self {
        Self {
            killmail_workers: 4,
            entity_workers: 4,
            price_workers: 2,
            value_workers: 2,
            publish_workers: 2,
            stats_workers: 2,
        }
    }
}

impl WorkerTuning {
    fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            killmail_workers: count("KILLMAIL_WORKERS", defaults.killmail_workers),
            entity_workers: count("ENTITY_WORKERS", defaults.entity_workers),
            price_workers: count("PRICE_WORKERS", defaults.price_workers),
            value_workers: count("VALUE_WORKERS", defaults.value_workers),
            publish_workers: count("PUBLISH_WORKERS", defaults.publish_workers),
            stats_workers: count("STATS_WORKERS", defaults.stats_workers),
        }
    }
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn count(name: &str, default: usize) -> usize {
    optional(name)
        .and_then(|v| v.parse().ok())
        .filter(|&n| n > 0)
        .unwrap_or(default)
}

/// Parse a comma-separated id list, ignoring anything unparseable.
fn id_list(name: &str) -> HashSet<i64> {
    optional(name)
        .map(|raw| {
            raw.split(',')
                .filter_map(|part| part.trim().parse().ok())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn killmail(
        victim_alliance: Option<i64>,
        attacker_characters: &[Option<i64>],
    ) -> esi::EsiKillmail {
        serde_json::from_value(serde_json::json!({
            "killmail_id": 1,
            "killmail_time": "2025-10-15T14:30:00Z",
            "solar_system_id": 30000142,
            "victim": {
                "corporation_id": 1000,
                "alliance_id": victim_alliance,
                "ship_type_id": 587,
                "damage_taken": 1
            },
            "attackers": attacker_characters
                .iter()
                .map(|c| serde_json::json!({"character_id": c, "damage_done": 1, "final_blow": true}))
                .collect::<Vec<_>>()
        }))
        .unwrap()
    }

    #[test]
    fn empty_followed_set_passes_everything() {
        let followed = FollowedIds::default();
        assert!(followed.matches(&killmail(None, &[Some(42)])));
    }

    #[test]
    fn followed_attacker_matches() {
        let followed = FollowedIds {
            characters: [42].into_iter().collect(),
            ..Default::default()
        };
        assert!(followed.matches(&killmail(None, &[Some(7), Some(42)])));
        assert!(!followed.matches(&killmail(None, &[Some(7)])));
    }

    #[test]
    fn followed_victim_alliance_matches() {
        let followed = FollowedIds {
            alliances: [99005443].into_iter().collect(),
            ..Default::default()
        };
        assert!(followed.matches(&killmail(Some(99005443), &[Some(7)])));
        assert!(!followed.matches(&killmail(Some(1), &[Some(7)])));
    }
}
