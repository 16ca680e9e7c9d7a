//! Job model for background work.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Queue names. Each queue gets its own worker pool.
pub mod queues {
    /// Killmail fetch + ingest.
    pub const KILLMAILS: &str = "killmails";
    /// Character / corporation / alliance / type refresh.
    pub const ENTITIES: &str = "entities";
    /// Historical price fetches.
    pub const PRICES: &str = "prices";
    /// ISK value calculation.
    pub const VALUES: &str = "values";
    /// Downstream republish.
    pub const PUBLISH: &str = "publish";
    /// Entity-stats aggregation.
    pub const STATS: &str = "stats";

    pub const ALL: &[&str] = &[KILLMAILS, ENTITIES, PRICES, VALUES, PUBLISH, STATS];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub queue: String,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    /// Smaller means claimed first.
    pub priority: i16,
    /// Earliest instant the job may run.
    pub available_at: DateTime<Utc>,
    pub reserved_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub max_attempts: i32,
    pub stalled_count: i32,
    pub error: Option<String>,
    pub dedup_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Whether another attempt remains after a failure.
    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

/// Retry delay after the `attempts`-th failed try: 2 s base, factor 2,
/// capped at one hour.
pub fn retry_backoff(attempts: i32) -> Duration {
    let exponent = attempts.saturating_sub(1).clamp(0, 30) as u32;
    let secs = 2u64.saturating_mul(1 << exponent).min(3_600);
    Duration::from_secs(secs)
}
