//! Postgres-backed response cache for the upstream client.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use esi::{CacheEntry, ResponseCache};
use sqlx::{FromRow, PgPool};
use tracing::info;

#[derive(FromRow)]
struct CacheRow {
    etag: Option<String>,
    expires_at: Option<DateTime<Utc>>,
    last_modified: Option<String>,
    body: serde_json::Value,
}

#[derive(Clone)]
pub struct PgResponseCache {
    db: PgPool,
}

impl PgResponseCache {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ResponseCache for PgResponseCache {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let row = sqlx::query_as::<_, CacheRow>(
            "SELECT etag, expires_at, last_modified, body FROM esi_cache WHERE cache_key = $1",
        )
        .bind(key)
        .fetch_optional(&self.db)
        .await?;

        Ok(row.map(|row| CacheEntry {
            etag: row.etag,
            expires_at: row.expires_at,
            last_modified: row.last_modified,
            body: row.body,
        }))
    }

    async fn put(&self, key: &str, entry: CacheEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO esi_cache (cache_key, etag, expires_at, last_modified, body, updated_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (cache_key) DO UPDATE SET
                etag = EXCLUDED.etag,
                expires_at = EXCLUDED.expires_at,
                last_modified = EXCLUDED.last_modified,
                body = EXCLUDED.body,
                updated_at = NOW()
            "#,
        )
        .bind(key)
        .bind(&entry.etag)
        .bind(entry.expires_at)
        .bind(&entry.last_modified)
        .bind(&entry.body)
        .execute(&self.db)
        .await?;

        Ok(())
    }
}

/// Delete entries that expired before now. Driven by the scheduler.
pub async fn sweep_expired(db: &PgPool) -> Result<u64> {
    let deleted = sqlx::query("DELETE FROM esi_cache WHERE expires_at IS NOT NULL AND expires_at < NOW()")
        .execute(db)
        .await?
        .rows_affected();

    if deleted > 0 {
        info!(deleted, "swept expired cache entries");
    }
    Ok(deleted)
}
