//! Bulk historical import over the paged export API.
//!
//! Two modes: enqueue-only fetches `(upstream_id, hash)` reference pages,
//! dedups against the database, and enqueues fetch jobs; direct-insert
//! fetches full killmail bodies and hands them straight to the ingestor.
//! Paging is `(skip, limit)` and resumable: each completed page records a
//! progress row, so a crash resumes at `last_page + 1`.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use esi::{EsiError, ExportClient, ExportKillmail, ExportPage, KillmailRef};
use sqlx::PgPool;
use tracing::{info, warn};

use crate::domains::killmails::jobs::FetchKillmail;
use crate::domains::killmails::models::Killmail;
use crate::domains::killmails::{ingest_killmail, IngestOutcome};
use crate::kernel::ServerDeps;

/// Attempts per page; retry delays are 1, 2, 4, 8, 16 seconds.
const PAGE_ATTEMPTS: u32 = 5;

/// Source of export pages. The production implementation is the HTTP
/// export client; tests drive the controller with scripted pages.
#[async_trait]
pub trait ExportFeed: Send + Sync {
    async fn fetch_refs(
        &self,
        filter: &serde_json::Value,
        limit: i64,
        skip: i64,
    ) -> Result<ExportPage<KillmailRef>, EsiError>;

    async fn fetch_bodies(
        &self,
        filter: &serde_json::Value,
        limit: i64,
        skip: i64,
    ) -> Result<ExportPage<ExportKillmail>, EsiError>;
}

#[async_trait]
impl ExportFeed for ExportClient {
    async fn fetch_refs(
        &self,
        filter: &serde_json::Value,
        limit: i64,
        skip: i64,
    ) -> Result<ExportPage<KillmailRef>, EsiError> {
        self.fetch_page(filter, limit, skip).await
    }

    async fn fetch_bodies(
        &self,
        filter: &serde_json::Value,
        limit: i64,
        skip: i64,
    ) -> Result<ExportPage<ExportKillmail>, EsiError> {
        self.fetch_page(filter, limit, skip).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfillMode {
    /// Fetch reference lists, dedup, enqueue fetch jobs.
    Enqueue,
    /// Fetch full bodies and ingest inline. Serial.
    Direct,
}

#[derive(Debug, Clone)]
pub struct BackfillConfig {
    /// Progress rows are keyed by this name.
    pub name: String,
    pub mode: BackfillMode,
    /// Upstream filter, passed through verbatim.
    pub filter: serde_json::Value,
    pub batch_size: i64,
    /// Explicit start page, overriding the recorded resume point.
    pub start_page: Option<i64>,
    /// In-flight pages in enqueue mode.
    pub concurrency: usize,
}

impl BackfillConfig {
    pub fn new(name: impl Into<String>, mode: BackfillMode) -> Self {
        Self {
            name: name.into(),
            mode,
            filter: serde_json::json!({}),
            batch_size: 1_000,
            start_page: None,
            concurrency: 5,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BackfillReport {
    pub pages: u64,
    pub fetched: u64,
    pub enqueued: u64,
    pub inserted: u64,
    pub duplicates: u64,
    pub errors: u64,
}

/// Drive a backfill run to completion (or to a failed page).
pub async fn run_backfill(
    deps: &ServerDeps,
    feed: &dyn ExportFeed,
    config: &BackfillConfig,
) -> Result<BackfillReport> {
    let start_page = match config.start_page {
        Some(page) => page.max(1),
        None => last_completed_page(&config.name, &deps.db).await? + 1,
    };

    info!(
        name = %config.name,
        mode = ?config.mode,
        start_page,
        batch_size = config.batch_size,
        "backfill starting"
    );

    match config.mode {
        BackfillMode::Direct => run_direct(deps, feed, config, start_page).await,
        BackfillMode::Enqueue => run_enqueue(deps, feed, config, start_page).await,
    }
}

/// Serial full-body import. Each row is one ingest transaction, so this
/// mode never runs pages concurrently.
async fn run_direct(
    deps: &ServerDeps,
    feed: &dyn ExportFeed,
    config: &BackfillConfig,
    start_page: i64,
) -> Result<BackfillReport> {
    let mut report = BackfillReport::default();

    let mut page = start_page;
    loop {
        let fetched = fetch_bodies_with_retry(feed, config, skip_for(page, config))
            .await
            .with_context(|| resume_hint(config, page))?;

        if fetched.data.is_empty() {
            info!(page, "backfill received zero rows, stopping");
            break;
        }

        let row_count = fetched.data.len() as i64;
        for row in &fetched.data {
            report.fetched += 1;
            let hash = row.hash.as_deref().unwrap_or("");
            match ingest_killmail(deps, &row.killmail, hash).await {
                Ok(IngestOutcome::Inserted { .. }) => report.inserted += 1,
                Ok(IngestOutcome::Duplicate) => report.duplicates += 1,
                Err(e) => {
                    report.errors += 1;
                    warn!(upstream_id = row.killmail_id, error = %e, "backfill ingest failed");
                }
            }
        }

        report.pages += 1;
        record_page(&config.name, page, &deps.db).await?;
        info!(
            page,
            inserted = report.inserted,
            duplicates = report.duplicates,
            errors = report.errors,
            "backfill page complete"
        );

        if row_count < config.batch_size {
            info!(page, "all data fetched");
            break;
        }
        if !has_more(&fetched) {
            info!(page, "upstream reports no more data");
            break;
        }

        page += 1;
    }

    Ok(report)
}

/// Reference-list import with bounded page concurrency. Pages complete in
/// waves so the recorded resume point never skips an unfinished page.
async fn run_enqueue(
    deps: &ServerDeps,
    feed: &dyn ExportFeed,
    config: &BackfillConfig,
    start_page: i64,
) -> Result<BackfillReport> {
    let mut report = BackfillReport::default();
    let concurrency = config.concurrency.max(1) as i64;

    let mut wave_start = start_page;
    'waves: loop {
        let fetches = (0..concurrency).map(|offset| {
            let page = wave_start + offset;
            async move {
                let fetched =
                    fetch_refs_with_retry(feed, config, skip_for(page, config)).await?;
                Ok::<_, EsiError>((page, fetched))
            }
        });

        let wave = futures::future::try_join_all(fetches)
            .await
            .with_context(|| resume_hint(config, wave_start))?;

        for (page, fetched) in wave {
            if fetched.data.is_empty() {
                info!(page, "backfill received zero rows, stopping");
                break 'waves;
            }

            let row_count = fetched.data.len() as i64;
            report.fetched += fetched.data.len() as u64;

            let upstream_ids: Vec<i64> = fetched.data.iter().map(|r| r.killmail_id).collect();
            let existing = Killmail::existing_upstream_ids(&upstream_ids, &deps.db).await?;
            report.duplicates += existing.len() as u64;

            let payloads: Vec<FetchKillmail> = fetched
                .data
                .iter()
                .filter(|r| !existing.contains(&r.killmail_id))
                .map(|r| FetchKillmail {
                    killmail_id: r.killmail_id,
                    hash: r.hash.clone(),
                })
                .collect();
            report.enqueued += deps.jobs.dispatch_many(&payloads).await?;

            report.pages += 1;
            record_page(&config.name, page, &deps.db).await?;
            info!(
                page,
                enqueued = report.enqueued,
                duplicates = report.duplicates,
                "backfill page complete"
            );

            if row_count < config.batch_size {
                info!(page, "all data fetched");
                break 'waves;
            }
            if !has_more(&fetched) {
                info!(page, "upstream reports no more data");
                break 'waves;
            }
        }

        wave_start += concurrency;
    }

    Ok(report)
}

fn skip_for(page: i64, config: &BackfillConfig) -> i64 {
    (page - 1) * config.batch_size
}

fn has_more<T>(page: &ExportPage<T>) -> bool {
    page.pagination.as_ref().map(|p| p.has_more).unwrap_or(true)
}

fn resume_hint(config: &BackfillConfig, page: i64) -> String {
    format!(
        "backfill '{}' failed on page {page}; resume with --skip {page}",
        config.name
    )
}

/// Whether to keep retrying after `attempt` failures, and for how long to
/// sleep first.
fn retry_delay(attempt: u32, error: &EsiError) -> Option<Duration> {
    if error.is_retryable() && attempt < PAGE_ATTEMPTS {
        Some(Duration::from_secs(1 << (attempt - 1).min(4)))
    } else {
        None
    }
}

async fn fetch_refs_with_retry(
    feed: &dyn ExportFeed,
    config: &BackfillConfig,
    skip: i64,
) -> Result<ExportPage<KillmailRef>, EsiError> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match feed.fetch_refs(&config.filter, config.batch_size, skip).await {
            Ok(page) => return Ok(page),
            Err(e) => match retry_delay(attempt, &e) {
                Some(delay) => {
                    warn!(skip, attempt, delay_secs = delay.as_secs(), error = %e, "page fetch failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                None => return Err(e),
            },
        }
    }
}

async fn fetch_bodies_with_retry(
    feed: &dyn ExportFeed,
    config: &BackfillConfig,
    skip: i64,
) -> Result<ExportPage<ExportKillmail>, EsiError> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match feed.fetch_bodies(&config.filter, config.batch_size, skip).await {
            Ok(page) => return Ok(page),
            Err(e) => match retry_delay(attempt, &e) {
                Some(delay) => {
                    warn!(skip, attempt, delay_secs = delay.as_secs(), error = %e, "page fetch failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                None => return Err(e),
            },
        }
    }
}

/// Last page this named run completed; zero when the run is new.
pub async fn last_completed_page(name: &str, db: &PgPool) -> Result<i64> {
    let page: Option<i64> =
        sqlx::query_scalar("SELECT last_page FROM backfill_progress WHERE name = $1")
            .bind(name)
            .fetch_optional(db)
            .await?;
    Ok(page.unwrap_or(0))
}

/// Record a completed page; the resume point never moves backwards.
pub async fn record_page(name: &str, page: i64, db: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO backfill_progress (name, last_page, updated_at)
        VALUES ($1, $2, NOW())
        ON CONFLICT (name) DO UPDATE SET
            last_page = GREATEST(backfill_progress.last_page, EXCLUDED.last_page),
            updated_at = NOW()
        "#,
    )
    .bind(name)
    .bind(page)
    .execute(db)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_map_to_skip_offsets() {
        let config = BackfillConfig::new("test", BackfillMode::Enqueue);
        assert_eq!(skip_for(1, &config), 0);
        assert_eq!(skip_for(2, &config), 1_000);
        assert_eq!(skip_for(11, &config), 10_000);
    }

    #[test]
    fn missing_pagination_means_keep_going() {
        let page: ExportPage<KillmailRef> = ExportPage {
            data: vec![],
            pagination: None,
        };
        assert!(has_more(&page));
    }

    #[test]
    fn resume_hint_names_the_failed_page() {
        let config = BackfillConfig::new("october", BackfillMode::Direct);
        let hint = resume_hint(&config, 42);
        assert!(hint.contains("october"));
        assert!(hint.contains("--skip 42"));
    }

    #[test]
    fn retry_delays_double_and_stop_at_the_attempt_cap() {
        let transient = EsiError::Transient("503".into());
        assert_eq!(retry_delay(1, &transient), Some(Duration::from_secs(1)));
        assert_eq!(retry_delay(2, &transient), Some(Duration::from_secs(2)));
        assert_eq!(retry_delay(3, &transient), Some(Duration::from_secs(4)));
        assert_eq!(retry_delay(4, &transient), Some(Duration::from_secs(8)));
        assert_eq!(retry_delay(5, &transient), None);

        let fatal = EsiError::Fatal("401".into());
        assert_eq!(retry_delay(1, &fatal), None);
    }
}
