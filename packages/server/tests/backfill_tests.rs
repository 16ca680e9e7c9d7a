//! Backfill controller scenarios: paged import, per-page retry, and
//! crash-resume off the recorded progress row.

mod common;

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use common::TestApp;
use esi::{EsiError, ExportKillmail, ExportPage, KillmailRef, Pagination};
use killfeed_core::domains::backfill::controller::{last_completed_page, record_page};
use killfeed_core::domains::backfill::{
    run_backfill, BackfillConfig, BackfillMode, ExportFeed,
};

const BATCH: i64 = 10;

fn body(upstream_id: i64) -> ExportKillmail {
    serde_json::from_value(serde_json::json!({
        "killmail_id": upstream_id,
        "hash": format!("hash-{upstream_id}"),
        "killmail": {
            "killmail_id": upstream_id,
            "killmail_time": "2025-10-15T14:30:00Z",
            "solar_system_id": 30000142,
            "victim": {
                "character_id": 12345,
                "corporation_id": 67890,
                "ship_type_id": 587,
                "damage_taken": 100
            },
            "attackers": [{
                "character_id": 54321,
                "corporation_id": 11111,
                "damage_done": 100,
                "final_blow": true
            }]
        }
    }))
    .expect("export body must decode")
}

/// Scripted export feed: two pages of bodies (full batch, then a short
/// page), with optional per-skip failure injection.
struct ScriptedFeed {
    /// skip offset → (errors to serve first, rows)
    failures: Mutex<HashMap<i64, Vec<EsiError>>>,
}

impl ScriptedFeed {
    fn new() -> Self {
        Self {
            failures: Mutex::new(HashMap::new()),
        }
    }

    fn failing_at(self, skip: i64, errors: Vec<EsiError>) -> Self {
        self.failures.lock().unwrap().insert(skip, errors);
        self
    }

    fn take_failure(&self, skip: i64) -> Option<EsiError> {
        let mut failures = self.failures.lock().unwrap();
        failures.get_mut(&skip).and_then(|errors| {
            if errors.is_empty() {
                None
            } else {
                Some(errors.remove(0))
            }
        })
    }

    fn rows_for(skip: i64) -> (Vec<i64>, bool) {
        match skip {
            0 => ((1..=BATCH).collect(), true),
            10 => ((11..=15).collect(), false),
            _ => (Vec::new(), false),
        }
    }
}

#[async_trait]
impl ExportFeed for ScriptedFeed {
    async fn fetch_refs(
        &self,
        _filter: &serde_json::Value,
        _limit: i64,
        skip: i64,
    ) -> Result<ExportPage<KillmailRef>, EsiError> {
        if let Some(error) = self.take_failure(skip) {
            return Err(error);
        }
        let (ids, has_more) = Self::rows_for(skip);
        Ok(ExportPage {
            data: ids
                .into_iter()
                .map(|id| KillmailRef {
                    killmail_id: id,
                    hash: format!("hash-{id}"),
                })
                .collect(),
            pagination: Some(Pagination { has_more }),
        })
    }

    async fn fetch_bodies(
        &self,
        _filter: &serde_json::Value,
        _limit: i64,
        skip: i64,
    ) -> Result<ExportPage<ExportKillmail>, EsiError> {
        if let Some(error) = self.take_failure(skip) {
            return Err(error);
        }
        let (ids, has_more) = Self::rows_for(skip);
        Ok(ExportPage {
            data: ids.into_iter().map(body).collect(),
            pagination: Some(Pagination { has_more }),
        })
    }
}

fn direct_config(name: &str) -> BackfillConfig {
    BackfillConfig {
        batch_size: BATCH,
        ..BackfillConfig::new(name, BackfillMode::Direct)
    }
}

#[tokio::test]
async fn direct_import_runs_both_pages_to_completion() {
    let app = TestApp::spawn().await;
    let feed = ScriptedFeed::new();

    let report = run_backfill(&app.deps, &feed, &direct_config("full-run"))
        .await
        .unwrap();

    assert_eq!(report.pages, 2);
    assert_eq!(report.fetched, 15);
    assert_eq!(report.inserted, 15);
    assert_eq!(report.duplicates, 0);
    assert_eq!(report.errors, 0);

    let killmails: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM killmails")
        .fetch_one(&app.pool)
        .await
        .unwrap();
    assert_eq!(killmails, 15);
    assert_eq!(last_completed_page("full-run", &app.pool).await.unwrap(), 2);
}

#[tokio::test]
async fn crashed_run_resumes_at_the_recorded_page() {
    let app = TestApp::spawn().await;

    // First run dies on page 2 with a non-retryable error.
    let broken = ScriptedFeed::new().failing_at(10, vec![EsiError::Fatal("401".into())]);
    let error = run_backfill(&app.deps, &broken, &direct_config("resume-run"))
        .await
        .unwrap_err();
    assert!(error.to_string().contains("--skip 2"), "prints a resume command");

    assert_eq!(last_completed_page("resume-run", &app.pool).await.unwrap(), 1);
    let killmails: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM killmails")
        .fetch_one(&app.pool)
        .await
        .unwrap();
    assert_eq!(killmails, 10, "page one landed before the crash");

    // Restart with no explicit start page: picks up at page 2.
    let healthy = ScriptedFeed::new();
    let report = run_backfill(&app.deps, &healthy, &direct_config("resume-run"))
        .await
        .unwrap();

    assert_eq!(report.pages, 1);
    assert_eq!(report.inserted, 5);
    let killmails: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM killmails")
        .fetch_one(&app.pool)
        .await
        .unwrap();
    assert_eq!(killmails, 15, "pipeline terminates with every row present");
}

#[tokio::test]
async fn transient_page_errors_are_retried() {
    let app = TestApp::spawn().await;

    let flaky = ScriptedFeed::new().failing_at(
        0,
        vec![
            EsiError::Transient("503".into()),
            EsiError::Transient("connection reset".into()),
        ],
    );

    let report = run_backfill(&app.deps, &flaky, &direct_config("flaky-run"))
        .await
        .unwrap();
    assert_eq!(report.inserted, 15, "run completes despite two transient failures");
}

#[tokio::test]
async fn enqueue_mode_dedups_against_the_database_and_queue() {
    let app = TestApp::spawn().await;

    // Killmail 3 is already persisted; its reference must not re-enqueue.
    killfeed_core::domains::killmails::ingest_killmail(&app.deps, &body(3).killmail, "hash-3")
        .await
        .unwrap();
    let fetch_jobs_before = app.job_count("killmails", Some("fetch_killmail")).await;

    let feed = ScriptedFeed::new();
    let config = BackfillConfig {
        batch_size: BATCH,
        concurrency: 2,
        ..BackfillConfig::new("enqueue-run", BackfillMode::Enqueue)
    };
    let report = run_backfill(&app.deps, &feed, &config).await.unwrap();

    assert_eq!(report.pages, 2);
    assert_eq!(report.fetched, 15);
    assert_eq!(report.duplicates, 1);
    assert_eq!(report.enqueued, 14);
    assert_eq!(
        app.job_count("killmails", Some("fetch_killmail")).await,
        fetch_jobs_before + 14
    );
}

#[tokio::test]
async fn progress_rows_never_move_backwards() {
    let app = TestApp::spawn().await;

    assert_eq!(last_completed_page("fresh", &app.pool).await.unwrap(), 0);

    record_page("fresh", 5, &app.pool).await.unwrap();
    record_page("fresh", 3, &app.pool).await.unwrap();
    assert_eq!(last_completed_page("fresh", &app.pool).await.unwrap(), 5);
}
