//! Worker runtime end-to-end: claim, execute, retry, and permanent
//! failure classification against a live queue.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::TestApp;
use killfeed_core::kernel::jobs::{
    JobPayload, JobRegistry, JobStatus, QueueWorkerConfig, WorkerPool,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

static FLAKY_CALLS: AtomicU32 = AtomicU32::new(0);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FlakyJob {
    marker: i64,
}

impl JobPayload for FlakyJob {
    const QUEUE: &'static str = "flaky";
    const JOB_TYPE: &'static str = "flaky_job";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UnhandledJob {
    marker: i64,
}

impl JobPayload for UnhandledJob {
    const QUEUE: &'static str = "flaky";
    const JOB_TYPE: &'static str = "unhandled_job";
}

async fn wait_for_status(
    app: &TestApp,
    job_id: i64,
    wanted: JobStatus,
    timeout: Duration,
) -> (JobStatus, i32, Option<String>) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let (status, attempts, error): (JobStatus, i32, Option<String>) =
            sqlx::query_as("SELECT status, attempts, error FROM jobs WHERE id = $1")
                .bind(job_id)
                .fetch_one(&app.pool)
                .await
                .unwrap();
        if status == wanted || tokio::time::Instant::now() >= deadline {
            return (status, attempts, error);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
async fn transient_failure_retries_then_completes() {
    let app = TestApp::spawn().await;
    FLAKY_CALLS.store(0, Ordering::SeqCst);

    let mut registry = JobRegistry::new();
    registry.register::<FlakyJob, _, _>(|_job, _deps| async move {
        if FLAKY_CALLS.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(anyhow::Error::new(esi::EsiError::Transient(
                "upstream returned 503".into(),
            )))
        } else {
            Ok(())
        }
    });

    let mut config = QueueWorkerConfig::new("flaky", 2);
    config.poll_interval = Duration::from_millis(100);
    let shutdown = CancellationToken::new();
    let pool = WorkerPool::new(
        config,
        app.jobs.clone(),
        Arc::new(registry),
        app.deps.clone(),
    );
    let worker = tokio::spawn(pool.run(shutdown.clone()));

    let job_id = app
        .jobs
        .dispatch(&FlakyJob { marker: 1 })
        .await
        .unwrap()
        .expect("job must enqueue");

    // First attempt fails, backs off two seconds, second succeeds.
    let (status, attempts, error) =
        wait_for_status(&app, job_id, JobStatus::Completed, Duration::from_secs(20)).await;
    assert_eq!(status, JobStatus::Completed);
    assert_eq!(attempts, 2);
    assert!(error.is_none(), "error clears on success");
    assert_eq!(FLAKY_CALLS.load(Ordering::SeqCst), 2);

    shutdown.cancel();
    worker.await.unwrap().unwrap();
}

#[tokio::test]
async fn unknown_job_types_fail_permanently() {
    let app = TestApp::spawn().await;

    let mut registry = JobRegistry::new();
    registry.register::<FlakyJob, _, _>(|_job, _deps| async move { Ok(()) });

    let mut config = QueueWorkerConfig::new("flaky", 1);
    config.poll_interval = Duration::from_millis(100);
    let shutdown = CancellationToken::new();
    let pool = WorkerPool::new(
        config,
        app.jobs.clone(),
        Arc::new(registry),
        app.deps.clone(),
    );
    let worker = tokio::spawn(pool.run(shutdown.clone()));

    let job_id = app
        .jobs
        .dispatch(&UnhandledJob { marker: 1 })
        .await
        .unwrap()
        .expect("job must enqueue");

    // No retries: one attempt, straight to failed.
    let (status, attempts, error) =
        wait_for_status(&app, job_id, JobStatus::Failed, Duration::from_secs(10)).await;
    assert_eq!(status, JobStatus::Failed);
    assert_eq!(attempts, 1);
    assert!(error.unwrap().contains("unknown job type"));

    shutdown.cancel();
    worker.await.unwrap().unwrap();
}
