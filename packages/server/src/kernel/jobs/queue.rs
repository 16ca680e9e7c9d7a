//! PostgreSQL-backed job queue.
//!
//! The jobs table is the serialisation point for all background work.
//! Enqueue collapses duplicate live payloads through a partial unique
//! index on `dedup_key`; reservation is a `FOR UPDATE SKIP LOCKED`
//! locking select so two workers never claim the same row; failures
//! re-queue with exponential backoff until `max_attempts`, then park in
//! `failed` for operator inspection.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tracing::info;

use super::job::{retry_backoff, Job, JobStatus};
use super::payload::{dedup_key, JobPayload};

const JOB_COLUMNS: &str = "id, queue, job_type, payload, status, priority, available_at, \
                           reserved_at, processed_at, attempts, max_attempts, stalled_count, \
                           error, dedup_key, created_at";

/// Matches the `jobs_dedup_live_idx` partial index.
const DEDUP_CONFLICT: &str =
    "ON CONFLICT (dedup_key) WHERE dedup_key IS NOT NULL AND processed_at IS NULL DO NOTHING";

#[derive(Debug, Clone, Copy)]
pub struct DispatchOptions {
    pub priority: i16,
    pub delay: Duration,
    pub max_attempts: i32,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            delay: Duration::ZERO,
            max_attempts: 3,
        }
    }
}

/// Per-status counts for one queue (or all queues combined).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

impl QueueStats {
    /// Jobs that are waiting or currently running.
    pub fn waiting_or_active(&self) -> i64 {
        self.pending + self.processing
    }
}

/// Result of one stall-reaper sweep.
#[derive(Debug, Clone, Copy, Default)]
pub struct StallSweep {
    /// Reservations released back to pending.
    pub released: u64,
    /// Jobs that stalled too often and were failed.
    pub failed: u64,
}

#[derive(Clone)]
pub struct JobQueue {
    db: PgPool,
}

impl JobQueue {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &PgPool {
        &self.db
    }

    /// Enqueue one job. Returns the new job id, or `None` when a live job
    /// with the same dedup key already exists.
    pub async fn dispatch<P: JobPayload>(&self, payload: &P) -> Result<Option<i64>> {
        self.dispatch_with(
            payload,
            DispatchOptions {
                priority: payload.priority(),
                max_attempts: payload.max_attempts(),
                ..Default::default()
            },
        )
        .await
    }

    /// Enqueue one job with explicit options (priority, delay, retries).
    pub async fn dispatch_with<P: JobPayload>(
        &self,
        payload: &P,
        options: DispatchOptions,
    ) -> Result<Option<i64>> {
        let key = if payload.dedup() {
            Some(dedup_key(payload)?)
        } else {
            None
        };
        let body = serde_json::to_value(payload).context("failed to serialise job payload")?;

        let id: Option<i64> = sqlx::query_scalar(&format!(
            r#"
            INSERT INTO jobs (queue, job_type, payload, priority, available_at, max_attempts, dedup_key)
            VALUES ($1, $2, $3, $4, NOW() + ($5 || ' milliseconds')::INTERVAL, $6, $7)
            {DEDUP_CONFLICT}
            RETURNING id
            "#,
        ))
        .bind(P::QUEUE)
        .bind(P::JOB_TYPE)
        .bind(&body)
        .bind(options.priority)
        .bind((options.delay.as_millis() as i64).to_string())
        .bind(options.max_attempts)
        .bind(&key)
        .fetch_optional(&self.db)
        .await?;

        Ok(id)
    }

    /// Atomic bulk enqueue, chunked under the parameter limit. Returns the
    /// number of jobs actually created (duplicates collapse silently).
    pub async fn dispatch_many<P: JobPayload>(&self, payloads: &[P]) -> Result<u64> {
        self.dispatch_many_with(payloads, DispatchOptions::default())
            .await
    }

    pub async fn dispatch_many_with<P: JobPayload>(
        &self,
        payloads: &[P],
        options: DispatchOptions,
    ) -> Result<u64> {
        if payloads.is_empty() {
            return Ok(0);
        }

        struct Row {
            payload: serde_json::Value,
            priority: i16,
            max_attempts: i32,
            dedup_key: Option<String>,
        }

        let available_at = chrono::Utc::now()
            + chrono::Duration::from_std(options.delay).unwrap_or_else(|_| chrono::Duration::zero());

        let mut rows = Vec::with_capacity(payloads.len());
        for payload in payloads {
            rows.push(Row {
                payload: serde_json::to_value(payload)?,
                priority: payload.priority(),
                max_attempts: payload.max_attempts(),
                dedup_key: if payload.dedup() {
                    Some(dedup_key(payload)?)
                } else {
                    None
                },
            });
        }

        // 7 columns per row keeps chunks safely in the low thousands.
        let chunk_size = crate::common::batch::rows_per_chunk(7).min(5_000);
        let mut tx = self.db.begin().await?;
        let mut created = 0u64;

        for chunk in rows.chunks(chunk_size) {
            let mut builder: sqlx::QueryBuilder<sqlx::Postgres> = sqlx::QueryBuilder::new(
                "INSERT INTO jobs (queue, job_type, payload, priority, available_at, max_attempts, dedup_key) ",
            );
            builder.push_values(chunk, |mut b, row| {
                b.push_bind(P::QUEUE)
                    .push_bind(P::JOB_TYPE)
                    .push_bind(&row.payload)
                    .push_bind(row.priority)
                    .push_bind(available_at)
                    .push_bind(row.max_attempts)
                    .push_bind(&row.dedup_key);
            });
            builder.push(" ");
            builder.push(DEDUP_CONFLICT);
            created += builder.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;
        Ok(created)
    }

    /// Atomically claim the next eligible job on `queue`.
    ///
    /// Claim order is `(priority ASC, available_at ASC, id ASC)`. The
    /// locking select serialises against other workers; the update bumps
    /// `attempts` and stamps the reservation.
    pub async fn reserve(&self, queue: &str) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(&format!(
            r#"
            WITH next_job AS (
                SELECT id
                FROM jobs
                WHERE queue = $1
                  AND status = 'pending'
                  AND available_at <= NOW()
                ORDER BY priority ASC, available_at ASC, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET status = 'processing',
                reserved_at = NOW(),
                attempts = attempts + 1
            WHERE id IN (SELECT id FROM next_job)
            RETURNING {JOB_COLUMNS}
            "#,
        ))
        .bind(queue)
        .fetch_optional(&self.db)
        .await?;

        Ok(job)
    }

    /// Mark a job successfully processed. Clears any error from earlier
    /// attempts.
    pub async fn complete(&self, job_id: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed',
                processed_at = NOW(),
                error = NULL
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    /// Record a handler failure. Retryable failures with attempts left go
    /// back to pending with exponential backoff; everything else parks in
    /// `failed`.
    pub async fn fail(&self, job: &Job, error: &str, retryable: bool) -> Result<()> {
        if retryable && job.can_retry() {
            let backoff = retry_backoff(job.attempts);
            sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'pending',
                    available_at = NOW() + ($2 || ' milliseconds')::INTERVAL,
                    reserved_at = NULL,
                    error = $3
                WHERE id = $1
                "#,
            )
            .bind(job.id)
            .bind((backoff.as_millis() as i64).to_string())
            .bind(error)
            .execute(&self.db)
            .await?;
        } else {
            sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'failed',
                    processed_at = NOW(),
                    error = $2
                WHERE id = $1
                "#,
            )
            .bind(job.id)
            .bind(error)
            .execute(&self.db)
            .await?;
        }

        Ok(())
    }

    /// Reap abandoned reservations on `queue`: processing rows whose
    /// reservation is older than `lock_duration` go back to pending, up to
    /// `max_stalled` times each, after which they fail.
    pub async fn release_stalled(
        &self,
        queue: &str,
        lock_duration: Duration,
        max_stalled: i32,
    ) -> Result<StallSweep> {
        let lock_ms = (lock_duration.as_millis() as i64).to_string();

        let failed = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed',
                processed_at = NOW(),
                error = 'job stalled too many times'
            WHERE queue = $1
              AND status = 'processing'
              AND reserved_at < NOW() - ($2 || ' milliseconds')::INTERVAL
              AND stalled_count >= $3
            "#,
        )
        .bind(queue)
        .bind(&lock_ms)
        .bind(max_stalled)
        .execute(&self.db)
        .await?
        .rows_affected();

        let released = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                reserved_at = NULL,
                stalled_count = stalled_count + 1
            WHERE queue = $1
              AND status = 'processing'
              AND reserved_at < NOW() - ($2 || ' milliseconds')::INTERVAL
              AND stalled_count < $3
            "#,
        )
        .bind(queue)
        .bind(&lock_ms)
        .bind(max_stalled)
        .execute(&self.db)
        .await?
        .rows_affected();

        if released > 0 || failed > 0 {
            info!(queue, released, failed, "stall sweep recovered jobs");
        }

        Ok(StallSweep { released, failed })
    }

    /// Per-status counts, optionally restricted to one queue.
    pub async fn stats(&self, queue: Option<&str>) -> Result<QueueStats> {
        let rows: Vec<(JobStatus, i64)> = match queue {
            Some(queue) => {
                sqlx::query_as(
                    "SELECT status, COUNT(*) FROM jobs WHERE queue = $1 GROUP BY status",
                )
                .bind(queue)
                .fetch_all(&self.db)
                .await?
            }
            None => {
                sqlx::query_as("SELECT status, COUNT(*) FROM jobs GROUP BY status")
                    .fetch_all(&self.db)
                    .await?
            }
        };

        Ok(fold_stats(rows))
    }

    /// Per-queue status counts.
    pub async fn stats_by_queue(&self) -> Result<BTreeMap<String, QueueStats>> {
        let rows: Vec<(String, JobStatus, i64)> =
            sqlx::query_as("SELECT queue, status, COUNT(*) FROM jobs GROUP BY queue, status")
                .fetch_all(&self.db)
                .await?;

        let mut by_queue: BTreeMap<String, QueueStats> = BTreeMap::new();
        for (queue, status, count) in rows {
            let stats = by_queue.entry(queue).or_default();
            apply_stat(stats, status, count);
        }
        Ok(by_queue)
    }

    /// Most recent failed jobs, for operator inspection.
    pub async fn failed(&self, limit: i64) -> Result<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE status = 'failed'
            ORDER BY processed_at DESC NULLS LAST, id DESC
            LIMIT $1
            "#,
        ))
        .bind(limit)
        .fetch_all(&self.db)
        .await?;

        Ok(jobs)
    }

    /// Reset one failed job for another round of attempts.
    ///
    /// The dedup key is dropped so the retry cannot collide with a newer
    /// live enqueue of the same payload.
    pub async fn retry(&self, job_id: i64) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                attempts = 0,
                stalled_count = 0,
                error = NULL,
                available_at = NOW(),
                reserved_at = NULL,
                processed_at = NULL,
                dedup_key = NULL
            WHERE id = $1 AND status = 'failed'
            "#,
        )
        .bind(job_id)
        .execute(&self.db)
        .await?
        .rows_affected();

        Ok(updated > 0)
    }

    /// Reset every failed job, optionally restricted to one queue.
    pub async fn retry_failed(&self, queue: Option<&str>) -> Result<u64> {
        let base = r#"
            UPDATE jobs
            SET status = 'pending',
                attempts = 0,
                stalled_count = 0,
                error = NULL,
                available_at = NOW(),
                reserved_at = NULL,
                processed_at = NULL,
                dedup_key = NULL
            WHERE status = 'failed'
        "#;

        let affected = match queue {
            Some(queue) => {
                sqlx::query(&format!("{base} AND queue = $1"))
                    .bind(queue)
                    .execute(&self.db)
                    .await?
                    .rows_affected()
            }
            None => sqlx::query(base).execute(&self.db).await?.rows_affected(),
        };

        Ok(affected)
    }

    /// Delete terminal rows older than `older_than`.
    pub async fn cleanup(&self, older_than: Duration) -> Result<u64> {
        let deleted = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE status IN ('completed', 'failed')
              AND processed_at < NOW() - ($1 || ' milliseconds')::INTERVAL
            "#,
        )
        .bind((older_than.as_millis() as i64).to_string())
        .execute(&self.db)
        .await?
        .rows_affected();

        Ok(deleted)
    }

    /// Delete rows on `queue`; by default only terminal ones.
    pub async fn purge(&self, queue: &str, only_terminal: bool) -> Result<u64> {
        let deleted = if only_terminal {
            sqlx::query("DELETE FROM jobs WHERE queue = $1 AND status IN ('completed', 'failed')")
                .bind(queue)
                .execute(&self.db)
                .await?
                .rows_affected()
        } else {
            sqlx::query("DELETE FROM jobs WHERE queue = $1")
                .bind(queue)
                .execute(&self.db)
                .await?
                .rows_affected()
        };

        Ok(deleted)
    }

    /// Waiting plus active count for one queue; scheduled ticks use this
    /// to skip while a queue is still draining.
    pub async fn waiting_or_active(&self, queue: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs WHERE queue = $1 AND status IN ('pending', 'processing')",
        )
        .bind(queue)
        .fetch_one(&self.db)
        .await?;

        Ok(count)
    }
}

fn fold_stats(rows: Vec<(JobStatus, i64)>) -> QueueStats {
    let mut stats = QueueStats::default();
    for (status, count) in rows {
        apply_stat(&mut stats, status, count);
    }
    stats
}

fn apply_stat(stats: &mut QueueStats, status: JobStatus, count: i64) {
    match status {
        JobStatus::Pending => stats.pending = count,
        JobStatus::Processing => stats.processing = count,
        JobStatus::Completed => stats.completed = count,
        JobStatus::Failed => stats.failed = count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_fold_by_status() {
        let stats = fold_stats(vec![
            (JobStatus::Pending, 3),
            (JobStatus::Failed, 1),
            (JobStatus::Completed, 10),
        ]);
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.processing, 0);
        assert_eq!(stats.completed, 10);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.waiting_or_active(), 3);
    }
}
