//! Durable ingestion job queue on Postgres.
//!
//! Separates the API (producer) from the worker fleet (consumer) with
//! at-least-once delivery:
//!
//! - **Claiming** uses `FOR UPDATE SKIP LOCKED`, so concurrent workers
//!   never receive the same job and an idle worker never blocks on a busy
//!   row.
//! - **Retries** are attempt-counted with exponential backoff: a failed
//!   attempt reschedules the job at `backoff_base × 2^(attempts−1)` until
//!   `max_attempts` is exhausted, after which the job is parked in the
//!   `failed` state with its reason retained for inspection and manual
//!   retry.
//! - **Retention**: completed jobs are pruned after one hour or past the
//!   most recent 100; failed jobs are pruned after 24 hours.
//!
//! A crashed worker leaves its job in `active`; queue-level recovery of
//! orphaned active jobs is the deployment's concern (job payloads are
//! idempotent, so re-running one converges).

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::models::{JobPayload, JobRecord, JobState};
use crate::traits::{ActiveJob, JobQueue};

pub struct PgJobQueue {
    pool: PgPool,
    config: QueueConfig,
}

impl PgJobQueue {
    pub fn new(pool: PgPool, config: QueueConfig) -> Self {
        Self { pool, config }
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(&self, payload: JobPayload) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let payload_json =
            serde_json::to_value(&payload).context("failed to serialize job payload")?;
        sqlx::query(
            r#"
            INSERT INTO ingest_jobs (id, state, payload, max_attempts, backoff_base_ms, run_at, queued_at)
            VALUES ($1, 'waiting', $2, $3, $4, now(), $5)
            "#,
        )
        .bind(id)
        .bind(payload_json)
        .bind(self.config.max_attempts)
        .bind(self.config.backoff_base_ms)
        .bind(payload.queued_at)
        .execute(&self.pool)
        .await
        .context("failed to enqueue job")?;
        Ok(id)
    }

    async fn dequeue(&self) -> Result<Option<ActiveJob>> {
        let row = sqlx::query(
            r#"
            UPDATE ingest_jobs
            SET state = 'active', started_at = now(), attempts_made = attempts_made + 1
            WHERE id = (
                SELECT id FROM ingest_jobs
                WHERE state = 'waiting' AND run_at <= now()
                ORDER BY queued_at
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING id, payload, attempts_made
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .context("failed to dequeue job")?;

        let Some(row) = row else { return Ok(None) };
        let payload: serde_json::Value = row.get("payload");
        let payload: JobPayload =
            serde_json::from_value(payload).context("corrupt job payload in queue")?;
        Ok(Some(ActiveJob {
            id: row.get("id"),
            payload,
            attempts_made: row.get("attempts_made"),
        }))
    }

    async fn complete(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE ingest_jobs SET state = 'completed', progress = 100, finished_at = now() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail(&self, id: Uuid, reason: &str) -> Result<()> {
        // Attempts were already counted at claim time; retry while the
        // budget lasts, park as failed once it runs out.
        sqlx::query(
            r#"
            UPDATE ingest_jobs
            SET state = CASE WHEN attempts_made >= max_attempts THEN 'failed' ELSE 'waiting' END,
                run_at = now() + (backoff_base_ms * power(2, greatest(attempts_made - 1, 0))) * interval '1 millisecond',
                failed_reason = $2,
                finished_at = CASE WHEN attempts_made >= max_attempts THEN now() ELSE NULL END
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_progress(&self, id: Uuid, progress: i32) -> Result<()> {
        sqlx::query("UPDATE ingest_jobs SET progress = $2 WHERE id = $1")
            .bind(id)
            .bind(progress.clamp(0, 100))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<JobRecord>> {
        let row = sqlx::query(
            "SELECT id, state, payload, progress, attempts_made, failed_reason, queued_at, finished_at
             FROM ingest_jobs WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_record).transpose()
    }

    async fn failed_jobs(&self) -> Result<Vec<JobRecord>> {
        let rows = sqlx::query(
            "SELECT id, state, payload, progress, attempts_made, failed_reason, queued_at, finished_at
             FROM ingest_jobs WHERE state = 'failed' ORDER BY finished_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_record).collect()
    }

    async fn retry(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE ingest_jobs
            SET state = 'waiting', attempts_made = 0, progress = 0,
                run_at = now(), failed_reason = NULL, finished_at = NULL
            WHERE id = $1 AND state = 'failed'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn retry_all(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE ingest_jobs
            SET state = 'waiting', attempts_made = 0, progress = 0,
                run_at = now(), failed_reason = NULL, finished_at = NULL
            WHERE state = 'failed'
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn sweep(&self) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM ingest_jobs
            WHERE state = 'completed'
              AND (finished_at < now() - ($1 * interval '1 second')
                   OR id NOT IN (
                       SELECT id FROM ingest_jobs WHERE state = 'completed'
                       ORDER BY finished_at DESC LIMIT $2
                   ))
            "#,
        )
        .bind(self.config.completed_retention_secs)
        .bind(self.config.completed_retention_count)
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "DELETE FROM ingest_jobs WHERE state = 'failed' AND finished_at < now() - ($1 * interval '1 second')",
        )
        .bind(self.config.failed_retention_secs)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn row_to_record(row: sqlx::postgres::PgRow) -> Result<JobRecord> {
    let payload: serde_json::Value = row.get("payload");
    let payload: JobPayload =
        serde_json::from_value(payload).context("corrupt job payload in queue")?;
    let state: String = row.get("state");
    Ok(JobRecord {
        id: row.get("id"),
        state: JobState::parse(&state).unwrap_or(JobState::Waiting),
        progress: row.get("progress"),
        payload,
        attempts_made: row.get("attempts_made"),
        failed_reason: row.get("failed_reason"),
        queued_at: row.get::<DateTime<Utc>, _>("queued_at"),
        finished_at: row.get("finished_at"),
    })
}
