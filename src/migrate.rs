//! Database schema migrations.
//!
//! Creates all required tables and indexes; idempotent, safe to run on
//! every process start or via `rephole migrate`.
//!
//! # Tables
//!
//! | Table | Purpose |
//! |-------|---------|
//! | `repositories` | Per-repository state: clone path, last processed commit, file signatures |
//! | `code_documents` | Full file contents (parents), keyed by `(id, repo_id)` |
//! | `ingest_jobs` | Durable job queue with retry/backoff metadata |

use anyhow::Result;
use sqlx::PgPool;

pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS repositories (
            id CHAR(26) PRIMARY KEY,
            repo_url TEXT NOT NULL UNIQUE,
            local_path TEXT NOT NULL,
            last_processed_commit TEXT,
            file_signatures JSONB NOT NULL DEFAULT '{}'::jsonb
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS code_documents (
            id TEXT NOT NULL,
            repo_id VARCHAR(255) NOT NULL,
            content TEXT NOT NULL,
            metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
            PRIMARY KEY (id, repo_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_code_documents_repo_id ON code_documents(repo_id)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ingest_jobs (
            id UUID PRIMARY KEY,
            state TEXT NOT NULL DEFAULT 'waiting',
            payload JSONB NOT NULL,
            progress INT NOT NULL DEFAULT 0,
            attempts_made INT NOT NULL DEFAULT 0,
            max_attempts INT NOT NULL DEFAULT 3,
            backoff_base_ms BIGINT NOT NULL DEFAULT 5000,
            run_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            queued_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            started_at TIMESTAMPTZ,
            finished_at TIMESTAMPTZ,
            failed_reason TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_ingest_jobs_state_run_at ON ingest_jobs(state, run_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
