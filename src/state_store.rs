use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{PgPool, Row};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::models::RepoState;
use crate::traits::StateStore;

/// Repository state records in Postgres. `find_by_url` is the hot path;
/// `save` is an upsert on id with last-writer-wins semantics.
pub struct PgStateStore {
    pool: PgPool,
}

impl PgStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StateStore for PgStateStore {
    async fn find_by_url(&self, repo_url: &str) -> Result<Option<RepoState>> {
        let row = sqlx::query(
            "SELECT id, repo_url, local_path, last_processed_commit, file_signatures
             FROM repositories WHERE repo_url = $1",
        )
        .bind(repo_url)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| {
            let signatures: serde_json::Value = row.get("file_signatures");
            let file_signatures: BTreeMap<String, String> =
                serde_json::from_value(signatures).unwrap_or_default();
            RepoState {
                id: row.get::<String, _>("id").trim().to_string(),
                repo_url: row.get("repo_url"),
                local_path: PathBuf::from(row.get::<String, _>("local_path")),
                last_processed_commit: row.get("last_processed_commit"),
                file_signatures,
            }
        }))
    }

    async fn save(&self, state: &RepoState) -> Result<()> {
        let signatures = serde_json::to_value(&state.file_signatures)
            .context("failed to serialize file signatures")?;
        sqlx::query(
            r#"
            INSERT INTO repositories (id, repo_url, local_path, last_processed_commit, file_signatures)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE SET
                repo_url = excluded.repo_url,
                local_path = excluded.local_path,
                last_processed_commit = excluded.last_processed_commit,
                file_signatures = excluded.file_signatures
            "#,
        )
        .bind(&state.id)
        .bind(&state.repo_url)
        .bind(state.local_path.to_string_lossy().as_ref())
        .bind(&state.last_processed_commit)
        .bind(signatures)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to save repo state {}", state.id))?;
        Ok(())
    }
}
