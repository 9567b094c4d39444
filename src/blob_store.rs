//! Content blob store: full source files keyed by `(path, repoId)`.
//!
//! Writes are upserts. Content is sanitized before storage: NUL bytes and
//! C0 control characters other than line feed, carriage return and tab are
//! stripped, counted and logged, but never rejected.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{PgPool, Row};

use crate::models::{MetaMap, ParentDocument};
use crate::traits::ParentStore;

/// Removes characters the text column cannot carry. Returns the cleaned
/// string and the number of characters stripped. Already-clean content is
/// returned unchanged, so sanitization is idempotent.
pub fn sanitize_content(content: &str) -> (String, usize) {
    let mut stripped = 0usize;
    let out: String = content
        .chars()
        .filter(|&c| {
            let keep = c == '\n' || c == '\r' || c == '\t' || !(c as u32 <= 0x1F || c == '\0');
            if !keep {
                stripped += 1;
            }
            keep
        })
        .collect();
    (out, stripped)
}

pub struct PgBlobStore {
    pool: PgPool,
}

impl PgBlobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ParentStore for PgBlobStore {
    async fn save_parent(
        &self,
        id: &str,
        content: &str,
        repo_id: &str,
        meta: &MetaMap,
    ) -> Result<()> {
        let (clean, stripped) = sanitize_content(content);
        if stripped > 0 {
            tracing::info!(id, repo_id, stripped, "stripped control characters from content");
        }

        sqlx::query(
            r#"
            INSERT INTO code_documents (id, repo_id, content, metadata)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id, repo_id) DO UPDATE SET
                content = excluded.content,
                metadata = excluded.metadata
            "#,
        )
        .bind(id)
        .bind(repo_id)
        .bind(&clean)
        .bind(serde_json::Value::Object(meta.clone()))
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to save content blob {id}"))?;

        Ok(())
    }

    async fn get_parent(&self, id: &str, repo_id: &str) -> Result<Option<ParentDocument>> {
        let row = sqlx::query(
            "SELECT id, repo_id, content, metadata FROM code_documents WHERE id = $1 AND repo_id = $2",
        )
        .bind(id)
        .bind(repo_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(row_to_document))
    }

    async fn get_parents(&self, ids: &[String], repo_id: &str) -> Result<Vec<ParentDocument>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            "SELECT id, repo_id, content, metadata FROM code_documents WHERE repo_id = $1 AND id = ANY($2)",
        )
        .bind(repo_id)
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(row_to_document).collect())
    }
}

fn row_to_document(row: sqlx::postgres::PgRow) -> ParentDocument {
    let metadata: serde_json::Value = row.get("metadata");
    ParentDocument {
        id: row.get("id"),
        repo_id: row.get("repo_id"),
        content: row.get("content"),
        metadata: metadata.as_object().cloned().unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_nul_and_c0() {
        let dirty = "fn main() {\u{0}\u{1}\u{8}}\n";
        let (clean, stripped) = sanitize_content(dirty);
        assert_eq!(clean, "fn main() {}\n");
        assert_eq!(stripped, 3);
    }

    #[test]
    fn sanitize_keeps_tab_cr_lf() {
        let text = "line one\r\n\tindented\n";
        let (clean, stripped) = sanitize_content(text);
        assert_eq!(clean, text);
        assert_eq!(stripped, 0);
    }

    #[test]
    fn sanitize_is_idempotent() {
        let dirty = "a\u{0}b\u{7}c";
        let (once, _) = sanitize_content(dirty);
        let (twice, stripped) = sanitize_content(&once);
        assert_eq!(once, twice);
        assert_eq!(stripped, 0);
    }

    #[test]
    fn sanitize_keeps_unicode() {
        let text = "// コメント ✓\nfn run() {}\n";
        let (clean, stripped) = sanitize_content(text);
        assert_eq!(clean, text);
        assert_eq!(stripped, 0);
    }
}
