//! Ingestion worker: consumes queue jobs and drives the pipeline.
//!
//! One job runs the following state machine:
//!
//! ```text
//! Received → Resolve → Diff → Delete → (Short-circuit?) → Process → Commit → Done
//!                                                         ↘ (per-file) ↙
//! ```
//!
//! 1. **Resolve** the repository state by URL, creating it (fresh id,
//!    clone under the storage root) on first sight. A state whose working
//!    tree has vanished is healed by re-cloning; an existing tree is
//!    fetched and reset to the requested ref.
//! 2. **Diff** `lastProcessedCommit..HEAD`. No previous commit (or an
//!    invalid one) means bootstrap: every tracked file counts as added.
//! 3. **Delete** vectors for removed and rename-source paths, then
//!    short-circuit when nothing needs indexing. Deletions are applied
//!    even on the "no changes" path.
//! 4. **Per file**: skip binaries by extension, decode UTF-8 (warn and
//!    skip on failure), write the parent blob, chunk, drop whitespace-only
//!    chunks, embed the rest in one call, assemble vector records (user
//!    meta first, reserved fields assigned last so they win), upsert.
//! 5. **Commit** the new head to the repository state, together with
//!    refreshed file signatures.
//!
//! Per-file failures (unreadable, undecodable, no chunks) are logged and
//! counted; the loop continues. Phase failures (git, embed, vector store,
//! blob store) fail the job and the queue retries it with backoff.
//!
//! Every effect is idempotent (clones are reused, blob writes and vector
//! upserts are keyed on stable ids, deletions are by filter), so re-running
//! a partially failed job converges, and replaying a completed one is a
//! no-op because its diff is empty.

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::chunker::Chunker;
use crate::git::{self, ChangedFiles};
use crate::models::{sanitize_meta, CodeChunk, JobPayload, MetaMap, RepoState, VectorRecord};
use crate::traits::{ActiveJob, Embedder, JobQueue, ParentStore, StateStore, VectorIndex};

/// Extensions never ingested, lowercase with dot.
const BINARY_EXTENSIONS: &[&str] = &[
    ".png", ".jpg", ".jpeg", ".gif", ".bmp", ".ico", ".svg", ".webp", ".tiff", ".mp4", ".avi",
    ".mov", ".wmv", ".flv", ".mkv", ".mp3", ".wav", ".ogg", ".flac", ".aac", ".zip", ".tar",
    ".gz", ".rar", ".7z", ".bz2", ".exe", ".dll", ".so", ".dylib", ".bin", ".class", ".pyc",
    ".o", ".a", ".pdf", ".doc", ".docx", ".xls", ".xlsx", ".ppt", ".pptx", ".ttf", ".otf",
    ".woff", ".woff2", ".eot", ".db", ".sqlite", ".sqlite3", ".wasm", ".lock",
];

/// Outcome of processing one file; aggregated into the [`JobReport`].
#[derive(Debug, PartialEq, Eq)]
enum FileOutcome {
    Indexed { chunks: usize },
    SkippedBinary,
    SkippedUndecodable,
    SkippedNoChunks,
    SkippedUnreadable,
    SkippedDuplicateChunkIds,
}

/// What one job did, for logging and tests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub no_changes: bool,
    pub files_indexed: usize,
    pub files_skipped: usize,
    pub chunks_indexed: usize,
    pub paths_deleted: usize,
}

pub struct IngestionWorker {
    state_store: Arc<dyn StateStore>,
    blob_store: Arc<dyn ParentStore>,
    vector_index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
    queue: Arc<dyn JobQueue>,
    chunker: Arc<Chunker>,
    storage_root: PathBuf,
    poll_interval: Duration,
}

impl IngestionWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state_store: Arc<dyn StateStore>,
        blob_store: Arc<dyn ParentStore>,
        vector_index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn Embedder>,
        queue: Arc<dyn JobQueue>,
        chunker: Arc<Chunker>,
        storage_root: PathBuf,
        poll_interval: Duration,
    ) -> Self {
        Self {
            state_store,
            blob_store,
            vector_index,
            embedder,
            queue,
            chunker,
            storage_root,
            poll_interval,
        }
    }

    /// Poll loop: one job at a time until `shutdown` flips. The in-flight
    /// job always runs to completion.
    pub async fn run(&self, shutdown: Arc<AtomicBool>) {
        tracing::info!(
            languages = ?self.chunker.languages().loaded_languages(),
            "ingestion worker started"
        );
        let mut last_sweep = Instant::now();

        loop {
            if shutdown.load(Ordering::Relaxed) {
                tracing::info!("shutdown signal received, worker stopping");
                break;
            }

            if last_sweep.elapsed() > Duration::from_secs(60) {
                if let Err(e) = self.queue.sweep().await {
                    tracing::warn!(error = %e, "queue retention sweep failed");
                }
                last_sweep = Instant::now();
            }

            match self.queue.dequeue().await {
                Ok(Some(job)) => {
                    let job_id = job.id;
                    tracing::info!(job_id = %job_id, repo_url = %job.payload.repo_url, attempt = job.attempts_made, "processing ingestion job");
                    match self.process(&job).await {
                        Ok(report) => {
                            if let Err(e) = self.queue.complete(job_id).await {
                                tracing::error!(job_id = %job_id, error = %e, "failed to mark job completed");
                            }
                            tracing::info!(
                                job_id = %job_id,
                                files = report.files_indexed,
                                chunks = report.chunks_indexed,
                                skipped = report.files_skipped,
                                deleted = report.paths_deleted,
                                no_changes = report.no_changes,
                                "job completed"
                            );
                        }
                        Err(e) => {
                            tracing::error!(job_id = %job_id, error = %format!("{e:#}"), "job failed");
                            if let Err(fail_err) = self.queue.fail(job_id, &format!("{e:#}")).await {
                                tracing::error!(job_id = %job_id, error = %fail_err, "failed to record job failure");
                            }
                        }
                    }
                }
                Ok(None) => tokio::time::sleep(self.poll_interval).await,
                Err(e) => {
                    tracing::error!(error = %e, "failed to poll queue");
                    tokio::time::sleep(self.poll_interval * 5).await;
                }
            }
        }
    }

    /// Runs the full state machine for one job.
    pub async fn process(&self, job: &ActiveJob) -> Result<JobReport> {
        let payload = &job.payload;
        let mut state = self.resolve_state(payload).await?;
        self.queue.update_progress(job.id, 10).await.ok();

        let head = git::current_commit(&state.local_path)?;

        let changes = match git::changed_files(&state.local_path, state.last_processed_commit.as_deref())
        {
            Ok(changes) => changes,
            Err(e) => {
                tracing::warn!(
                    repo = %payload.repo_id,
                    error = %e,
                    "diff against last processed commit failed, re-indexing from scratch"
                );
                git::changed_files(&state.local_path, None)?
            }
        };

        let report = self.apply_changes(job, &mut state, &changes).await?;

        state.last_processed_commit = Some(head);
        self.state_store.save(&state).await?;
        self.queue.update_progress(job.id, 100).await.ok();

        Ok(report)
    }

    /// Looks up or creates the repository state and makes sure the working
    /// clone exists and is current.
    async fn resolve_state(&self, payload: &JobPayload) -> Result<RepoState> {
        match self.state_store.find_by_url(&payload.repo_url).await? {
            Some(state) => {
                if state.local_path.join(".git").exists() {
                    update_clone(&state.local_path, &payload.git_ref).await?;
                } else {
                    // The state says a clone exists but the tree is gone
                    // (moved host, wiped volume). Heal by re-cloning.
                    tracing::warn!(
                        repo = %payload.repo_id,
                        path = %state.local_path.display(),
                        "working clone missing, re-cloning"
                    );
                    clone_fresh(payload, &state.local_path).await?;
                }
                Ok(state)
            }
            None => {
                let state = RepoState::new(&payload.repo_url, &self.storage_root);
                clone_fresh(payload, &state.local_path).await?;
                self.state_store.save(&state).await?;
                tracing::info!(repo = %payload.repo_id, id = %state.id, "created repository state");
                Ok(state)
            }
        }
    }

    /// Deletions, short-circuit, and the per-file pipeline.
    async fn apply_changes(
        &self,
        job: &ActiveJob,
        state: &mut RepoState,
        changes: &ChangedFiles,
    ) -> Result<JobReport> {
        let payload = &job.payload;
        let mut report = JobReport::default();

        // Deletions run before the short-circuit so a commit that only
        // removes files still cleans the index.
        for path in &changes.deleted {
            let mut filter = MetaMap::new();
            filter.insert("repoId".to_string(), json!(payload.repo_id));
            filter.insert("parentId".to_string(), json!(path));
            self.vector_index
                .delete_by_filter(&filter)
                .await
                .with_context(|| format!("failed to delete vectors for {path}"))?;
            state.file_signatures.remove(path);
            report.paths_deleted += 1;
        }
        self.queue.update_progress(job.id, 20).await.ok();

        let to_index = changes.to_index();
        if to_index.is_empty() {
            tracing::info!(repo = %payload.repo_id, "no changes detected");
            report.no_changes = true;
            return Ok(report);
        }

        let sanitized_meta = payload
            .meta
            .as_ref()
            .map(sanitize_meta)
            .unwrap_or_default();
        let job_timestamp = Utc::now().to_rfc3339();

        let total = to_index.len();
        for (index, path) in to_index.iter().enumerate() {
            // A modified or renamed file's chunk ids shift with its line
            // numbers; stale vectors under the same parent must not linger.
            let replaces_existing =
                changes.modified.contains(path) || changes.renamed.contains(path);
            let outcome = self
                .process_file(
                    payload,
                    state,
                    path,
                    replaces_existing,
                    &sanitized_meta,
                    &job_timestamp,
                )
                .await?;
            match outcome {
                FileOutcome::Indexed { chunks } => {
                    report.files_indexed += 1;
                    report.chunks_indexed += chunks;
                }
                _ => report.files_skipped += 1,
            }
            let progress = 20 + ((index + 1) * 70 / total) as i32;
            self.queue.update_progress(job.id, progress).await.ok();
        }

        Ok(report)
    }

    /// Runs the per-file pipeline. Returns `Ok` with a skip outcome for
    /// conditions local to the file; propagates errors for phase failures
    /// (blob, embed, vector) that must fail the job.
    async fn process_file(
        &self,
        payload: &JobPayload,
        state: &mut RepoState,
        path: &str,
        replaces_existing: bool,
        sanitized_meta: &MetaMap,
        job_timestamp: &str,
    ) -> Result<FileOutcome> {
        if is_binary_path(path) {
            tracing::debug!(path, "skipping binary file");
            return Ok(FileOutcome::SkippedBinary);
        }

        let absolute = state.local_path.join(path);
        let bytes = match std::fs::read(&absolute) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(path, error = %e, "failed to read file, skipping");
                return Ok(FileOutcome::SkippedUnreadable);
            }
        };
        let content = match String::from_utf8(bytes) {
            Ok(content) => content,
            Err(_) => {
                tracing::warn!(path, "file is not valid UTF-8, skipping");
                return Ok(FileOutcome::SkippedUndecodable);
            }
        };

        self.blob_store
            .save_parent(path, &content, &payload.repo_id, sanitized_meta)
            .await
            .with_context(|| format!("failed to persist content blob for {path}"))?;

        if replaces_existing {
            let mut filter = MetaMap::new();
            filter.insert("repoId".to_string(), json!(payload.repo_id));
            filter.insert("parentId".to_string(), json!(path));
            self.vector_index
                .delete_by_filter(&filter)
                .await
                .with_context(|| format!("failed to clear stale vectors for {path}"))?;
        }

        let chunks: Vec<CodeChunk> = self
            .chunker
            .split(path, &content)
            .into_iter()
            .filter(|c| !c.content.trim().is_empty())
            .collect();

        state
            .file_signatures
            .insert(path.to_string(), content_signature(&content));

        if chunks.is_empty() {
            tracing::warn!(path, "no chunks produced, file stored without vectors");
            return Ok(FileOutcome::SkippedNoChunks);
        }

        // A duplicate id would make one chunk silently overwrite another;
        // the file is dropped rather than poisoning the collection.
        let mut seen = std::collections::HashSet::new();
        let duplicates: Vec<&str> = chunks
            .iter()
            .filter(|c| !seen.insert(c.id.as_str()))
            .map(|c| c.id.as_str())
            .collect();
        if !duplicates.is_empty() {
            tracing::error!(path, ids = ?duplicates, "duplicate chunk ids, file not indexed");
            return Ok(FileOutcome::SkippedDuplicateChunkIds);
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let vectors = self
            .embedder
            .embed(&texts)
            .await
            .with_context(|| format!("failed to embed chunks of {path}"))?;
        if vectors.len() != chunks.len() {
            anyhow::bail!(
                "embedding count mismatch for {path}: {} chunks, {} vectors",
                chunks.len(),
                vectors.len()
            );
        }

        let records: Vec<VectorRecord> = chunks
            .iter()
            .zip(vectors)
            .enumerate()
            .map(|(chunk_index, (chunk, vector))| VectorRecord {
                id: chunk.id.clone(),
                vector,
                content: chunk.content.clone(),
                metadata: build_chunk_metadata(
                    payload,
                    state,
                    path,
                    chunk,
                    chunk_index,
                    sanitized_meta,
                    job_timestamp,
                ),
            })
            .collect();

        let count = records.len();
        self.vector_index
            .upsert(records)
            .await
            .with_context(|| format!("failed to upsert vectors for {path}"))?;

        Ok(FileOutcome::Indexed { chunks: count })
    }
}

async fn clone_fresh(payload: &JobPayload, dst: &Path) -> Result<()> {
    let url = payload.repo_url.clone();
    let git_ref = payload.git_ref.clone();
    let token = payload.token.clone();
    let dst = dst.to_path_buf();
    tokio::task::spawn_blocking(move || git::clone_repo(&url, &git_ref, token.as_deref(), &dst))
        .await
        .context("clone task panicked")?
}

async fn update_clone(path: &Path, git_ref: &str) -> Result<()> {
    let path = path.to_path_buf();
    let git_ref = git_ref.to_string();
    tokio::task::spawn_blocking(move || git::update_repo(&path, &git_ref))
        .await
        .context("fetch task panicked")?
}

fn is_binary_path(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    BINARY_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

fn content_signature(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Full metadata for one vector record. User meta goes in first; reserved
/// fields are assigned afterwards so they always win.
fn build_chunk_metadata(
    payload: &JobPayload,
    state: &RepoState,
    path: &str,
    chunk: &CodeChunk,
    chunk_index: usize,
    sanitized_meta: &MetaMap,
    job_timestamp: &str,
) -> MetaMap {
    let mut metadata = sanitized_meta.clone();

    let file_type = path
        .rsplit('/')
        .next()
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| format!(".{}", ext.to_ascii_lowercase()))
        .unwrap_or_default();

    metadata.insert("id".into(), json!(chunk.id));
    metadata.insert("category".into(), json!("repository"));
    metadata.insert("workspaceId".into(), json!("default"));
    metadata.insert(
        "userId".into(),
        json!(payload.user_id.as_deref().unwrap_or("anonymous")),
    );
    metadata.insert("timestamp".into(), json!(job_timestamp));
    metadata.insert("filePath".into(), json!(path));
    metadata.insert("fileType".into(), json!(file_type));
    metadata.insert("chunkIndex".into(), json!(chunk_index));
    metadata.insert("chunkType".into(), json!(chunk.chunk_type));
    metadata.insert("parentId".into(), json!(path));
    metadata.insert("repositoryId".into(), json!(state.id));
    metadata.insert("repoId".into(), json!(payload.repo_id));
    metadata.insert("functionName".into(), json!(chunk.name));
    metadata.insert("startLine".into(), json!(chunk.start_line));
    metadata.insert("endLine".into(), json!(chunk.end_line));
    metadata
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_extensions_are_skipped_case_insensitively() {
        assert!(is_binary_path("assets/logo.png"));
        assert!(is_binary_path("assets/LOGO.PNG"));
        assert!(is_binary_path("Cargo.lock"));
        assert!(is_binary_path("dist/app.wasm"));
        assert!(!is_binary_path("src/main.rs"));
        assert!(!is_binary_path("src/png_tools.rs"));
    }

    #[test]
    fn reserved_fields_override_user_meta() {
        let payload = JobPayload {
            repo_url: "https://github.com/acme/demo.git".into(),
            git_ref: "main".into(),
            token: None,
            user_id: Some("u1".into()),
            repo_id: "demo".into(),
            meta: None,
            queued_at: Utc::now(),
        };
        let state = RepoState::new(&payload.repo_url, Path::new("/tmp"));
        let chunk = CodeChunk {
            id: "src/a.rs:alpha:function_item:L1".into(),
            chunk_type: "function_item".into(),
            name: "alpha".into(),
            content: "fn alpha() {}".into(),
            start_line: 1,
            end_line: 1,
        };

        let mut user_meta = MetaMap::new();
        user_meta.insert("env".into(), json!("prod"));
        // A hostile value that collides with a reserved key; sanitize_meta
        // would have dropped it, but even raw it must not survive.
        user_meta.insert("repoId".into(), json!("spoofed"));

        let metadata =
            build_chunk_metadata(&payload, &state, "src/a.rs", &chunk, 3, &user_meta, "t0");
        assert_eq!(metadata["repoId"], json!("demo"));
        assert_eq!(metadata["env"], json!("prod"));
        assert_eq!(metadata["parentId"], json!("src/a.rs"));
        assert_eq!(metadata["chunkIndex"], json!(3));
        assert_eq!(metadata["fileType"], json!(".rs"));
        assert_eq!(metadata["functionName"], json!("alpha"));
        assert_eq!(metadata["repositoryId"], json!(state.id));
        assert_eq!(metadata["userId"], json!("u1"));
    }

    #[test]
    fn file_type_handles_dotless_names() {
        let payload = JobPayload {
            repo_url: "u".into(),
            git_ref: "main".into(),
            token: None,
            user_id: None,
            repo_id: "r".into(),
            meta: None,
            queued_at: Utc::now(),
        };
        let state = RepoState::new("u", Path::new("/tmp"));
        let chunk = CodeChunk {
            id: "Makefile:anonymous:rule:L1".into(),
            chunk_type: "rule".into(),
            name: "anonymous".into(),
            content: "all:".into(),
            start_line: 1,
            end_line: 1,
        };
        let metadata =
            build_chunk_metadata(&payload, &state, "Makefile", &chunk, 0, &MetaMap::new(), "t0");
        assert_eq!(metadata["fileType"], json!(""));
    }

    #[test]
    fn content_signature_is_stable() {
        assert_eq!(
            content_signature("fn a() {}"),
            content_signature("fn a() {}")
        );
        assert_ne!(content_signature("a"), content_signature("b"));
    }
}
