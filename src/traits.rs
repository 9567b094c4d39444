//! Trait seams between the pipeline and its storage/embedding backends.
//!
//! The worker, retriever and query service are written against these
//! traits rather than concrete adapters, so each can run over the real
//! Postgres/Chroma/OpenAI implementations in production and over
//! in-memory fakes in tests.
//!
//! ```text
//! ┌────────────────┐       ┌──────────────┐
//! │ IngestionWorker │──────▶│  JobQueue    │  Postgres (SKIP LOCKED)
//! │                │──────▶│  StateStore  │  Postgres
//! │                │──────▶│  ParentStore │  Postgres
//! │                │──────▶│  VectorIndex │  Chroma
//! │                │──────▶│  Embedder    │  OpenAI
//! └────────────────┘       └──────────────┘
//! ```

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crate::models::{
    JobPayload, JobRecord, MetaMap, ParentDocument, RepoState, SearchHit, VectorRecord,
};

/// Approximate-nearest-neighbor index over chunk vectors with flat
/// metadata-equality filtering.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Upserts a batch keyed on record id. Fails on duplicate ids within
    /// the batch.
    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<()>;

    /// ANN search. `filter` keys are AND-ed equality predicates; an empty
    /// map means no filter. Results are similarity-descending with scores
    /// in [0, 1].
    async fn similarity_search(
        &self,
        vector: &[f32],
        k: usize,
        filter: &MetaMap,
    ) -> Result<Vec<SearchHit>>;

    async fn get_by_ids(&self, ids: &[String]) -> Result<Vec<SearchHit>>;

    /// Every indexed chunk of one file in one repository.
    async fn get_by_file_path(&self, repo_id: &str, path: &str) -> Result<Vec<SearchHit>>;

    async fn delete_by_ids(&self, ids: &[String]) -> Result<()>;

    /// Deletes everything matching the filter; returns nothing because the
    /// backing store does not report counts reliably.
    async fn delete_by_filter(&self, filter: &MetaMap) -> Result<()>;
}

/// Durable store of full file contents, keyed by `(repoId, path)`.
#[async_trait]
pub trait ParentStore: Send + Sync {
    /// Upsert; content is sanitized before writing.
    async fn save_parent(
        &self,
        id: &str,
        content: &str,
        repo_id: &str,
        meta: &MetaMap,
    ) -> Result<()>;

    async fn get_parent(&self, id: &str, repo_id: &str) -> Result<Option<ParentDocument>>;

    /// Returns a subset of the requested ids; missing ids are omitted.
    async fn get_parents(&self, ids: &[String], repo_id: &str) -> Result<Vec<ParentDocument>>;
}

/// Durable per-repository state records.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn find_by_url(&self, repo_url: &str) -> Result<Option<RepoState>>;

    /// Upsert on id.
    async fn save(&self, state: &RepoState) -> Result<()>;
}

/// A claimed job, visible to exactly one worker until completed or failed.
#[derive(Debug, Clone)]
pub struct ActiveJob {
    pub id: Uuid,
    pub payload: JobPayload,
    pub attempts_made: i32,
}

/// Durable at-least-once job queue with retry/backoff metadata and
/// failed-job inspection.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, payload: JobPayload) -> Result<Uuid>;

    /// Claims the next runnable job, or `None` when the queue is idle.
    async fn dequeue(&self) -> Result<Option<ActiveJob>>;

    async fn complete(&self, id: Uuid) -> Result<()>;

    /// Records a failed attempt: reschedules with exponential backoff while
    /// attempts remain, parks the job as `failed` otherwise.
    async fn fail(&self, id: Uuid, reason: &str) -> Result<()>;

    async fn update_progress(&self, id: Uuid, progress: i32) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<JobRecord>>;

    async fn failed_jobs(&self) -> Result<Vec<JobRecord>>;

    /// Re-enqueues one failed job. Returns `false` when the job is unknown
    /// or not in the failed state.
    async fn retry(&self, id: Uuid) -> Result<bool>;

    /// Re-enqueues every failed job, returning how many were requeued.
    async fn retry_all(&self) -> Result<u64>;

    /// Applies the retention policy to completed and failed jobs.
    async fn sweep(&self) -> Result<()>;
}

/// Dense-vector embedding backend.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embeds a batch. Output length equals the count of non-empty inputs
    /// after sanitization, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}
