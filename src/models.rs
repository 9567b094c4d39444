//! Core data types used throughout the pipeline.
//!
//! The data lifecycle is:
//!
//! ```text
//! enqueue → JobPayload → worker → { RepoState, ParentDocument, CodeChunk }
//!                                         ↓
//!                                  embed → VectorRecord
//!                                         ↓
//!                                 search → SearchHit → Retrieved
//! ```
//!
//! - A **[`RepoState`]** is the durable per-repository record: where the
//!   working clone lives and which commit was last ingested.
//! - A **[`ParentDocument`]** is a full source file persisted in the blob
//!   store, keyed by its repository-relative path.
//! - A **[`CodeChunk`]** is an ephemeral syntax-aware slice of one file,
//!   emitted by the chunker.
//! - A **[`VectorRecord`]** is one indexed chunk: id, embedding, text, and
//!   the full metadata mapping.
//! - A **[`SearchHit`]** is a scored result from the vector index.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

/// Flat metadata mapping. Values are restricted to JSON primitives
/// (string, number, boolean); [`sanitize_meta`] enforces this for
/// caller-supplied maps.
pub type MetaMap = serde_json::Map<String, Value>;

/// Metadata field names owned by the pipeline. Caller-supplied meta can
/// never overwrite these; [`sanitize_meta`] drops them on the way in and
/// the worker assigns them last when building records.
pub const RESERVED_METADATA_KEYS: &[&str] = &[
    "id",
    "category",
    "repositoryId",
    "repoId",
    "workspaceId",
    "userId",
    "timestamp",
    "filePath",
    "fileType",
    "chunkIndex",
    "chunkType",
    "parentId",
    "functionName",
    "startLine",
    "endLine",
];

/// True for JSON values allowed in metadata maps.
pub fn is_primitive(value: &Value) -> bool {
    matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_))
}

/// Filters caller-supplied metadata down to safe entries: reserved keys and
/// non-primitive values (arrays, objects, nulls) are dropped with a warning.
pub fn sanitize_meta(meta: &MetaMap) -> MetaMap {
    let mut out = MetaMap::new();
    for (key, value) in meta {
        if RESERVED_METADATA_KEYS.contains(&key.as_str()) {
            tracing::warn!(key = %key, "dropping reserved metadata key from user meta");
            continue;
        }
        if !is_primitive(value) {
            tracing::warn!(key = %key, "dropping non-primitive metadata value");
            continue;
        }
        out.insert(key.clone(), value.clone());
    }
    out
}

/// Durable per-repository record. One row per repository URL; created on
/// the first job for that URL and never deleted by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoState {
    /// ULID: 26 characters, lexicographically time-ordered.
    pub id: String,
    pub repo_url: String,
    /// Working clone owned exclusively by the worker fleet.
    pub local_path: PathBuf,
    /// Commit hash last successfully ingested; `None` before the first run.
    pub last_processed_commit: Option<String>,
    /// Relative path → SHA-256 content hash. Written on every successful
    /// job; the diff path does not read it.
    pub file_signatures: BTreeMap<String, String>,
}

impl RepoState {
    pub fn new(repo_url: &str, storage_root: &std::path::Path) -> Self {
        let id = ulid::Ulid::new().to_string();
        let local_path = storage_root.join(&id);
        Self {
            id,
            repo_url: repo_url.to_string(),
            local_path,
            last_processed_commit: None,
            file_signatures: BTreeMap::new(),
        }
    }
}

/// A syntax-aware slice of one source file, emitted by the chunker.
/// Ephemeral: exists only between parsing and upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeChunk {
    /// `"{filePath}:{name}:{nodeType}:L{startLine}"`; unique within a file.
    pub id: String,
    /// Grammar node type of the block (`function_item`, `class_declaration`, ...).
    pub chunk_type: String,
    /// Identifier attached to the block, or `"anonymous"`.
    pub name: String,
    /// Source text from the start of any leading comment/decorator chain to
    /// the end of the block.
    pub content: String,
    /// 1-indexed, inclusive.
    pub start_line: usize,
    /// 1-indexed, inclusive.
    pub end_line: usize,
}

/// One indexed chunk as handed to the vector store.
#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub id: String,
    pub vector: Vec<f32>,
    pub content: String,
    pub metadata: MetaMap,
}

/// A scored result from the vector index. `score` is similarity in [0, 1],
/// descending order preserved from the store.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub id: String,
    pub content: String,
    pub score: f32,
    pub metadata: MetaMap,
}

impl SearchHit {
    /// The `parentId` metadata field, when present and non-empty.
    pub fn parent_id(&self) -> Option<&str> {
        self.metadata
            .get("parentId")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }
}

/// A full source file persisted in the blob store.
#[derive(Debug, Clone)]
pub struct ParentDocument {
    /// Repository-relative path.
    pub id: String,
    pub repo_id: String,
    pub content: String,
    pub metadata: MetaMap,
}

/// Wire payload of one ingestion job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    pub repo_url: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub repo_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<MetaMap>,
    pub queued_at: DateTime<Utc>,
}

impl JobPayload {
    /// Payload as exposed by the job-status endpoints, with the access
    /// token removed.
    pub fn public_view(&self) -> Value {
        let mut v = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut v {
            map.remove("token");
        }
        v
    }
}

/// Queue-visible lifecycle of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(JobState::Waiting),
            "active" => Some(JobState::Active),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }
}

/// A job as read back from the queue for status endpoints.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: Uuid,
    pub state: JobState,
    pub progress: i32,
    pub payload: JobPayload,
    pub attempts_made: i32,
    pub failed_reason: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}
