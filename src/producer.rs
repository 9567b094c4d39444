//! Ingestion producer: request validation and job enqueue.
//!
//! The producer is the only write path into the queue. It validates the
//! request shape, derives a `repoId` from the URL when the caller did not
//! supply one, and enqueues a job carrying the retry policy (3 attempts,
//! exponential backoff from 5 s).

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use crate::models::{is_primitive, JobPayload, MetaMap};
use crate::traits::JobQueue;

/// Hosts accepted without a `.git` suffix on the URL.
const KNOWN_GIT_HOSTS: &[&str] = &["github.com", "gitlab.com", "bitbucket.org"];

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestRequest {
    pub repo_url: String,
    #[serde(rename = "ref")]
    pub git_ref: Option<String>,
    pub token: Option<String>,
    pub user_id: Option<String>,
    pub repo_id: Option<String>,
    pub meta: Option<MetaMap>,
}

#[derive(Debug)]
pub enum ProducerError {
    Validation(String),
    Internal(anyhow::Error),
}

pub struct Producer {
    queue: Arc<dyn JobQueue>,
}

impl Producer {
    pub fn new(queue: Arc<dyn JobQueue>) -> Self {
        Self { queue }
    }

    /// Validates the request and enqueues an ingestion job. Returns the
    /// job id together with the payload that was queued.
    pub async fn enqueue(&self, req: IngestRequest) -> Result<(Uuid, JobPayload), ProducerError> {
        let payload = build_payload(&req).map_err(ProducerError::Validation)?;
        let job_id = self
            .queue
            .enqueue(payload.clone())
            .await
            .map_err(ProducerError::Internal)?;
        tracing::info!(job_id = %job_id, repo_url = %payload.repo_url, repo_id = %payload.repo_id, "ingestion job queued");
        Ok((job_id, payload))
    }
}

/// Pure validation: turns a request into a job payload or a caller-facing
/// error message.
pub fn build_payload(req: &IngestRequest) -> Result<JobPayload, String> {
    let repo_url = req.repo_url.trim();
    validate_repo_url(repo_url)?;

    let git_ref = req
        .git_ref
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .unwrap_or("main")
        .to_string();

    let repo_id = match req.repo_id.as_deref().map(str::trim).filter(|r| !r.is_empty()) {
        Some(explicit) => {
            if !is_valid_repo_id(explicit) {
                return Err(format!(
                    "repoId '{explicit}' is invalid; allowed characters are A-Z a-z 0-9 . _ -"
                ));
            }
            explicit.to_string()
        }
        None => derive_repo_id(repo_url)?,
    };

    if let Some(meta) = &req.meta {
        for (key, value) in meta {
            if !is_primitive(value) {
                return Err(format!(
                    "meta.{key} must be a string, number, or boolean; got {}",
                    value_type_name(value)
                ));
            }
        }
    }

    Ok(JobPayload {
        repo_url: repo_url.to_string(),
        git_ref,
        token: req.token.clone(),
        user_id: req.user_id.clone(),
        repo_id,
        meta: req.meta.clone(),
        queued_at: Utc::now(),
    })
}

fn validate_repo_url(url: &str) -> Result<(), String> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .ok_or_else(|| "repoUrl must be an http(s) URL".to_string())?;

    let host = rest.split('/').next().unwrap_or_default();
    if host.is_empty() {
        return Err("repoUrl has no host".to_string());
    }

    let bare_host = host.strip_prefix("www.").unwrap_or(host);
    let known_host = KNOWN_GIT_HOSTS.contains(&bare_host);
    if !known_host && !url.ends_with(".git") {
        return Err(
            "repoUrl must end in .git or point at a known git host (github, gitlab, bitbucket)"
                .to_string(),
        );
    }
    Ok(())
}

/// Derives a repoId from the trailing path segment of the URL, stripping an
/// optional `.git` suffix.
fn derive_repo_id(url: &str) -> Result<String, String> {
    let trimmed = url.trim_end_matches('/');
    let segment = trimmed.rsplit('/').next().unwrap_or_default();
    let candidate = segment.strip_suffix(".git").unwrap_or(segment);
    if candidate.is_empty() || !is_valid_repo_id(candidate) {
        return Err(format!("could not derive a valid repoId from '{url}'"));
    }
    Ok(candidate.to_string())
}

fn is_valid_repo_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
