//! Query service: prompt in, ranked results out.
//!
//! Shared preamble for both search modes: clamp `k`, build the metadata
//! filter, embed the prompt, then dispatch to the retriever in parent or
//! chunk mode and shape the response.

use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

use crate::models::{is_primitive, MetaMap};
use crate::retriever::{Retrieved, Retriever};
use crate::traits::Embedder;

const DEFAULT_K: usize = 5;
const MAX_K: usize = 100;

#[derive(Debug, Clone, Deserialize)]
pub struct SearchQuery {
    pub prompt: String,
    /// Accepted loosely: non-integers and out-of-range values fall back to
    /// the default rather than rejecting the request.
    pub k: Option<Value>,
    pub meta: Option<MetaMap>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Parent,
    Chunk,
}

#[derive(Debug)]
pub enum QueryError {
    BadRequest(String),
    Internal(anyhow::Error),
}

pub struct QueryService {
    embedder: Arc<dyn Embedder>,
    retriever: Retriever,
}

impl QueryService {
    pub fn new(embedder: Arc<dyn Embedder>, retriever: Retriever) -> Self {
        Self {
            embedder,
            retriever,
        }
    }

    pub async fn search(
        &self,
        repo_id: &str,
        query: &SearchQuery,
        mode: SearchMode,
    ) -> Result<Vec<Retrieved>, QueryError> {
        let prompt = query.prompt.trim();
        if prompt.is_empty() {
            return Err(QueryError::BadRequest("prompt must not be empty".into()));
        }

        let k = clamp_k(query.k.as_ref());
        let filter = build_filter(repo_id, query.meta.as_ref())?;

        let vectors = self
            .embedder
            .embed(&[prompt.to_string()])
            .await
            .map_err(QueryError::Internal)?;
        let Some(query_vector) = vectors.into_iter().next() else {
            return Err(QueryError::BadRequest(
                "prompt produced no embedding".into(),
            ));
        };

        let results = match mode {
            SearchMode::Parent => self.retriever.retrieve(&query_vector, k, &filter).await,
            SearchMode::Chunk => {
                self.retriever
                    .retrieve_chunks(&query_vector, k, &filter)
                    .await
            }
        }
        .map_err(QueryError::Internal)?;

        Ok(results)
    }
}

/// Clamps `k` to `[1, 100]`. Missing, non-integer, or non-positive values
/// default to 5; anything above 100 is pinned to 100.
pub fn clamp_k(k: Option<&Value>) -> usize {
    let Some(value) = k else { return DEFAULT_K };
    let Some(i) = value.as_i64() else {
        return DEFAULT_K;
    };
    if i <= 0 {
        DEFAULT_K
    } else {
        (i as usize).min(MAX_K)
    }
}

/// Builds the search filter: user meta first, `repoId` assigned last so it
/// always wins on conflict.
fn build_filter(repo_id: &str, meta: Option<&MetaMap>) -> Result<MetaMap, QueryError> {
    let mut filter = MetaMap::new();
    if let Some(meta) = meta {
        for (key, value) in meta {
            if !is_primitive(value) {
                return Err(QueryError::BadRequest(format!(
                    "meta.{key} must be a string, number, or boolean"
                )));
            }
            filter.insert(key.clone(), value.clone());
        }
    }
    filter.insert("repoId".to_string(), Value::String(repo_id.to_string()));
    Ok(filter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn k_defaults_and_clamps() {
        assert_eq!(clamp_k(None), 5);
        assert_eq!(clamp_k(Some(&json!(1))), 1);
        assert_eq!(clamp_k(Some(&json!(100))), 100);
        assert_eq!(clamp_k(Some(&json!(101))), 100);
        assert_eq!(clamp_k(Some(&json!(0))), 5);
        assert_eq!(clamp_k(Some(&json!(-3))), 5);
        assert_eq!(clamp_k(Some(&json!(2.5))), 5);
        assert_eq!(clamp_k(Some(&json!("7"))), 5);
    }

    #[test]
    fn filter_merges_meta_under_repo_id() {
        let mut meta = MetaMap::new();
        meta.insert("env".into(), json!("prod"));
        meta.insert("repoId".into(), json!("spoofed"));
        let filter = build_filter("demo", Some(&meta)).unwrap();
        assert_eq!(filter["env"], json!("prod"));
        // repoId is assigned last; the user value never survives.
        assert_eq!(filter["repoId"], json!("demo"));
    }

    #[test]
    fn filter_rejects_non_primitive_meta() {
        let mut meta = MetaMap::new();
        meta.insert("tags".into(), json!(["a"]));
        assert!(matches!(
            build_filter("demo", Some(&meta)),
            Err(QueryError::BadRequest(_))
        ));
    }
}
