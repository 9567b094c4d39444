//! Parent–child retrieval.
//!
//! The index holds small semantic chunks (children), each carrying a
//! `parentId` pointing at the file it was cut from. Search runs against
//! children; the returned context is either the full parent bodies
//! (**parent mode**) or the chunks themselves (**chunk mode**).
//!
//! Parent mode over-fetches 3× the requested `k` because several children
//! of the same file routinely land in the top hits; deduplicating their
//! parents would otherwise starve the result set. Ordering of the child
//! hits is the final relevance ranking; no re-scoring happens after the
//! blob fetch.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;

use crate::models::MetaMap;
use crate::traits::{ParentStore, VectorIndex};

/// One retrieval result: a full parent file in parent mode, a single chunk
/// in chunk mode or when only orphans were found.
#[derive(Debug, Clone)]
pub struct Retrieved {
    pub id: String,
    pub content: String,
    pub repo_id: String,
    pub metadata: MetaMap,
}

pub struct Retriever {
    index: Arc<dyn VectorIndex>,
    parents: Arc<dyn ParentStore>,
}

impl Retriever {
    pub fn new(index: Arc<dyn VectorIndex>, parents: Arc<dyn ParentStore>) -> Self {
        Self { index, parents }
    }

    /// Parent mode: search children, deduplicate parents in hit order, and
    /// return the full parent bodies. Falls back to orphan hits (children
    /// with no `parentId` but non-empty content) when no parent was found.
    pub async fn retrieve(
        &self,
        query_vector: &[f32],
        k: usize,
        filter: &MetaMap,
    ) -> Result<Vec<Retrieved>> {
        let hits = self
            .index
            .similarity_search(query_vector, k.saturating_mul(3), filter)
            .await?;

        // (parent id, repo id) pairs in insertion order.
        let mut parent_keys: Vec<(String, String)> = Vec::new();
        let mut orphans: Vec<Retrieved> = Vec::new();

        for hit in &hits {
            if parent_keys.len() >= k {
                break;
            }
            match hit.parent_id() {
                Some(parent) => {
                    let repo_id = meta_str(&hit.metadata, "repoId");
                    let key = (parent.to_string(), repo_id);
                    if !parent_keys.contains(&key) {
                        parent_keys.push(key);
                    }
                }
                None if !hit.content.is_empty() => orphans.push(Retrieved {
                    id: hit.id.clone(),
                    content: hit.content.clone(),
                    repo_id: meta_str(&hit.metadata, "repoId"),
                    metadata: hit.metadata.clone(),
                }),
                None => {}
            }
        }

        if parent_keys.is_empty() {
            return Ok(orphans);
        }

        // Fetch bodies per repository, then emit in insertion order of the
        // parent ids. Missing blobs are silently skipped (sparse results).
        let mut by_repo: HashMap<String, Vec<String>> = HashMap::new();
        for (parent, repo_id) in &parent_keys {
            by_repo
                .entry(repo_id.clone())
                .or_default()
                .push(parent.clone());
        }

        let mut fetched: HashMap<(String, String), Retrieved> = HashMap::new();
        for (repo_id, ids) in by_repo {
            for doc in self.parents.get_parents(&ids, &repo_id).await? {
                fetched.insert(
                    (doc.id.clone(), doc.repo_id.clone()),
                    Retrieved {
                        id: doc.id,
                        content: doc.content,
                        repo_id: doc.repo_id,
                        metadata: doc.metadata,
                    },
                );
            }
        }

        Ok(parent_keys
            .into_iter()
            .filter_map(|key| fetched.remove(&key))
            .collect())
    }

    /// Chunk mode: search children directly and return them, dropping
    /// entries with empty content.
    pub async fn retrieve_chunks(
        &self,
        query_vector: &[f32],
        k: usize,
        filter: &MetaMap,
    ) -> Result<Vec<Retrieved>> {
        let hits = self.index.similarity_search(query_vector, k, filter).await?;
        Ok(hits
            .into_iter()
            .filter(|hit| !hit.content.is_empty())
            .map(|hit| Retrieved {
                id: hit.id,
                repo_id: meta_str(&hit.metadata, "repoId"),
                content: hit.content,
                metadata: hit.metadata,
            })
            .collect())
    }
}

fn meta_str(meta: &MetaMap, key: &str) -> String {
    meta.get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}
