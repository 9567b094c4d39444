//! Chroma-backed vector index adapter.
//!
//! Talks to a Chroma server over its REST API and implements
//! [`VectorIndex`] for the rest of the pipeline.
//!
//! # Behaviors
//!
//! - **Collection bootstrap** is lazy and idempotent: the first call
//!   issues a `get_or_create` for the configured collection and caches its
//!   id for the life of the process.
//! - **Upserts** validate that batch ids are pairwise unique (a duplicate
//!   means a chunker regression or metadata collision) and are sliced into
//!   batches of at most the configured size, sent sequentially.
//! - **Filters** are flat primitive maps translated into Chroma `where`
//!   clauses: one key becomes `{"k": {"$eq": v}}`, two or more become an
//!   `$and` of equality clauses, zero keys means no filter.
//! - **Scores**: Chroma returns distances; the adapter converts them to
//!   similarity via `score = 1 − distance` and preserves the returned
//!   order. A hit without a distance is rejected as a store bug.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashSet;
use tokio::sync::OnceCell;

use crate::config::ChromaConfig;
use crate::models::{MetaMap, SearchHit, VectorRecord};
use crate::traits::VectorIndex;

pub struct ChromaStore {
    client: reqwest::Client,
    config: ChromaConfig,
    batch_size: usize,
    collection_id: OnceCell<String>,
}

impl ChromaStore {
    pub fn new(config: ChromaConfig, batch_size: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            batch_size: batch_size.max(1),
            collection_id: OnceCell::new(),
        }
    }

    /// Fetches or creates the configured collection, caching its id.
    async fn collection_id(&self) -> Result<&str> {
        self.collection_id
            .get_or_try_init(|| async {
                let url = format!("{}/api/v1/collections", self.config.base_url());
                let response = self
                    .client
                    .post(&url)
                    .json(&json!({
                        "name": self.config.collection_name,
                        "get_or_create": true,
                    }))
                    .send()
                    .await
                    .context("failed to reach vector store")?;

                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    bail!("vector store collection bootstrap failed ({status}): {body}");
                }

                let body: Value = response.json().await?;
                let id = body
                    .get("id")
                    .and_then(|v| v.as_str())
                    .context("vector store returned a collection without an id")?;
                tracing::debug!(collection = %self.config.collection_name, id, "vector collection ready");
                Ok(id.to_string())
            })
            .await
            .map(|s| s.as_str())
    }

    async fn post(&self, op: &str, body: &Value) -> Result<Value> {
        let collection = self.collection_id().await?;
        let url = format!(
            "{}/api/v1/collections/{}/{}",
            self.config.base_url(),
            collection,
            op
        );
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("vector store {op} request failed"))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("vector store {op} failed ({status}): {text}");
        }
        Ok(response.json().await.unwrap_or(Value::Null))
    }
}

#[async_trait]
impl VectorIndex for ChromaStore {
    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let duplicates = find_duplicate_ids(&records);
        if !duplicates.is_empty() {
            bail!("duplicate ids in upsert batch: {}", duplicates.join(", "));
        }

        for batch in records.chunks(self.batch_size) {
            let ids: Vec<&str> = batch.iter().map(|r| r.id.as_str()).collect();
            let embeddings: Vec<&[f32]> = batch.iter().map(|r| r.vector.as_slice()).collect();
            let documents: Vec<&str> = batch.iter().map(|r| r.content.as_str()).collect();
            let metadatas: Vec<&MetaMap> = batch.iter().map(|r| &r.metadata).collect();

            self.post(
                "upsert",
                &json!({
                    "ids": ids,
                    "embeddings": embeddings,
                    "documents": documents,
                    "metadatas": metadatas,
                }),
            )
            .await?;
        }
        Ok(())
    }

    async fn similarity_search(
        &self,
        vector: &[f32],
        k: usize,
        filter: &MetaMap,
    ) -> Result<Vec<SearchHit>> {
        let mut body = json!({
            "query_embeddings": [vector],
            "n_results": k,
            "include": ["documents", "metadatas", "distances"],
        });
        if let Some(where_clause) = build_where(filter) {
            body["where"] = where_clause;
        }

        let response = self.post("query", &body).await?;
        parse_query_response(&response)
    }

    async fn get_by_ids(&self, ids: &[String]) -> Result<Vec<SearchHit>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let response = self
            .post(
                "get",
                &json!({
                    "ids": ids,
                    "include": ["documents", "metadatas"],
                }),
            )
            .await?;
        parse_get_response(&response)
    }

    async fn get_by_file_path(&self, repo_id: &str, path: &str) -> Result<Vec<SearchHit>> {
        let mut filter = MetaMap::new();
        filter.insert("repoId".to_string(), json!(repo_id));
        filter.insert("filePath".to_string(), json!(path));
        let response = self
            .post(
                "get",
                &json!({
                    "where": build_where(&filter),
                    "include": ["documents", "metadatas"],
                }),
            )
            .await?;
        parse_get_response(&response)
    }

    async fn delete_by_ids(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.post("delete", &json!({ "ids": ids })).await?;
        Ok(())
    }

    async fn delete_by_filter(&self, filter: &MetaMap) -> Result<()> {
        let Some(where_clause) = build_where(filter) else {
            bail!("refusing to delete with an empty filter");
        };
        self.post("delete", &json!({ "where": where_clause })).await?;
        Ok(())
    }
}

/// Ids that appear more than once in the batch, in first-seen order.
fn find_duplicate_ids(records: &[VectorRecord]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut dups = Vec::new();
    for record in records {
        if !seen.insert(record.id.as_str()) && !dups.contains(&record.id) {
            dups.push(record.id.clone());
        }
    }
    dups
}

/// Translates a flat filter into a Chroma `where` clause. `None` when the
/// filter is empty.
fn build_where(filter: &MetaMap) -> Option<Value> {
    match filter.len() {
        0 => None,
        1 => {
            let (key, value) = filter.iter().next().unwrap();
            Some(json!({ key: { "$eq": value } }))
        }
        _ => {
            let clauses: Vec<Value> = filter
                .iter()
                .map(|(key, value)| json!({ key: { "$eq": value } }))
                .collect();
            Some(json!({ "$and": clauses }))
        }
    }
}

/// Chroma `query` responses are nested one level per query embedding; we
/// always send exactly one.
fn parse_query_response(response: &Value) -> Result<Vec<SearchHit>> {
    let ids = first_row(response, "ids").context("vector store response missing ids")?;
    let documents = first_row(response, "documents").unwrap_or_default();
    let metadatas = first_row(response, "metadatas").unwrap_or_default();
    let distances = first_row(response, "distances").unwrap_or_default();

    let mut hits = Vec::with_capacity(ids.len());
    for (i, id) in ids.iter().enumerate() {
        let id = id.as_str().context("non-string id in vector store response")?;
        let distance = distances
            .get(i)
            .and_then(|d| d.as_f64())
            .with_context(|| format!("vector store hit {id} has no distance"))?;
        hits.push(SearchHit {
            id: id.to_string(),
            content: documents
                .get(i)
                .and_then(|d| d.as_str())
                .unwrap_or_default()
                .to_string(),
            score: (1.0 - distance) as f32,
            metadata: metadatas
                .get(i)
                .and_then(|m| m.as_object())
                .cloned()
                .unwrap_or_default(),
        });
    }
    Ok(hits)
}

/// Chroma `get` responses are flat (no per-query nesting, no distances).
fn parse_get_response(response: &Value) -> Result<Vec<SearchHit>> {
    let empty = Vec::new();
    let ids = response
        .get("ids")
        .and_then(|v| v.as_array())
        .unwrap_or(&empty);
    let documents = response
        .get("documents")
        .and_then(|v| v.as_array())
        .unwrap_or(&empty);
    let metadatas = response
        .get("metadatas")
        .and_then(|v| v.as_array())
        .unwrap_or(&empty);

    let mut hits = Vec::with_capacity(ids.len());
    for (i, id) in ids.iter().enumerate() {
        let id = id.as_str().context("non-string id in vector store response")?;
        hits.push(SearchHit {
            id: id.to_string(),
            content: documents
                .get(i)
                .and_then(|d| d.as_str())
                .unwrap_or_default()
                .to_string(),
            score: 0.0,
            metadata: metadatas
                .get(i)
                .and_then(|m| m.as_object())
                .cloned()
                .unwrap_or_default(),
        });
    }
    Ok(hits)
}

fn first_row(response: &Value, field: &str) -> Option<Vec<Value>> {
    response
        .get(field)?
        .as_array()?
        .first()?
        .as_array()
        .cloned()
}
