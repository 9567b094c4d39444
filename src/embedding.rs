//! OpenAI embeddings client.
//!
//! Implements [`Embedder`] over the `POST /v1/embeddings` endpoint.
//!
//! Input handling, in order:
//! - leading/trailing whitespace is stripped and internal newlines become
//!   spaces;
//! - inputs that are empty after sanitization are dropped;
//! - each surviving input is truncated by a character heuristic (about
//!   4 characters per token) to the configured per-model cap, with a
//!   warning when truncation occurs.
//!
//! The response is re-ordered by the API's `index` field so output order
//! always matches input order. Transport and API errors propagate to the
//! caller; retries belong to the job queue, not this client.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::traits::Embedder;

const OPENAI_EMBEDDINGS_URL: &str = "https://api.openai.com/v1/embeddings";

/// Character budget per token for the truncation heuristic.
const CHARS_PER_TOKEN: usize = 4;

pub struct OpenAiEmbedder {
    client: reqwest::Client,
    config: EmbeddingConfig,
}

impl OpenAiEmbedder {
    pub fn new(config: EmbeddingConfig) -> Result<Self> {
        if config.api_key.is_none() {
            bail!("OPENAI_API_KEY is not set");
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let inputs = prepare_inputs(texts, self.config.max_tokens);
        if inputs.is_empty() {
            return Ok(Vec::new());
        }

        let api_key = self
            .config
            .api_key
            .as_deref()
            .context("OPENAI_API_KEY is not set")?;

        let body = serde_json::json!({
            "model": self.config.model,
            "input": inputs,
        });

        let mut request = self
            .client
            .post(OPENAI_EMBEDDINGS_URL)
            .bearer_auth(api_key)
            .json(&body);
        if let Some(org) = &self.config.organization_id {
            request = request.header("OpenAI-Organization", org);
        }
        if let Some(project) = &self.config.project_id {
            request = request.header("OpenAI-Project", project);
        }

        let response = request
            .send()
            .await
            .context("embedding request failed to send")?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("embedding API error {}: {}", status, body_text);
        }

        let json: serde_json::Value = response
            .json()
            .await
            .context("embedding response was not valid JSON")?;
        let vectors = parse_embeddings_response(&json)?;

        if vectors.len() != inputs.len() {
            bail!(
                "embedding API returned {} vectors for {} inputs",
                vectors.len(),
                inputs.len()
            );
        }
        Ok(vectors)
    }
}

/// Sanitizes and truncates inputs, dropping empties.
fn prepare_inputs(texts: &[String], max_tokens: usize) -> Vec<String> {
    let max_chars = max_tokens * CHARS_PER_TOKEN;
    texts
        .iter()
        .filter_map(|text| {
            let sanitized = text.trim().replace('\n', " ");
            if sanitized.is_empty() {
                return None;
            }
            Some(truncate_chars(&sanitized, max_chars))
        })
        .collect()
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    tracing::warn!(
        chars = text.chars().count(),
        max_chars,
        "truncating embedding input to model context"
    );
    text.chars().take(max_chars).collect()
}

/// Extracts `data[].embedding`, ordered by `data[].index`.
fn parse_embeddings_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .context("embedding response missing data array")?;

    let mut indexed: Vec<(usize, Vec<f32>)> = Vec::with_capacity(data.len());
    for item in data {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .context("embedding response item missing index")? as usize;
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .context("embedding response item missing embedding")?;
        let vector: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        indexed.push((index, vector));
    }

    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_inputs_strips_and_collapses_newlines() {
        let texts = vec!["  fn main() {\n    run()\n}  ".to_string()];
        let out = prepare_inputs(&texts, 8_000);
        assert_eq!(out, vec!["fn main() {     run() }"]);
    }

    #[test]
    fn prepare_inputs_drops_empty_after_sanitization() {
        let texts = vec![
            "real content".to_string(),
            "   ".to_string(),
            "\n\n".to_string(),
            "".to_string(),
        ];
        let out = prepare_inputs(&texts, 8_000);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn prepare_inputs_truncates_by_char_heuristic() {
        // max_tokens 2 → 8 chars
        let texts = vec!["abcdefghijkl".to_string()];
        let out = prepare_inputs(&texts, 2);
        assert_eq!(out, vec!["abcdefgh"]);
    }

    #[test]
    fn parse_response_orders_by_index() {
        let json = serde_json::json!({
            "data": [
                { "index": 1, "embedding": [0.5, 0.5] },
                { "index": 0, "embedding": [1.0, 0.0] },
            ]
        });
        let vectors = parse_embeddings_response(&json).unwrap();
        assert_eq!(vectors[0], vec![1.0, 0.0]);
        assert_eq!(vectors[1], vec![0.5, 0.5]);
    }

    #[test]
    fn parse_response_rejects_missing_embedding() {
        let json = serde_json::json!({ "data": [{ "index": 0 }] });
        assert!(parse_embeddings_response(&json).is_err());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let text = "αβγδε";
        assert_eq!(truncate_chars(text, 3), "αβγ");
        assert_eq!(truncate_chars(text, 10), "αβγδε");
    }
}
