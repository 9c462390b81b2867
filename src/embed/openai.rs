// src/embed/openai.rs
// OpenAI-compatible embeddings backend (also covers Azure/OpenAI-compatible proxies via
// `base_url` override). Truncates oversized inputs defensively since the API rejects
// requests over its token limit outright rather than truncating server-side.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{MemoryError, Result};

use super::{is_retryable_status, ModelInfo, RETRY_DELAYS_SECS};

const DEFAULT_MODEL: &str = "text-embedding-3-small";
const DEFAULT_DIMENSIONS: usize = 1536;
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const BATCH_SIZE: usize = 32;
/// Conservative character cap before we truncate a single input (~8191 tokens @ ~4 chars/token).
const MAX_INPUT_CHARS: usize = 32_000;

pub struct OpenAiEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dimensions: usize,
    api_key: Option<String>,
    available: bool,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponseItem {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingResponseItem>,
}

impl OpenAiEmbedder {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: cfg.embedding.base_url.clone().unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            model: cfg.embedding.model.clone().unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            dimensions: cfg.embedding.dimensions.unwrap_or(DEFAULT_DIMENSIONS),
            api_key: cfg.embedding.api_key.clone(),
            available: false,
        }
    }

    fn truncate(text: &str) -> &str {
        if text.len() <= MAX_INPUT_CHARS {
            text
        } else {
            let mut end = MAX_INPUT_CHARS;
            while end > 0 && !text.is_char_boundary(end) {
                end -= 1;
            }
            &text[..end]
        }
    }

    async fn post_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| MemoryError::Embedding("OpenAI embedder has no API key".into()))?;

        let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
        let body = EmbeddingRequest { model: &self.model, input: inputs };

        let mut last_err = None;
        for (attempt, delay_secs) in RETRY_DELAYS_SECS.iter().enumerate() {
            let resp = self
                .client
                .post(&url)
                .bearer_auth(api_key)
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(r) if r.status().is_success() => {
                    let parsed: EmbeddingResponse = r.json().await.map_err(MemoryError::Http)?;
                    return Ok(parsed.data.into_iter().map(|d| d.embedding).collect());
                }
                Ok(r) if is_retryable_status(r.status()) => {
                    let status = r.status();
                    tracing::warn!(attempt = attempt + 1, %status, "OpenAI embeddings request retrying");
                    last_err = Some(MemoryError::Embedding(format!("OpenAI returned {status}")));
                    tokio::time::sleep(std::time::Duration::from_secs(*delay_secs)).await;
                }
                Ok(r) => {
                    let status = r.status();
                    let text = r.text().await.unwrap_or_default();
                    return Err(MemoryError::Embedding(format!("OpenAI returned {status}: {text}")));
                }
                Err(e) => {
                    return Err(MemoryError::Http(e));
                }
            }
        }
        Err(last_err.unwrap_or_else(|| MemoryError::Embedding("OpenAI embeddings retries exhausted".into())))
    }
}

#[async_trait]
impl super::EmbeddingProvider for OpenAiEmbedder {
    async fn initialize(&mut self) {
        self.available = self.api_key.is_some();
        if !self.available {
            tracing::debug!("OpenAI embedder has no API key, marking unavailable");
        }
    }

    fn is_available(&self) -> bool {
        self.available
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let truncated = Self::truncate(text).to_string();
        let mut results = self.post_batch(&[truncated]).await?;
        results
            .pop()
            .ok_or_else(|| MemoryError::Embedding("OpenAI returned no embeddings".into()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut all = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(BATCH_SIZE) {
            let truncated: Vec<String> = chunk.iter().map(|t| Self::truncate(t).to_string()).collect();
            all.extend(self.post_batch(&truncated).await?);
        }
        Ok(all)
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            provider: "openai",
            model: self.model.clone(),
            dimensions: self.dimensions,
            available: self.available,
        }
    }

    fn batch_size(&self) -> usize {
        BATCH_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_leaves_short_text_untouched() {
        assert_eq!(OpenAiEmbedder::truncate("hello"), "hello");
    }

    #[test]
    fn test_truncate_caps_long_text() {
        let text = "a".repeat(MAX_INPUT_CHARS + 500);
        let truncated = OpenAiEmbedder::truncate(&text);
        assert_eq!(truncated.len(), MAX_INPUT_CHARS);
    }

    #[tokio::test]
    async fn test_unavailable_without_api_key() {
        let cfg = Config::default();
        let mut embedder = OpenAiEmbedder::from_config(&cfg);
        use super::super::EmbeddingProvider;
        embedder.initialize().await;
        assert!(!embedder.is_available());
    }
}
