// src/embed/ollama.rs
// Local Ollama embeddings backend. No API key; availability is determined by probing
// the server's `/api/tags` endpoint once at initialize() time.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{MemoryError, Result};

use super::{is_retryable_status, ModelInfo, RETRY_DELAYS_SECS};

const DEFAULT_MODEL: &str = "nomic-embed-text";
const DEFAULT_DIMENSIONS: usize = 768;
const DEFAULT_BASE_URL: &str = "http://localhost:11434";
const BATCH_SIZE: usize = 16;

pub struct OllamaEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dimensions: usize,
    available: bool,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

impl OllamaEmbedder {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: cfg.embedding.base_url.clone().unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            model: cfg.embedding.model.clone().unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            dimensions: cfg.embedding.dimensions.unwrap_or(DEFAULT_DIMENSIONS),
            available: false,
        }
    }

    async fn probe(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url.trim_end_matches('/'));
        matches!(self.client.get(&url).send().await, Ok(r) if r.status().is_success())
    }

    async fn post_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/api/embed", self.base_url.trim_end_matches('/'));
        let body = EmbedRequest { model: &self.model, input: inputs };

        let mut last_err = None;
        for (attempt, delay_secs) in RETRY_DELAYS_SECS.iter().enumerate() {
            let resp = self.client.post(&url).json(&body).send().await;
            match resp {
                Ok(r) if r.status().is_success() => {
                    let parsed: EmbedResponse = r.json().await.map_err(MemoryError::Http)?;
                    return Ok(parsed.embeddings);
                }
                Ok(r) if is_retryable_status(r.status()) => {
                    let status = r.status();
                    tracing::warn!(attempt = attempt + 1, %status, "Ollama embed request retrying");
                    last_err = Some(MemoryError::Embedding(format!("Ollama returned {status}")));
                    tokio::time::sleep(std::time::Duration::from_secs(*delay_secs)).await;
                }
                Ok(r) => {
                    let status = r.status();
                    return Err(MemoryError::Embedding(format!("Ollama returned {status}")));
                }
                Err(e) => return Err(MemoryError::Http(e)),
            }
        }
        Err(last_err.unwrap_or_else(|| MemoryError::Embedding("Ollama embeddings retries exhausted".into())))
    }
}

#[async_trait]
impl super::EmbeddingProvider for OllamaEmbedder {
    async fn initialize(&mut self) {
        self.available = self.probe().await;
        if !self.available {
            tracing::debug!(base_url = %self.base_url, "Ollama server unreachable, marking unavailable");
        }
    }

    fn is_available(&self) -> bool {
        self.available
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut results = self.post_batch(std::slice::from_ref(&text.to_string())).await?;
        results
            .pop()
            .ok_or_else(|| MemoryError::Embedding("Ollama returned no embeddings".into()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut all = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(BATCH_SIZE) {
            all.extend(self.post_batch(chunk).await?);
        }
        Ok(all)
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            provider: "ollama",
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
    fn test_from_config_uses_defaults() {
        let cfg = Config::default();
        let embedder = OllamaEmbedder::from_config(&cfg);
        assert_eq!(embedder.model, DEFAULT_MODEL);
        assert_eq!(embedder.base_url, DEFAULT_BASE_URL);
        assert_eq!(embedder.dimensions, DEFAULT_DIMENSIONS);
    }
}
