// src/embed/mod.rs
// EmbeddingProvider capability: a small trait plus an enum-dispatch client that wraps
// whichever concrete backend the factory resolved. `initialize()` is idempotent and
// never throws on backend unavailability — it just marks the backend unavailable so
// callers degrade to FTS-only search instead of failing the whole indexing run.

pub mod ollama;
pub mod openai;

use async_trait::async_trait;

use crate::config::{Config, EmbeddingProviderKind};
use crate::error::{MemoryError, Result};

#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub provider: &'static str,
    pub model: String,
    pub dimensions: usize,
    pub available: bool,
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn initialize(&mut self);
    fn is_available(&self) -> bool;
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
    fn model_info(&self) -> ModelInfo;
    fn batch_size(&self) -> usize;
}

enum Backend {
    OpenAi(openai::OpenAiEmbedder),
    Ollama(ollama::OllamaEmbedder),
    Disabled,
}

/// Enum-dispatch wrapper so call sites hold one concrete type regardless of which
/// backend the factory picked.
pub struct EmbeddingClient {
    backend: Backend,
}

impl EmbeddingClient {
    pub fn disabled() -> Self {
        Self { backend: Backend::Disabled }
    }

    /// Resolve configuration (already layered by `Config::load`) and build a client.
    /// `OpenAi`/`Ollama` are tried as requested; `Auto` tries OpenAI first (if an API
    /// key is present), then Ollama, then falls back to `Disabled`.
    pub async fn from_config(cfg: &Config) -> Self {
        let mut client = match cfg.embedding.provider {
            EmbeddingProviderKind::Disabled => Self::disabled(),
            EmbeddingProviderKind::OpenAi => Self {
                backend: Backend::OpenAi(openai::OpenAiEmbedder::from_config(cfg)),
            },
            EmbeddingProviderKind::Ollama => Self {
                backend: Backend::Ollama(ollama::OllamaEmbedder::from_config(cfg)),
            },
            EmbeddingProviderKind::Auto => {
                if cfg.embedding.api_key.is_some() {
                    Self {
                        backend: Backend::OpenAi(openai::OpenAiEmbedder::from_config(cfg)),
                    }
                } else {
                    Self {
                        backend: Backend::Ollama(ollama::OllamaEmbedder::from_config(cfg)),
                    }
                }
            }
        };
        client.initialize().await;

        if !client.is_available() && matches!(cfg.embedding.provider, EmbeddingProviderKind::Auto) {
            tracing::info!("preferred embedding backend unavailable, falling back to Ollama");
            let mut fallback = Self {
                backend: Backend::Ollama(ollama::OllamaEmbedder::from_config(cfg)),
            };
            fallback.initialize().await;
            if fallback.is_available() {
                return fallback;
            }
            tracing::warn!("no embedding backend available, search will be FTS-only");
        }
        client
    }

    pub async fn initialize(&mut self) {
        match &mut self.backend {
            Backend::OpenAi(e) => e.initialize().await,
            Backend::Ollama(e) => e.initialize().await,
            Backend::Disabled => {}
        }
    }

    pub fn is_available(&self) -> bool {
        match &self.backend {
            Backend::OpenAi(e) => e.is_available(),
            Backend::Ollama(e) => e.is_available(),
            Backend::Disabled => false,
        }
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        match &self.backend {
            Backend::OpenAi(e) => e.embed(text).await,
            Backend::Ollama(e) => e.embed(text).await,
            Backend::Disabled => Err(MemoryError::Embedding("no embedding backend configured".into())),
        }
    }

    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        match &self.backend {
            Backend::OpenAi(e) => e.embed_batch(texts).await,
            Backend::Ollama(e) => e.embed_batch(texts).await,
            Backend::Disabled => Err(MemoryError::Embedding("no embedding backend configured".into())),
        }
    }

    pub fn model_info(&self) -> ModelInfo {
        match &self.backend {
            Backend::OpenAi(e) => e.model_info(),
            Backend::Ollama(e) => e.model_info(),
            Backend::Disabled => ModelInfo { provider: "none", model: String::new(), dimensions: 0, available: false },
        }
    }

    pub fn batch_size(&self) -> usize {
        match &self.backend {
            Backend::OpenAi(e) => e.batch_size(),
            Backend::Ollama(e) => e.batch_size(),
            Backend::Disabled => 32,
        }
    }
}

/// Shared retry policy for HTTP-backed providers (§4.6): exponential backoff from 1s,
/// doubling to a 32s cap, 6 attempts total. Any 4xx other than 429 fails fast.
pub(crate) const RETRY_DELAYS_SECS: [u64; 6] = [1, 2, 4, 8, 16, 32];

pub(crate) fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    status.as_u16() == 429 || status.is_server_error()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_client_reports_unavailable() {
        let client = EmbeddingClient::disabled();
        assert!(!client.is_available());
        assert!(client.embed("hi").await.is_err());
    }

    #[test]
    fn test_retry_delays_double_up_to_cap() {
        assert_eq!(RETRY_DELAYS_SECS, [1, 2, 4, 8, 16, 32]);
    }

    #[test]
    fn test_is_retryable_status() {
        assert!(is_retryable_status(reqwest::StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(reqwest::StatusCode::INTERNAL_SERVER_ERROR));
        assert!(!is_retryable_status(reqwest::StatusCode::BAD_REQUEST));
        assert!(!is_retryable_status(reqwest::StatusCode::UNAUTHORIZED));
    }
}
