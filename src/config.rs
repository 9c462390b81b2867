// src/config.rs
// Layered configuration: env override > project file > home file > built-in default.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Top-level configuration for the memory engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub embedding: EmbeddingConfig,
    pub chunking: ChunkingConfig,
    pub rerank: RerankConfig,
    pub indexing: IndexingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            embedding: EmbeddingConfig::default(),
            chunking: ChunkingConfig::default(),
            rerank: RerankConfig::default(),
            indexing: IndexingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DbMode {
    #[default]
    Single,
    PerProject,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub db_path: Option<PathBuf>,
    pub db_mode: DbMode,
    pub cache_size_kb: i64,
    /// mmap window in bytes; 0 disables.
    pub mmap_size: i64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            db_mode: DbMode::Single,
            cache_size_kb: 64 * 1024,
            mmap_size: 1024 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum EmbeddingProviderKind {
    #[default]
    Auto,
    OpenAi,
    Ollama,
    Disabled,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProviderKind,
    pub model: Option<String>,
    pub dimensions: Option<usize>,
    pub base_url: Option<String>,
    /// Always sourced from env at call sites, never persisted to a config file.
    #[serde(skip)]
    pub api_key: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderKind::Auto,
            model: None,
            dimensions: None,
            base_url: None,
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStrategy {
    #[default]
    Sentence,
    SlidingWindow,
    Disabled,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub enabled: bool,
    pub strategy: ChunkStrategy,
    pub chunk_size: usize,
    pub overlap: f32,
    pub min_chunk_size: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: ChunkStrategy::Sentence,
            chunk_size: 512,
            overlap: 0.20,
            min_chunk_size: 200,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RerankConfig {
    pub enabled: bool,
    pub weight_vector: f64,
    pub weight_fts: f64,
    pub k: f64,
    pub overlap_boost: f64,
    pub min_similarity_floor: Option<f64>,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            weight_vector: 0.6,
            weight_fts: 0.4,
            k: 60.0,
            overlap_boost: 0.05,
            min_similarity_floor: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum McpExclusionMode {
    #[default]
    Off,
    SelfOnly,
    AllMcp,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct IndexingConfig {
    pub exclude_mcp_conversations: McpExclusionMode,
    pub exclude_mcp_servers: Vec<String>,
}

impl Config {
    /// Resolve configuration: env override > project-local file > home file > defaults.
    ///
    /// `project_dir` is the project root to look for `.mira-memory.toml` in; pass `None`
    /// to skip the project-file layer (e.g. for cross-project commands).
    pub fn load(project_dir: Option<&Path>) -> Self {
        let mut cfg = Self::default();

        if let Some(home) = dirs::home_dir() {
            let home_file = home.join(".config/mira-memory/config.toml");
            if let Some(loaded) = Self::read_file(&home_file) {
                cfg = loaded;
            }
        }

        if let Some(dir) = project_dir {
            let project_file = dir.join(".mira-memory.toml");
            if let Some(loaded) = Self::read_file(&project_file) {
                cfg = loaded;
            }
        }

        cfg.apply_env_overrides();
        cfg
    }

    fn read_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }
        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(parsed) => {
                    debug!(path = %path.display(), "loaded config file");
                    Some(parsed)
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "malformed config file, ignoring");
                    None
                }
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read config file, ignoring");
                None
            }
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(p) = std::env::var("MIRA_MEMORY_DB_PATH") {
            self.store.db_path = Some(PathBuf::from(p));
        }
        if let Ok(v) = std::env::var("MIRA_MEMORY_DB_MODE") {
            self.store.db_mode = match v.as_str() {
                "per-project" => DbMode::PerProject,
                _ => DbMode::Single,
            };
        }
        if let Ok(v) = std::env::var("MIRA_MEMORY_EMBEDDING_PROVIDER") {
            self.embedding.provider = match v.as_str() {
                "openai" => EmbeddingProviderKind::OpenAi,
                "ollama" => EmbeddingProviderKind::Ollama,
                "disabled" => EmbeddingProviderKind::Disabled,
                _ => EmbeddingProviderKind::Auto,
            };
        }
        if let Ok(v) = std::env::var("MIRA_MEMORY_EMBEDDING_MODEL") {
            self.embedding.model = Some(v);
        }
        if let Ok(v) = std::env::var("MIRA_MEMORY_EMBEDDING_BASE_URL") {
            self.embedding.base_url = Some(v);
        }
        self.embedding.api_key = read_env_key("OPENAI_API_KEY");
        if self.embedding.api_key.is_none() {
            self.embedding.api_key = read_env_key("MIRA_MEMORY_EMBEDDING_API_KEY");
        }
    }
}

fn read_env_key(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.store.db_mode, DbMode::Single);
        assert!(cfg.chunking.enabled);
        assert!(cfg.rerank.enabled);
    }

    #[test]
    fn test_read_file_missing_returns_none() {
        let missing = PathBuf::from("/nonexistent/path/mira-memory-test.toml");
        assert!(Config::read_file(&missing).is_none());
    }

    #[test]
    fn test_read_file_malformed_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "this is not [valid toml").unwrap();
        assert!(Config::read_file(&path).is_none());
    }

    #[test]
    fn test_read_file_parses_partial_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[chunking]\nchunk_size = 1024\n").unwrap();
        let cfg = Config::read_file(&path).expect("should parse");
        assert_eq!(cfg.chunking.chunk_size, 1024);
        // Untouched sections still carry defaults.
        assert!(cfg.rerank.enabled);
    }
}
