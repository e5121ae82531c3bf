//! TOML configuration.
//!
//! Every section has defaults, so an empty file (or no file at all) gives a
//! working local setup: in-memory store, keyword retrieval, Gemini
//! generation. See `config/rag.example.toml` for all options.
//!
//! Environment overrides applied by [`load_config`]:
//!
//! | Variable | Effect |
//! |----------|--------|
//! | `PORT` | bind to `0.0.0.0:$PORT` |
//! | `WEAVIATE_PORT` | port of the default Weaviate host when `store.url` is unset |
//!
//! API keys are read from the environment by the providers themselves
//! (`GEMINI_API_KEY`, `OPENAI_API_KEY`) and never from the file.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Sentence units per chunk.
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    /// Sentence units shared by consecutive chunks.
    #[serde(default = "default_overlap")]
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            overlap: default_overlap(),
        }
    }
}

fn default_window_size() -> usize {
    15
}
fn default_overlap() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Number of passages requested from similarity search.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
        }
    }
}

fn default_top_k() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Base URL override; each provider has its own default.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_embedding_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_generation_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_generation_retries")]
    pub max_retries: u32,
    #[serde(default = "default_generation_timeout")]
    pub timeout_secs: u64,
    /// Replaces the built-in RAG instruction block.
    #[serde(default)]
    pub instructions: Option<String>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_generation_provider(),
            model: None,
            url: None,
            max_retries: default_generation_retries(),
            timeout_secs: default_generation_timeout(),
            instructions: None,
        }
    }
}

fn default_generation_provider() -> String {
    "gemini".to_string()
}
fn default_generation_retries() -> u32 {
    3
}
fn default_generation_timeout() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_store_provider")]
    pub provider: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_class_name")]
    pub class_name: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_store_retries")]
    pub max_retries: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            provider: default_store_provider(),
            url: None,
            class_name: default_class_name(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_store_retries(),
        }
    }
}

fn default_store_provider() -> String {
    "memory".to_string()
}
fn default_class_name() -> String {
    "Documents".to_string()
}
fn default_store_retries() -> u32 {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string(), "**/*.txt".to_string()]
}
fn default_max_upload_bytes() -> usize {
    32 << 20
}

impl Config {
    /// Resolved generation model, falling back to the provider's default.
    pub fn generation_model(&self) -> String {
        if let Some(m) = &self.generation.model {
            return m.clone();
        }
        match self.generation.provider.as_str() {
            "openai" => "gpt-4o-mini".to_string(),
            "ollama" => "llama3.2".to_string(),
            _ => "gemini-1.5-flash".to_string(),
        }
    }

    /// Resolved Weaviate base URL.
    pub fn weaviate_url(&self) -> String {
        match &self.store.url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => {
                let port = std::env::var("WEAVIATE_PORT")
                    .ok()
                    .filter(|p| !p.is_empty())
                    .unwrap_or_else(|| "9035".to_string());
                format!("http://weaviate-db:{}", port)
            }
        }
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.chunking.window_size == 0 {
            anyhow::bail!("chunking.window_size must be > 0");
        }
        if self.chunking.overlap >= self.chunking.window_size {
            anyhow::bail!(
                "chunking.overlap ({}) must be smaller than chunking.window_size ({})",
                self.chunking.overlap,
                self.chunking.window_size
            );
        }
        if self.retrieval.top_k == 0 {
            anyhow::bail!("retrieval.top_k must be >= 1");
        }
        if self.embedding.batch_size == 0 {
            anyhow::bail!("embedding.batch_size must be >= 1");
        }

        match self.embedding.provider.as_str() {
            "disabled" | "gemini" | "openai" | "ollama" => {}
            other => anyhow::bail!(
                "Unknown embedding provider: '{}'. Must be disabled, gemini, openai, or ollama.",
                other
            ),
        }
        match self.generation.provider.as_str() {
            "disabled" | "gemini" | "openai" | "ollama" => {}
            other => anyhow::bail!(
                "Unknown generation provider: '{}'. Must be disabled, gemini, openai, or ollama.",
                other
            ),
        }
        match self.store.provider.as_str() {
            "memory" => {}
            "weaviate" => {
                if !self.embedding.is_enabled() {
                    anyhow::bail!("store.provider 'weaviate' requires an embedding provider");
                }
            }
            other => anyhow::bail!(
                "Unknown store provider: '{}'. Must be memory or weaviate.",
                other
            ),
        }

        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("PORT") {
            if !port.is_empty() {
                self.server.bind = format!("0.0.0.0:{}", port);
            }
        }
    }
}

/// Parse a config from TOML text and validate it.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}

/// Load the config file, falling back to defaults when it does not exist.
pub fn load_config(path: &Path) -> Result<Config> {
    let mut config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content).with_context(|| "Failed to parse config file")?
    } else {
        tracing::info!(path = %path.display(), "config file not found, using defaults");
        Config::default()
    };

    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}
