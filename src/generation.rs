//! Generative model clients.
//!
//! A [`Generator`] turns one prompt into one completion. There is no token
//! streaming at this layer: the call is a single blocking unit even though
//! the outer HTTP response is streamed.
//!
//! | Config Value | Implementation | Endpoint |
//! |-------------|----------------|----------|
//! | `"disabled"` | [`DisabledGenerator`] | - |
//! | `"gemini"` | [`GeminiGenerator`] | `models/{model}:generateContent` |
//! | `"openai"` | [`OpenAIGenerator`] | `/v1/chat/completions` |
//! | `"ollama"` | [`OllamaGenerator`] | `/api/generate` |

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::config::Config;
use crate::http::{client, post_json_with_retry};

/// A text generation backend.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Model identifier sent with each request.
    fn model_name(&self) -> &str;

    /// Generate a completion for `prompt`.
    async fn generate(&self, prompt: &str) -> Result<String>;
}

pub struct DisabledGenerator;

#[async_trait]
impl Generator for DisabledGenerator {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn generate(&self, _prompt: &str) -> Result<String> {
        bail!("Generation provider is disabled")
    }
}

/// Gemini `generateContent`. Requires `GEMINI_API_KEY`.
pub struct GeminiGenerator {
    client: reqwest::Client,
    model: String,
    url: String,
    api_key: String,
    max_retries: u32,
}

impl GeminiGenerator {
    pub fn new(config: &Config) -> Result<Self> {
        let api_key = std::env::var("GEMINI_API_KEY")
            .map_err(|_| anyhow::anyhow!("GEMINI_API_KEY environment variable not set"))?;
        Ok(Self {
            client: client(config.generation.timeout_secs)?,
            model: config.generation_model(),
            url: config
                .generation
                .url
                .clone()
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com".to_string()),
            api_key,
            max_retries: config.generation.max_retries,
        })
    }
}

#[async_trait]
impl Generator for GeminiGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
        });
        let json = post_json_with_retry(
            &self.client,
            &format!("{}/v1beta/models/{}:generateContent", self.url, self.model),
            &[("x-goog-api-key", self.api_key.clone())],
            &body,
            self.max_retries,
            "Gemini",
        )
        .await?;
        parse_gemini_response(&json)
    }
}

/// Concatenates the text parts of the first candidate.
fn parse_gemini_response(json: &serde_json::Value) -> Result<String> {
    let parts = json
        .pointer("/candidates/0/content/parts")
        .and_then(|p| p.as_array())
        .ok_or_else(|| {
            let reason = json
                .pointer("/promptFeedback/blockReason")
                .and_then(|r| r.as_str())
                .unwrap_or("no candidates");
            anyhow::anyhow!("Invalid Gemini response: {}", reason)
        })?;

    Ok(parts
        .iter()
        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
        .collect::<Vec<_>>()
        .join(""))
}

/// OpenAI chat completions. Requires `OPENAI_API_KEY`.
pub struct OpenAIGenerator {
    client: reqwest::Client,
    model: String,
    url: String,
    api_key: String,
    max_retries: u32,
}

impl OpenAIGenerator {
    pub fn new(config: &Config) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        Ok(Self {
            client: client(config.generation.timeout_secs)?,
            model: config.generation_model(),
            url: config
                .generation
                .url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com".to_string()),
            api_key,
            max_retries: config.generation.max_retries,
        })
    }
}

#[async_trait]
impl Generator for OpenAIGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
        });
        let json = post_json_with_retry(
            &self.client,
            &format!("{}/v1/chat/completions", self.url),
            &[("Authorization", format!("Bearer {}", self.api_key))],
            &body,
            self.max_retries,
            "OpenAI",
        )
        .await?;
        json.pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing message content"))
    }
}

/// Ollama `/api/generate` with streaming disabled.
pub struct OllamaGenerator {
    client: reqwest::Client,
    model: String,
    url: String,
    max_retries: u32,
}

impl OllamaGenerator {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            client: client(config.generation.timeout_secs)?,
            model: config.generation_model(),
            url: config
                .generation
                .url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            max_retries: config.generation.max_retries,
        })
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
        });
        let json = post_json_with_retry(
            &self.client,
            &format!("{}/api/generate", self.url),
            &[],
            &body,
            self.max_retries,
            "Ollama",
        )
        .await?;
        json.get("response")
            .and_then(|r| r.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing response"))
    }
}

/// Create the [`Generator`] named by `generation.provider`.
pub fn create_generator(config: &Config) -> Result<Box<dyn Generator>> {
    match config.generation.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledGenerator)),
        "gemini" => Ok(Box::new(GeminiGenerator::new(config)?)),
        "openai" => Ok(Box::new(OpenAIGenerator::new(config)?)),
        "ollama" => Ok(Box::new(OllamaGenerator::new(config)?)),
        other => bail!("Unknown generation provider: {}", other),
    }
}
