//! HTTP embedding providers.
//!
//! Concrete [`Embedder`] implementations behind `[embedding] provider`:
//!
//! | Config Value | Provider | Endpoint |
//! |-------------|----------|----------|
//! | `"disabled"` | none | |
//! | `"openai"` | [`OpenAiEmbedder`] | `POST {base_url}/embeddings` (batched) |
//! | `"ollama"` | [`OllamaEmbedder`] | `POST {base_url}/api/embeddings` (one text per call) |
//!
//! Providers never return errors: a failed request is logged at `warn`
//! and yields `None` for the whole batch, and an unusable vector yields
//! `None` in its slot. Returned vectors are unit-normalized.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use docmirror_core::embedding::{normalize_vector, trim_input, Embedder};

use crate::config::EmbeddingConfig;

pub const DEFAULT_OPENAI_MODEL: &str = "text-embedding-3-small";
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_OLLAMA_MODEL: &str = "nomic-embed-text";
pub const DEFAULT_OLLAMA_BASE_URL: &str = "http://localhost:11434";

/// Parse a JSON number array into a vector.
fn parse_vector(value: Option<&serde_json::Value>) -> Option<Vec<f32>> {
    let values: Vec<f32> = value?
        .as_array()?
        .iter()
        .map(|v| v.as_f64().unwrap_or(f64::NAN) as f32)
        .collect();
    normalize_vector(&values)
}

fn http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

/// OpenAI-compatible embeddings API.
///
/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    model: String,
    base_url: String,
    api_key: String,
    max_chars: usize,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = match std::env::var("OPENAI_API_KEY") {
            Ok(key) if !key.trim().is_empty() => key,
            _ => bail!("OPENAI_API_KEY environment variable not set"),
        };
        Ok(Self {
            client: http_client(config.timeout_secs)?,
            model: config
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string()),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string()),
            api_key,
            max_chars: config.max_chars_per_input,
        })
    }

    async fn request(&self, inputs: &[String]) -> Result<Vec<Option<Vec<f32>>>> {
        let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "input": inputs,
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            tracing::warn!(status = %status, body = %text, "OpenAI embeddings API error");
            return Ok(vec![None; inputs.len()]);
        }

        let json: serde_json::Value = response.json().await?;
        let data = json.get("data").and_then(|d| d.as_array());
        Ok((0..inputs.len())
            .map(|i| parse_vector(data.and_then(|d| d.get(i)).and_then(|item| item.get("embedding"))))
            .collect())
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_id(&self) -> String {
        format!("openai:{}", self.model)
    }

    async fn embed(&self, texts: &[String]) -> Option<Vec<Option<Vec<f32>>>> {
        if texts.is_empty() {
            return Some(Vec::new());
        }
        let inputs: Vec<String> = texts.iter().map(|t| trim_input(t, self.max_chars)).collect();
        match self.request(&inputs).await {
            Ok(vectors) => Some(vectors),
            Err(e) => {
                tracing::warn!(model = %self.model, error = %e, "embedding request failed");
                None
            }
        }
    }
}

/// A local Ollama instance.
pub struct OllamaEmbedder {
    client: reqwest::Client,
    model: String,
    base_url: String,
    max_chars: usize,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(config.timeout_secs)?,
            model: config
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_OLLAMA_MODEL.to_string()),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_OLLAMA_BASE_URL.to_string()),
            max_chars: config.max_chars_per_input,
        })
    }

    async fn request(&self, input: &str) -> Result<Option<Vec<f32>>> {
        let url = format!("{}/api/embeddings", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "model": self.model,
                "prompt": input,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Ok(None);
        }
        let payload: serde_json::Value = response.json().await?;
        Ok(parse_vector(payload.get("embedding")))
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_id(&self) -> String {
        format!("ollama:{}", self.model)
    }

    async fn embed(&self, texts: &[String]) -> Option<Vec<Option<Vec<f32>>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            match self.request(&trim_input(text, self.max_chars)).await {
                Ok(vector) => vectors.push(vector),
                Err(e) => {
                    tracing::warn!(model = %self.model, error = %e, "embedding request failed");
                    return None;
                }
            }
        }
        Some(vectors)
    }
}

/// Build the configured embedder, or `None` when embeddings are disabled.
///
/// # Errors
///
/// Unknown provider names, and the OpenAI provider without an API key.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Option<Arc<dyn Embedder>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "openai" => Ok(Some(Arc::new(OpenAiEmbedder::new(config)?))),
        "ollama" => Ok(Some(Arc::new(OllamaEmbedder::new(config)?))),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_vector_normalizes() {
        let value = serde_json::json!([3.0, 4.0]);
        let v = parse_vector(Some(&value)).unwrap();
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_parse_vector_rejects_missing_or_zero() {
        assert!(parse_vector(None).is_none());
        assert!(parse_vector(Some(&serde_json::json!("nope"))).is_none());
        assert!(parse_vector(Some(&serde_json::json!([0.0, 0.0]))).is_none());
    }

    #[test]
    fn test_create_embedder_disabled() {
        assert!(create_embedder(&EmbeddingConfig::default()).unwrap().is_none());
    }

    #[test]
    fn test_create_embedder_ollama_defaults() {
        let config = EmbeddingConfig {
            provider: "ollama".into(),
            ..Default::default()
        };
        let embedder = create_embedder(&config).unwrap().unwrap();
        assert_eq!(embedder.model_id(), "ollama:nomic-embed-text");
    }

    #[test]
    fn test_create_embedder_unknown() {
        let config = EmbeddingConfig {
            provider: "word2vec".into(),
            ..Default::default()
        };
        assert!(create_embedder(&config).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_ollama_yields_none() {
        let config = EmbeddingConfig {
            provider: "ollama".into(),
            base_url: Some("http://127.0.0.1:1".into()),
            timeout_secs: 1,
            ..Default::default()
        };
        let embedder = OllamaEmbedder::new(&config).unwrap();
        assert!(embedder.embed(&["hello".to_string()]).await.is_none());
    }
}
