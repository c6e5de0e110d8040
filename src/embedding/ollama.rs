//! Local subprocess-daemon embedding provider: Ollama's HTTP API (spec §4.8).

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use super::{truncate_for_provider, EmbeddingProvider, ModelProfile};
use crate::error::Result;
use crate::rate_limiter::{looks_rate_limited, RateLimiter};

const DEFAULT_BASE_URL: &str = "http://localhost:11434";
const DEFAULT_MODEL: &str = "nomic-embed-text";
const DIMENSIONS: usize = 768;

#[derive(Deserialize)]
struct OllamaEmbedResponse {
    embedding: Vec<f32>,
}

pub struct OllamaProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
    limiter: Arc<RateLimiter>,
}

impl OllamaProvider {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: std::env::var("PAMPAX_OLLAMA_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
            model: std::env::var("PAMPAX_OLLAMA_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
            limiter,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    async fn init(&mut self) -> Result<()> {
        Ok(())
    }

    async fn generate(&self, text: &str) -> Result<Vec<f32>> {
        let text = truncate_for_provider(text, self.profile().max_chunk_chars).into_owned();
        let url = format!("{}/api/embeddings", self.base_url.trim_end_matches('/'));

        let result = self
            .limiter
            .execute(
                "ollama.embeddings",
                || {
                    let client = self.client.clone();
                    let url = url.clone();
                    let model = self.model.clone();
                    let prompt = text.clone();
                    async move {
                        let resp = client
                            .post(&url)
                            .json(&serde_json::json!({ "model": model, "prompt": prompt }))
                            .send()
                            .await
                            .map_err(|e| e.to_string())?;
                        let status = resp.status();
                        if !status.is_success() {
                            return Err(format!("ollama returned status {status}"));
                        }
                        resp.json::<OllamaEmbedResponse>().await.map_err(|e| e.to_string())
                    }
                },
                |e: &String| looks_rate_limited(e, None),
            )
            .await?;

        Ok(result.embedding)
    }

    fn dimensions(&self) -> usize {
        DIMENSIONS
    }

    fn name(&self) -> &'static str {
        "ollama"
    }

    fn model_name(&self) -> Option<String> {
        Some(self.model.clone())
    }

    fn profile(&self) -> ModelProfile {
        ModelProfile {
            max_tokens: 8192,
            optimal_tokens: 300,
            min_chunk_tokens: 20,
            max_chunk_tokens: 700,
            overlap_tokens: 40,
            max_chunk_chars: 32_000,
            dimensions: DIMENSIONS,
            use_tokens: false,
            tokenizer_type: "char_estimate",
        }
        .with_env_overrides()
    }
}
