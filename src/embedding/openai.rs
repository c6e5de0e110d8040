//! Remote OpenAI-compatible embedding provider: `POST <base>/embeddings` (spec §4.8).

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use super::{truncate_for_provider, EmbeddingProvider, ModelProfile};
use crate::error::{PampaError, Result};
use crate::rate_limiter::{looks_rate_limited, RateLimiter};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "text-embedding-3-small";
const DIMENSIONS: usize = 1536;

#[derive(Deserialize)]
struct OpenAiEmbedResponse {
    data: Vec<OpenAiEmbedItem>,
}

#[derive(Deserialize)]
struct OpenAiEmbedItem {
    embedding: Vec<f32>,
}

pub struct OpenAiCompatibleProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    limiter: Arc<RateLimiter>,
}

impl OpenAiCompatibleProvider {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
            model: std::env::var("PAMPAX_OPENAI_EMBEDDING_MODEL")
                .or_else(|_| std::env::var("OPENAI_MODEL"))
                .unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
            api_key: std::env::var("OPENAI_API_KEY").ok(),
            limiter,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiCompatibleProvider {
    async fn init(&mut self) -> Result<()> {
        if self.api_key.is_none() {
            return Err(PampaError::SearchError {
                reason: "OPENAI_API_KEY is not set".to_string(),
            });
        }
        Ok(())
    }

    async fn generate(&self, text: &str) -> Result<Vec<f32>> {
        let Some(api_key) = self.api_key.clone() else {
            return Err(PampaError::SearchError { reason: "OPENAI_API_KEY is not set".to_string() });
        };
        let text = truncate_for_provider(text, self.profile().max_chunk_chars).into_owned();
        let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));

        let result = self
            .limiter
            .execute(
                "openai.embeddings",
                || {
                    let client = self.client.clone();
                    let url = url.clone();
                    let model = self.model.clone();
                    let input = text.clone();
                    let api_key = api_key.clone();
                    async move {
                        let resp = client
                            .post(&url)
                            .bearer_auth(api_key)
                            .json(&serde_json::json!({ "model": model, "input": input }))
                            .send()
                            .await
                            .map_err(|e| e.to_string())?;
                        let status = resp.status();
                        if !status.is_success() {
                            return Err(format!("openai embeddings returned status {status}"));
                        }
                        resp.json::<OpenAiEmbedResponse>().await.map_err(|e| e.to_string())
                    }
                },
                |e: &String| looks_rate_limited(e, None),
            )
            .await?;

        result.data.into_iter().next().map(|item| item.embedding).ok_or_else(|| PampaError::SearchError {
            reason: "openai returned an empty embeddings array".to_string(),
        })
    }

    fn dimensions(&self) -> usize {
        DIMENSIONS
    }

    fn name(&self) -> &'static str {
        "openai"
    }

    fn model_name(&self) -> Option<String> {
        Some(self.model.clone())
    }

    fn profile(&self) -> ModelProfile {
        ModelProfile {
            max_tokens: 8191,
            optimal_tokens: 300,
            min_chunk_tokens: 20,
            max_chunk_tokens: 700,
            overlap_tokens: 40,
            max_chunk_chars: 32_000,
            dimensions: DIMENSIONS,
            use_tokens: true,
            tokenizer_type: "cl100k_base",
        }
        .with_env_overrides()
    }
}
