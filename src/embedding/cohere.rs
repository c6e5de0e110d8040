//! Remote Cohere embedding provider (spec §4.8).

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use super::{truncate_for_provider, EmbeddingProvider, ModelProfile};
use crate::error::{PampaError, Result};
use crate::rate_limiter::{looks_rate_limited, RateLimiter};

const DEFAULT_URL: &str = "https://api.cohere.ai/v1/embed";
const DEFAULT_MODEL: &str = "embed-english-v3.0";
const DIMENSIONS: usize = 1024;

#[derive(Deserialize)]
struct CohereEmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

pub struct CohereProvider {
    client: reqwest::Client,
    model: String,
    api_key: Option<String>,
    limiter: Arc<RateLimiter>,
}

impl CohereProvider {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self {
            client: reqwest::Client::new(),
            model: std::env::var("PAMPAX_COHERE_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
            api_key: std::env::var("COHERE_API_KEY").ok(),
            limiter,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for CohereProvider {
    async fn init(&mut self) -> Result<()> {
        if self.api_key.is_none() {
            return Err(PampaError::SearchError {
                reason: "COHERE_API_KEY is not set".to_string(),
            });
        }
        Ok(())
    }

    async fn generate(&self, text: &str) -> Result<Vec<f32>> {
        let Some(api_key) = self.api_key.clone() else {
            return Err(PampaError::SearchError { reason: "COHERE_API_KEY is not set".to_string() });
        };
        let text = truncate_for_provider(text, self.profile().max_chunk_chars).into_owned();

        let result = self
            .limiter
            .execute(
                "cohere.embed",
                || {
                    let client = self.client.clone();
                    let model = self.model.clone();
                    let text = text.clone();
                    let api_key = api_key.clone();
                    async move {
                        let resp = client
                            .post(DEFAULT_URL)
                            .bearer_auth(api_key)
                            .json(&serde_json::json!({
                                "model": model,
                                "texts": [text],
                                "input_type": "search_document",
                            }))
                            .send()
                            .await
                            .map_err(|e| e.to_string())?;
                        let status = resp.status();
                        if !status.is_success() {
                            return Err(format!("cohere embed returned status {status}"));
                        }
                        resp.json::<CohereEmbedResponse>().await.map_err(|e| e.to_string())
                    }
                },
                |e: &String| looks_rate_limited(e, None),
            )
            .await?;

        result.embeddings.into_iter().next().ok_or_else(|| PampaError::SearchError {
            reason: "cohere returned an empty embeddings array".to_string(),
        })
    }

    fn dimensions(&self) -> usize {
        DIMENSIONS
    }

    fn name(&self) -> &'static str {
        "cohere"
    }

    fn model_name(&self) -> Option<String> {
        Some(self.model.clone())
    }

    fn profile(&self) -> ModelProfile {
        ModelProfile {
            max_tokens: 512,
            optimal_tokens: 300,
            min_chunk_tokens: 20,
            max_chunk_tokens: 500,
            overlap_tokens: 40,
            max_chunk_chars: 16_000,
            dimensions: DIMENSIONS,
            use_tokens: false,
            tokenizer_type: "char_estimate",
        }
        .with_env_overrides()
    }
}
