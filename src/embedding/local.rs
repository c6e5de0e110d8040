//! Local in-process embedding provider, backed by `model2vec-rs` static
//! embeddings (spec §4.8 "transformers" variant). No network calls, so it
//! uses a no-op rate limiter.

use async_trait::async_trait;
use model2vec_rs::model::StaticModel;
use tokio::sync::OnceCell;

use super::{truncate_for_provider, EmbeddingProvider, ModelProfile};
use crate::error::{PampaError, Result};

const DEFAULT_MODEL: &str = "minishlab/potion-base-8M";
const DIMENSIONS: usize = 256;

pub struct LocalTransformersProvider {
    model_id: String,
    model: OnceCell<StaticModel>,
}

impl LocalTransformersProvider {
    pub fn new() -> Self {
        let model_id = std::env::var("PAMPAX_TRANSFORMERS_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        Self { model_id, model: OnceCell::new() }
    }
}

impl Default for LocalTransformersProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmbeddingProvider for LocalTransformersProvider {
    async fn init(&mut self) -> Result<()> {
        let model_id = self.model_id.clone();
        self.model
            .get_or_try_init(|| async move {
                StaticModel::from_pretrained(&model_id, None, None, None)
                    .map_err(|e| PampaError::SearchError { reason: format!("failed to load local embedding model: {e}") })
            })
            .await?;
        Ok(())
    }

    async fn generate(&self, text: &str) -> Result<Vec<f32>> {
        let Some(model) = self.model.get() else {
            return Err(PampaError::SearchError { reason: "local embedding model not initialized".to_string() });
        };
        let text = truncate_for_provider(text, self.profile().max_chunk_chars).into_owned();
        let mut embeddings = model.encode(&[text]);
        embeddings.pop().ok_or_else(|| PampaError::SearchError {
            reason: "local embedding model returned no vectors".to_string(),
        })
    }

    fn dimensions(&self) -> usize {
        DIMENSIONS
    }

    fn name(&self) -> &'static str {
        "transformers"
    }

    fn model_name(&self) -> Option<String> {
        Some(self.model_id.clone())
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
