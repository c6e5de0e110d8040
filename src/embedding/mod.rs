//! Embedding Provider (C8, spec §4.8): pluggable embedding backends behind one
//! async interface, each routed through the rate limiter (C9).

mod cohere;
mod local;
mod ollama;
mod openai;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{PampaError, Result};
use crate::rate_limiter::RateLimiter;

pub use cohere::CohereProvider;
pub use local::LocalTransformersProvider;
pub use ollama::OllamaProvider;
pub use openai::OpenAiCompatibleProvider;

/// Constants bundled per model (spec §4.8): everything the chunker, tokenizer,
/// and embedding call sites need in one place.
#[derive(Debug, Clone)]
pub struct ModelProfile {
    pub max_tokens: usize,
    pub optimal_tokens: usize,
    pub min_chunk_tokens: usize,
    pub max_chunk_tokens: usize,
    pub overlap_tokens: usize,
    pub max_chunk_chars: usize,
    pub dimensions: usize,
    pub use_tokens: bool,
    pub tokenizer_type: &'static str,
}

impl ModelProfile {
    /// Applies `PAMPAX_MAX_TOKENS` / `PAMPAX_DIMENSIONS` overrides on top of a
    /// provider's compiled-in defaults.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(raw) = std::env::var("PAMPAX_MAX_TOKENS") {
            if let Ok(v) = raw.parse() {
                self.max_tokens = v;
                self.max_chunk_tokens = v;
            }
        }
        if let Ok(raw) = std::env::var("PAMPAX_DIMENSIONS") {
            if let Ok(v) = raw.parse() {
                self.dimensions = v;
            }
        }
        self
    }
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn init(&mut self) -> Result<()>;
    async fn generate(&self, text: &str) -> Result<Vec<f32>>;
    fn dimensions(&self) -> usize;
    fn name(&self) -> &'static str;
    fn model_name(&self) -> Option<String>;
    fn profile(&self) -> ModelProfile;
}

/// Selects a provider by explicit name, or `auto` (OpenAI key -> Cohere key ->
/// local) per spec §4.8. Does not call `init()` — callers own that so failures
/// surface at a predictable point in the pipeline.
pub fn select(explicit: Option<&str>, rate_limiter: Arc<RateLimiter>) -> Result<Box<dyn EmbeddingProvider>> {
    let choice = explicit.unwrap_or("auto");
    match choice {
        "transformers" | "local" => Ok(Box::new(LocalTransformersProvider::new())),
        "ollama" => Ok(Box::new(OllamaProvider::new(rate_limiter))),
        "openai" => Ok(Box::new(OpenAiCompatibleProvider::new(rate_limiter))),
        "cohere" => Ok(Box::new(CohereProvider::new(rate_limiter))),
        "auto" => {
            if std::env::var("OPENAI_API_KEY").is_ok() {
                Ok(Box::new(OpenAiCompatibleProvider::new(rate_limiter)))
            } else if std::env::var("COHERE_API_KEY").is_ok() {
                Ok(Box::new(CohereProvider::new(rate_limiter)))
            } else {
                Ok(Box::new(LocalTransformersProvider::new()))
            }
        }
        other => Err(PampaError::SearchError {
            reason: format!("unknown embedding provider '{other}'"),
        }),
    }
}

/// Truncates `text` to at most `max_chars` UTF-8-safe characters — the
/// provider-side safety net described in spec §4.8 (the chunker should
/// already be within limits, this just guards network calls).
pub(crate) fn truncate_for_provider(text: &str, max_chars: usize) -> std::borrow::Cow<'_, str> {
    if text.chars().count() <= max_chars {
        std::borrow::Cow::Borrowed(text)
    } else {
        log::warn!("embedding input truncated to {max_chars} chars before provider call");
        std::borrow::Cow::Owned(text.chars().take(max_chars).collect())
    }
}
