//! Reranker (C13, spec §4.13): a local cross-encoder pass or a remote HTTP API,
//! selected per request or auto-detected (API configured -> API; else local).

use serde::Deserialize;

use crate::config::RerankerMode;
use crate::error::{PampaError, Result};

#[derive(Debug, Clone)]
pub struct RerankCandidate {
    pub chunk_id: String,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct RerankResult {
    pub chunk_id: String,
    pub score: f32,
    pub rank: usize,
}

const DEFAULT_MAX_TOKENS: usize = 512;

/// Reranks `candidates` against `query`, returning a stable descending sort
/// with `rank` assigned `1..N`. Callers treat any `Err` as a soft failure and
/// keep the prior ordering (spec §4.13, §7).
pub async fn rerank(mode: RerankerMode, query: &str, candidates: &[RerankCandidate]) -> Result<Vec<RerankResult>> {
    if candidates.is_empty() {
        return Ok(vec![]);
    }
    let scores = match mode {
        RerankerMode::Off => {
            return Err(PampaError::SearchError { reason: "reranker disabled".to_string() });
        }
        RerankerMode::Transformers => local_rerank(query, candidates)?,
        RerankerMode::Api => api_rerank(query, candidates).await?,
    };
    Ok(assign_ranks(scores))
}

fn assign_ranks(mut scored: Vec<(String, f32)>) -> Vec<RerankResult> {
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored
        .into_iter()
        .enumerate()
        .map(|(i, (chunk_id, score))| RerankResult { chunk_id, score, rank: i + 1 })
        .collect()
}

/// Deterministic test hook (spec §6 `PAMPAX_MOCK_RERANKER_TESTS`): when set,
/// scores by token-overlap with the query instead of loading a real model.
fn mock_enabled() -> bool {
    std::env::var("PAMPAX_MOCK_RERANKER_TESTS").map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false)
}

fn token_overlap_score(query: &str, text: &str) -> f32 {
    let q: std::collections::HashSet<&str> = query.split_whitespace().collect();
    let t: std::collections::HashSet<&str> = text.split_whitespace().collect();
    q.intersection(&t).count() as f32
}

fn truncate_tokens(text: &str, max_tokens: usize) -> String {
    text.split_whitespace().take(max_tokens).collect::<Vec<_>>().join(" ")
}

/// Cross-encoder pass over `(query, doc)` pairs. The mock path keeps this
/// module testable without bundling a real sequence-pair classifier.
fn local_rerank(query: &str, candidates: &[RerankCandidate]) -> Result<Vec<(String, f32)>> {
    let max_tokens: usize = std::env::var("PAMPAX_RERANKER_MAX_TOKENS").ok().and_then(|v| v.parse().ok()).unwrap_or(DEFAULT_MAX_TOKENS);

    if mock_enabled() {
        return Ok(candidates
            .iter()
            .map(|c| (c.chunk_id.clone(), token_overlap_score(query, &truncate_tokens(&c.text, max_tokens))))
            .collect());
    }

    // A real deployment loads a sequence-pair classifier once and runs each
    // (query, doc) pair through it. No ONNX/candle runtime is wired into this
    // build, so the local backend currently only serves the deterministic
    // mock path above; use `api` mode for real reranking until that lands.
    Err(PampaError::SearchError {
        reason: "local cross-encoder reranker is not available in this build; set PAMPAX_MOCK_RERANKER_TESTS=1 for tests or use reranker=api".to_string(),
    })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ApiRerankResponse {
    Results { results: Vec<ApiRerankItem> },
    Data { data: Vec<ApiRerankItem> },
    Bare(Vec<ApiRerankItem>),
}

#[derive(Deserialize)]
struct ApiRerankItem {
    index: usize,
    #[serde(alias = "relevance_score", alias = "score")]
    relevance_score: f32,
}

async fn api_rerank(query: &str, candidates: &[RerankCandidate]) -> Result<Vec<(String, f32)>> {
    let Ok(url) = std::env::var("PAMPAX_RERANK_API_URL") else {
        return Err(PampaError::SearchError { reason: "PAMPAX_RERANK_API_URL is not set".to_string() });
    };
    let api_key = std::env::var("PAMPAX_RERANK_API_KEY").ok();
    let model = std::env::var("PAMPAX_RERANK_MODEL").unwrap_or_else(|_| "rerank-default".to_string());
    let top_n: usize = std::env::var("PAMPAX_RERANKER_MAX").ok().and_then(|v| v.parse().ok()).unwrap_or(200).min(candidates.len());
    let max_tokens: usize = std::env::var("PAMPAX_RERANKER_MAX_TOKENS").ok().and_then(|v| v.parse().ok()).unwrap_or(DEFAULT_MAX_TOKENS);

    let documents: Vec<String> = candidates.iter().map(|c| truncate_tokens(&c.text, max_tokens)).collect();

    let client = reqwest::Client::new();
    let mut req = client.post(&url).json(&serde_json::json!({
        "model": model,
        "query": query,
        "documents": documents,
        "top_n": top_n,
    }));
    if let Some(key) = api_key {
        req = req.bearer_auth(key);
    }

    let resp = req.send().await.map_err(|e| PampaError::SearchError { reason: format!("reranker api request failed: {e}") })?;
    let status = resp.status();
    if !status.is_success() {
        return Err(PampaError::SearchError { reason: format!("reranker api returned status {status}") });
    }

    let parsed: ApiRerankResponse = resp.json().await.map_err(|e| PampaError::SearchError {
        reason: format!("reranker api response did not match any known shape: {e}"),
    })?;

    let items = match parsed {
        ApiRerankResponse::Results { results } => results,
        ApiRerankResponse::Data { data } => data,
        ApiRerankResponse::Bare(items) => items,
    };

    Ok(items
        .into_iter()
        .filter_map(|item| candidates.get(item.index).map(|c| (c.chunk_id.clone(), item.relevance_score)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn candidates() -> Vec<RerankCandidate> {
        vec![
            RerankCandidate { chunk_id: "a".into(), text: "validate user token".into() },
            RerankCandidate { chunk_id: "b".into(), text: "create checkout session".into() },
        ]
    }

    #[tokio::test]
    async fn mock_local_reranker_sorts_by_overlap() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("PAMPAX_MOCK_RERANKER_TESTS", "1");
        let results = rerank(RerankerMode::Transformers, "checkout session", &candidates()).await.unwrap();
        assert_eq!(results[0].chunk_id, "b");
        assert_eq!(results[0].rank, 1);
        std::env::remove_var("PAMPAX_MOCK_RERANKER_TESTS");
    }

    #[tokio::test]
    async fn empty_candidates_short_circuit() {
        let results = rerank(RerankerMode::Transformers, "q", &[]).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn local_without_mock_flag_is_a_soft_failure() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("PAMPAX_MOCK_RERANKER_TESTS");
        let result = rerank(RerankerMode::Transformers, "q", &candidates()).await;
        assert!(result.is_err());
    }
}
