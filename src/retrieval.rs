//! Retrieval Engine (C12, spec §4.12): the seven-phase hybrid search pipeline.

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::bm25::{self, Bm25CacheKey, Bm25Document};
use crate::chunk_store::ChunkStore;
use crate::config::RerankerMode;
use crate::db::MetadataDb;
use crate::embedding::EmbeddingProvider;
use crate::error::{PampaError, Result};
use crate::reranker::{self, RerankCandidate};

#[derive(Debug, Clone, Default)]
pub struct SearchScope {
    pub path_glob: Vec<String>,
    pub tags: Vec<String>,
    pub lang: Vec<String>,
    pub hybrid: Option<bool>,
    pub bm25: Option<bool>,
    pub reranker: Option<RerankerMode>,
    pub symbol_boost: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct SearchResult {
    pub chunk_id: String,
    pub symbol: String,
    pub file_path: String,
    pub score: f32,
    pub score_raw: Option<f32>,
    pub vector_score: f32,
    pub bm25_score: Option<f64>,
    pub hybrid_score: Option<f64>,
    pub reranker_score: Option<f32>,
    pub symbol_boost: Option<f32>,
    pub search_type: &'static str,
}

const RRF_K: f64 = 60.0;
const INTENT_MATCH_BOOST: f32 = 0.2;
const TAG_MATCH_BOOST: f32 = 0.1;
const LEARNING_THRESHOLD: f32 = 0.8;

static SYNONYMS: &[(&str, &str)] = &[
    ("create", "create"),
    ("make", "create"),
    ("add", "create"),
    ("remove", "delete"),
    ("delete", "delete"),
    ("fetch", "get"),
    ("retrieve", "get"),
];

fn normalize_query(query: &str) -> String {
    let lower = query.to_ascii_lowercase().replace('?', "");
    let mut words: Vec<String> = lower
        .split_whitespace()
        .map(|w| SYNONYMS.iter().find(|(k, _)| *k == w).map(|(_, v)| v.to_string()).unwrap_or_else(|| w.to_string()))
        .collect();
    words.retain(|w| !w.is_empty());
    words.join(" ")
}

static PATTERN_ENTITY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\b(\w+(?:Session|Service|Controller))\b").unwrap());
static STRIPE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bstripe\b").unwrap());

fn extract_pattern(query: &str) -> String {
    let mut pattern = PATTERN_ENTITY_RE.replace_all(query, "<ENTITY>").to_string();
    pattern = STRIPE_RE.replace_all(&pattern, "<PROVIDER>").to_string();
    pattern
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

fn glob_matches_any(globs: &[String], path: &str) -> bool {
    if globs.is_empty() {
        return true;
    }
    globs.iter().any(|g| glob::Pattern::new(g).map(|p| p.matches(path)).unwrap_or(false))
}

pub struct SearchRequest<'a> {
    pub query: &'a str,
    pub limit: usize,
    pub repo_root: &'a std::path::Path,
    pub provider: &'a dyn EmbeddingProvider,
    pub scope: SearchScope,
    pub default_hybrid: bool,
    pub default_bm25: bool,
    pub default_symbol_boost: bool,
}

pub async fn search(req: SearchRequest<'_>) -> Result<Vec<SearchResult>> {
    let db = MetadataDb::open(req.repo_root)?;
    let chunk_store = ChunkStore::open(req.repo_root.join(".pampa").join("chunks"), crate::config::EncryptionMode::Auto, crate::config::load_encryption_key()?)?;

    let symbol_boost_enabled = req.scope.symbol_boost.unwrap_or(req.default_symbol_boost);
    let hybrid_enabled = req.scope.hybrid.unwrap_or(req.default_hybrid);
    let bm25_enabled = req.scope.bm25.unwrap_or(req.default_bm25);

    let all_rows = db.chunks_for_provider(req.provider.name(), req.provider.dimensions())?;
    if all_rows.is_empty() {
        return Err(PampaError::NoChunksFound {
            provider: req.provider.name().to_string(),
            dimensions: req.provider.dimensions(),
            path: req.repo_root.to_path_buf(),
        });
    }

    let scoped: Vec<_> = all_rows
        .into_iter()
        .filter(|r| glob_matches_any(&req.scope.path_glob, &r.file_path))
        .filter(|r| req.scope.lang.is_empty() || req.scope.lang.contains(&r.lang))
        .filter(|r| req.scope.tags.is_empty() || req.scope.tags.iter().any(|t| r.tags.contains(t)))
        .collect();
    let scoped_ids: HashSet<String> = scoped.iter().map(|r| r.chunk_id.clone()).collect();

    let normalized_query = normalize_query(req.query);
    let mut intent_results: Vec<SearchResult> = Vec::new();

    // Phase 1 — intent lookup.
    if symbol_boost_enabled {
        if let Some(hit) = db.get_intention(&normalized_query)? {
            if let Some(row) = scoped.iter().find(|r| r.sha == hit.target_sha) {
                db.record_intention_hit(&normalized_query)?;
                intent_results.push(SearchResult {
                    chunk_id: row.chunk_id.clone(),
                    symbol: row.symbol.clone(),
                    file_path: row.file_path.clone(),
                    score: hit.confidence.min(1.0),
                    score_raw: None,
                    vector_score: 0.0,
                    bm25_score: None,
                    hybrid_score: None,
                    reranker_score: None,
                    symbol_boost: None,
                    search_type: "intention",
                });
            }
        }
    }

    // Phase 2 — pattern record.
    db.record_query_pattern(&extract_pattern(req.query))?;

    // Phase 3 — vector candidates.
    let query_embedding = req.provider.generate(req.query).await?;
    let mut scored: Vec<SearchResult> = scoped
        .iter()
        .map(|row| {
            let raw = cosine(&query_embedding, &row.embedding);
            let mut boosted = raw;
            if let Some(intent) = &row.intent {
                if intent.to_ascii_lowercase().contains(&req.query.to_ascii_lowercase()) {
                    boosted += INTENT_MATCH_BOOST;
                }
            }
            let query_lower = req.query.to_ascii_lowercase();
            for tag in &row.tags {
                if query_lower.contains(&tag.to_ascii_lowercase()) {
                    boosted += TAG_MATCH_BOOST;
                }
            }
            let score_raw = if boosted > 1.0 { Some(boosted) } else { None };
            SearchResult {
                chunk_id: row.chunk_id.clone(),
                symbol: row.symbol.clone(),
                file_path: row.file_path.clone(),
                score: boosted.min(1.0),
                score_raw,
                vector_score: raw,
                bm25_score: None,
                hybrid_score: None,
                reranker_score: None,
                symbol_boost: None,
                search_type: "vector",
            }
        })
        .collect();

    // Phase 4 — symbol boost.
    if symbol_boost_enabled {
        let query_lower = req.query.to_ascii_lowercase();
        for result in &mut scored {
            if let Some(row) = scoped.iter().find(|r| r.chunk_id == result.chunk_id) {
                let mut hits = 0u32;
                if query_lower.contains(&row.symbol.to_ascii_lowercase()) {
                    hits += 1;
                }
                result.symbol_boost = Some(hits as f32 * 0.15);
            }
        }
        scored.sort_by(|a, b| {
            (b.score, b.symbol_boost.unwrap_or(0.0), b.hybrid_score.unwrap_or(0.0))
                .partial_cmp(&(a.score, a.symbol_boost.unwrap_or(0.0), a.hybrid_score.unwrap_or(0.0)))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
    } else {
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    }

    // Phase 5 — lexical fusion.
    if hybrid_enabled && bm25_enabled {
        let key = Bm25CacheKey {
            provider: req.provider.name().to_string(),
            dimensions: req.provider.dimensions(),
            base_path: req.repo_root.display().to_string(),
        };
        let docs: Vec<Bm25Document> = scoped
            .iter()
            .map(|r| {
                let body = chunk_store.read(&r.sha).map(|b| String::from_utf8_lossy(&b).into_owned()).unwrap_or_default();
                Bm25Document {
                    chunk_id: r.chunk_id.clone(),
                    text: format!(
                        "{} {} {} {} {}",
                        r.symbol,
                        r.file_path,
                        r.description.clone().unwrap_or_default(),
                        r.intent.clone().unwrap_or_default(),
                        body,
                    ),
                }
            })
            .collect();
        let index = bm25::get_or_build(key, || docs);
        let bm25_limit = req.limit.max(60);
        let bm25_hits = index.query(req.query, &scoped_ids, bm25_limit);

        if !bm25_hits.is_empty() {
            let vector_ranks: HashMap<String, usize> = scored.iter().enumerate().map(|(i, r)| (r.chunk_id.clone(), i + 1)).collect();
            let bm25_ranks: HashMap<String, usize> = bm25_hits.iter().enumerate().map(|(i, (id, _))| (id.clone(), i + 1)).collect();
            let bm25_scores: HashMap<String, f64> = bm25_hits.iter().cloned().collect();

            let mut union: HashSet<String> = vector_ranks.keys().cloned().collect();
            union.extend(bm25_ranks.keys().cloned());

            let mut fused: Vec<(String, f64)> = union
                .into_iter()
                .map(|id| {
                    let mut rrf = 0.0;
                    if let Some(&r) = vector_ranks.get(&id) {
                        rrf += 1.0 / (RRF_K + r as f64);
                    }
                    if let Some(&r) = bm25_ranks.get(&id) {
                        rrf += 1.0 / (RRF_K + r as f64);
                    }
                    (id, rrf)
                })
                .collect();
            fused.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

            let by_id: HashMap<String, SearchResult> = scored.into_iter().map(|r| (r.chunk_id.clone(), r)).collect();
            scored = fused
                .into_iter()
                .filter_map(|(id, hybrid_score)| {
                    by_id.get(&id).cloned().map(|mut r| {
                        r.hybrid_score = Some(hybrid_score);
                        r.bm25_score = bm25_scores.get(&id).copied();
                        r
                    })
                })
                .collect();
        }
    }

    // Phase 6 — rerank.
    let reranker_mode = req.scope.reranker.unwrap_or(RerankerMode::Off);
    if !matches!(reranker_mode, RerankerMode::Off) && scored.len() > 1 {
        let top_n = scored.len().min(200);
        let candidates: Vec<RerankCandidate> = scored[..top_n]
            .iter()
            .filter_map(|r| chunk_store.read(&find_sha(&scoped, &r.chunk_id)?).ok().map(|bytes| RerankCandidate { chunk_id: r.chunk_id.clone(), text: String::from_utf8_lossy(&bytes).into_owned() }))
            .collect();

        if let Ok(rerank_results) = reranker::rerank(reranker_mode, req.query, &candidates).await {
            let by_rank: HashMap<String, (f32, usize)> = rerank_results.into_iter().map(|r| (r.chunk_id, (r.score, r.rank))).collect();
            for r in &mut scored {
                if let Some(&(score, _rank)) = by_rank.get(&r.chunk_id) {
                    r.reranker_score = Some(score);
                }
            }
            scored.sort_by(|a, b| {
                b.reranker_score.unwrap_or(f32::MIN).partial_cmp(&a.reranker_score.unwrap_or(f32::MIN)).unwrap_or(std::cmp::Ordering::Equal)
            });
        }
        // soft failure: keep the prior order on reranker error.
    }

    // Phase 7 — compose.
    let mut composed = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    for r in intent_results {
        if seen.insert(r.chunk_id.clone()) {
            composed.push(r);
        }
    }
    for r in scored {
        if composed.len() >= req.limit {
            break;
        }
        if seen.insert(r.chunk_id.clone()) {
            composed.push(r);
        }
    }

    if composed.is_empty() {
        return Err(PampaError::NoRelevantMatches { query: req.query.to_string() });
    }

    // Learning.
    if let Some(top) = composed.first() {
        if top.score > LEARNING_THRESHOLD {
            if let Some(row) = scoped.iter().find(|r| r.chunk_id == top.chunk_id) {
                db.upsert_intention(&normalized_query, req.query, &row.sha, top.score)?;
            }
        }
    }

    Ok(composed)
}

fn find_sha(rows: &[crate::db::ChunkRow], chunk_id: &str) -> Option<String> {
    rows.iter().find(|r| r.chunk_id == chunk_id).map(|r| r.sha.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_synonyms_and_strips_question_mark() {
        assert_eq!(normalize_query("Can I Make a Session?"), "can i create a session");
    }

    #[test]
    fn extracts_pattern_with_entity_placeholder() {
        let p = extract_pattern("create CheckoutSession for stripe");
        assert_eq!(p, "create <ENTITY> for <PROVIDER>");
    }

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        assert_eq!(cosine(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
    }

    #[test]
    fn glob_scope_empty_matches_everything() {
        assert!(glob_matches_any(&[], "src/anything.rs"));
        assert!(glob_matches_any(&["src/**/*.rs".to_string()], "src/a/b.rs"));
        assert!(!glob_matches_any(&["docs/**".to_string()], "src/a/b.rs"));
    }
}
