//! Lazily-built in-memory BM25 lexical index (C11, spec §4.11).
//!
//! Keyed by `(provider, dimensions, base_path)` so switching repos or providers
//! never reuses a stale index. Flushed whenever the Orchestrator mutates the
//! DB or the working base path changes (spec §5).

use std::collections::HashMap;
use std::sync::Mutex;

use once_cell::sync::Lazy;

const K1: f64 = 1.2;
const B: f64 = 0.75;

#[derive(Debug, Clone)]
pub struct Bm25Document {
    pub chunk_id: String,
    pub text: String,
}

pub struct Bm25Index {
    doc_ids: Vec<String>,
    doc_term_freqs: Vec<HashMap<String, u32>>,
    doc_lengths: Vec<usize>,
    avg_doc_length: f64,
    doc_freq: HashMap<String, u32>,
    n_docs: usize,
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_ascii_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

impl Bm25Index {
    pub fn build(docs: &[Bm25Document]) -> Self {
        let mut doc_ids = Vec::with_capacity(docs.len());
        let mut doc_term_freqs = Vec::with_capacity(docs.len());
        let mut doc_lengths = Vec::with_capacity(docs.len());
        let mut doc_freq: HashMap<String, u32> = HashMap::new();
        let mut total_len = 0usize;

        for doc in docs {
            let terms = tokenize(&doc.text);
            doc_lengths.push(terms.len());
            total_len += terms.len();

            let mut freqs: HashMap<String, u32> = HashMap::new();
            for term in &terms {
                *freqs.entry(term.clone()).or_insert(0) += 1;
            }
            for term in freqs.keys() {
                *doc_freq.entry(term.clone()).or_insert(0) += 1;
            }

            doc_ids.push(doc.chunk_id.clone());
            doc_term_freqs.push(freqs);
        }

        let n_docs = docs.len();
        let avg_doc_length = if n_docs == 0 { 0.0 } else { total_len as f64 / n_docs as f64 };

        Self { doc_ids, doc_term_freqs, doc_lengths, avg_doc_length, doc_freq, n_docs }
    }

    fn idf(&self, term: &str) -> f64 {
        let n = self.n_docs as f64;
        let df = *self.doc_freq.get(term).unwrap_or(&0) as f64;
        ((n - df + 0.5) / (df + 0.5) + 1.0).ln()
    }

    /// Returns `(chunk_id, score)` pairs restricted to `allowed` and sorted
    /// descending, truncated to `limit`.
    pub fn query(&self, query: &str, allowed: &std::collections::HashSet<String>, limit: usize) -> Vec<(String, f64)> {
        let terms = tokenize(query);
        if terms.is_empty() || self.n_docs == 0 {
            return vec![];
        }

        let mut scores: Vec<(String, f64)> = Vec::new();
        for i in 0..self.n_docs {
            let id = &self.doc_ids[i];
            if !allowed.is_empty() && !allowed.contains(id) {
                continue;
            }
            let doc_len = self.doc_lengths[i] as f64;
            let freqs = &self.doc_term_freqs[i];
            let mut score = 0.0;
            for term in &terms {
                let Some(&tf) = freqs.get(term) else { continue };
                let tf = tf as f64;
                let idf = self.idf(term);
                let denom = tf + K1 * (1.0 - B + B * doc_len / self.avg_doc_length.max(1.0));
                score += idf * (tf * (K1 + 1.0)) / denom;
            }
            if score > 0.0 {
                scores.push((id.clone(), score));
            }
        }

        scores.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scores.truncate(limit);
        scores
    }

    pub fn len(&self) -> usize {
        self.n_docs
    }

    pub fn is_empty(&self) -> bool {
        self.n_docs == 0
    }
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct Bm25CacheKey {
    pub provider: String,
    pub dimensions: usize,
    pub base_path: String,
}

static CACHE: Lazy<Mutex<HashMap<Bm25CacheKey, std::sync::Arc<Bm25Index>>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// Returns the cached index for `key`, building it via `build_docs` on a miss.
pub fn get_or_build(key: Bm25CacheKey, build_docs: impl FnOnce() -> Vec<Bm25Document>) -> std::sync::Arc<Bm25Index> {
    let mut cache = CACHE.lock().unwrap();
    if let Some(existing) = cache.get(&key) {
        return existing.clone();
    }
    let index = std::sync::Arc::new(Bm25Index::build(&build_docs()));
    cache.insert(key, index.clone());
    index
}

/// Invalidates every cached index for `base_path` (any provider/dimensions) —
/// called whenever the Orchestrator mutates the DB for that path.
pub fn invalidate(base_path: &str) {
    let mut cache = CACHE.lock().unwrap();
    cache.retain(|k, _| k.base_path != base_path);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn docs() -> Vec<Bm25Document> {
        vec![
            Bm25Document { chunk_id: "a".into(), text: "validate user credentials login".into() },
            Bm25Document { chunk_id: "b".into(), text: "create checkout session stripe".into() },
            Bm25Document { chunk_id: "c".into(), text: "list users paginated".into() },
        ]
    }

    #[test]
    fn ranks_exact_term_matches_highest() {
        let idx = Bm25Index::build(&docs());
        let allowed: std::collections::HashSet<String> = ["a".into(), "b".into(), "c".into()].into_iter().collect();
        let results = idx.query("checkout stripe session", &allowed, 10);
        assert_eq!(results[0].0, "b");
    }

    #[test]
    fn scope_filter_excludes_disallowed_docs() {
        let idx = Bm25Index::build(&docs());
        let allowed: std::collections::HashSet<String> = ["a".into()].into_iter().collect();
        let results = idx.query("checkout stripe", &allowed, 10);
        assert!(results.is_empty());
    }

    #[test]
    fn cache_rebuilds_after_invalidation() {
        let key = Bm25CacheKey { provider: "local".into(), dimensions: 256, base_path: "/tmp/repo".into() };
        let first = get_or_build(key.clone(), || docs());
        assert_eq!(first.len(), 3);

        invalidate("/tmp/repo");
        let second = get_or_build(key, || vec![docs()[0].clone()]);
        assert_eq!(second.len(), 1);
    }
}
