#[macro_export]
macro_rules! debug_log {
	($($arg:tt)*) => {{
		#[cfg(debug_assertions)]
		{
			eprintln!($($arg)*);
		}
	}};
}

pub mod bm25;
pub mod chunk_store;
pub mod chunker;
pub mod codemap;
pub mod config;
pub mod contextpacks;
pub mod db;
pub mod embedding;
pub mod error;
pub mod indexer;
pub mod languages;
pub mod manifest;
pub mod rate_limiter;
pub mod reranker;
pub mod retrieval;
pub mod scanner;
pub mod symbols;
pub mod tokenizer;
pub mod watcher;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use config::Config;
use db::MetadataDb;
use embedding::EmbeddingProvider;
use error::Result;
use rate_limiter::RateLimiter;

/// The public semantic-operations surface (spec §6). Every operation here
/// opens its own `MetadataDb`/provider rather than holding long-lived state,
/// matching the "short-lived handle" rule in spec §5.

/// Builds (or rebuilds, if called again) a fresh index of `repo_root`.
pub async fn index(repo_root: &Path, provider_name: Option<&str>, config: &Config) -> Result<indexer::IndexStats> {
    let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit_rpm));
    let mut provider = embedding::select(provider_name, rate_limiter)?;
    provider.init().await?;

    indexer::index(
        indexer::IndexRequest {
            repo_root,
            provider: provider.as_ref(),
            config,
            changed_files: None,
            deleted_files: None,
            encrypt_mode_override: None,
        },
        |_line| {},
    )
    .await
}

/// Incrementally reindexes only the given paths, removing any in `deleted`.
pub async fn update(
    repo_root: &Path,
    provider_name: Option<&str>,
    config: &Config,
    changed: Vec<PathBuf>,
    deleted: Vec<PathBuf>,
) -> Result<indexer::IndexStats> {
    let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit_rpm));
    let mut provider = embedding::select(provider_name, rate_limiter)?;
    provider.init().await?;

    indexer::index(
        indexer::IndexRequest {
            repo_root,
            provider: provider.as_ref(),
            config,
            changed_files: Some(changed),
            deleted_files: Some(deleted),
            encrypt_mode_override: None,
        },
        |_line| {},
    )
    .await
}

/// Starts a debounced file watcher that drives incremental reindexing
/// (spec §4.14). See [`watcher::watch`] for the handle's lifecycle.
pub async fn watch(
    repo_root: &Path,
    provider_name: Option<&str>,
    config: Config,
    on_batch: impl FnMut(watcher::WatchBatch) + Send + 'static,
) -> Result<watcher::WatcherHandle> {
    let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit_rpm));
    let mut provider = embedding::select(provider_name, rate_limiter)?;
    provider.init().await?;

    watcher::watch(
        watcher::WatchRequest { repo_root, config, debounce_ms: None },
        provider,
        on_batch,
    )
}

/// Runs the seven-phase hybrid retrieval pipeline (spec §4.12).
pub async fn search(
    repo_root: &Path,
    provider_name: Option<&str>,
    config: &Config,
    query: &str,
    limit: Option<usize>,
    scope: retrieval::SearchScope,
) -> Result<Vec<retrieval::SearchResult>> {
    let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit_rpm));
    let mut provider = embedding::select(provider_name, rate_limiter)?;
    provider.init().await?;

    retrieval::search(retrieval::SearchRequest {
        query,
        limit: limit.unwrap_or(config.retrieval.default_limit),
        repo_root,
        provider: provider.as_ref(),
        scope,
        default_hybrid: config.retrieval.hybrid,
        default_bm25: config.retrieval.bm25,
        default_symbol_boost: config.retrieval.symbol_boost,
    })
    .await
}

/// Merges `pack` into `scope`'s unset fields and runs `search`. Pack fields
/// never override scope fields the caller already set explicitly.
pub async fn search_with_context_pack(
    repo_root: &Path,
    provider_name: Option<&str>,
    config: &Config,
    query: &str,
    limit: Option<usize>,
    mut scope: retrieval::SearchScope,
    pack_name: &str,
) -> Result<Vec<retrieval::SearchResult>> {
    let pack = contextpacks::load(repo_root, pack_name)?;
    if scope.path_glob.is_empty() {
        scope.path_glob = pack.path_glob;
    }
    if scope.tags.is_empty() {
        scope.tags = pack.tags;
    }
    if scope.lang.is_empty() {
        scope.lang = pack.lang;
    }
    scope.hybrid = scope.hybrid.or(pack.hybrid);
    scope.bm25 = scope.bm25.or(pack.bm25);
    scope.reranker = scope.reranker.or(pack.reranker);
    scope.symbol_boost = scope.symbol_boost.or(pack.symbol_boost);

    search(repo_root, provider_name, config, query, limit, scope).await
}

pub fn list_context_packs(repo_root: &Path) -> Result<Vec<contextpacks::ContextPack>> {
    contextpacks::list(repo_root)
}

/// Fetches a single chunk's source code and metadata by id.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkView {
    pub chunk_id: String,
    pub file_path: String,
    pub symbol: String,
    pub lang: String,
    pub chunk_type: String,
    pub code: String,
    pub tags: Vec<String>,
    pub intent: Option<String>,
    pub description: Option<String>,
}

pub fn get_chunk(repo_root: &Path, chunk_id: &str) -> Result<Option<ChunkView>> {
    let db = MetadataDb::open(repo_root)?;
    let Some(row) = db.get_chunk(chunk_id)? else { return Ok(None) };

    let chunk_store = chunk_store::ChunkStore::open(
        repo_root.join(".pampa").join("chunks"),
        config::EncryptionMode::Auto,
        config::load_encryption_key()?,
    )?;
    let code = String::from_utf8_lossy(&chunk_store.read(&row.sha)?).into_owned();

    Ok(Some(ChunkView {
        chunk_id: row.chunk_id,
        file_path: row.file_path,
        symbol: row.symbol,
        lang: row.lang,
        chunk_type: row.chunk_type,
        code,
        tags: row.tags,
        intent: row.intent,
        description: row.description,
    }))
}

/// A file-level summary of indexed symbols, the shape the spec's
/// `getOverview` operation returns.
#[derive(Debug, Clone, Serialize)]
pub struct FileOverview {
    pub file: String,
    pub symbols: Vec<String>,
}

pub fn get_overview(repo_root: &Path) -> Result<Vec<FileOverview>> {
    let codemap = codemap::Codemap::load(repo_root)?;
    let mut by_file: std::collections::BTreeMap<String, Vec<String>> = std::collections::BTreeMap::new();
    for (_, entry) in codemap.iter() {
        by_file.entry(entry.file.clone()).or_default().push(entry.symbol.clone());
    }
    Ok(by_file.into_iter().map(|(file, symbols)| FileOverview { file, symbols }).collect())
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexStatsSummary {
    pub total_chunks: usize,
    pub files: usize,
    pub providers: Vec<(String, usize)>,
}

pub fn get_stats(repo_root: &Path) -> Result<IndexStatsSummary> {
    let db = MetadataDb::open(repo_root)?;
    Ok(IndexStatsSummary {
        total_chunks: db.count_chunks()?,
        files: db.distinct_file_paths()?.len(),
        providers: db.distinct_providers()?,
    })
}

pub fn get_query_analytics(repo_root: &Path, limit: usize) -> Result<Vec<(String, i64)>> {
    let db = MetadataDb::open(repo_root)?;
    db.top_query_patterns(limit)
}
