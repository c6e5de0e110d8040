//! Indexer Orchestrator (C10, spec §4.10). Sole writer of the DB, chunk store,
//! codemap, and manifest — the Retrieval Engine only ever reads them, and the
//! Watcher only ever calls into this module.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tree_sitter::Parser;

use crate::bm25;
use crate::chunk_store::ChunkStore;
use crate::chunker::{self, ChunkingStats, RawChunk};
use crate::codemap::{Codemap, CodemapEntry, CodemapFlags};
use crate::config::{Config, EncryptionMode};
use crate::db::{ChunkRow, MetadataDb};
use crate::embedding::EmbeddingProvider;
use crate::error::{PampaError, Result};
use crate::languages;
use crate::manifest::{sha1_hex, FileManifestEntry, MerkleManifest};
use crate::scanner::{self, ScanOptions};
use crate::symbols;
use crate::tokenizer::TiktokenCounter;

#[derive(Debug, Clone, Default)]
pub struct IndexStats {
    pub processed_chunks: usize,
    pub total_chunks: usize,
    pub provider: String,
    pub errors: Vec<String>,
    pub chunking_stats: ChunkingStats,
}

impl std::ops::AddAssign<ChunkingStats> for ChunkingStats {
    fn add_assign(&mut self, rhs: ChunkingStats) {
        self.total_nodes += rhs.total_nodes;
        self.normal_chunks += rhs.normal_chunks;
        self.subdivided += rhs.subdivided;
        self.merged_small += rhs.merged_small;
        self.statement_fallback += rhs.statement_fallback;
        self.skipped_small += rhs.skipped_small;
    }
}

pub struct IndexRequest<'a> {
    pub repo_root: &'a Path,
    pub provider: &'a dyn EmbeddingProvider,
    pub config: &'a Config,
    pub changed_files: Option<Vec<PathBuf>>,
    pub deleted_files: Option<Vec<PathBuf>>,
    pub encrypt_mode_override: Option<EncryptionMode>,
}

/// Runs one index/update pass. `on_progress` is invoked with a short
/// human-readable line per file processed (spec's `onProgress?`).
pub async fn index(req: IndexRequest<'_>, mut on_progress: impl FnMut(&str)) -> Result<IndexStats> {
    let repo_root = req.repo_root;
    let db = MetadataDb::open(repo_root)?;
    let mut manifest = MerkleManifest::load(repo_root)?;
    let mut codemap = Codemap::load(repo_root)?;

    let encryption_key = crate::config::load_encryption_key()?;
    let mode = req.encrypt_mode_override.unwrap_or(req.config.encryption);
    let chunk_store = ChunkStore::open(repo_root.join(".pampa").join("chunks"), mode, encryption_key)?;

    warn_on_provider_mismatch(&db, req.provider)?;

    let is_full_scan = req.changed_files.is_none();
    let (entries, mut deleted_rel_paths) = enumerate_files(repo_root, req.config, req.changed_files.clone())?;
    if let Some(explicit_deleted) = &req.deleted_files {
        for p in explicit_deleted {
            let rel = if p.is_absolute() { p.strip_prefix(repo_root).unwrap_or(p).to_path_buf() } else { p.clone() };
            deleted_rel_paths.push(rel);
        }
    }

    let counter = TiktokenCounter::new();
    let mut stats = IndexStats { provider: req.provider.name().to_string(), ..Default::default() };

    for entry in &entries {
        let rel_str = entry.rel_path.to_string_lossy().to_string();
        let bytes = match std::fs::read(&entry.abs_path) {
            Ok(b) => b,
            Err(e) => {
                stats.errors.push(format!("{rel_str}: io_error: {e}"));
                continue;
            }
        };
        let sha_file = sha1_hex(&bytes);

        if manifest.is_unchanged(&rel_str, &sha_file) {
            on_progress(&format!("skip (unchanged): {rel_str}"));
            continue;
        }

        let source = String::from_utf8_lossy(&bytes).into_owned();
        let lang = entry
            .rel_path
            .extension()
            .and_then(|e| e.to_str())
            .and_then(languages::rule_for_extension)
            .map(|r| r.name);

        let file_basename = entry.rel_path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or(rel_str.clone());

        let (raw_chunks, chunking_stats) = match lang {
            Some(lang_name) => chunker::chunk_file(&source, lang_name, &file_basename, &req.config.chunk_limits, &counter),
            None => chunker::chunk_file(&source, "__unsupported__", &file_basename, &req.config.chunk_limits, &counter),
        };
        stats.chunking_stats += chunking_stats;

        let previous_chunk_ids = db.chunk_ids_for_file(&rel_str)?;
        let mut retained_chunk_ids: HashSet<String> = HashSet::new();
        let mut chunk_shas: Vec<String> = Vec::new();

        for raw in &raw_chunks {
            let sha = chunk_sha(raw);
            let chunk_id = format!("{}:{}:{}", rel_str, raw.symbol, &sha[..8]);

            retained_chunk_ids.insert(chunk_id.clone());
            chunk_shas.push(sha.clone());

            let unchanged = codemap.get(&chunk_id).map(|e| e.sha == sha).unwrap_or(false);
            if unchanged {
                on_progress(&format!("retain: {chunk_id}"));
                continue;
            }

            let embed_text = enhanced_embedding_text(raw);
            let embedding = match req.provider.generate(&embed_text).await {
                Ok(v) => v,
                Err(e) => {
                    stats.errors.push(format!("{chunk_id}: embedding failed: {e}"));
                    continue;
                }
            };

            chunk_store.write(&sha, raw.code.as_bytes())?;

            let extracted = extract_symbols(raw, lang);
            let row = ChunkRow {
                chunk_id: chunk_id.clone(),
                file_path: rel_str.clone(),
                symbol: raw.symbol.clone(),
                sha: sha.clone(),
                lang: lang.unwrap_or("unknown").to_string(),
                chunk_type: raw.chunk_type.clone(),
                embedding,
                embedding_provider: req.provider.name().to_string(),
                embedding_dimensions: req.provider.dimensions(),
                tags: raw.metadata.pampa_tags.clone(),
                intent: raw.metadata.pampa_intent.clone(),
                description: raw.metadata.pampa_description.clone(),
                doc_comments: raw.metadata.doc_comment.clone(),
                variables_used: raw.metadata.important_variables.iter().map(|(n, _)| n.clone()).collect(),
                context_info: serde_json::json!({
                    "startLine": raw.start_line,
                    "endLine": raw.end_line,
                    "autoTags": raw.metadata.auto_tags,
                }),
            };
            db.upsert_chunk(&row)?;

            codemap.upsert(
                chunk_id.clone(),
                CodemapEntry {
                    file: rel_str.clone(),
                    symbol: raw.symbol.clone(),
                    sha: sha.clone(),
                    lang: lang.unwrap_or("unknown").to_string(),
                    chunk_type: raw.chunk_type.clone(),
                    provider: req.provider.name().to_string(),
                    dimensions: req.provider.dimensions(),
                    flags: CodemapFlags {
                        has_pampa_tags: !raw.metadata.pampa_tags.is_empty(),
                        has_intent: raw.metadata.pampa_intent.is_some(),
                        has_documentation: raw.metadata.doc_comment.is_some(),
                        variable_count: raw.metadata.important_variables.len(),
                        encrypted: matches!(mode, EncryptionMode::On) || matches!(mode, EncryptionMode::Auto),
                    },
                    signature: extracted.as_ref().and_then(|e| e.signature.clone()),
                    parameters: extracted.as_ref().map(|e| e.parameters.iter().map(|p| p.name.clone()).collect()).unwrap_or_default(),
                    return_type: extracted.as_ref().and_then(|e| e.return_type.clone()),
                    calls: extracted.as_ref().map(|e| e.calls.clone()).unwrap_or_default(),
                    user_fields: Default::default(),
                },
            );

            stats.processed_chunks += 1;
            on_progress(&format!("indexed: {chunk_id}"));
        }

        let stale: Vec<String> = previous_chunk_ids.difference(&retained_chunk_ids).cloned().collect();
        for stale_id in stale {
            if let Some(prev_sha) = db.chunk_sha(&stale_id)? {
                chunk_store.remove(&prev_sha)?;
            }
            db.delete_chunk(&stale_id)?;
            codemap.remove(&stale_id);
        }

        manifest.upsert(rel_str.clone(), FileManifestEntry { sha_file, chunk_shas });
    }

    for rel in &deleted_rel_paths {
        let rel_str = rel.to_string_lossy().to_string();
        let chunk_ids = db.chunk_ids_for_file(&rel_str)?;
        for chunk_id in chunk_ids {
            if let Some(sha) = db.chunk_sha(&chunk_id)? {
                chunk_store.remove(&sha)?;
            }
            db.delete_chunk(&chunk_id)?;
            codemap.remove(&chunk_id);
        }
        manifest.remove(&rel_str);
    }

    if is_full_scan {
        let on_disk: HashSet<String> = entries.iter().map(|e| e.rel_path.to_string_lossy().to_string()).collect();
        let manifest_paths: Vec<String> = manifest.paths().cloned().collect();
        for path in manifest_paths {
            if !on_disk.contains(&path) {
                let chunk_ids = db.chunk_ids_for_file(&path)?;
                for chunk_id in chunk_ids {
                    if let Some(sha) = db.chunk_sha(&chunk_id)? {
                        chunk_store.remove(&sha)?;
                    }
                    db.delete_chunk(&chunk_id)?;
                    codemap.remove(&chunk_id);
                }
                manifest.remove(&path);
            }
        }
        let existing_files = db.distinct_file_paths()?;
        codemap.retain_files(&existing_files);
    }

    manifest.save()?;
    codemap.save()?;
    bm25::invalidate(&repo_root.display().to_string());

    stats.total_chunks = db.count_chunks()?;
    Ok(stats)
}

fn enumerate_files(repo_root: &Path, config: &Config, changed_files: Option<Vec<PathBuf>>) -> Result<(Vec<scanner::FileEntry>, Vec<PathBuf>)> {
    match changed_files {
        Some(candidates) => Ok(scanner::resolve_changed_files(repo_root, &candidates, config.scan.max_file_bytes)),
        None => {
            let opts = ScanOptions {
                repo_root: repo_root.to_path_buf(),
                target: repo_root.to_path_buf(),
                max_file_bytes: config.scan.max_file_bytes,
                exclude_dir_names: config.scan.exclude_dir_names.clone(),
            };
            let entries = scanner::scan_workspace(&opts).map_err(|e| PampaError::io(repo_root, std::io::Error::other(e)))?;
            Ok((entries, vec![]))
        }
    }
}

fn warn_on_provider_mismatch(db: &MetadataDb, provider: &dyn EmbeddingProvider) -> Result<()> {
    let existing = db.distinct_providers()?;
    for (existing_provider, existing_dims) in existing {
        if existing_provider != provider.name() || existing_dims != provider.dimensions() {
            log::warn!(
                "indexed rows exist under provider='{existing_provider}' dims={existing_dims}, \
                 but this run is configured for provider='{}' dims={}; those rows will be invisible to searches \
                 under the new configuration. Run a clean reindex (delete .pampa/ and reindex) to consolidate.",
                provider.name(),
                provider.dimensions()
            );
        }
    }
    Ok(())
}

/// Enhanced embedding text: doc comment + code + annotation lines, each only
/// when present (spec §4.10 step 5).
fn enhanced_embedding_text(chunk: &RawChunk) -> String {
    let mut parts = Vec::new();
    if let Some(doc) = &chunk.metadata.doc_comment {
        parts.push(doc.clone());
    }
    parts.push(chunk.code.clone());
    if let Some(intent) = &chunk.metadata.pampa_intent {
        parts.push(format!("// Intent: {intent}"));
    }
    if let Some(desc) = &chunk.metadata.pampa_description {
        parts.push(format!("// Description: {desc}"));
    }
    if !chunk.metadata.pampa_tags.is_empty() {
        parts.push(format!("// Tags: {}", chunk.metadata.pampa_tags.join(", ")));
    }
    if !chunk.metadata.important_variables.is_empty() {
        let names: Vec<&str> = chunk.metadata.important_variables.iter().map(|(n, _)| n.as_str()).collect();
        parts.push(format!("// Uses variables: {}", names.join(", ")));
    }
    parts.join("\n")
}

fn chunk_sha(chunk: &RawChunk) -> String {
    sha1_hex(chunk.code.as_bytes())
}

/// Re-parses a chunk's own code in isolation to recover an AST node for C7
/// extraction. Works even for merged/statement-fallback chunks since
/// tree-sitter tolerates malformed input by emitting `ERROR` nodes.
fn extract_symbols(chunk: &RawChunk, lang: Option<&str>) -> Option<symbols::ExtractedSymbol> {
    let lang_name = lang?;
    let language = languages::resolve(lang_name)?;
    let mut parser = Parser::new();
    parser.set_language(&language).ok()?;
    let tree = parser.parse(&chunk.code, None)?;
    let root = tree.root_node();
    let target = root.named_child(0).unwrap_or(root);
    Some(symbols::extract(target, &chunk.code))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enhanced_text_includes_only_present_fields() {
        let chunk = RawChunk {
            code: "fn foo() {}".into(),
            start_line: 1,
            end_line: 1,
            symbol: "foo".into(),
            chunk_type: "function_item".into(),
            metadata: crate::chunker::ChunkMetadata {
                doc_comment: None,
                pampa_tags: vec!["auth".into()],
                pampa_intent: Some("do the thing".into()),
                pampa_description: None,
                auto_tags: vec![],
                important_variables: vec![],
            },
        };
        let text = enhanced_embedding_text(&chunk);
        assert!(text.contains("fn foo"));
        assert!(text.contains("// Intent: do the thing"));
        assert!(text.contains("// Tags: auth"));
        assert!(!text.contains("Description"));
    }

    #[test]
    fn chunk_sha_is_sha1_of_code() {
        let chunk = RawChunk {
            code: "hello".into(),
            start_line: 1,
            end_line: 1,
            symbol: "x".into(),
            chunk_type: "function_item".into(),
            metadata: Default::default(),
        };
        assert_eq!(chunk_sha(&chunk), sha1_hex(b"hello"));
    }
}
