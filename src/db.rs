//! Metadata DB (spec §4.3): chunks, the intention cache, and query-pattern analytics.
//!
//! A single embedded SQLite database opened per-operation, per spec §5 ("short-lived
//! to keep the code simple and robust; only the Indexer holds exclusive write access
//! during a run").

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::{PampaError, Result};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS code_chunks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    chunk_id TEXT NOT NULL UNIQUE,
    file_path TEXT NOT NULL,
    symbol TEXT NOT NULL,
    sha TEXT NOT NULL,
    lang TEXT NOT NULL,
    chunk_type TEXT NOT NULL,
    embedding BLOB NOT NULL,
    embedding_provider TEXT NOT NULL,
    embedding_dimensions INTEGER NOT NULL,
    pampa_tags TEXT NOT NULL DEFAULT '[]',
    pampa_intent TEXT,
    pampa_description TEXT,
    doc_comments TEXT,
    variables_used TEXT NOT NULL DEFAULT '[]',
    context_info TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_chunks_file_path ON code_chunks(file_path);
CREATE INDEX IF NOT EXISTS idx_chunks_symbol ON code_chunks(symbol);
CREATE INDEX IF NOT EXISTS idx_chunks_lang ON code_chunks(lang);
CREATE INDEX IF NOT EXISTS idx_chunks_provider ON code_chunks(embedding_provider);
CREATE INDEX IF NOT EXISTS idx_chunks_type ON code_chunks(chunk_type);
CREATE INDEX IF NOT EXISTS idx_chunks_tags ON code_chunks(pampa_tags);
CREATE INDEX IF NOT EXISTS idx_chunks_intent ON code_chunks(pampa_intent);
CREATE INDEX IF NOT EXISTS idx_chunks_lang_provider_dims ON code_chunks(lang, embedding_provider, embedding_dimensions);

CREATE TABLE IF NOT EXISTS intention_cache (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    query_normalized TEXT NOT NULL UNIQUE,
    original_query TEXT NOT NULL,
    target_sha TEXT NOT NULL,
    confidence REAL NOT NULL,
    usage_count INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    last_used TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_intention_normalized ON intention_cache(query_normalized);
CREATE INDEX IF NOT EXISTS idx_intention_target_sha ON intention_cache(target_sha);
CREATE INDEX IF NOT EXISTS idx_intention_usage ON intention_cache(usage_count DESC);

CREATE TABLE IF NOT EXISTS query_patterns (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pattern TEXT NOT NULL UNIQUE,
    frequency INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_patterns_frequency ON query_patterns(frequency DESC);
"#;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRow {
    pub chunk_id: String,
    pub file_path: String,
    pub symbol: String,
    pub sha: String,
    pub lang: String,
    pub chunk_type: String,
    pub embedding: Vec<f32>,
    pub embedding_provider: String,
    pub embedding_dimensions: usize,
    pub tags: Vec<String>,
    pub intent: Option<String>,
    pub description: Option<String>,
    pub doc_comments: Option<String>,
    pub variables_used: Vec<String>,
    pub context_info: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct IntentionCacheRow {
    pub query_normalized: String,
    pub original_query: String,
    pub target_sha: String,
    pub confidence: f32,
    pub usage_count: i64,
}

/// Serializes an embedding as a length-prefixed little-endian `f32[]` blob (spec §4.3).
pub fn encode_embedding(vec: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + vec.len() * 4);
    out.extend_from_slice(&(vec.len() as u32).to_le_bytes());
    for v in vec {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Decodes a blob written by [`encode_embedding`]. Malformed blobs decode to `vec![]`
/// rather than panicking (spec §9: parse defensively).
pub fn decode_embedding(blob: &[u8]) -> Vec<f32> {
    if blob.len() < 4 {
        return vec![];
    }
    let len = u32::from_le_bytes([blob[0], blob[1], blob[2], blob[3]]) as usize;
    let expected = 4 + len * 4;
    if blob.len() < expected {
        return vec![];
    }
    let mut out = Vec::with_capacity(len);
    for i in 0..len {
        let off = 4 + i * 4;
        out.push(f32::from_le_bytes([blob[off], blob[off + 1], blob[off + 2], blob[off + 3]]));
    }
    out
}

fn now_iso() -> String {
    // No wall-clock dependency beyond the system clock; formatted as RFC 3339-ish
    // without pulling in chrono, which nothing else in this crate needs.
    let dur = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}", dur.as_secs())
}

pub struct MetadataDb {
    path: PathBuf,
}

impl MetadataDb {
    /// Opens (creating if absent) the database at `<root>/.pampa/pampa.db` and
    /// ensures the schema exists. Each call below opens its own short-lived
    /// `Connection` per spec §5.
    pub fn open(root: &Path) -> Result<Self> {
        let dir = root.join(".pampa");
        std::fs::create_dir_all(&dir).map_err(|e| PampaError::io(&dir, e))?;
        let path = dir.join("pampa.db");
        let conn = Connection::open(&path).map_err(|e| PampaError::io(&path, std::io::Error::other(e)))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| PampaError::io(&path, std::io::Error::other(e)))?;
        Ok(Self { path })
    }

    /// Fails with `database_not_found` if the file has disappeared since `open`
    /// (spec §4.3: actionable error naming the missing path).
    fn connect(&self) -> Result<Connection> {
        if !self.path.exists() {
            return Err(PampaError::DatabaseNotFound { path: self.path.clone() });
        }
        Connection::open(&self.path).map_err(|e| PampaError::io(&self.path, std::io::Error::other(e)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn upsert_chunk(&self, row: &ChunkRow) -> Result<()> {
        let conn = self.connect()?;
        let now = now_iso();
        conn.execute(
            "INSERT INTO code_chunks
                (chunk_id, file_path, symbol, sha, lang, chunk_type, embedding,
                 embedding_provider, embedding_dimensions, pampa_tags, pampa_intent,
                 pampa_description, doc_comments, variables_used, context_info,
                 created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?16)
             ON CONFLICT(chunk_id) DO UPDATE SET
                file_path = excluded.file_path,
                symbol = excluded.symbol,
                sha = excluded.sha,
                lang = excluded.lang,
                chunk_type = excluded.chunk_type,
                embedding = excluded.embedding,
                embedding_provider = excluded.embedding_provider,
                embedding_dimensions = excluded.embedding_dimensions,
                pampa_tags = excluded.pampa_tags,
                pampa_intent = excluded.pampa_intent,
                pampa_description = excluded.pampa_description,
                doc_comments = excluded.doc_comments,
                variables_used = excluded.variables_used,
                context_info = excluded.context_info,
                updated_at = excluded.updated_at",
            params![
                row.chunk_id,
                row.file_path,
                row.symbol,
                row.sha,
                row.lang,
                row.chunk_type,
                encode_embedding(&row.embedding),
                row.embedding_provider,
                row.embedding_dimensions as i64,
                serde_json::to_string(&row.tags).unwrap_or_else(|_| "[]".into()),
                row.intent,
                row.description,
                row.doc_comments,
                serde_json::to_string(&row.variables_used).unwrap_or_else(|_| "[]".into()),
                row.context_info.to_string(),
                now,
            ],
        )
        .map_err(|e| PampaError::io(&self.path, std::io::Error::other(e)))?;
        Ok(())
    }

    pub fn delete_chunk(&self, chunk_id: &str) -> Result<()> {
        let conn = self.connect()?;
        conn.execute("DELETE FROM code_chunks WHERE chunk_id = ?1", params![chunk_id])
            .map_err(|e| PampaError::io(&self.path, std::io::Error::other(e)))?;
        Ok(())
    }

    pub fn delete_chunks_for_file(&self, file_path: &str) -> Result<usize> {
        let conn = self.connect()?;
        let n = conn
            .execute("DELETE FROM code_chunks WHERE file_path = ?1", params![file_path])
            .map_err(|e| PampaError::io(&self.path, std::io::Error::other(e)))?;
        Ok(n)
    }

    pub fn chunk_ids_for_file(&self, file_path: &str) -> Result<HashSet<String>> {
        let conn = self.connect()?;
        let mut stmt = conn
            .prepare("SELECT chunk_id FROM code_chunks WHERE file_path = ?1")
            .map_err(|e| PampaError::io(&self.path, std::io::Error::other(e)))?;
        let rows = stmt
            .query_map(params![file_path], |r| r.get::<_, String>(0))
            .map_err(|e| PampaError::io(&self.path, std::io::Error::other(e)))?;
        let mut out = HashSet::new();
        for r in rows {
            out.insert(r.map_err(|e| PampaError::io(&self.path, std::io::Error::other(e)))?);
        }
        Ok(out)
    }

    pub fn chunk_sha(&self, chunk_id: &str) -> Result<Option<String>> {
        let conn = self.connect()?;
        conn.query_row(
            "SELECT sha FROM code_chunks WHERE chunk_id = ?1",
            params![chunk_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| PampaError::io(&self.path, std::io::Error::other(e)))
    }

    /// Returns every chunk whose `(provider, dimensions)` matches — the mandatory
    /// filter on all vector reads (spec §4.3 invariant I2).
    pub fn chunks_for_provider(&self, provider: &str, dimensions: usize) -> Result<Vec<ChunkRow>> {
        let conn = self.connect()?;
        let mut stmt = conn
            .prepare(
                "SELECT chunk_id, file_path, symbol, sha, lang, chunk_type, embedding,
                        embedding_provider, embedding_dimensions, pampa_tags, pampa_intent,
                        pampa_description, doc_comments, variables_used, context_info
                 FROM code_chunks WHERE embedding_provider = ?1 AND embedding_dimensions = ?2",
            )
            .map_err(|e| PampaError::io(&self.path, std::io::Error::other(e)))?;

        let rows = stmt
            .query_map(params![provider, dimensions as i64], row_to_chunk)
            .map_err(|e| PampaError::io(&self.path, std::io::Error::other(e)))?;

        let mut out = Vec::new();
        for r in rows {
            out.push(r.map_err(|e| PampaError::io(&self.path, std::io::Error::other(e)))?);
        }
        Ok(out)
    }

    pub fn get_chunk(&self, chunk_id: &str) -> Result<Option<ChunkRow>> {
        let conn = self.connect()?;
        conn.query_row(
            "SELECT chunk_id, file_path, symbol, sha, lang, chunk_type, embedding,
                    embedding_provider, embedding_dimensions, pampa_tags, pampa_intent,
                    pampa_description, doc_comments, variables_used, context_info
             FROM code_chunks WHERE chunk_id = ?1",
            params![chunk_id],
            row_to_chunk,
        )
        .optional()
        .map_err(|e| PampaError::io(&self.path, std::io::Error::other(e)))
    }

    /// Distinct `(provider, dimensions)` pairs currently present, for the
    /// Orchestrator's mismatch warning (spec §4.10).
    pub fn distinct_providers(&self) -> Result<Vec<(String, usize)>> {
        let conn = self.connect()?;
        let mut stmt = conn
            .prepare("SELECT DISTINCT embedding_provider, embedding_dimensions FROM code_chunks")
            .map_err(|e| PampaError::io(&self.path, std::io::Error::other(e)))?;
        let rows = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)? as usize)))
            .map_err(|e| PampaError::io(&self.path, std::io::Error::other(e)))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r.map_err(|e| PampaError::io(&self.path, std::io::Error::other(e)))?);
        }
        Ok(out)
    }

    pub fn distinct_file_paths(&self) -> Result<HashSet<String>> {
        let conn = self.connect()?;
        let mut stmt = conn
            .prepare("SELECT DISTINCT file_path FROM code_chunks")
            .map_err(|e| PampaError::io(&self.path, std::io::Error::other(e)))?;
        let rows = stmt
            .query_map([], |r| r.get::<_, String>(0))
            .map_err(|e| PampaError::io(&self.path, std::io::Error::other(e)))?;
        let mut out = HashSet::new();
        for r in rows {
            out.insert(r.map_err(|e| PampaError::io(&self.path, std::io::Error::other(e)))?);
        }
        Ok(out)
    }

    pub fn count_chunks(&self) -> Result<usize> {
        let conn = self.connect()?;
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM code_chunks", [], |r| r.get(0))
            .map_err(|e| PampaError::io(&self.path, std::io::Error::other(e)))?;
        Ok(n as usize)
    }

    // ── Intention cache (spec §4.12 Phase 1 / "Learning") ──────────────────

    pub fn get_intention(&self, normalized_query: &str) -> Result<Option<IntentionCacheRow>> {
        let conn = self.connect()?;
        conn.query_row(
            "SELECT query_normalized, original_query, target_sha, confidence, usage_count
             FROM intention_cache WHERE query_normalized = ?1",
            params![normalized_query],
            |r| {
                Ok(IntentionCacheRow {
                    query_normalized: r.get(0)?,
                    original_query: r.get(1)?,
                    target_sha: r.get(2)?,
                    confidence: r.get(3)?,
                    usage_count: r.get(4)?,
                })
            },
        )
        .optional()
        .map_err(|e| PampaError::io(&self.path, std::io::Error::other(e)))
    }

    /// On a re-hit: bump `usage_count`/`last_used`. On a new mapping: insert,
    /// overwriting `confidence` if it already existed (spec §3).
    pub fn record_intention_hit(&self, normalized_query: &str) -> Result<()> {
        let conn = self.connect()?;
        let now = now_iso();
        conn.execute(
            "UPDATE intention_cache SET usage_count = usage_count + 1, last_used = ?2
             WHERE query_normalized = ?1",
            params![normalized_query, now],
        )
        .map_err(|e| PampaError::io(&self.path, std::io::Error::other(e)))?;
        Ok(())
    }

    pub fn upsert_intention(&self, normalized: &str, original: &str, target_sha: &str, confidence: f32) -> Result<()> {
        let conn = self.connect()?;
        let now = now_iso();
        conn.execute(
            "INSERT INTO intention_cache
                (query_normalized, original_query, target_sha, confidence, usage_count, created_at, last_used)
             VALUES (?1, ?2, ?3, ?4, 1, ?5, ?5)
             ON CONFLICT(query_normalized) DO UPDATE SET
                original_query = excluded.original_query,
                target_sha = excluded.target_sha,
                confidence = excluded.confidence,
                last_used = excluded.last_used",
            params![normalized, original, target_sha, confidence, now],
        )
        .map_err(|e| PampaError::io(&self.path, std::io::Error::other(e)))?;
        Ok(())
    }

    // ── Query pattern analytics (spec §4.12 Phase 2) ────────────────────────

    pub fn record_query_pattern(&self, pattern: &str) -> Result<()> {
        let conn = self.connect()?;
        let now = now_iso();
        conn.execute(
            "INSERT INTO query_patterns (pattern, frequency, created_at, updated_at)
             VALUES (?1, 1, ?2, ?2)
             ON CONFLICT(pattern) DO UPDATE SET
                frequency = frequency + 1,
                updated_at = excluded.updated_at",
            params![pattern, now],
        )
        .map_err(|e| PampaError::io(&self.path, std::io::Error::other(e)))?;
        Ok(())
    }

    pub fn top_query_patterns(&self, limit: usize) -> Result<Vec<(String, i64)>> {
        let conn = self.connect()?;
        let mut stmt = conn
            .prepare("SELECT pattern, frequency FROM query_patterns ORDER BY frequency DESC LIMIT ?1")
            .map_err(|e| PampaError::io(&self.path, std::io::Error::other(e)))?;
        let rows = stmt
            .query_map(params![limit as i64], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))
            .map_err(|e| PampaError::io(&self.path, std::io::Error::other(e)))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r.map_err(|e| PampaError::io(&self.path, std::io::Error::other(e)))?);
        }
        Ok(out)
    }
}

fn row_to_chunk(r: &rusqlite::Row) -> rusqlite::Result<ChunkRow> {
    let tags_json: String = r.get(9)?;
    let vars_json: String = r.get(13)?;
    let context_json: String = r.get(14)?;
    let embedding_blob: Vec<u8> = r.get(6)?;
    Ok(ChunkRow {
        chunk_id: r.get(0)?,
        file_path: r.get(1)?,
        symbol: r.get(2)?,
        sha: r.get(3)?,
        lang: r.get(4)?,
        chunk_type: r.get(5)?,
        embedding: decode_embedding(&embedding_blob),
        embedding_provider: r.get(7)?,
        embedding_dimensions: r.get::<_, i64>(8)? as usize,
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        intent: r.get(10)?,
        description: r.get(11)?,
        doc_comments: r.get(12)?,
        variables_used: serde_json::from_str(&vars_json).unwrap_or_default(),
        context_info: serde_json::from_str(&context_json).unwrap_or(serde_json::Value::Null),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_row(chunk_id: &str, file: &str, provider: &str, dims: usize) -> ChunkRow {
        ChunkRow {
            chunk_id: chunk_id.to_string(),
            file_path: file.to_string(),
            symbol: "foo".to_string(),
            sha: "sha1".to_string(),
            lang: "rust".to_string(),
            chunk_type: "function".to_string(),
            embedding: vec![0.1, 0.2, 0.3],
            embedding_provider: provider.to_string(),
            embedding_dimensions: dims,
            tags: vec!["auth".into()],
            intent: Some("validate credentials".into()),
            description: None,
            doc_comments: None,
            variables_used: vec![],
            context_info: serde_json::json!({"startLine": 1, "endLine": 10}),
        }
    }

    #[test]
    fn embedding_round_trips() {
        let v = vec![1.0_f32, -2.5, 0.0, 3.25];
        let blob = encode_embedding(&v);
        assert_eq!(decode_embedding(&blob), v);
    }

    #[test]
    fn malformed_embedding_blob_decodes_to_empty() {
        assert_eq!(decode_embedding(&[1, 2]), Vec::<f32>::new());
        assert_eq!(decode_embedding(&[5, 0, 0, 0]), Vec::<f32>::new());
    }

    #[test]
    fn upsert_then_fetch_by_provider() {
        let dir = tempfile::tempdir().unwrap();
        let db = MetadataDb::open(dir.path()).unwrap();
        db.upsert_chunk(&sample_row("a.rs:foo:sha1", "a.rs", "openai", 1536)).unwrap();
        db.upsert_chunk(&sample_row("b.rs:bar:sha2", "b.rs", "cohere", 1024)).unwrap();

        let openai_rows = db.chunks_for_provider("openai", 1536).unwrap();
        assert_eq!(openai_rows.len(), 1);
        assert_eq!(openai_rows[0].file_path, "a.rs");

        let cohere_rows = db.chunks_for_provider("cohere", 1024).unwrap();
        assert_eq!(cohere_rows.len(), 1);

        // I2: a provider/dims mismatch returns nothing.
        assert!(db.chunks_for_provider("openai", 1024).unwrap().is_empty());
    }

    #[test]
    fn upsert_is_idempotent_on_chunk_id() {
        let dir = tempfile::tempdir().unwrap();
        let db = MetadataDb::open(dir.path()).unwrap();
        db.upsert_chunk(&sample_row("a.rs:foo:sha1", "a.rs", "openai", 1536)).unwrap();
        let mut updated = sample_row("a.rs:foo:sha1", "a.rs", "openai", 1536);
        updated.sha = "sha2".to_string();
        db.upsert_chunk(&updated).unwrap();

        assert_eq!(db.count_chunks().unwrap(), 1);
        assert_eq!(db.chunk_sha("a.rs:foo:sha1").unwrap().unwrap(), "sha2");
    }

    #[test]
    fn delete_chunks_for_file_removes_only_that_file() {
        let dir = tempfile::tempdir().unwrap();
        let db = MetadataDb::open(dir.path()).unwrap();
        db.upsert_chunk(&sample_row("a.rs:foo:s1", "a.rs", "local", 256)).unwrap();
        db.upsert_chunk(&sample_row("b.rs:bar:s2", "b.rs", "local", 256)).unwrap();

        let n = db.delete_chunks_for_file("a.rs").unwrap();
        assert_eq!(n, 1);
        assert_eq!(db.count_chunks().unwrap(), 1);
    }

    #[test]
    fn database_not_found_when_file_removed_after_open() {
        let dir = tempfile::tempdir().unwrap();
        let db = MetadataDb::open(dir.path()).unwrap();
        std::fs::remove_file(db.path()).unwrap();
        let err = db.chunks_for_provider("local", 256).unwrap_err();
        assert!(matches!(err, PampaError::DatabaseNotFound { .. }));
    }

    #[test]
    fn intention_cache_upsert_and_hit() {
        let dir = tempfile::tempdir().unwrap();
        let db = MetadataDb::open(dir.path()).unwrap();
        db.upsert_intention("create checkout session", "Create checkout session?", "sha-abc", 0.91).unwrap();

        let row = db.get_intention("create checkout session").unwrap().unwrap();
        assert_eq!(row.target_sha, "sha-abc");
        assert_eq!(row.usage_count, 1);

        db.record_intention_hit("create checkout session").unwrap();
        let row2 = db.get_intention("create checkout session").unwrap().unwrap();
        assert_eq!(row2.usage_count, 2);
    }

    #[test]
    fn query_pattern_frequency_accumulates() {
        let dir = tempfile::tempdir().unwrap();
        let db = MetadataDb::open(dir.path()).unwrap();
        db.record_query_pattern("create <ENTITY>Service").unwrap();
        db.record_query_pattern("create <ENTITY>Service").unwrap();
        db.record_query_pattern("list <ENTITY>Controller").unwrap();

        let top = db.top_query_patterns(10).unwrap();
        assert_eq!(top[0], ("create <ENTITY>Service".to_string(), 2));
    }
}
