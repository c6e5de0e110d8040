use std::path::PathBuf;

use thiserror::Error;

/// Semantic error categories surfaced by the indexing and retrieval pipeline.
///
/// Callers that just want to propagate use `anyhow::Error: From<PampaError>` at
/// the CLI boundary; callers that need to branch (e.g. "is this a soft search
/// failure or a fatal startup error?") match on the variant.
#[derive(Debug, Error)]
pub enum PampaError {
    #[error("chunk {sha} not found in chunk store at {root}")]
    NotFound { sha: String, root: PathBuf },

    #[error("chunk blob for {sha} is corrupt: {reason}")]
    CorruptBlob { sha: String, reason: String },

    #[error(
        "chunk {sha} is encrypted but no PAMPAX_ENCRYPTION_KEY is configured; \
         set PAMPAX_ENCRYPTION_KEY (32 bytes, base64 or hex) and retry"
    )]
    EncryptionKeyRequired { sha: String },

    #[error("failed to decrypt chunk {sha}: authentication tag mismatch")]
    DecryptFailed { sha: String },

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "no database found at {path}; run `pampax index` first \
         (or pass --path to point at an already-indexed repo)"
    )]
    DatabaseNotFound { path: PathBuf },

    #[error("no chunks are indexed for provider '{provider}' ({dimensions} dims) under {path}")]
    NoChunksFound {
        provider: String,
        dimensions: usize,
        path: PathBuf,
    },

    #[error("no matches cleared the relevance threshold for query {query:?}")]
    NoRelevantMatches { query: String },

    #[error("search failed: {reason}")]
    SearchError { reason: String },

    #[error("failed to parse {path} as {lang}: {reason}")]
    ParseError {
        path: PathBuf,
        lang: String,
        reason: String,
    },

    #[error("tokenizer unavailable ({reason}); downgrading to character estimate")]
    TokenizerUnavailable { reason: String },

    #[error("rate limit exhausted after {attempts} attempts for {operation}")]
    RateLimitExhausted { operation: String, attempts: u32 },

    #[error("invalid encryption key: {reason}")]
    InvalidEncryptionKey { reason: String },
}

pub type Result<T> = std::result::Result<T, PampaError>;

impl PampaError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PampaError::Io {
            path: path.into(),
            source,
        }
    }

    /// A short, user-actionable suggestion to pair with `message()` in structured
    /// API responses (spec §7: every fatal error carries a concrete next action).
    pub fn suggestion(&self) -> Option<String> {
        match self {
            PampaError::DatabaseNotFound { path } => Some(format!(
                "run `pampax index {}` to build the metadata database",
                path.display()
            )),
            PampaError::EncryptionKeyRequired { .. } => Some(
                "set PAMPAX_ENCRYPTION_KEY to the base64 or hex 32-byte key used at index time"
                    .to_string(),
            ),
            PampaError::NoChunksFound { provider, .. } => Some(format!(
                "reindex with --provider {provider} or search with the provider this repo was indexed under"
            )),
            PampaError::NoRelevantMatches { .. } => {
                Some("broaden the query or relax scope filters (tags/path_glob/lang)".to_string())
            }
            _ => None,
        }
    }
}
