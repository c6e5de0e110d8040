use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Hard safety ceiling: files larger than this are always skipped at scan time,
/// regardless of configuration — protects low-RAM machines from Tree-sitter-parsing
/// a multi-megabyte minified bundle.
pub const ABSOLUTE_MAX_FILE_BYTES: u64 = 2_000_000;

/// Directories skipped unconditionally by the scanner and the watcher (spec §4.10).
pub const DEFAULT_EXCLUDED_DIR_NAMES: &[&str] = &[
    "node_modules",
    "vendor",
    ".git",
    ".pampa",
    ".pampax",
    "dist",
    "build",
    "tmp",
    "temp",
    ".npm",
    ".yarn",
    "$RECYCLE.BIN",
    ".Trash",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub exclude_dir_names: Vec<String>,
    pub max_file_bytes: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            exclude_dir_names: vec![],
            max_file_bytes: 512 * 1024,
        }
    }
}

/// Chunk size bounds (spec §4.5/§4.6), expressed in tokens. Defaults come from
/// the active embedding provider's model profile but can be overridden here or
/// via `PAMPAX_MAX_TOKENS` / `PAMPAX_DIMENSIONS`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkLimits {
    pub min_tokens: usize,
    pub optimal_tokens: usize,
    pub max_tokens: usize,
    pub overlap_tokens: usize,
}

impl Default for ChunkLimits {
    fn default() -> Self {
        Self {
            min_tokens: 20,
            optimal_tokens: 300,
            max_tokens: 700,
            overlap_tokens: 40,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncryptionMode {
    On,
    Off,
    Auto,
}

impl Default for EncryptionMode {
    fn default() -> Self {
        EncryptionMode::Auto
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RerankerMode {
    Off,
    Transformers,
    Api,
}

impl Default for RerankerMode {
    fn default() -> Self {
        RerankerMode::Off
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub hybrid: bool,
    pub bm25: bool,
    pub symbol_boost: bool,
    pub reranker: RerankerMode,
    pub default_limit: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            hybrid: true,
            bm25: true,
            symbol_boost: true,
            reranker: RerankerMode::Off,
            default_limit: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub debounce_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self { debounce_ms: 300 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub output_dir: PathBuf,
    pub scan: ScanConfig,
    pub chunk_limits: ChunkLimits,
    pub encryption: EncryptionMode,
    pub retrieval: RetrievalConfig,
    pub watcher: WatcherConfig,
    /// Rate limit, requests per minute. `None` = unlimited.
    pub rate_limit_rpm: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from(".pampa"),
            scan: ScanConfig::default(),
            chunk_limits: ChunkLimits::default(),
            encryption: EncryptionMode::default(),
            retrieval: RetrievalConfig::default(),
            watcher: WatcherConfig::default(),
            rate_limit_rpm: None,
        }
    }
}

impl Config {
    /// Applies the environment-variable overrides named in spec §6 on top of
    /// whatever was loaded from `.pampax.json` (or the default).
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(raw) = std::env::var("PAMPAX_MAX_TOKENS") {
            if let Ok(v) = raw.parse::<usize>() {
                self.chunk_limits.max_tokens = v;
            }
        }
        if let Ok(raw) = std::env::var("PAMPAX_RATE_LIMIT") {
            if let Ok(v) = raw.parse::<u32>() {
                self.rate_limit_rpm = Some(v);
            }
        }
        if let Ok(raw) = std::env::var("PAMPAX_RERANKER_DEFAULT") {
            self.retrieval.reranker = match raw.to_ascii_lowercase().as_str() {
                "transformers" => RerankerMode::Transformers,
                "api" => RerankerMode::Api,
                _ => RerankerMode::Off,
            };
        }
        self
    }
}

/// Loads `.pampax.json` from the repo root, falling back to defaults on any
/// read/parse error — mirrors the teacher's `load_config` (never hard-fails
/// CLI startup on a malformed config file).
pub fn load_config(repo_root: &Path) -> Config {
    let primary = repo_root.join(".pampax.json");
    let text = match std::fs::read_to_string(&primary) {
        Ok(t) => t,
        Err(_) => return Config::default().apply_env_overrides(),
    };
    serde_json::from_str::<Config>(&text)
        .unwrap_or_default()
        .apply_env_overrides()
}

/// Decodes `PAMPAX_ENCRYPTION_KEY` (base64 or hex) into a 32-byte AES-256-GCM key.
/// Decode errors are fatal at startup (spec §4.1), never per-write.
pub fn load_encryption_key() -> crate::error::Result<Option<[u8; 32]>> {
    let Ok(raw) = std::env::var("PAMPAX_ENCRYPTION_KEY") else {
        return Ok(None);
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }

    let bytes = if let Ok(b) = hex::decode(raw) {
        b
    } else {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD
            .decode(raw)
            .map_err(|e| crate::error::PampaError::InvalidEncryptionKey {
                reason: format!("not valid base64 or hex: {e}"),
            })?
    };

    if bytes.len() != 32 {
        return Err(crate::error::PampaError::InvalidEncryptionKey {
            reason: format!("expected 32 bytes, got {}", bytes.len()),
        });
    }

    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(Some(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // `std::env` is process-global; serialize tests that mutate it so they
    // don't race across threads within the same test binary.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn default_config_has_sane_chunk_bounds() {
        let cfg = Config::default();
        assert!(cfg.chunk_limits.min_tokens < cfg.chunk_limits.optimal_tokens);
        assert!(cfg.chunk_limits.optimal_tokens < cfg.chunk_limits.max_tokens);
    }

    #[test]
    fn missing_config_file_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_config(dir.path());
        assert_eq!(cfg.output_dir, PathBuf::from(".pampa"));
    }

    #[test]
    fn corrupt_config_file_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".pampax.json"), "{ not json").unwrap();
        let cfg = load_config(dir.path());
        assert_eq!(cfg.retrieval.default_limit, 10);
    }

    #[test]
    fn env_override_applies_max_tokens() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("PAMPAX_MAX_TOKENS", "999");
        let cfg = Config::default().apply_env_overrides();
        assert_eq!(cfg.chunk_limits.max_tokens, 999);
        std::env::remove_var("PAMPAX_MAX_TOKENS");
    }

    #[test]
    fn hex_encryption_key_decodes_to_32_bytes() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("PAMPAX_ENCRYPTION_KEY", "a".repeat(64));
        let key = load_encryption_key().unwrap();
        assert_eq!(key.unwrap().len(), 32);
        std::env::remove_var("PAMPAX_ENCRYPTION_KEY");
    }

    #[test]
    fn wrong_length_key_is_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("PAMPAX_ENCRYPTION_KEY", "deadbeef");
        let err = load_encryption_key().unwrap_err();
        assert!(matches!(err, crate::error::PampaError::InvalidEncryptionKey { .. }));
        std::env::remove_var("PAMPAX_ENCRYPTION_KEY");
    }
}
