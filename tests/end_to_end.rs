//! Library-level smoke tests for the index → update → search lifecycle
//! (spec §8), replacing the teacher's MCP stdio smoke test since the
//! transport layer itself is out of scope here.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use pampax::config::Config;
use pampax::embedding::{EmbeddingProvider, ModelProfile};
use pampax::error::{PampaError, Result};
use pampax::retrieval::SearchScope;

// `PAMPAX_ENCRYPTION_KEY` is process-global; only `encrypted_round_trip_via_env_key`
// touches it, but it's guarded anyway since `cargo test` runs these concurrently.
static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// A deterministic, dependency-free provider: each dimension is a hash of a
/// fixed-size shingle of the input text. Good enough to exercise cosine
/// similarity ordering without a real model.
#[derive(Debug, Default)]
struct HashProvider;

const DIMS: usize = 32;

#[async_trait]
impl EmbeddingProvider for HashProvider {
    async fn init(&mut self) -> Result<()> {
        Ok(())
    }

    async fn generate(&self, text: &str) -> Result<Vec<f32>> {
        let mut v = vec![0.0f32; DIMS];
        for (i, word) in text.split_whitespace().enumerate() {
            let mut h: u64 = 1469598103934665603;
            for b in word.bytes() {
                h ^= b as u64;
                h = h.wrapping_mul(1099511628211);
            }
            v[(h as usize + i) % DIMS] += 1.0;
        }
        Ok(v)
    }

    fn dimensions(&self) -> usize {
        DIMS
    }

    fn name(&self) -> &'static str {
        "hash-test"
    }

    fn model_name(&self) -> Option<String> {
        None
    }

    fn profile(&self) -> ModelProfile {
        ModelProfile {
            max_tokens: 700,
            optimal_tokens: 300,
            min_chunk_tokens: 20,
            max_chunk_tokens: 700,
            overlap_tokens: 40,
            max_chunk_chars: 4000,
            dimensions: DIMS,
            use_tokens: true,
            tokenizer_type: "hash",
        }
    }
}

fn write_repo(dir: &Path) {
    std::fs::write(
        dir.join("auth.rs"),
        r#"
/// Validates a user's credentials against the stored hash.
/// @pampa-tags: auth, security
/// @pampa-intent: check whether a login attempt is valid
fn validate_credentials(username: &str, password: &str) -> bool {
    let hash = hash_password(password);
    lookup_user(username).map(|u| u.hash == hash).unwrap_or(false)
}

fn hash_password(password: &str) -> String {
    format!("hashed:{password}")
}

struct User {
    hash: String,
}

fn lookup_user(_username: &str) -> Option<User> {
    None
}
"#,
    )
    .unwrap();

    std::fs::write(
        dir.join("checkout.rs"),
        r#"
/// Creates a checkout session for the given cart.
/// @pampa-tags: billing, stripe
fn create_checkout_session(cart_id: &str) -> String {
    format!("session-for-{cart_id}")
}
"#,
    )
    .unwrap();
}

async fn index_repo(dir: &Path) -> pampax::indexer::IndexStats {
    let config = Config::default();
    let mut provider = HashProvider;
    EmbeddingProvider::init(&mut provider).await.unwrap();

    pampax::indexer::index(
        pampax::indexer::IndexRequest {
            repo_root: dir,
            provider: &provider,
            config: &config,
            changed_files: None,
            deleted_files: None,
            encrypt_mode_override: None,
        },
        |_| {},
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn fresh_index_then_search_finds_the_right_chunk() {
    let dir = tempfile::tempdir().unwrap();
    write_repo(dir.path());

    let stats = index_repo(dir.path()).await;
    assert!(stats.processed_chunks >= 2, "expected at least 2 chunks, got {}", stats.processed_chunks);
    assert!(stats.errors.is_empty(), "unexpected errors: {:?}", stats.errors);

    let provider = HashProvider;
    let results = pampax::retrieval::search(pampax::retrieval::SearchRequest {
        query: "validate credentials",
        limit: 5,
        repo_root: dir.path(),
        provider: &provider,
        scope: SearchScope::default(),
        default_hybrid: true,
        default_bm25: true,
        default_symbol_boost: true,
    })
    .await
    .unwrap();

    assert!(!results.is_empty());
    assert!(results.iter().any(|r| r.symbol == "validate_credentials"));
}

#[tokio::test]
async fn rerunning_index_skips_unchanged_files() {
    let dir = tempfile::tempdir().unwrap();
    write_repo(dir.path());

    let first = index_repo(dir.path()).await;
    assert!(first.processed_chunks > 0);

    let second = index_repo(dir.path()).await;
    assert_eq!(second.processed_chunks, 0, "second pass should skip everything via the Merkle manifest");
    assert_eq!(second.total_chunks, first.total_chunks);
}

#[tokio::test]
async fn incremental_update_reindexes_only_the_touched_file() {
    let dir = tempfile::tempdir().unwrap();
    write_repo(dir.path());
    index_repo(dir.path()).await;

    std::fs::write(
        dir.path().join("checkout.rs"),
        r#"
/// Creates a checkout session for the given cart, now with currency support.
/// @pampa-tags: billing, stripe
fn create_checkout_session(cart_id: &str, currency: &str) -> String {
    format!("session-for-{cart_id}-{currency}")
}
"#,
    )
    .unwrap();

    let config = Config::default();
    let mut provider = HashProvider;
    EmbeddingProvider::init(&mut provider).await.unwrap();
    let stats = pampax::indexer::index(
        pampax::indexer::IndexRequest {
            repo_root: dir.path(),
            provider: &provider,
            config: &config,
            changed_files: Some(vec![PathBuf::from("checkout.rs")]),
            deleted_files: None,
            encrypt_mode_override: None,
        },
        |_| {},
    )
    .await
    .unwrap();

    assert_eq!(stats.processed_chunks, 1);
}

#[tokio::test]
async fn deleting_a_file_removes_its_chunks() {
    let dir = tempfile::tempdir().unwrap();
    write_repo(dir.path());
    let first = index_repo(dir.path()).await;

    let config = Config::default();
    let mut provider = HashProvider;
    EmbeddingProvider::init(&mut provider).await.unwrap();
    let stats = pampax::indexer::index(
        pampax::indexer::IndexRequest {
            repo_root: dir.path(),
            provider: &provider,
            config: &config,
            changed_files: Some(vec![]),
            deleted_files: Some(vec![PathBuf::from("checkout.rs")]),
            encrypt_mode_override: None,
        },
        |_| {},
    )
    .await
    .unwrap();

    assert!(stats.total_chunks < first.total_chunks);
}

#[tokio::test]
async fn search_with_wrong_provider_reports_no_chunks_found() {
    let dir = tempfile::tempdir().unwrap();
    write_repo(dir.path());
    index_repo(dir.path()).await;

    #[derive(Debug, Default)]
    struct OtherProvider;
    #[async_trait]
    impl EmbeddingProvider for OtherProvider {
        async fn init(&mut self) -> Result<()> {
            Ok(())
        }
        async fn generate(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(vec![0.0; 8])
        }
        fn dimensions(&self) -> usize {
            8
        }
        fn name(&self) -> &'static str {
            "other"
        }
        fn model_name(&self) -> Option<String> {
            None
        }
        fn profile(&self) -> ModelProfile {
            ModelProfile {
                max_tokens: 700,
                optimal_tokens: 300,
                min_chunk_tokens: 20,
                max_chunk_tokens: 700,
                overlap_tokens: 40,
                max_chunk_chars: 4000,
                dimensions: 8,
                use_tokens: true,
                tokenizer_type: "other",
            }
        }
    }

    let provider = OtherProvider;
    let err = pampax::retrieval::search(pampax::retrieval::SearchRequest {
        query: "anything",
        limit: 5,
        repo_root: dir.path(),
        provider: &provider,
        scope: SearchScope::default(),
        default_hybrid: true,
        default_bm25: true,
        default_symbol_boost: true,
    })
    .await
    .unwrap_err();

    assert!(matches!(err, PampaError::NoChunksFound { .. }));
}

#[tokio::test]
async fn context_pack_narrows_search_scope() {
    let dir = tempfile::tempdir().unwrap();
    write_repo(dir.path());
    index_repo(dir.path()).await;

    let pack = pampax::contextpacks::ContextPack {
        name: "billing".to_string(),
        description: Some("billing-only code".to_string()),
        path_glob: vec!["checkout.rs".to_string()],
        ..Default::default()
    };
    pampax::contextpacks::save(dir.path(), &pack).unwrap();

    let loaded = pampax::contextpacks::load(dir.path(), "billing").unwrap();
    let scope = loaded.into_scope();
    assert_eq!(scope.path_glob, vec!["checkout.rs".to_string()]);

    let provider = HashProvider;
    let results = pampax::retrieval::search(pampax::retrieval::SearchRequest {
        query: "checkout session",
        limit: 5,
        repo_root: dir.path(),
        provider: &provider,
        scope,
        default_hybrid: true,
        default_bm25: true,
        default_symbol_boost: true,
    })
    .await
    .unwrap();

    assert!(results.iter().all(|r| r.file_path == "checkout.rs"));
}

#[tokio::test]
async fn listing_context_packs_returns_saved_packs_sorted() {
    let dir = tempfile::tempdir().unwrap();
    pampax::contextpacks::save(
        dir.path(),
        &pampax::contextpacks::ContextPack { name: "zzz".to_string(), ..Default::default() },
    )
    .unwrap();
    pampax::contextpacks::save(
        dir.path(),
        &pampax::contextpacks::ContextPack { name: "aaa".to_string(), ..Default::default() },
    )
    .unwrap();

    let packs = pampax::list_context_packs(dir.path()).unwrap();
    let names: Vec<&str> = packs.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["aaa", "zzz"]);
}

#[tokio::test]
async fn encrypted_round_trip_via_env_key() {
    let _guard = ENV_LOCK.lock().unwrap();
    let dir = tempfile::tempdir().unwrap();
    write_repo(dir.path());

    let key = "a".repeat(64);
    std::env::set_var("PAMPAX_ENCRYPTION_KEY", &key);

    let mut config = Config::default();
    config.encryption = pampax::config::EncryptionMode::On;

    let mut provider = HashProvider;
    EmbeddingProvider::init(&mut provider).await.unwrap();
    let stats = pampax::indexer::index(
        pampax::indexer::IndexRequest {
            repo_root: dir.path(),
            provider: &provider,
            config: &config,
            changed_files: None,
            deleted_files: None,
            encrypt_mode_override: None,
        },
        |_| {},
    )
    .await
    .unwrap();
    assert!(stats.processed_chunks > 0);

    let db = pampax::db::MetadataDb::open(dir.path()).unwrap();
    let chunk_ids = db.chunk_ids_for_file("auth.rs").unwrap();
    let chunk_id = chunk_ids.iter().next().unwrap();
    let chunk = pampax::get_chunk(dir.path(), chunk_id).unwrap().unwrap();
    assert!(chunk.code.contains("fn"));

    std::env::remove_var("PAMPAX_ENCRYPTION_KEY");
}

#[tokio::test]
async fn stats_and_overview_reflect_indexed_state() {
    let dir = tempfile::tempdir().unwrap();
    write_repo(dir.path());
    index_repo(dir.path()).await;

    let stats = pampax::get_stats(dir.path()).unwrap();
    assert_eq!(stats.files, 2);
    assert!(stats.total_chunks >= 2);
    assert_eq!(stats.providers, vec![("hash-test".to_string(), DIMS)]);

    let overview = pampax::get_overview(dir.path()).unwrap();
    let files: Vec<&str> = overview.iter().map(|f| f.file.as_str()).collect();
    assert!(files.contains(&"auth.rs"));
    assert!(files.contains(&"checkout.rs"));
    let auth = overview.iter().find(|f| f.file == "auth.rs").unwrap();
    assert!(auth.symbols.contains(&"validate_credentials".to_string()));
}

#[tokio::test]
async fn watcher_reindexes_on_file_change() {
    let dir = tempfile::tempdir().unwrap();
    write_repo(dir.path());

    let config = Config::default();
    let mut provider = HashProvider;
    EmbeddingProvider::init(&mut provider).await.unwrap();

    let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::<pampax::watcher::WatchBatch>::new()));
    let seen_writer = seen.clone();

    let handle = pampax::watcher::watch(
        pampax::watcher::WatchRequest { repo_root: dir.path(), config, debounce_ms: Some(50) },
        Box::new(provider),
        move |batch| seen_writer.lock().unwrap().push(batch),
    )
    .unwrap();

    std::fs::write(dir.path().join("auth.rs"), "fn touched() {}\n").unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(400)).await;
    handle.close().await;

    let batches = seen.lock().unwrap();
    assert!(!batches.is_empty(), "watcher should have fired at least one batch");
    assert!(batches.iter().any(|b| b.changed.iter().any(|p| p.ends_with("auth.rs"))));
}
