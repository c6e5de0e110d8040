//! Content-addressed chunk blob store (spec §4.1).
//!
//! One file per chunk at `<root>/<sha>.gz` (plaintext gzip) or `<sha>.gz.enc`
//! (AES-256-GCM over gzip). At most one form exists per SHA at a time.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rand::RngCore;

use crate::config::EncryptionMode;
use crate::error::{PampaError, Result};

const MAGIC: &[u8; 4] = b"PMPX";
const VERSION: u8 = 1;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

pub struct WriteOutcome {
    pub encrypted: bool,
}

/// Blob store rooted at `<repo>/.pampa/chunks`.
pub struct ChunkStore {
    root: PathBuf,
    key: Option<[u8; 32]>,
    mode: EncryptionMode,
}

impl ChunkStore {
    pub fn open(root: impl Into<PathBuf>, mode: EncryptionMode, key: Option<[u8; 32]>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| PampaError::io(&root, e))?;
        Ok(Self { root, key, mode })
    }

    fn should_encrypt(&self) -> bool {
        match self.mode {
            EncryptionMode::On => true,
            EncryptionMode::Off => false,
            EncryptionMode::Auto => self.key.is_some(),
        }
    }

    fn plain_path(&self, sha: &str) -> PathBuf {
        self.root.join(format!("{sha}.gz"))
    }

    fn enc_path(&self, sha: &str) -> PathBuf {
        self.root.join(format!("{sha}.gz.enc"))
    }

    /// Writes `bytes` under `sha`, producing the preferred form (plaintext or
    /// encrypted, per the resolved encryption policy) and removing the other.
    pub fn write(&self, sha: &str, bytes: &[u8]) -> Result<WriteOutcome> {
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(bytes)
            .map_err(|e| PampaError::io(self.plain_path(sha), e))?;
        let compressed = gz
            .finish()
            .map_err(|e| PampaError::io(self.plain_path(sha), e))?;

        let encrypt = self.should_encrypt();
        if encrypt {
            let key = self.key.ok_or_else(|| PampaError::EncryptionKeyRequired { sha: sha.to_string() })?;
            let ciphertext = encrypt_blob(&key, &compressed)?;
            std::fs::write(self.enc_path(sha), ciphertext).map_err(|e| PampaError::io(self.enc_path(sha), e))?;
            let _ = std::fs::remove_file(self.plain_path(sha));
        } else {
            std::fs::write(self.plain_path(sha), &compressed)
                .map_err(|e| PampaError::io(self.plain_path(sha), e))?;
            let _ = std::fs::remove_file(self.enc_path(sha));
        }

        Ok(WriteOutcome { encrypted: encrypt })
    }

    /// Reads and decompresses (and decrypts, if necessary) the bytes stored under `sha`.
    pub fn read(&self, sha: &str) -> Result<Vec<u8>> {
        let plain = self.plain_path(sha);
        let enc = self.enc_path(sha);

        if plain.exists() {
            let raw = std::fs::read(&plain).map_err(|e| PampaError::io(&plain, e))?;
            return gunzip(&raw, sha);
        }

        if enc.exists() {
            let Some(key) = self.key else {
                return Err(PampaError::EncryptionKeyRequired { sha: sha.to_string() });
            };
            let raw = std::fs::read(&enc).map_err(|e| PampaError::io(&enc, e))?;
            let compressed = decrypt_blob(&key, &raw, sha)?;
            return gunzip(&compressed, sha);
        }

        Err(PampaError::NotFound {
            sha: sha.to_string(),
            root: self.root.clone(),
        })
    }

    pub fn remove(&self, sha: &str) -> Result<()> {
        let plain = self.plain_path(sha);
        let enc = self.enc_path(sha);
        if plain.exists() {
            std::fs::remove_file(&plain).map_err(|e| PampaError::io(&plain, e))?;
        }
        if enc.exists() {
            std::fs::remove_file(&enc).map_err(|e| PampaError::io(&enc, e))?;
        }
        Ok(())
    }

    pub fn exists(&self, sha: &str) -> bool {
        self.plain_path(sha).exists() || self.enc_path(sha).exists()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn gunzip(compressed: &[u8], sha: &str) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(compressed);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).map_err(|e| PampaError::CorruptBlob {
        sha: sha.to_string(),
        reason: e.to_string(),
    })?;
    Ok(out)
}

/// `magic(4) || version(1) || nonce(12) || ciphertext || tag(16)` (spec §4.1).
fn encrypt_blob(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| PampaError::InvalidEncryptionKey {
        reason: e.to_string(),
    })?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| PampaError::InvalidEncryptionKey {
            reason: format!("encryption failed: {e}"),
        })?;

    let mut out = Vec::with_capacity(4 + 1 + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(MAGIC);
    out.push(VERSION);
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn decrypt_blob(key: &[u8; 32], data: &[u8], sha: &str) -> Result<Vec<u8>> {
    if data.len() < 4 + 1 + NONCE_LEN + TAG_LEN || &data[0..4] != MAGIC {
        return Err(PampaError::CorruptBlob {
            sha: sha.to_string(),
            reason: "missing or invalid magic header".to_string(),
        });
    }

    let nonce = Nonce::from_slice(&data[5..5 + NONCE_LEN]);
    let ciphertext = &data[5 + NONCE_LEN..];

    let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| PampaError::InvalidEncryptionKey {
        reason: e.to_string(),
    })?;

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| PampaError::DecryptFailed { sha: sha.to_string() })
}
