//! Per-file Merkle manifest enabling incremental reindex (spec §4.2).
//!
//! Persisted at `<root>/.pampa/merkle.json` as `{ <file_path>: { shaFile, chunkShas[] } }`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::error::{PampaError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileManifestEntry {
    pub sha_file: String,
    pub chunk_shas: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MerkleManifest {
    #[serde(flatten)]
    entries: HashMap<String, FileManifestEntry>,
    #[serde(skip)]
    path: PathBuf,
}

pub fn sha1_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

impl MerkleManifest {
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(".pampa").join("merkle.json");
        let entries = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_default(),
            Err(_) => HashMap::new(),
        };
        Ok(Self { entries, path })
    }

    pub fn get(&self, rel_path: &str) -> Option<&FileManifestEntry> {
        self.entries.get(rel_path)
    }

    /// True when `sha_file` matches the stored value — the file can be skipped entirely.
    pub fn is_unchanged(&self, rel_path: &str, sha_file: &str) -> bool {
        self.entries
            .get(rel_path)
            .map(|e| e.sha_file == sha_file)
            .unwrap_or(false)
    }

    pub fn upsert(&mut self, rel_path: String, entry: FileManifestEntry) {
        self.entries.insert(rel_path, entry);
    }

    /// Removes the entry for `path`. Returns whether anything was removed.
    pub fn remove(&mut self, rel_path: &str) -> bool {
        self.entries.remove(rel_path).is_some()
    }

    pub fn paths(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Persists the manifest to disk, all-or-nothing from the caller's perspective.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PampaError::io(parent, e))?;
        }
        let text = serde_json::to_string_pretty(&self.entries).map_err(|e| PampaError::CorruptBlob {
            sha: "manifest".to_string(),
            reason: e.to_string(),
        })?;
        std::fs::write(&self.path, text).map_err(|e| PampaError::io(&self.path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unchanged_file_is_skippable() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = MerkleManifest::load(dir.path()).unwrap();
        m.upsert(
            "a.rs".into(),
            FileManifestEntry {
                sha_file: sha1_hex(b"content"),
                chunk_shas: vec!["x".into()],
            },
        );
        assert!(m.is_unchanged("a.rs", &sha1_hex(b"content")));
        assert!(!m.is_unchanged("a.rs", &sha1_hex(b"other")));
        assert!(!m.is_unchanged("missing.rs", &sha1_hex(b"content")));
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut m = MerkleManifest::load(dir.path()).unwrap();
            m.upsert(
                "a.rs".into(),
                FileManifestEntry {
                    sha_file: "deadbeef".into(),
                    chunk_shas: vec!["c1".into(), "c2".into()],
                },
            );
            m.save().unwrap();
        }
        let reloaded = MerkleManifest::load(dir.path()).unwrap();
        assert_eq!(reloaded.get("a.rs").unwrap().sha_file, "deadbeef");
        assert_eq!(reloaded.len(), 1);
    }

    #[test]
    fn remove_reports_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = MerkleManifest::load(dir.path()).unwrap();
        assert!(!m.remove("nope.rs"));
        m.upsert("a.rs".into(), FileManifestEntry::default());
        assert!(m.remove("a.rs"));
    }
}
