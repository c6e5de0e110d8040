//! Git-committed JSON mirror of chunk metadata (spec §4.4).
//!
//! Serialized to `<root>/pampax.codemap.json` as pretty-printed, key-sorted
//! JSON so diffs stay stable across commits. `BTreeMap` gives us the
//! stable-sort for free.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PampaError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CodemapFlags {
    pub has_pampa_tags: bool,
    pub has_intent: bool,
    pub has_documentation: bool,
    pub variable_count: usize,
    pub encrypted: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CodemapEntry {
    pub file: String,
    pub symbol: String,
    pub sha: String,
    pub lang: String,
    pub chunk_type: String,
    pub provider: String,
    pub dimensions: usize,
    pub flags: CodemapFlags,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub parameters: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_type: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub calls: Vec<String>,

    /// User-authored fields (`synonyms`, `weights`, ...) that must survive a
    /// re-index untouched. Kept as opaque JSON so the indexer never needs to
    /// know every possible user extension ahead of time.
    #[serde(flatten)]
    pub user_fields: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Default)]
pub struct Codemap {
    entries: BTreeMap<String, CodemapEntry>,
    path: PathBuf,
}

impl Codemap {
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join("pampax.codemap.json");
        let entries: BTreeMap<String, CodemapEntry> = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_default(),
            Err(_) => BTreeMap::new(),
        };
        Ok(Self { entries, path })
    }

    pub fn get(&self, chunk_id: &str) -> Option<&CodemapEntry> {
        self.entries.get(chunk_id)
    }

    /// Merges `new_entry` into the map, preserving any `user_fields` already
    /// recorded for this chunk id (spec §4.4: "preserving user-authored fields").
    pub fn upsert(&mut self, chunk_id: String, mut new_entry: CodemapEntry) {
        if let Some(prev) = self.entries.get(&chunk_id) {
            for (k, v) in &prev.user_fields {
                new_entry.user_fields.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }
        self.entries.insert(chunk_id, new_entry);
    }

    pub fn remove(&mut self, chunk_id: &str) -> Option<CodemapEntry> {
        self.entries.remove(chunk_id)
    }

    /// Drops every entry whose `file` is not in `existing_files`.
    pub fn retain_files(&mut self, existing_files: &std::collections::HashSet<String>) {
        self.entries.retain(|_, e| existing_files.contains(&e.file));
    }

    pub fn entries_for_file<'a>(&'a self, file: &'a str) -> impl Iterator<Item = (&'a String, &'a CodemapEntry)> {
        self.entries.iter().filter(move |(_, e)| e.file == file)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &CodemapEntry)> {
        self.entries.iter()
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| PampaError::io(parent, e))?;
            }
        }
        let text = serde_json::to_string_pretty(&self.entries).map_err(|e| PampaError::CorruptBlob {
            sha: "codemap".to_string(),
            reason: e.to_string(),
        })?;
        std::fs::write(&self.path, text).map_err(|e| PampaError::io(&self.path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(file: &str, sha: &str) -> CodemapEntry {
        CodemapEntry {
            file: file.to_string(),
            symbol: "foo".to_string(),
            sha: sha.to_string(),
            lang: "rust".to_string(),
            chunk_type: "function".to_string(),
            provider: "local".to_string(),
            dimensions: 256,
            ..Default::default()
        }
    }

    #[test]
    fn upsert_preserves_user_fields() {
        let dir = tempfile::tempdir().unwrap();
        let mut map = Codemap::load(dir.path()).unwrap();

        let mut e1 = entry("a.rs", "sha1");
        e1.user_fields.insert("synonyms".into(), serde_json::json!(["alpha"]));
        map.upsert("a.rs:foo:sha1".into(), e1);

        let e2 = entry("a.rs", "sha2");
        map.upsert("a.rs:foo:sha1".into(), e2);

        let merged = map.get("a.rs:foo:sha1").unwrap();
        assert_eq!(merged.sha, "sha2");
        assert_eq!(merged.user_fields.get("synonyms").unwrap(), &serde_json::json!(["alpha"]));
    }

    #[test]
    fn retain_files_drops_deleted_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut map = Codemap::load(dir.path()).unwrap();
        map.upsert("a.rs:foo:s1".into(), entry("a.rs", "s1"));
        map.upsert("b.rs:bar:s2".into(), entry("b.rs", "s2"));

        let existing: std::collections::HashSet<String> = ["a.rs".to_string()].into_iter().collect();
        map.retain_files(&existing);

        assert_eq!(map.len(), 1);
        assert!(map.get("a.rs:foo:s1").is_some());
    }

    #[test]
    fn save_and_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut map = Codemap::load(dir.path()).unwrap();
            map.upsert("a.rs:foo:s1".into(), entry("a.rs", "s1"));
            map.save().unwrap();
        }
        let reloaded = Codemap::load(dir.path()).unwrap();
        assert_eq!(reloaded.len(), 1);

        let text = std::fs::read_to_string(dir.path().join("pampax.codemap.json")).unwrap();
        assert!(text.starts_with('{'));
    }
}
