//! Context packs (spec §6): user-authored named scope presets under
//! `.pampa/contextpacks/*.json`, applied on top of (never replacing) CLI/API
//! scope arguments.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::RerankerMode;
use crate::error::{PampaError, Result};
use crate::retrieval::SearchScope;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextPack {
    pub name: String,
    pub description: Option<String>,
    pub path_glob: Vec<String>,
    pub tags: Vec<String>,
    pub lang: Vec<String>,
    pub reranker: Option<RerankerMode>,
    pub hybrid: Option<bool>,
    pub bm25: Option<bool>,
    pub symbol_boost: Option<bool>,
}

impl Default for ContextPack {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: None,
            path_glob: vec![],
            tags: vec![],
            lang: vec![],
            reranker: None,
            hybrid: None,
            bm25: None,
            symbol_boost: None,
        }
    }
}

impl ContextPack {
    pub fn into_scope(self) -> SearchScope {
        SearchScope {
            path_glob: self.path_glob,
            tags: self.tags,
            lang: self.lang,
            hybrid: self.hybrid,
            bm25: self.bm25,
            reranker: self.reranker,
            symbol_boost: self.symbol_boost,
        }
    }
}

fn packs_dir(repo_root: &Path) -> PathBuf {
    repo_root.join(".pampa").join("contextpacks")
}

/// Loads `<name>.json` from `.pampa/contextpacks/`. Missing file or invalid
/// JSON are both reported, unlike `Config::load` — a context pack the caller
/// named explicitly should fail loudly rather than silently falling back.
pub fn load(repo_root: &Path, name: &str) -> Result<ContextPack> {
    let path = packs_dir(repo_root).join(format!("{name}.json"));
    let text = std::fs::read_to_string(&path).map_err(|e| PampaError::io(&path, e))?;
    serde_json::from_str(&text).map_err(|e| PampaError::CorruptBlob {
        sha: format!("contextpack:{name}"),
        reason: e.to_string(),
    })
}

/// Lists every context pack defined for this repo, sorted by name. Returns an
/// empty list (not an error) when the directory doesn't exist yet.
pub fn list(repo_root: &Path) -> Result<Vec<ContextPack>> {
    let dir = packs_dir(repo_root);
    let entries = match std::fs::read_dir(&dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(PampaError::io(&dir, e)),
    };

    let mut packs = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| PampaError::io(&dir, e))?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Ok(text) = std::fs::read_to_string(&path) else { continue };
        if let Ok(pack) = serde_json::from_str::<ContextPack>(&text) {
            packs.push(pack);
        }
    }
    packs.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(packs)
}

/// Writes `pack` to `.pampa/contextpacks/<name>.json`, creating the directory
/// if needed.
pub fn save(repo_root: &Path, pack: &ContextPack) -> Result<()> {
    let dir = packs_dir(repo_root);
    std::fs::create_dir_all(&dir).map_err(|e| PampaError::io(&dir, e))?;
    let path = dir.join(format!("{}.json", pack.name));
    let text = serde_json::to_string_pretty(pack).map_err(|e| PampaError::CorruptBlob {
        sha: format!("contextpack:{}", pack.name),
        reason: e.to_string(),
    })?;
    std::fs::write(&path, text).map_err(|e| PampaError::io(&path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(name: &str) -> ContextPack {
        ContextPack {
            name: name.to_string(),
            description: Some("auth-related code".into()),
            path_glob: vec!["src/auth/**".into()],
            tags: vec!["auth".into()],
            ..Default::default()
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        save(dir.path(), &sample("auth")).unwrap();
        let loaded = load(dir.path(), "auth").unwrap();
        assert_eq!(loaded.path_glob, vec!["src/auth/**".to_string()]);
        assert_eq!(loaded.tags, vec!["auth".to_string()]);
    }

    #[test]
    fn list_is_empty_when_directory_absent() {
        let dir = tempfile::tempdir().unwrap();
        assert!(list(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn list_returns_sorted_packs() {
        let dir = tempfile::tempdir().unwrap();
        save(dir.path(), &sample("zeta")).unwrap();
        save(dir.path(), &sample("alpha")).unwrap();
        let names: Vec<String> = list(dir.path()).unwrap().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["alpha".to_string(), "zeta".to_string()]);
    }

    #[test]
    fn load_missing_pack_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(dir.path(), "nope").is_err());
    }
}
