use anyhow::{Context, Result};
use ignore::WalkBuilder;
use ignore::overrides::{Override, OverrideBuilder};
use std::path::{Path, PathBuf};

use crate::config::DEFAULT_EXCLUDED_DIR_NAMES;
use crate::languages;

/// Builds the directory/pattern deny-list shared by the scanner and the
/// watcher (spec §4.10, §4.14): `config::DEFAULT_EXCLUDED_DIR_NAMES` plus a
/// few universally-noisy file patterns (lockfiles, sourcemaps, binary assets)
/// and any project-specific names from `.pampax.json`.
fn default_overrides(repo_root: &Path, exclude_dir_names: &[String]) -> Result<Override> {
    let mut ob = OverrideBuilder::new(repo_root);

    ob.add("**/*.lock")?;
    ob.add("**/package-lock.json")?;
    ob.add("**/pnpm-lock.yaml")?;
    ob.add("**/yarn.lock")?;
    ob.add("**/Cargo.lock")?;

    ob.add("**/*.map")?;
    ob.add("**/*.svg")?;
    ob.add("**/*.png")?;
    ob.add("**/*.ico")?;
    ob.add("**/*.jpg")?;
    ob.add("**/*.jpeg")?;
    ob.add("**/*.gif")?;

    for d in DEFAULT_EXCLUDED_DIR_NAMES {
        ob.add(&format!("**/{d}"))?;
        ob.add(&format!("**/{d}/**"))?;
    }

    for d in exclude_dir_names {
        let d = d.trim().trim_matches('/');
        if d.is_empty() {
            continue;
        }
        ob.add(&format!("**/{d}"))?;
        ob.add(&format!("**/{d}/**"))?;
    }

    Ok(ob.build()?)
}

/// True when `path`'s extension matches one of the 22 supported languages
/// (spec §6). Files outside this set are never candidates for chunking.
pub fn has_supported_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| languages::rule_for_extension(ext).is_some())
        .unwrap_or(false)
}

#[derive(Debug, Clone)]
pub struct FileEntry {
    pub abs_path: PathBuf,
    pub rel_path: PathBuf,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub repo_root: PathBuf,
    pub target: PathBuf,
    pub max_file_bytes: u64,
    pub exclude_dir_names: Vec<String>,
}

impl ScanOptions {
    pub fn target_root(&self) -> PathBuf {
        if self.target.is_absolute() {
            self.target.clone()
        } else {
            self.repo_root.join(&self.target)
        }
    }
}

pub fn scan_workspace(opts: &ScanOptions) -> Result<Vec<FileEntry>> {
    let target_root = opts.target_root();

    let meta = std::fs::metadata(&target_root)
        .with_context(|| format!("Target does not exist: {}", target_root.display()))?;

    if meta.is_file() {
        return scan_single_file(&opts.repo_root, &target_root, opts.max_file_bytes)
            .map(|v| v.into_iter().collect());
    }

    let mut entries = Vec::new();
    let overrides = default_overrides(&opts.repo_root, &opts.exclude_dir_names)?;
    let walker = WalkBuilder::new(&target_root)
        .standard_filters(true) // .gitignore, .ignore, hidden, etc.
        .overrides(overrides)
        .build();

    for item in walker {
        let dent = match item {
            Ok(d) => d,
            Err(_) => continue,
        };

        if !dent.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
            continue;
        }

        let abs_path = dent.into_path();
        if !has_supported_extension(&abs_path) {
            continue;
        }

        let bytes = match std::fs::metadata(&abs_path).map(|m| m.len()) {
            Ok(b) => b,
            Err(_) => continue,
        };

        if bytes == 0 || bytes > opts.max_file_bytes {
            continue;
        }

        let rel_path = path_relative_to(&abs_path, &opts.repo_root)
            .with_context(|| format!("Failed to relativize path: {}", abs_path.display()))?;

        entries.push(FileEntry {
            abs_path,
            rel_path,
            bytes,
        });
    }

    entries.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    Ok(entries)
}

fn scan_single_file(repo_root: &Path, abs_path: &Path, max_file_bytes: u64) -> Result<Vec<FileEntry>> {
    let ov = default_overrides(repo_root, &[])?;
    if ov.matched(abs_path, /* is_dir */ false).is_ignore() {
        return Ok(vec![]);
    }
    if !has_supported_extension(abs_path) {
        return Ok(vec![]);
    }

    let bytes = std::fs::metadata(abs_path)?.len();
    if bytes == 0 || bytes > max_file_bytes {
        return Ok(vec![]);
    }

    let rel_path = path_relative_to(abs_path, repo_root)?;
    Ok(vec![FileEntry {
        abs_path: abs_path.to_path_buf(),
        rel_path,
        bytes,
    }])
}

/// Resolves an explicit `changedFiles` candidate set (spec §4.10): files that
/// still exist become [`FileEntry`]s, files that no longer exist are folded
/// into the returned deleted-paths list.
pub fn resolve_changed_files(repo_root: &Path, candidates: &[PathBuf], max_file_bytes: u64) -> (Vec<FileEntry>, Vec<PathBuf>) {
    let mut present = Vec::new();
    let mut deleted = Vec::new();

    for candidate in candidates {
        let abs_path = if candidate.is_absolute() { candidate.clone() } else { repo_root.join(candidate) };
        match std::fs::metadata(&abs_path) {
            Ok(meta) if meta.is_file() && meta.len() > 0 && meta.len() <= max_file_bytes => {
                if let Ok(rel_path) = path_relative_to(&abs_path, repo_root) {
                    present.push(FileEntry { abs_path, rel_path, bytes: meta.len() });
                }
            }
            _ => {
                if let Ok(rel_path) = path_relative_to(&abs_path, repo_root) {
                    deleted.push(rel_path);
                } else {
                    deleted.push(candidate.clone());
                }
            }
        }
    }

    (present, deleted)
}

fn path_relative_to(path: &Path, base: &Path) -> Result<PathBuf> {
    let rel = path
        .strip_prefix(base)
        .with_context(|| format!("{} is not under {}", path.display(), base.display()))?;
    Ok(rel.to_path_buf())
}
