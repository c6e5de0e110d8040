//! File Watcher (C14, spec §4.14): debounces filesystem events and drives
//! incremental reindex through the Indexer Orchestrator.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcher};
use tokio::sync::{mpsc, Mutex};

use crate::config::{Config, DEFAULT_EXCLUDED_DIR_NAMES};
use crate::embedding::EmbeddingProvider;
use crate::error::Result;
use crate::indexer::{self, IndexRequest, IndexStats};

const MIN_DEBOUNCE_MS: u64 = 50;

/// A processed batch, handed to `on_batch` after one debounced indexing pass.
#[derive(Debug, Clone, Default)]
pub struct WatchBatch {
    pub changed: Vec<PathBuf>,
    pub deleted: Vec<PathBuf>,
}

#[derive(Default)]
struct PendingSets {
    changed: HashSet<PathBuf>,
    deleted: HashSet<PathBuf>,
}

impl PendingSets {
    fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.deleted.is_empty()
    }

    /// Coalesces per-path: the latest intent for a path wins within a window
    /// (spec §4.14 ordering guarantee).
    fn record(&mut self, path: PathBuf, kind: &EventKind) {
        match kind {
            EventKind::Remove(_) => {
                self.changed.remove(&path);
                self.deleted.insert(path);
            }
            _ => {
                self.deleted.remove(&path);
                self.changed.insert(path);
            }
        }
    }

    fn take(&mut self) -> (Vec<PathBuf>, Vec<PathBuf>) {
        (self.changed.drain().collect(), self.deleted.drain().collect())
    }
}

fn is_excluded(path: &Path, repo_root: &Path, extra: &[String]) -> bool {
    let Ok(rel) = path.strip_prefix(repo_root) else {
        return false;
    };
    rel.components().any(|c| {
        let name = c.as_os_str().to_string_lossy();
        DEFAULT_EXCLUDED_DIR_NAMES.contains(&name.as_ref()) || extra.iter().any(|e| e == name.as_ref())
    })
}

/// A handle to a running watcher. Dropping it stops the underlying `notify`
/// watcher; call [`WatcherHandle::close`] to drain pending changes first.
pub struct WatcherHandle {
    _notify: RecommendedWatcher,
    debounce_task: tokio::task::JoinHandle<()>,
    shutdown: mpsc::Sender<()>,
    flush: mpsc::Sender<tokio::sync::oneshot::Sender<()>>,
}

impl WatcherHandle {
    /// Forces the current debounce window to fire immediately and waits for
    /// that pass (if any) to complete.
    pub async fn flush(&self) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        if self.flush.send(tx).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Idempotent: draining pending changes before returning (spec §4.14).
    pub async fn close(self) {
        self.flush().await;
        let _ = self.shutdown.send(()).await;
        let _ = self.debounce_task.await;
    }
}

pub struct WatchRequest<'a> {
    pub repo_root: &'a Path,
    pub config: Config,
    pub debounce_ms: Option<u64>,
}

/// Starts watching `req.repo_root` recursively, filtering the same deny-list
/// as the Orchestrator. `provider` is memoized for the lifetime of the watch
/// (spec §4.14 point 3); `on_batch` fires once per debounced pass, after the
/// indexer has run.
pub fn watch(
    req: WatchRequest<'_>,
    provider: Box<dyn EmbeddingProvider>,
    mut on_batch: impl FnMut(WatchBatch) + Send + 'static,
) -> Result<WatcherHandle> {
    let repo_root = req.repo_root.to_path_buf();
    let config = req.config;
    let debounce = Duration::from_millis(req.debounce_ms.unwrap_or(config.watcher.debounce_ms).max(MIN_DEBOUNCE_MS));

    let (raw_tx, mut raw_rx) = mpsc::channel::<Event>(1024);
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
    let (flush_tx, mut flush_rx) = mpsc::channel::<tokio::sync::oneshot::Sender<()>>(8);

    let mut notify_watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| {
            if let Ok(event) = res {
                let _ = raw_tx.blocking_send(event);
            }
        },
        notify::Config::default(),
    )
    .map_err(|e| crate::error::PampaError::Io {
        path: repo_root.clone(),
        source: std::io::Error::other(e),
    })?;
    notify_watcher
        .watch(&repo_root, RecursiveMode::Recursive)
        .map_err(|e| crate::error::PampaError::Io {
            path: repo_root.clone(),
            source: std::io::Error::other(e),
        })?;

    let provider = Arc::new(Mutex::new(provider));
    let exclude_names = config.scan.exclude_dir_names.clone();
    let init_logged = Arc::new(std::sync::atomic::AtomicBool::new(false));

    let debounce_task = tokio::spawn(async move {
        let mut pending = PendingSets::default();
        let mut processing = false;
        let mut rearm = false;
        let mut pending_flush: Vec<tokio::sync::oneshot::Sender<()>> = Vec::new();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    if !pending.is_empty() {
                        run_pass(&repo_root, &config, &provider, &init_logged, &mut pending, &mut on_batch).await;
                    }
                    for tx in pending_flush.drain(..) {
                        let _ = tx.send(());
                    }
                    return;
                }
                Some(reply) = flush_rx.recv() => {
                    if !processing {
                        if !pending.is_empty() {
                            run_pass(&repo_root, &config, &provider, &init_logged, &mut pending, &mut on_batch).await;
                        }
                        let _ = reply.send(());
                    } else {
                        pending_flush.push(reply);
                    }
                }
                event = raw_rx.recv() => {
                    let Some(event) = event else { return };
                    for path in event.paths.iter() {
                        if is_excluded(path, &repo_root, &exclude_names) {
                            continue;
                        }
                        if !crate::scanner::has_supported_extension(path) && !matches!(event.kind, EventKind::Remove(_)) {
                            continue;
                        }
                        pending.record(path.clone(), &event.kind);
                    }

                    if pending.is_empty() {
                        continue;
                    }
                    if processing {
                        rearm = true;
                        continue;
                    }

                    tokio::time::sleep(debounce).await;
                    // Drain any events that arrived during the sleep before firing.
                    while let Ok(more) = raw_rx.try_recv() {
                        for path in more.paths.iter() {
                            if is_excluded(path, &repo_root, &exclude_names) {
                                continue;
                            }
                            if !crate::scanner::has_supported_extension(path) && !matches!(more.kind, EventKind::Remove(_)) {
                                continue;
                            }
                            pending.record(path.clone(), &more.kind);
                        }
                    }

                    processing = true;
                    run_pass(&repo_root, &config, &provider, &init_logged, &mut pending, &mut on_batch).await;
                    processing = false;

                    for tx in pending_flush.drain(..) {
                        let _ = tx.send(());
                    }

                    if rearm {
                        rearm = false;
                        // Events that landed during processing are already in `pending`
                        // (the channel kept receiving); loop back around to debounce again.
                    }
                }
            }
        }
    });

    Ok(WatcherHandle {
        _notify: notify_watcher,
        debounce_task,
        shutdown: shutdown_tx,
        flush: flush_tx,
    })
}

async fn run_pass(
    repo_root: &Path,
    config: &Config,
    provider: &Arc<Mutex<Box<dyn EmbeddingProvider>>>,
    init_logged: &Arc<std::sync::atomic::AtomicBool>,
    pending: &mut PendingSets,
    on_batch: &mut (impl FnMut(WatchBatch) + Send + 'static),
) {
    let (changed, deleted) = pending.take();
    if changed.is_empty() && deleted.is_empty() {
        return;
    }

    let mut guard = provider.lock().await;
    if let Err(e) = guard.init().await {
        if !init_logged.swap(true, std::sync::atomic::Ordering::SeqCst) {
            log::error!("watcher: embedding provider init failed, batch skipped: {e}");
        }
        return;
    }
    drop(guard);
    let guard = provider.lock().await;

    let req = IndexRequest {
        repo_root,
        provider: guard.as_ref(),
        config,
        changed_files: Some(changed.clone()),
        deleted_files: Some(deleted.clone()),
        encrypt_mode_override: None,
    };

    match indexer::index(req, |_line| {}).await {
        Ok(stats) => {
            log_summary(&stats);
            on_batch(WatchBatch { changed, deleted });
        }
        Err(e) => {
            log::error!("watcher: incremental reindex failed: {e}");
        }
    }
}

fn log_summary(stats: &IndexStats) {
    log::info!(
        "watch: indexed {} chunk(s), {} total, {} error(s)",
        stats.processed_chunks,
        stats.total_chunks,
        stats.errors.len()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_sets_coalesce_latest_intent_per_path() {
        let mut pending = PendingSets::default();
        let p = PathBuf::from("a.rs");
        pending.record(p.clone(), &EventKind::Create(notify::event::CreateKind::File));
        pending.record(p.clone(), &EventKind::Remove(notify::event::RemoveKind::File));
        let (changed, deleted) = pending.take();
        assert!(changed.is_empty());
        assert_eq!(deleted, vec![p]);
    }

    #[test]
    fn pending_sets_modify_after_remove_moves_back_to_changed() {
        let mut pending = PendingSets::default();
        let p = PathBuf::from("b.rs");
        pending.record(p.clone(), &EventKind::Remove(notify::event::RemoveKind::File));
        pending.record(p.clone(), &EventKind::Modify(notify::event::ModifyKind::Any));
        let (changed, deleted) = pending.take();
        assert_eq!(changed, vec![p]);
        assert!(deleted.is_empty());
    }

    #[test]
    fn excluded_dir_is_filtered() {
        let root = PathBuf::from("/repo");
        let path = root.join("node_modules").join("pkg").join("index.js");
        assert!(is_excluded(&path, &root, &[]));
        assert!(!is_excluded(&root.join("src").join("lib.rs"), &root, &[]));
    }
}
