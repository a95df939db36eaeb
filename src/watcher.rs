//! Filesystem watching for memory files.
//!
//! Wraps `notify-debouncer-full`: raw notify events are held until writes
//! settle for the configured debounce window, then surfaced over an
//! unbounded channel. The watch set is the workspace `MEMORY.md` /
//! `memory.md` files, the `memory/` tree, and any configured extra paths;
//! symlinks are filtered out up front.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use notify_debouncer_full::{
    new_debouncer,
    notify::{RecursiveMode, Watcher},
    DebounceEventResult, Debouncer, FileIdMap,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// A settled change under one of the watched roots.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Created(PathBuf),
    Modified(PathBuf),
    Removed(PathBuf),
}

impl WatchEvent {
    pub fn path(&self) -> &PathBuf {
        match self {
            WatchEvent::Created(p) | WatchEvent::Modified(p) | WatchEvent::Removed(p) => p,
        }
    }
}

/// Watches memory roots for changes, debounced.
pub struct MemoryFileWatcher {
    _debouncer: Debouncer<notify_debouncer_full::notify::RecommendedWatcher, FileIdMap>,
}

impl MemoryFileWatcher {
    /// Start watching `paths` (files or directories; non-existent and
    /// symlinked entries are skipped). Returns the watcher handle and the
    /// event receiver; dropping the handle stops the watcher.
    pub fn start(
        paths: Vec<PathBuf>,
        debounce: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<WatchEvent>)> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut debouncer = new_debouncer(
            debounce,
            None,
            move |result: DebounceEventResult| match result {
                Ok(events) => {
                    for event in events {
                        use notify_debouncer_full::notify::EventKind;
                        for path in &event.paths {
                            let watch_event = match event.kind {
                                EventKind::Create(_) => WatchEvent::Created(path.clone()),
                                EventKind::Modify(_) => WatchEvent::Modified(path.clone()),
                                EventKind::Remove(_) => WatchEvent::Removed(path.clone()),
                                _ => continue,
                            };
                            debug!(path = %path.display(), "memory watcher event");
                            if tx.send(watch_event).is_err() {
                                return; // receiver dropped
                            }
                        }
                    }
                }
                Err(errors) => {
                    for e in errors {
                        warn!(error = %e, "memory watcher error");
                    }
                }
            },
        )?;

        for path in &paths {
            if path.is_symlink() {
                debug!(path = %path.display(), "skipping symlinked watch path");
                continue;
            }
            if !path.exists() {
                continue;
            }
            let mode = if path.is_dir() {
                RecursiveMode::Recursive
            } else {
                RecursiveMode::NonRecursive
            };
            debouncer.watcher().watch(path, mode)?;
            info!(path = %path.display(), "watching memory path");
        }

        Ok((Self { _debouncer: debouncer }, rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn change_event_arrives_after_debounce() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("memory");
        std::fs::create_dir_all(&dir).unwrap();

        let (watcher, mut rx) =
            MemoryFileWatcher::start(vec![dir.clone()], Duration::from_millis(100)).unwrap();

        std::fs::write(dir.join("a.md"), "alpha\n").unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("watcher should emit within 5s")
            .expect("channel open");
        assert!(event.path().starts_with(&dir));
        drop(watcher);
    }

    #[tokio::test]
    async fn missing_paths_are_skipped() {
        let tmp = TempDir::new().unwrap();
        let result = MemoryFileWatcher::start(
            vec![tmp.path().join("does-not-exist")],
            Duration::from_millis(50),
        );
        assert!(result.is_ok());
    }
}
