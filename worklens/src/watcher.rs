//! File-watcher producer
//!
//! Watches the highest-scoring active discovered directories and feeds file
//! events to the daemon socket exactly like an external producer would: one
//! NDJSON line per event, errors swallowed. The watch list is refreshed
//! periodically as directory discovery learns new places.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify_debouncer_mini::{new_debouncer, notify::RecursiveMode, DebounceEventResult};
use worklens_core::config::CollectorsConfig;
use worklens_core::ingest::WireRecord;
use worklens_core::{Database, FileEventKind};

use crate::transport;

/// Directories that only ever hold dependencies, caches, or build output
const SKIP_DIRS: &[&str] = &[
    "node_modules",
    "__pycache__",
    ".venv",
    "venv",
    ".git",
    ".pytest_cache",
    ".mypy_cache",
    ".tox",
    "dist",
    "build",
    "target",
    "out",
    "bin",
    ".next",
    ".nuxt",
    ".cache",
    "vendor",
    "coverage",
    ".eggs",
];

pub struct FileWatcher {
    socket: PathBuf,
    db: Arc<Database>,
    cfg: CollectorsConfig,
}

impl FileWatcher {
    pub fn new(socket: PathBuf, db: Arc<Database>, cfg: CollectorsConfig) -> Self {
        Self { socket, db, cfg }
    }

    /// Blocking watch loop; run via `spawn_blocking`. Returns when the
    /// shutdown flag flips.
    pub fn run(self, shutdown: tokio::sync::watch::Receiver<bool>) {
        let (tx, rx) = std::sync::mpsc::channel::<DebounceEventResult>();
        let mut debouncer =
            match new_debouncer(Duration::from_millis(self.cfg.watch_debounce_ms), tx) {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!(error = %e, "File watcher unavailable");
                    return;
                }
            };

        let mut watched: HashSet<PathBuf> = HashSet::new();
        let rescan = Duration::from_secs(self.cfg.watch_rescan_secs);
        let mut last_scan = Instant::now() - rescan;

        loop {
            if *shutdown.borrow() {
                break;
            }

            if last_scan.elapsed() >= rescan {
                last_scan = Instant::now();
                self.refresh_watches(&mut debouncer, &mut watched);
            }

            match rx.recv_timeout(Duration::from_secs(1)) {
                Ok(Ok(events)) => {
                    for event in events {
                        self.forward(&event.path);
                    }
                }
                Ok(Err(e)) => {
                    tracing::debug!(error = %e, "Watcher backend error");
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        tracing::info!("File watcher stopped");
    }

    /// Sync the watch set with the current top discovered directories.
    fn refresh_watches(
        &self,
        debouncer: &mut notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
        watched: &mut HashSet<PathBuf>,
    ) {
        let candidates = match self.db.watch_candidates(self.cfg.watch_max_dirs) {
            Ok(dirs) => dirs,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load watch candidates");
                return;
            }
        };

        let wanted: HashSet<PathBuf> = candidates
            .into_iter()
            .map(|d| PathBuf::from(d.path))
            .filter(|p| p.is_dir())
            .collect();

        for gone in watched.difference(&wanted).cloned().collect::<Vec<_>>() {
            let _ = debouncer.watcher().unwatch(&gone);
            watched.remove(&gone);
            tracing::debug!(dir = %gone.display(), "Stopped watching");
        }

        for new in wanted.difference(watched).cloned().collect::<Vec<_>>() {
            match debouncer.watcher().watch(&new, RecursiveMode::Recursive) {
                Ok(()) => {
                    tracing::info!(dir = %new.display(), "Watching directory");
                    watched.insert(new);
                }
                Err(e) => {
                    tracing::warn!(dir = %new.display(), error = %e, "Failed to watch");
                }
            }
        }
    }

    /// Filter and forward one debounced path to the daemon.
    ///
    /// The mini debouncer collapses event kinds, so the kind is recovered
    /// from the filesystem: a path that still exists was modified, a path
    /// that is gone was deleted.
    fn forward(&self, path: &Path) {
        if !should_record(path, &self.cfg.watch_extensions) {
            return;
        }

        let kind = if path.exists() {
            FileEventKind::Modified
        } else {
            FileEventKind::Deleted
        };

        let record = WireRecord::File {
            ts: transport::now_epoch(),
            path: path.to_string_lossy().to_string(),
            event: kind,
        };
        if !transport::send_record(&self.socket, &record) {
            tracing::debug!(path = %path.display(), "File event dropped (daemon unreachable)");
        }
    }
}

/// Source-file filter: skip dependency/cache trees, hidden paths, and
/// extensions nobody edits by hand.
fn should_record(path: &Path, extensions: &[String]) -> bool {
    for component in path.components() {
        let part = component.as_os_str().to_string_lossy();
        if SKIP_DIRS.contains(&part.as_ref()) {
            return false;
        }
        if part.starts_with('.') && part.len() > 1 && part != ".." {
            return false;
        }
    }

    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => extensions.iter().any(|allowed| allowed == ext),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extensions() -> Vec<String> {
        worklens_core::config::CollectorsConfig::default().watch_extensions
    }

    #[test]
    fn test_records_source_files() {
        assert!(should_record(Path::new("/home/dev/app/src/lib.rs"), &extensions()));
        assert!(should_record(Path::new("/home/dev/app/README.md"), &extensions()));
    }

    #[test]
    fn test_skips_dependency_trees() {
        assert!(!should_record(
            Path::new("/home/dev/app/node_modules/x/index.js"),
            &extensions()
        ));
        assert!(!should_record(
            Path::new("/home/dev/app/target/debug/build.rs"),
            &extensions()
        ));
    }

    #[test]
    fn test_skips_hidden_paths() {
        assert!(!should_record(
            Path::new("/home/dev/app/.idea/workspace.json"),
            &extensions()
        ));
    }

    #[test]
    fn test_skips_unknown_extensions() {
        assert!(!should_record(Path::new("/home/dev/app/core.dump"), &extensions()));
        assert!(!should_record(Path::new("/home/dev/app/Makefile"), &extensions()));
    }
}
