//! Filesystem-watch source adapter.
//!
//! Watches the backup tree recursively for create/write events and feeds
//! candidates into the dispatch pipeline. Watch events can be dropped under
//! load, so two safety nets back the watcher up: an initial sweep of files
//! already on disk, and a periodic rescan that revisits recently modified
//! directories on a per-directory cooldown.

use crate::discovery::{DiscoveredFile, DiscoveryMethod};
use crate::pipeline::Pipeline;
use crate::shutdown::Shutdown;
use backup_transformer_config::WatchConfig;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use walkdir::WalkDir;

/// Directories not modified within this window are skipped by the rescan.
const RECENT_DIR_MODIFICATION_WINDOW: Duration = Duration::from_secs(120);

/// Error type for the watch adapter.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to watch {dir}: {source}")]
    Watch {
        dir: PathBuf,
        source: notify::Error,
    },
}

/// Per-directory rescan bookkeeping with the same sweep-on-threshold
/// bounding as the dispatch deduplicator.
struct RescanState {
    cooldown: Duration,
    sweep_threshold: usize,
    scanned: HashMap<PathBuf, Instant>,
}

impl RescanState {
    fn new(cooldown: Duration, sweep_threshold: usize) -> Self {
        Self {
            cooldown,
            sweep_threshold,
            scanned: HashMap::new(),
        }
    }

    /// Decide whether to descend into `dir` this sweep. A directory is
    /// entered when its cooldown has elapsed and it was modified recently;
    /// entering records the visit.
    fn should_scan(&mut self, dir: &Path, modified_age: Option<Duration>, now: Instant) -> bool {
        let due = self
            .scanned
            .get(dir)
            .map_or(true, |last| now.saturating_duration_since(*last) >= self.cooldown);
        let recently_modified =
            modified_age.is_some_and(|age| age < RECENT_DIR_MODIFICATION_WINDOW);

        if !(due && recently_modified) {
            return false;
        }

        self.scanned.insert(dir.to_path_buf(), now);
        if self.scanned.len() > self.sweep_threshold {
            let cooldown = self.cooldown;
            self.scanned
                .retain(|_, last| now.saturating_duration_since(*last) < cooldown);
        }
        true
    }
}

/// Watches one directory tree and dispatches candidate files.
pub struct WatchSource {
    dir: PathBuf,
    cfg: WatchConfig,
}

impl WatchSource {
    pub fn new(dir: PathBuf, cfg: WatchConfig) -> Self {
        Self { dir, cfg }
    }

    /// Run the watcher until shutdown.
    ///
    /// Performs the initial sweep, then multiplexes watch events and rescan
    /// ticks onto the pipeline.
    pub async fn run(&self, pipeline: Arc<Pipeline>, shutdown: Shutdown) -> Result<(), WatchError> {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut watcher = RecommendedWatcher::new(
            move |result: Result<Event, notify::Error>| match result {
                Ok(event) => {
                    if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                        for path in event.paths {
                            let _ = tx.send(path);
                        }
                    }
                }
                Err(e) => error!(error = %e, "file watcher error"),
            },
            notify::Config::default(),
        )
        .map_err(|source| WatchError::Watch {
            dir: self.dir.clone(),
            source,
        })?;

        watcher
            .watch(&self.dir, RecursiveMode::Recursive)
            .map_err(|source| WatchError::Watch {
                dir: self.dir.clone(),
                source,
            })?;

        info!(dir = %self.dir.display(), "watching for new backup files");

        // Files already on disk when the watch starts.
        self.sweep(&pipeline);

        let mut rescan_state =
            RescanState::new(self.cfg.rescan_cooldown(), 1024);
        let mut rescan = tokio::time::interval_at(
            tokio::time::Instant::now() + self.cfg.rescan_interval(),
            self.cfg.rescan_interval(),
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = rx.recv() => match received {
                    Some(path) => dispatch_candidate(&pipeline, path, DiscoveryMethod::Watch),
                    None => break,
                },
                _ = rescan.tick() => self.rescan(&pipeline, &mut rescan_state),
            }
        }

        info!(dir = %self.dir.display(), "watch source stopped");
        Ok(())
    }

    /// Dispatch every existing file under the watch root.
    fn sweep(&self, pipeline: &Pipeline) {
        let walker = WalkDir::new(&self.dir)
            .into_iter()
            .filter_entry(|entry| !is_hidden_dir(entry));

        for entry in walker.filter_map(|e| e.ok()) {
            if entry.file_type().is_file() {
                dispatch_candidate(pipeline, entry.path().to_path_buf(), DiscoveryMethod::Scan);
            }
        }
    }

    /// Periodic rescan: revisit directories modified recently whose
    /// cooldown has elapsed, dispatching whatever files they hold.
    fn rescan(&self, pipeline: &Pipeline, state: &mut RescanState) {
        let now = Instant::now();
        debug!(dir = %self.dir.display(), "rescanning for missed files");

        let walker = WalkDir::new(&self.dir).into_iter().filter_entry(|entry| {
            if is_hidden_dir(entry) {
                return false;
            }
            if !entry.file_type().is_dir() || entry.depth() == 0 {
                return true;
            }
            let modified_age = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .and_then(|m| m.elapsed().ok());
            state.should_scan(entry.path(), modified_age, now)
        });

        for entry in walker.filter_map(|e| e.ok()) {
            if entry.file_type().is_file() {
                dispatch_candidate(pipeline, entry.path().to_path_buf(), DiscoveryMethod::Scan);
            }
        }
    }
}

fn is_hidden_dir(entry: &walkdir::DirEntry) -> bool {
    entry.file_type().is_dir()
        && entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .map(|name| name.starts_with('.'))
            .unwrap_or(false)
}

/// True for names the adapter never dispatches: hidden files and temp
/// artifacts (including our own staging files).
fn is_ignored_file_name(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return true;
    };
    name.starts_with('.') || name.ends_with(".tmp") || name.ends_with(".temp")
}

fn dispatch_candidate(pipeline: &Pipeline, path: PathBuf, method: DiscoveryMethod) {
    if is_ignored_file_name(&path) {
        return;
    }

    let metadata = match std::fs::metadata(&path) {
        Ok(metadata) => metadata,
        // Vanished between event and dispatch.
        Err(_) => return,
    };
    if metadata.is_dir() {
        return;
    }

    let file = DiscoveredFile::new(path, method).with_created_at(metadata.modified().ok());
    pipeline.dispatch(file);
}
