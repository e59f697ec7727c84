//! Dispatch deduplicator.
//!
//! Filesystem events and rescans frequently report the same path several
//! times in quick succession. The deduplicator admits at most one dispatch
//! per path per window. It is a best-effort guard, not a lock: a conversion
//! that outlives the window can race with a fresh admission for the same
//! path.

use backup_transformer_config::DedupeConfig;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Suppresses redundant dispatches for the same path within a short window.
///
/// The admission map is pruned whenever it grows past `sweep_threshold`, so
/// long-running watches do not accumulate entries indefinitely.
#[derive(Debug)]
pub struct DispatchDeduplicator {
    window: Duration,
    sweep_threshold: usize,
    entries: Mutex<HashMap<PathBuf, Instant>>,
}

impl DispatchDeduplicator {
    pub fn new(cfg: &DedupeConfig) -> Self {
        Self::with_window(cfg.window(), cfg.sweep_threshold)
    }

    pub fn with_window(window: Duration, sweep_threshold: usize) -> Self {
        Self {
            window,
            sweep_threshold,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Admit a dispatch for `path` at `now`.
    ///
    /// Returns `true` when no prior admission exists for the path or the
    /// prior admission is older than the window; rejects silently otherwise.
    pub fn admit(&self, path: &Path, now: Instant) -> bool {
        let mut entries = self.entries.lock().expect("dedup map lock poisoned");

        if let Some(last) = entries.get(path) {
            if now.saturating_duration_since(*last) < self.window {
                return false;
            }
        }

        entries.insert(path.to_path_buf(), now);

        if entries.len() > self.sweep_threshold {
            let window = self.window;
            entries.retain(|_, last| now.saturating_duration_since(*last) < window);
        }

        true
    }

    /// Number of paths currently tracked.
    pub fn tracked(&self) -> usize {
        self.entries.lock().expect("dedup map lock poisoned").len()
    }
}
