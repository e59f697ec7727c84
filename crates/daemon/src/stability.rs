//! Stability gate for verifying files are no longer being written.
//!
//! Backup writers create files and append to them; reading too early yields
//! truncated or corrupt input. Before processing a file we poll its size and
//! only proceed once the size has held steady for a configured window.

use backup_transformer_config::StabilityConfig;
use std::path::Path;
use std::time::Instant;
use tokio::time::sleep;
use tracing::warn;

/// Result of waiting for a file to stabilize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StabilityOutcome {
    /// Size held steady for the full stability window; safe to read.
    Stable,
    /// The ceiling elapsed before the file settled; callers proceed anyway.
    TimedOut,
    /// The path disappeared mid-wait; the job should be dropped.
    Vanished,
}

/// Tracks how long a file's size has remained unchanged.
///
/// Pure state machine extracted from [`await_stable`] so the reset behavior
/// can be tested without touching the filesystem or the clock.
#[derive(Debug)]
pub struct SizeTracker {
    last_size: Option<u64>,
    stable_since: Instant,
}

impl SizeTracker {
    pub fn new(now: Instant) -> Self {
        Self {
            last_size: None,
            stable_since: now,
        }
    }

    /// Record an observed size. Returns how long the size has been unchanged
    /// as of `now`; any change (including the first observation) resets the
    /// clock to zero.
    pub fn observe(&mut self, size: u64, now: Instant) -> std::time::Duration {
        if self.last_size == Some(size) {
            now.saturating_duration_since(self.stable_since)
        } else {
            self.last_size = Some(size);
            self.stable_since = now;
            std::time::Duration::ZERO
        }
    }
}

/// Wait until `path` stops changing size.
///
/// Samples the size every `poll_interval`, requires it unchanged for
/// `stable_for`, and gives up (proceeding anyway, with a warning) after
/// `max_wait`. A path that disappears mid-wait yields
/// [`StabilityOutcome::Vanished`].
pub async fn await_stable(path: &Path, cfg: &StabilityConfig) -> StabilityOutcome {
    let started = Instant::now();
    let mut tracker = SizeTracker::new(started);

    loop {
        if started.elapsed() > cfg.max_wait() {
            warn!(
                path = %path.display(),
                max_wait_secs = cfg.max_wait_secs,
                "file did not stabilize within ceiling, proceeding anyway"
            );
            return StabilityOutcome::TimedOut;
        }

        let size = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return StabilityOutcome::Vanished;
            }
            Err(_) => {
                // Transient stat error: retry on the next poll.
                sleep(cfg.poll_interval()).await;
                continue;
            }
        };

        if tracker.observe(size, Instant::now()) >= cfg.stable_for() {
            return StabilityOutcome::Stable;
        }

        sleep(cfg.poll_interval()).await;
    }
}
