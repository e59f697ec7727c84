//! Progress tracking and the shutdown drain barrier.
//!
//! Components report job starts and finishes through the [`JobSink`]
//! observer interface rather than process-wide globals or callback wiring;
//! the [`ProgressTracker`] is the concrete sink handed to the engine at
//! construction.

use std::sync::Mutex;
use tokio::sync::Notify;

/// Observer interface for job lifecycle events.
pub trait JobSink: Send + Sync {
    /// A job began transformation.
    fn job_started(&self);
    /// A job finished, in any terminal state.
    fn job_finished(&self);
}

/// Point-in-time view of the concurrency ledger.
///
/// Invariant: `0 <= active <= total` at all times, and `active` returns to
/// zero exactly once every job dispatched so far has completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LedgerSnapshot {
    /// Jobs currently inside the transformation engine.
    pub active: u64,
    /// Jobs that have begun transformation since startup.
    pub total: u64,
}

/// Tracks active/total job counts and provides the drain barrier used
/// during shutdown.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    ledger: Mutex<LedgerSnapshot>,
    idle: Notify,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current ledger values.
    pub fn snapshot(&self) -> LedgerSnapshot {
        *self.ledger.lock().expect("ledger lock poisoned")
    }

    /// Wait until no jobs are active.
    ///
    /// Returns immediately when the ledger is already idle. This is the
    /// drain barrier: shutdown calls it after the source adapters have
    /// stopped producing discoveries.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.snapshot().active == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl JobSink for ProgressTracker {
    fn job_started(&self) {
        let mut ledger = self.ledger.lock().expect("ledger lock poisoned");
        ledger.active += 1;
        ledger.total += 1;
    }

    fn job_finished(&self) {
        let mut ledger = self.ledger.lock().expect("ledger lock poisoned");
        debug_assert!(ledger.active > 0, "job_finished without matching start");
        ledger.active = ledger.active.saturating_sub(1);
        let idle = ledger.active == 0;
        drop(ledger);

        if idle {
            self.idle.notify_waiters();
        }
    }
}

/// RAII guard pairing one `job_started` with exactly one `job_finished`.
///
/// Dropping the guard reports the finish even when the job unwinds, so the
/// ledger cannot leak active counts across fault paths.
pub struct JobGuard<'a> {
    sink: &'a dyn JobSink,
}

impl<'a> JobGuard<'a> {
    pub fn begin(sink: &'a dyn JobSink) -> Self {
        sink.job_started();
        Self { sink }
    }
}

impl Drop for JobGuard<'_> {
    fn drop(&mut self) {
        self.sink.job_finished();
    }
}
