//! Orchestrator wiring a discovery source to the transformation engine.
//!
//! Both source adapters converge on [`Pipeline::dispatch`]: the deduplicator
//! admits or rejects, then one lightweight task per admitted file runs the
//! stability gate, the classifier, and the engine. Faults inside a job —
//! including panics — are contained at the task boundary and logged; they
//! never abort sibling jobs or the process.

use crate::classify::{self, ClassificationResult};
use crate::dedupe::DispatchDeduplicator;
use crate::discovery::DiscoveredFile;
use crate::governor::PoolTable;
use crate::progress::{LedgerSnapshot, ProgressTracker};
use crate::shutdown::Shutdown;
use crate::stability::{await_stable, StabilityOutcome};
use crate::tools::ToolResolver;
use crate::transform::TransformEngine;
use backup_transformer_config::{Config, StabilityConfig};
use futures::FutureExt;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

/// The assembled pipeline: engine, gate, deduplicator, tracker, and the
/// task set used for shutdown draining.
pub struct Pipeline {
    engine: Arc<TransformEngine>,
    stability: StabilityConfig,
    dedupe: DispatchDeduplicator,
    tracker: Arc<ProgressTracker>,
    tasks: TaskTracker,
    shutdown: Shutdown,
}

impl Pipeline {
    /// Wire up all components from configuration.
    pub fn new(cfg: &Config, shutdown: Shutdown) -> Self {
        let tracker = Arc::new(ProgressTracker::new());
        let engine = Arc::new(TransformEngine::new(
            cfg.transform.clone(),
            PoolTable::new(&cfg.pools),
            ToolResolver::new(cfg.transform.libraries_dir.clone()),
            tracker.clone(),
            shutdown.clone(),
        ));

        Self {
            engine,
            stability: cfg.stability.clone(),
            dedupe: DispatchDeduplicator::new(&cfg.dedupe),
            tracker,
            tasks: TaskTracker::new(),
            shutdown,
        }
    }

    /// The progress tracker backing the ledger.
    pub fn tracker(&self) -> &Arc<ProgressTracker> {
        &self.tracker
    }

    /// Admit a discovered file and spawn its job.
    ///
    /// Rejected duplicates and post-shutdown discoveries are dropped
    /// silently.
    pub fn dispatch(&self, file: DiscoveredFile) {
        if self.shutdown.is_cancelled() {
            return;
        }
        if !self.dedupe.admit(&file.path, Instant::now()) {
            return;
        }

        let engine = self.engine.clone();
        let stability = self.stability.clone();
        let _job_handle = self.tasks.spawn(async move {
            let path = file.path.clone();
            let job = std::panic::AssertUnwindSafe(run_job(engine, stability, file));
            if job.catch_unwind().await.is_err() {
                error!(path = %path.display(), "panic contained in file job");
            }
        });
    }

    /// Drain the pipeline for shutdown: wait for every spawned job to
    /// finish, then for the ledger to reach zero active jobs. Returns the
    /// final ledger for reporting.
    pub async fn drain(&self) -> LedgerSnapshot {
        self.tasks.close();
        self.tasks.wait().await;
        self.tracker.wait_idle().await;
        self.tracker.snapshot()
    }
}

/// One file's journey: stability gate, header read, classification,
/// transformation.
async fn run_job(engine: Arc<TransformEngine>, stability: StabilityConfig, mut file: DiscoveredFile) {
    match await_stable(&file.path, &stability).await {
        StabilityOutcome::Vanished => {
            debug!(path = %file.path.display(), "file vanished before processing");
            return;
        }
        StabilityOutcome::Stable | StabilityOutcome::TimedOut => {}
    }

    let header = match read_header(&file.path) {
        Ok(Some(header)) => header,
        Ok(None) => return,
        Err(e) => {
            debug!(path = %file.path.display(), error = %e, "dropping unreadable file");
            return;
        }
    };

    let classification: ClassificationResult =
        classify::classify_with_hint(&header, &file.path, file.extension_hint.as_deref());
    debug!(
        path = %file.path.display(),
        content_type = %classification.content_type,
        confidence = %classification.confidence,
        method = %file.method,
        "classified file"
    );

    match engine.process(&mut file, classification).await {
        Ok(outcome) => {
            info!(
                path = %file.path.display(),
                content_type = %classification.content_type,
                outcome = %outcome,
                "file processed"
            );
        }
        Err(e) => {
            error!(
                path = %file.path.display(),
                error = %e,
                "conversion failed, original left in place"
            );
        }
    }
}

/// Read the classification header (first 64 bytes). `Ok(None)` means the
/// file vanished.
fn read_header(path: &Path) -> std::io::Result<Option<Vec<u8>>> {
    let file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    let mut header = Vec::with_capacity(classify::HEADER_LEN);
    file.take(classify::HEADER_LEN as u64)
        .read_to_end(&mut header)?;
    Ok(Some(header))
}
