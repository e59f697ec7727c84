//! Backup Media Transformer
//!
//! Ingests files as they are written into a live backup directory tree and
//! converts qualifying media files in place, without corrupting a backup
//! still in progress. Two interchangeable discovery sources (a filesystem
//! watcher and an extraction-subprocess log reader) feed one dispatch
//! pipeline: stability gate, deduplicator, content classifier, per-class
//! concurrency governor, and the transformation engine that atomically
//! replaces originals with resized JPEGs.

pub mod classify;
pub mod dedupe;
pub mod discovery;
pub mod governor;
pub mod pipeline;
pub mod progress;
pub mod replace;
pub mod resize;
pub mod runner;
pub mod shutdown;
pub mod stability;
pub mod tools;
pub mod transform;
pub mod watch;

pub use backup_transformer_config as config;
pub use backup_transformer_config::Config;
pub use classify::{classify, classify_with_hint, ClassificationResult, Confidence, ContentType};
pub use dedupe::DispatchDeduplicator;
pub use discovery::{DiscoveredFile, DiscoveryMethod};
pub use governor::{PoolClass, PoolTable};
pub use pipeline::Pipeline;
pub use progress::{JobSink, LedgerSnapshot, ProgressTracker};
pub use runner::{ExtractionRunner, RunError};
pub use shutdown::{Shutdown, ShutdownTrigger};
pub use stability::{await_stable, StabilityOutcome};
pub use tools::{ToolError, ToolResolver};
pub use transform::{Outcome, TransformEngine, TransformError};
pub use watch::{WatchError, WatchSource};
