//! Discovered-file records carried through the pipeline.
//!
//! A `DiscoveredFile` is created when a source adapter observes a candidate
//! path and is dropped after dispatch regardless of outcome; nothing here is
//! ever persisted.

use std::path::PathBuf;
use std::time::{Instant, SystemTime};

/// How a candidate file entered the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryMethod {
    /// Reported by a filesystem watch event.
    Watch,
    /// Found by a directory sweep (initial or periodic rescan).
    Scan,
    /// Reported by the extraction subprocess's completion protocol.
    ExternalReport,
}

impl std::fmt::Display for DiscoveryMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscoveryMethod::Watch => write!(f, "watch"),
            DiscoveryMethod::Scan => write!(f, "scan"),
            DiscoveryMethod::ExternalReport => write!(f, "external-report"),
        }
    }
}

/// A candidate file observed by a source adapter.
#[derive(Debug, Clone)]
pub struct DiscoveredFile {
    /// Full path to the candidate file.
    pub path: PathBuf,
    /// Lowercased extension taken from an external report, when the on-disk
    /// name carries none (backup payloads are stored under hash names).
    pub extension_hint: Option<String>,
    /// How the file was discovered.
    pub method: DiscoveryMethod,
    /// File modification time at discovery, when available.
    pub created_at: Option<SystemTime>,
    /// When the adapter observed the path.
    pub discovered_at: Instant,
    /// When transformation actually began; `None` until the engine picks
    /// the file up.
    pub transform_started_at: Option<Instant>,
}

impl DiscoveredFile {
    /// Create a new discovery record for `path`.
    pub fn new(path: PathBuf, method: DiscoveryMethod) -> Self {
        Self {
            path,
            extension_hint: None,
            method,
            created_at: None,
            discovered_at: Instant::now(),
            transform_started_at: None,
        }
    }

    /// Attach an extension hint from an external report.
    pub fn with_extension_hint(mut self, hint: Option<String>) -> Self {
        self.extension_hint = hint;
        self
    }

    /// Attach the file's modification time at discovery.
    pub fn with_created_at(mut self, created_at: Option<SystemTime>) -> Self {
        self.created_at = created_at;
        self
    }
}
