//! Extraction-subprocess source adapter.
//!
//! Spawns the backup extraction tool and consumes its combined output as a
//! line-oriented completion protocol: `FILE_SAVED: path=<rel>[ domain=<orig>]`
//! lines become discoveries (the relative path resolves against the parent
//! of the backup directory; the domain value carries the original filename
//! and therefore the extension hint), recognized noise markers are
//! suppressed in non-verbose mode, and everything else passes through to
//! the log. The whole run is bounded by one overall deadline so a hung
//! extractor cannot wedge the process forever.

use crate::discovery::{DiscoveredFile, DiscoveryMethod};
use crate::pipeline::Pipeline;
use crate::shutdown::Shutdown;
use crate::tools::ToolResolver;
use backup_transformer_config::ExtractorConfig;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Run-level errors for the extraction adapter. Per-file problems never
/// surface here.
#[derive(Debug, Error)]
pub enum RunError {
    /// The extraction tool could not be resolved anywhere.
    #[error("extraction tool not found: {0}")]
    ToolNotFound(String),

    /// The extraction tool could not be spawned.
    #[error("failed to launch {tool}: {source}")]
    Launch {
        tool: String,
        source: std::io::Error,
    },

    /// Waiting on the extraction tool failed.
    #[error("failed waiting for extraction tool: {0}")]
    Wait(std::io::Error),

    /// The overall run deadline elapsed; the tool was killed.
    #[error("extraction run timed out after {secs}s")]
    Timeout { secs: u64 },

    /// The extraction tool exited with a failure status.
    #[error("extraction tool exited with status {code:?}")]
    ExtractorFailed { code: Option<i32> },
}

/// One `FILE_SAVED` protocol line, before path resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedLine {
    /// Path relative to the parent of the backup directory.
    pub relative: String,
    /// Original path (with extension) of the backed-up file, when reported.
    pub domain: Option<String>,
}

/// Parse a `FILE_SAVED: path=<rel>[ domain=<orig>]` line.
///
/// Returns `None` for every other line.
pub fn parse_saved_line(line: &str) -> Option<SavedLine> {
    let rest = line.strip_prefix("FILE_SAVED: ")?;

    let mut relative = None;
    let mut domain = None;
    for token in rest.split_whitespace() {
        if let Some(value) = token.strip_prefix("path=") {
            relative.get_or_insert_with(|| value.to_string());
        } else if let Some(value) = token.strip_prefix("domain=") {
            domain.get_or_insert_with(|| value.to_string());
        }
    }

    relative
        .filter(|r| !r.is_empty())
        .map(|relative| SavedLine { relative, domain })
}

/// Resolve a reported relative path against the parent of the backup
/// directory (the extractor's destination root includes the device
/// directory itself).
pub fn resolve_saved_path(backup_dir: &Path, relative: &str) -> PathBuf {
    backup_dir
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .join(relative)
}

/// Extension hint from the domain value: the lowercased extension of the
/// original filename, when it has one.
pub fn extension_hint(domain: &str) -> Option<String> {
    Path::new(domain)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
}

/// Noise markers suppressed in non-verbose mode.
fn is_noise(line: &str) -> bool {
    line.trim().is_empty()
        || line.starts_with("FILE_FILTERED:")
        || line.starts_with("Receiving domain:")
}

enum RunOutcome {
    Exited(std::process::ExitStatus),
    WaitFailed(std::io::Error),
    DeadlineExpired,
    Cancelled,
}

/// Runs the extraction subprocess and feeds its reported files into the
/// pipeline.
pub struct ExtractionRunner {
    backup_dir: PathBuf,
    tool: String,
    verbose: bool,
    cfg: ExtractorConfig,
}

impl ExtractionRunner {
    pub fn new(backup_dir: PathBuf, tool: String, verbose: bool, cfg: ExtractorConfig) -> Self {
        Self {
            backup_dir,
            tool,
            verbose,
            cfg,
        }
    }

    /// Run the extraction tool to completion.
    ///
    /// Shutdown kills the tool and returns cleanly; the overall deadline
    /// and non-zero exits are run-level failures. Output-stream read errors
    /// are warnings, never fatal.
    pub async fn run(
        &self,
        pipeline: Arc<Pipeline>,
        tools: &ToolResolver,
        shutdown: Shutdown,
    ) -> Result<(), RunError> {
        let program = tools
            .resolve(&self.tool)
            .ok_or_else(|| RunError::ToolNotFound(self.tool.clone()))?;

        let destination = self
            .backup_dir
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();

        let mut child = Command::new(&program)
            .args(&self.cfg.args)
            .arg(&destination)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RunError::Launch {
                tool: self.tool.clone(),
                source,
            })?;

        info!(
            tool = %program.display(),
            backup_dir = %self.backup_dir.display(),
            "started extraction subprocess"
        );

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");

        let stdout_pump = tokio::spawn(pump_lines(
            stdout,
            "stdout",
            self.backup_dir.clone(),
            self.verbose,
            pipeline.clone(),
        ));
        let stderr_pump = tokio::spawn(pump_lines(
            stderr,
            "stderr",
            self.backup_dir.clone(),
            self.verbose,
            pipeline,
        ));

        let outcome = tokio::select! {
            result = tokio::time::timeout(self.cfg.run_deadline(), child.wait()) => match result {
                Ok(Ok(status)) => RunOutcome::Exited(status),
                Ok(Err(source)) => RunOutcome::WaitFailed(source),
                Err(_) => RunOutcome::DeadlineExpired,
            },
            _ = shutdown.cancelled() => RunOutcome::Cancelled,
        };

        if matches!(
            outcome,
            RunOutcome::DeadlineExpired | RunOutcome::Cancelled
        ) {
            let _ = child.kill().await;
            let _ = child.wait().await;
        }

        // The pipes close with the child; both pumps run to EOF.
        let _ = tokio::join!(stdout_pump, stderr_pump);

        match outcome {
            RunOutcome::Exited(status) if status.success() => {
                info!("extraction subprocess completed successfully");
                Ok(())
            }
            RunOutcome::Exited(status) => Err(RunError::ExtractorFailed {
                code: status.code(),
            }),
            RunOutcome::WaitFailed(source) => Err(RunError::Wait(source)),
            RunOutcome::DeadlineExpired => Err(RunError::Timeout {
                secs: self.cfg.run_deadline_secs,
            }),
            RunOutcome::Cancelled => {
                info!("extraction subprocess stopped by shutdown");
                Ok(())
            }
        }
    }
}

/// Consume one output stream: dispatch `FILE_SAVED` discoveries, forward
/// everything else (minus noise) to the log.
async fn pump_lines<R>(
    reader: R,
    stream: &'static str,
    backup_dir: PathBuf,
    verbose: bool,
    pipeline: Arc<Pipeline>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut files_seen = 0u64;

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(stream, error = %e, "error reading extractor output");
                break;
            }
        };

        if let Some(saved) = parse_saved_line(&line) {
            files_seen += 1;
            let full_path = resolve_saved_path(&backup_dir, &saved.relative);
            if full_path.exists() {
                let hint = saved.domain.as_deref().and_then(extension_hint);
                let created_at = std::fs::metadata(&full_path).ok().and_then(|m| m.modified().ok());
                pipeline.dispatch(
                    DiscoveredFile::new(full_path, DiscoveryMethod::ExternalReport)
                        .with_extension_hint(hint)
                        .with_created_at(created_at),
                );
            } else {
                debug!(stream, path = %full_path.display(), "reported file does not exist");
            }
            continue;
        }

        if verbose || !is_noise(&line) {
            info!(target: "extractor", stream, "{line}");
        }
    }

    if files_seen > 0 {
        debug!(stream, files_seen, "extractor stream finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown;
    use backup_transformer_config::Config;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn test_parse_saved_line_with_domain() {
        let line = "FILE_SAVED: path=00008110-X/Snapshot/test.txt domain=MediaDomain";
        let saved = parse_saved_line(line).unwrap();
        assert_eq!(saved.relative, "00008110-X/Snapshot/test.txt");
        assert_eq!(saved.domain.as_deref(), Some("MediaDomain"));
    }

    #[test]
    fn test_parse_saved_line_without_domain() {
        let saved = parse_saved_line("FILE_SAVED: path=test.txt").unwrap();
        assert_eq!(saved.relative, "test.txt");
        assert_eq!(saved.domain, None);
    }

    #[test]
    fn test_parse_rejects_other_lines() {
        assert_eq!(parse_saved_line("Not a FILE_SAVED line"), None);
        assert_eq!(parse_saved_line("FILE_FILTERED: path=x"), None);
        assert_eq!(parse_saved_line("FILE_SAVED: domain=OnlyDomain"), None);
        assert_eq!(parse_saved_line(""), None);
    }

    #[test]
    fn test_resolve_against_backup_parent() {
        let resolved = resolve_saved_path(
            Path::new("/backups/00008110-X"),
            "00008110-X/Snapshot/test.txt",
        );
        assert_eq!(
            resolved,
            PathBuf::from("/backups/00008110-X/Snapshot/test.txt")
        );
    }

    #[test]
    fn test_extension_hint_from_domain() {
        assert_eq!(
            extension_hint("/.b/6/Library/SMS/IMG_1234.HEIC").as_deref(),
            Some("heic")
        );
        assert_eq!(extension_hint("clip.MOV").as_deref(), Some("mov"));
        assert_eq!(extension_hint("MediaDomain"), None);
    }

    #[test]
    fn test_noise_markers() {
        assert!(is_noise(""));
        assert!(is_noise("   "));
        assert!(is_noise("FILE_FILTERED: path=skipped"));
        assert!(is_noise("Receiving domain: MediaDomain"));
        assert!(!is_noise("Backup started"));
        assert!(!is_noise("FILE_SAVED: path=x"));
    }

    fn install_extractor(dir: &Path, body: &str) {
        let path = dir.join("stub-extractor");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn fast_config() -> Config {
        let mut cfg = Config::default();
        cfg.stability.poll_interval_ms = 5;
        cfg.stability.stable_for_ms = 10;
        cfg.extractor.args = vec![]; // stub needs no domain filters
        cfg
    }

    fn runner(backup_dir: PathBuf, cfg: &Config) -> ExtractionRunner {
        ExtractionRunner::new(
            backup_dir,
            "stub-extractor".to_string(),
            false,
            cfg.extractor.clone(),
        )
    }

    #[tokio::test]
    async fn test_reported_files_are_dispatched() {
        let root = tempfile::tempdir().unwrap();
        let backup_dir = root.path().join("DEVICE");
        fs::create_dir_all(backup_dir.join("ab")).unwrap();
        fs::write(backup_dir.join("ab/payload"), b"plain text payload").unwrap();

        let tools_dir = tempfile::tempdir().unwrap();
        install_extractor(
            tools_dir.path(),
            concat!(
                "echo 'Receiving domain: MediaDomain'\n",
                "echo 'FILE_SAVED: path=DEVICE/ab/payload domain=note.txt'\n",
                "echo 'FILE_SAVED: path=DEVICE/ab/missing domain=gone.txt'\n",
                "echo 'plain progress line'",
            ),
        );

        let cfg = fast_config();
        let (_trigger, shutdown) = shutdown::channel();
        let pipeline = Arc::new(Pipeline::new(&cfg, shutdown.clone()));
        let tools = ToolResolver::new(Some(tools_dir.path().to_path_buf()));

        runner(backup_dir, &cfg)
            .run(pipeline.clone(), &tools, shutdown)
            .await
            .unwrap();

        let snapshot = pipeline.drain().await;
        // Only the file that actually exists becomes a job.
        assert_eq!(snapshot.total, 1);
        assert_eq!(snapshot.active, 0);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_run_failure() {
        let root = tempfile::tempdir().unwrap();
        let backup_dir = root.path().join("DEVICE");
        fs::create_dir_all(&backup_dir).unwrap();

        let tools_dir = tempfile::tempdir().unwrap();
        install_extractor(tools_dir.path(), "echo 'device gone' >&2\nexit 2");

        let cfg = fast_config();
        let (_trigger, shutdown) = shutdown::channel();
        let pipeline = Arc::new(Pipeline::new(&cfg, shutdown.clone()));
        let tools = ToolResolver::new(Some(tools_dir.path().to_path_buf()));

        let err = runner(backup_dir, &cfg)
            .run(pipeline, &tools, shutdown)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            RunError::ExtractorFailed { code: Some(2) }
        ));
    }

    #[tokio::test]
    async fn test_missing_tool_is_run_failure() {
        let root = tempfile::tempdir().unwrap();
        let backup_dir = root.path().join("DEVICE");
        fs::create_dir_all(&backup_dir).unwrap();

        let cfg = fast_config();
        let (_trigger, shutdown) = shutdown::channel();
        let pipeline = Arc::new(Pipeline::new(&cfg, shutdown.clone()));
        let tools = ToolResolver::new(None);

        let err = ExtractionRunner::new(
            backup_dir,
            "definitely-not-installed-extractor".to_string(),
            false,
            cfg.extractor.clone(),
        )
        .run(pipeline, &tools, shutdown)
        .await
        .unwrap_err();

        assert!(matches!(err, RunError::ToolNotFound(_)));
    }

    #[tokio::test]
    async fn test_overall_deadline_bounds_the_run() {
        let root = tempfile::tempdir().unwrap();
        let backup_dir = root.path().join("DEVICE");
        fs::create_dir_all(&backup_dir).unwrap();

        let tools_dir = tempfile::tempdir().unwrap();
        install_extractor(tools_dir.path(), "sleep 30");

        let mut cfg = fast_config();
        cfg.extractor.run_deadline_secs = 0; // expires immediately

        let (_trigger, shutdown) = shutdown::channel();
        let pipeline = Arc::new(Pipeline::new(&cfg, shutdown.clone()));
        let tools = ToolResolver::new(Some(tools_dir.path().to_path_buf()));

        let err = runner(backup_dir, &cfg)
            .run(pipeline, &tools, shutdown)
            .await
            .unwrap_err();

        assert!(matches!(err, RunError::Timeout { .. }));
        assert!(err.to_string().contains("timed out after"));
    }

    #[tokio::test]
    async fn test_shutdown_stops_run_cleanly() {
        let root = tempfile::tempdir().unwrap();
        let backup_dir = root.path().join("DEVICE");
        fs::create_dir_all(&backup_dir).unwrap();

        let tools_dir = tempfile::tempdir().unwrap();
        install_extractor(tools_dir.path(), "sleep 30");

        let cfg = fast_config();
        let (trigger, shutdown) = shutdown::channel();
        let pipeline = Arc::new(Pipeline::new(&cfg, shutdown.clone()));
        let tools = ToolResolver::new(Some(tools_dir.path().to_path_buf()));

        let run = {
            let pipeline = pipeline.clone();
            let shutdown = shutdown.clone();
            let runner = runner(backup_dir, &cfg);
            tokio::spawn(async move { runner.run(pipeline, &tools, shutdown).await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        trigger.trigger();

        // Clean shutdown is not a failure.
        run.await.unwrap().unwrap();
    }
}
