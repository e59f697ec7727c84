//! External tool resolution and deadline-bounded invocation.
//!
//! Tools (heic-converter, ffmpeg, ffprobe, the extraction binary) are
//! resolved once per process, searching the bundled-libraries directory,
//! then the executable's own directory, then the current working directory,
//! then the OS search path. Absence is not an error: converters treat an
//! unresolved tool as "skip this file".
//!
//! Every invocation carries an explicit deadline and observes the shutdown
//! signal; expiry or cancellation kills the child process.

use crate::shutdown::Shutdown;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Error type for external tool invocations.
#[derive(Debug, Error)]
pub enum ToolError {
    /// The deadline elapsed; the child was killed.
    #[error("{tool} timed out after {secs}s")]
    Timeout { tool: String, secs: u64 },

    /// The tool exited with a failure status.
    #[error("{tool} exited with status {code:?}: {output}")]
    Crashed {
        tool: String,
        code: Option<i32>,
        output: String,
    },

    /// Shutdown was requested while the tool was running.
    #[error("{tool} cancelled by shutdown")]
    Cancelled { tool: String },

    /// The tool could not be launched at all.
    #[error("failed to launch {tool}: {source}")]
    Launch {
        tool: String,
        source: std::io::Error,
    },
}

/// Resolves tool names to paths, caching each lookup for the process
/// lifetime.
#[derive(Debug)]
pub struct ToolResolver {
    libraries_dir: Option<PathBuf>,
    cache: Mutex<HashMap<String, Option<PathBuf>>>,
}

impl ToolResolver {
    pub fn new(libraries_dir: Option<PathBuf>) -> Self {
        Self {
            libraries_dir,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve `name` to an executable path, or `None` when the tool is
    /// unavailable. The first answer per name is cached.
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        let mut cache = self.cache.lock().expect("tool cache lock poisoned");
        if let Some(cached) = cache.get(name) {
            return cached.clone();
        }

        let resolved = self.locate(name);
        debug!(tool = name, path = ?resolved, "resolved external tool");
        cache.insert(name.to_string(), resolved.clone());
        resolved
    }

    fn locate(&self, name: &str) -> Option<PathBuf> {
        for dir in self.candidate_dirs() {
            let candidate = dir.join(name);
            if is_executable_file(&candidate) {
                return Some(candidate);
            }
        }
        search_os_path(name)
    }

    fn candidate_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = Vec::new();
        if let Some(libraries) = &self.libraries_dir {
            dirs.push(libraries.clone());
        }
        if let Ok(exe) = std::env::current_exe() {
            if let Some(exe_dir) = exe.parent() {
                dirs.push(exe_dir.to_path_buf());
            }
        }
        if let Ok(cwd) = std::env::current_dir() {
            dirs.push(cwd);
        }
        dirs
    }
}

fn is_executable_file(path: &Path) -> bool {
    path.is_file()
}

fn search_os_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable_file(candidate))
}

/// Run an external tool to completion under `deadline`, observing the
/// shutdown signal.
///
/// Returns the combined stdout/stderr text on success. A non-zero exit
/// yields [`ToolError::Crashed`] carrying the exit code and captured
/// output; deadline expiry or shutdown kills the child.
pub async fn run_tool<I, S>(
    tool: &str,
    program: &Path,
    args: I,
    deadline: Duration,
    shutdown: &Shutdown,
) -> Result<String, ToolError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        // Dropping the in-flight future (deadline, shutdown) must not leave
        // the child running.
        .kill_on_drop(true);

    let output = tokio::select! {
        result = tokio::time::timeout(deadline, cmd.output()) => match result {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(ToolError::Launch {
                    tool: tool.to_string(),
                    source,
                });
            }
            Err(_) => {
                return Err(ToolError::Timeout {
                    tool: tool.to_string(),
                    secs: deadline.as_secs(),
                });
            }
        },
        _ = shutdown.cancelled() => {
            return Err(ToolError::Cancelled {
                tool: tool.to_string(),
            });
        }
    };

    let combined = combine_output(&output.stdout, &output.stderr);

    if output.status.success() {
        Ok(combined)
    } else {
        Err(ToolError::Crashed {
            tool: tool.to_string(),
            code: output.status.code(),
            output: combined,
        })
    }
}

fn combine_output(stdout: &[u8], stderr: &[u8]) -> String {
    let mut combined = String::from_utf8_lossy(stdout).into_owned();
    let err = String::from_utf8_lossy(stderr);
    if !err.trim().is_empty() {
        if !combined.is_empty() {
            combined.push('\n');
        }
        combined.push_str(err.trim_end());
    }
    combined.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown;

    #[test]
    fn test_resolver_prefers_libraries_dir() {
        let dir = tempfile::tempdir().unwrap();
        let tool_path = dir.path().join("fake-tool");
        std::fs::write(&tool_path, b"#!/bin/sh\n").unwrap();

        let resolver = ToolResolver::new(Some(dir.path().to_path_buf()));
        assert_eq!(resolver.resolve("fake-tool"), Some(tool_path));
    }

    #[test]
    fn test_resolver_caches_first_answer() {
        let dir = tempfile::tempdir().unwrap();
        let tool_path = dir.path().join("fleeting-tool");
        std::fs::write(&tool_path, b"#!/bin/sh\n").unwrap();

        let resolver = ToolResolver::new(Some(dir.path().to_path_buf()));
        assert_eq!(resolver.resolve("fleeting-tool"), Some(tool_path.clone()));

        // Removing the file does not invalidate the cache.
        std::fs::remove_file(&tool_path).unwrap();
        assert_eq!(resolver.resolve("fleeting-tool"), Some(tool_path));
    }

    #[test]
    fn test_resolver_missing_tool_is_none() {
        let resolver = ToolResolver::new(None);
        assert_eq!(resolver.resolve("no-such-converter-exists-here"), None);
    }

    #[test]
    fn test_resolver_falls_back_to_os_path() {
        // `sh` is on PATH in every environment these tests run in.
        let resolver = ToolResolver::new(None);
        let resolved = resolver.resolve("sh");
        assert!(resolved.is_some());
    }

    #[tokio::test]
    async fn test_run_tool_captures_output() {
        let (_trigger, shutdown) = shutdown::channel();
        let output = run_tool(
            "sh",
            Path::new("/bin/sh"),
            ["-c", "echo out; echo err >&2"],
            Duration::from_secs(5),
            &shutdown,
        )
        .await
        .unwrap();

        assert!(output.contains("out"));
        assert!(output.contains("err"));
    }

    #[tokio::test]
    async fn test_run_tool_nonzero_exit_is_crashed() {
        let (_trigger, shutdown) = shutdown::channel();
        let err = run_tool(
            "sh",
            Path::new("/bin/sh"),
            ["-c", "echo boom >&2; exit 3"],
            Duration::from_secs(5),
            &shutdown,
        )
        .await
        .unwrap_err();

        match err {
            ToolError::Crashed { code, output, .. } => {
                assert_eq!(code, Some(3));
                assert!(output.contains("boom"));
            }
            other => panic!("expected Crashed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_tool_deadline_expiry() {
        let (_trigger, shutdown) = shutdown::channel();
        let err = run_tool(
            "sh",
            Path::new("/bin/sh"),
            ["-c", "sleep 5"],
            Duration::from_millis(50),
            &shutdown,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ToolError::Timeout { .. }));
        assert!(err.to_string().contains("timed out after"));
    }

    #[tokio::test]
    async fn test_run_tool_cancelled_by_shutdown() {
        let (trigger, shutdown) = shutdown::channel();

        let runner = tokio::spawn(async move {
            run_tool(
                "sh",
                Path::new("/bin/sh"),
                ["-c", "sleep 5"],
                Duration::from_secs(10),
                &shutdown,
            )
            .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.trigger();

        let err = runner.await.unwrap().unwrap_err();
        assert!(matches!(err, ToolError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_run_tool_launch_failure() {
        let (_trigger, shutdown) = shutdown::channel();
        let err = run_tool(
            "ghost",
            Path::new("/no/such/binary"),
            Vec::<&str>::new(),
            Duration::from_secs(1),
            &shutdown,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ToolError::Launch { .. }));
    }
}
