//! Atomic in-place replacement of converted files.
//!
//! A file's on-disk bytes are only ever replaced by writing a temporary file
//! in the same directory and renaming it over the original path. On any
//! failure the original is left untouched and the temp artifact is removed.

use std::io::Write;
use std::path::Path;
use tempfile::{Builder, NamedTempFile};
use thiserror::Error;

/// Errors that can occur while staging or promoting a replacement.
#[derive(Debug, Error)]
pub enum ReplaceError {
    /// Failed to create or write the same-directory temp file.
    #[error("failed to stage temp file: {0}")]
    Stage(std::io::Error),

    /// Failed to rename the temp file over the original path.
    #[error("failed to replace original: {0}")]
    Rename(std::io::Error),
}

/// Create a temp file next to `dest` for an external tool to write into.
///
/// The `.jpg` suffix matters: converters infer their output format from it.
/// The file is removed on drop unless promoted.
pub fn staging_file_for(dest: &Path) -> Result<NamedTempFile, ReplaceError> {
    let dir = parent_dir(dest);
    Builder::new()
        .prefix(".convert-")
        .suffix(".jpg")
        .tempfile_in(dir)
        .map_err(ReplaceError::Stage)
}

/// Write `bytes` to a temp file in `dest`'s directory and atomically rename
/// it over `dest`.
pub fn write_atomic(dest: &Path, bytes: &[u8]) -> Result<(), ReplaceError> {
    let dir = parent_dir(dest);
    let mut staged = Builder::new()
        .prefix(".convert-")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(ReplaceError::Stage)?;

    staged.write_all(bytes).map_err(ReplaceError::Stage)?;
    staged.flush().map_err(ReplaceError::Stage)?;

    // persist() is a rename; on failure the temp file comes back to us and
    // is removed when dropped.
    staged
        .persist(dest)
        .map(|_| ())
        .map_err(|e| ReplaceError::Rename(e.error))
}

fn parent_dir(dest: &Path) -> &Path {
    dest.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}
