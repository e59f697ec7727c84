//! Transformation engine.
//!
//! One converter per recognized media type, all sharing the same template:
//! decode, resize to the target width when wider, encode as JPEG into a
//! same-directory temp file, atomically rename over the original. Failures
//! leave the original file untouched.
//!
//! Non-media handling depends on the administrative flags: in
//! media-transform-only mode (the default) everything that is not a
//! convertible media file is left untouched; in administrative mode
//! snapshot files and stale PLISTs are truncated and unsupported types are
//! truncated or deleted.

mod heic;
mod raster;
mod video;

pub use video::{format_seek_timestamp, thumbnail_seek_seconds};

use crate::classify::{ClassificationResult, ContentType};
use crate::discovery::DiscoveredFile;
use crate::governor::{PoolClass, PoolTable};
use crate::progress::{JobGuard, JobSink};
use crate::replace::{self, ReplaceError};
use crate::resize::{shrink_to_width, ResizeRejected};
use crate::shutdown::Shutdown;
use crate::tools::{ToolError, ToolResolver};
use backup_transformer_config::TransformConfig;
use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info};

/// Terminal state of one dispatched file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The file was converted and replaced in place.
    Converted,
    /// The file was left exactly as found (preserved, skipped, or already
    /// at target size).
    Untouched,
    /// Administrative mode truncated the file to zero bytes.
    Truncated,
    /// Administrative mode deleted the file.
    Deleted,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Converted => write!(f, "converted"),
            Outcome::Untouched => write!(f, "untouched"),
            Outcome::Truncated => write!(f, "truncated"),
            Outcome::Deleted => write!(f, "deleted"),
        }
    }
}

/// Per-file transformation errors. All are contained to the file's own job.
#[derive(Debug, Error)]
pub enum TransformError {
    /// Source bytes could not be decoded; the original is untouched.
    #[error("failed to decode {path}: {reason}")]
    Decode { path: PathBuf, reason: String },

    /// The resize would exceed the pixel-buffer cap.
    #[error(transparent)]
    TooLarge(#[from] ResizeRejected),

    /// An external tool failed, timed out, or was cancelled.
    #[error(transparent)]
    Tool(#[from] ToolError),

    /// JPEG encoding failed.
    #[error("failed to encode JPEG: {0}")]
    Encode(image::ImageError),

    /// Staging or renaming the replacement failed.
    #[error(transparent)]
    Replace(#[from] ReplaceError),

    /// Filesystem error while reading or mutating the file.
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Converts qualifying files in place, gated by the per-class pools.
pub struct TransformEngine {
    pub(crate) cfg: TransformConfig,
    pub(crate) pools: PoolTable,
    pub(crate) tools: ToolResolver,
    pub(crate) sink: Arc<dyn JobSink>,
    pub(crate) shutdown: Shutdown,
}

impl TransformEngine {
    pub fn new(
        cfg: TransformConfig,
        pools: PoolTable,
        tools: ToolResolver,
        sink: Arc<dyn JobSink>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            cfg,
            pools,
            tools,
            sink,
            shutdown,
        }
    }

    /// Process one dispatched file according to its classification.
    ///
    /// Every call counts as one job in the ledger, started here and finished
    /// on every exit path.
    pub async fn process(
        &self,
        file: &mut DiscoveredFile,
        classification: ClassificationResult,
    ) -> Result<Outcome, TransformError> {
        let _job = JobGuard::begin(self.sink.as_ref());
        file.transform_started_at = Some(Instant::now());
        let path = file.path.clone();

        if in_snapshot_directory(&path) {
            if self.cfg.media_only {
                return Ok(Outcome::Untouched);
            }
            info!(path = %path.display(), "truncating snapshot file");
            return self.truncate(&path);
        }

        match classification.content_type {
            ContentType::Heic => self.convert_heic(&path).await,
            ContentType::Gif => {
                self.convert_raster(&path, image::ImageFormat::Gif, Some(PoolClass::Gif))
                    .await
            }
            ContentType::Png => {
                self.convert_raster(&path, image::ImageFormat::Png, None)
                    .await
            }
            ContentType::Webp => {
                self.convert_raster(&path, image::ImageFormat::WebP, None)
                    .await
            }
            ContentType::Jpeg => self.resize_jpeg(&path).await,
            kind if kind.is_video() => self.convert_video(&path).await,
            ContentType::Sqlite => {
                debug!(path = %path.display(), "keeping SQLite database");
                Ok(Outcome::Untouched)
            }
            ContentType::Plist => self.handle_plist(&path),
            other => self.handle_unsupported(&path, other),
        }
    }

    /// Binary property lists: the backup's own manifest files are preserved,
    /// everything else is truncated in administrative mode.
    fn handle_plist(&self, path: &Path) -> Result<Outcome, TransformError> {
        if self.cfg.media_only {
            return Ok(Outcome::Untouched);
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if name == "manifest.plist" || name == "status.plist" {
            info!(path = %path.display(), "keeping backup manifest plist");
            return Ok(Outcome::Untouched);
        }

        info!(path = %path.display(), "truncating plist");
        self.truncate(path)
    }

    fn handle_unsupported(
        &self,
        path: &Path,
        kind: ContentType,
    ) -> Result<Outcome, TransformError> {
        if self.cfg.media_only {
            debug!(path = %path.display(), kind = %kind, "unsupported type, leaving untouched");
            return Ok(Outcome::Untouched);
        }

        if self.cfg.truncate_unknown {
            info!(path = %path.display(), kind = %kind, "truncating unsupported file");
            self.truncate(path)
        } else {
            info!(path = %path.display(), kind = %kind, "deleting unsupported file");
            match std::fs::remove_file(path) {
                Ok(()) => Ok(Outcome::Deleted),
                Err(source) => Err(TransformError::Io {
                    path: path.to_path_buf(),
                    source,
                }),
            }
        }
    }

    fn truncate(&self, path: &Path) -> Result<Outcome, TransformError> {
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|source| TransformError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        file.set_len(0).map_err(|source| TransformError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Outcome::Truncated)
    }

    /// Shared conversion tail: resize when wider than the target, then
    /// encode as JPEG at the configured quality.
    pub(crate) fn encode_resized_jpeg(
        &self,
        img: DynamicImage,
    ) -> Result<Vec<u8>, TransformError> {
        let resized = shrink_to_width(img, self.cfg.target_width, self.cfg.max_pixel_buffer_bytes)?;
        let rgb = resized.to_rgb8();

        let mut encoded = Vec::new();
        JpegEncoder::new_with_quality(&mut encoded, self.cfg.jpeg_quality)
            .encode_image(&rgb)
            .map_err(TransformError::Encode)?;
        Ok(encoded)
    }

    /// Replace `path` with the encoded JPEG via same-directory temp +
    /// atomic rename.
    pub(crate) fn replace_with(&self, path: &Path, jpeg: &[u8]) -> Result<Outcome, TransformError> {
        replace::write_atomic(path, jpeg)?;
        Ok(Outcome::Converted)
    }

    pub(crate) fn read_source(&self, path: &Path) -> Result<Option<Vec<u8>>, TransformError> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            // The backup writer can remove a file mid-flight; drop silently.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(TransformError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

/// True when any path component is a backup-tool `Snapshot` staging
/// directory.
pub fn in_snapshot_directory(path: &Path) -> bool {
    path.components()
        .any(|c| matches!(c, Component::Normal(name) if name == "Snapshot"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::Confidence;
    use crate::discovery::DiscoveryMethod;
    use crate::progress::ProgressTracker;
    use crate::shutdown;
    use backup_transformer_config::PoolsConfig;
    use std::fs;

    fn engine_with(cfg: TransformConfig) -> (TransformEngine, Arc<ProgressTracker>) {
        let tracker = Arc::new(ProgressTracker::new());
        let (_trigger, shutdown) = shutdown::channel();
        // Leak the trigger so the shutdown signal never fires during a test.
        std::mem::forget(_trigger);
        let engine = TransformEngine::new(
            cfg,
            PoolTable::new(&PoolsConfig::default()),
            ToolResolver::new(None),
            tracker.clone(),
            shutdown,
        );
        (engine, tracker)
    }

    fn classification(content_type: ContentType, confidence: Confidence) -> ClassificationResult {
        ClassificationResult {
            content_type,
            confidence,
        }
    }

    fn discovered(path: &Path) -> DiscoveredFile {
        DiscoveredFile::new(path.to_path_buf(), DiscoveryMethod::Watch)
    }

    fn administrative() -> TransformConfig {
        TransformConfig {
            media_only: false,
            ..TransformConfig::default()
        }
    }

    #[test]
    fn test_snapshot_directory_detection() {
        assert!(in_snapshot_directory(Path::new(
            "/backup/00008110-X/Snapshot/test.txt"
        )));
        assert!(!in_snapshot_directory(Path::new(
            "/backup/00008110-X/ab/cdef123"
        )));
        // Only an exact component counts.
        assert!(!in_snapshot_directory(Path::new(
            "/backup/Snapshots/file.txt"
        )));
    }

    #[tokio::test]
    async fn test_png_converted_to_target_width_jpeg() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shot.png");
        let img = DynamicImage::new_rgb8(1000, 1000);
        img.save_with_format(&path, image::ImageFormat::Png).unwrap();

        let (engine, tracker) = engine_with(TransformConfig::default());
        let mut file = discovered(&path);
        let outcome = engine
            .process(&mut file, classification(ContentType::Png, Confidence::High))
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Converted);
        assert_eq!(tracker.snapshot().total, 1);
        assert_eq!(tracker.snapshot().active, 0);
        assert!(file.transform_started_at.is_some());

        // The original path now holds a JPEG decodable at 500x500.
        let converted = fs::read(&path).unwrap();
        let decoded =
            image::load_from_memory_with_format(&converted, image::ImageFormat::Jpeg).unwrap();
        assert_eq!(decoded.width(), 500);
        assert_eq!(decoded.height(), 500);
    }

    #[tokio::test]
    async fn test_small_jpeg_passes_through_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("small.jpg");
        let img = DynamicImage::new_rgb8(320, 240);
        img.save_with_format(&path, image::ImageFormat::Jpeg).unwrap();
        let original = fs::read(&path).unwrap();

        let (engine, _) = engine_with(TransformConfig::default());
        let mut file = discovered(&path);
        let outcome = engine
            .process(&mut file, classification(ContentType::Jpeg, Confidence::High))
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Untouched);
        assert_eq!(fs::read(&path).unwrap(), original);
    }

    #[tokio::test]
    async fn test_corrupt_gif_left_untouched_with_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.gif");
        fs::write(&path, b"not a gif").unwrap();

        let (engine, _) = engine_with(TransformConfig::default());
        let mut file = discovered(&path);
        let err = engine
            .process(&mut file, classification(ContentType::Gif, Confidence::Low))
            .await
            .unwrap_err();

        assert!(matches!(err, TransformError::Decode { .. }));
        assert_eq!(fs::read(&path).unwrap(), b"not a gif");
    }

    #[tokio::test]
    async fn test_heic_with_missing_tool_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("photo.heic");
        fs::write(&path, b"pretend heic bytes").unwrap();

        let (engine, _) = engine_with(TransformConfig::default());
        let mut file = discovered(&path);
        let outcome = engine
            .process(&mut file, classification(ContentType::Heic, Confidence::High))
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Untouched);
        assert_eq!(fs::read(&path).unwrap(), b"pretend heic bytes");
    }

    #[tokio::test]
    async fn test_oversized_image_rejected_without_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("huge.png");
        // 2000 px wide so the resize path runs, with a cap too small for the
        // destination buffer.
        let img = DynamicImage::new_rgb8(2000, 1000);
        img.save_with_format(&path, image::ImageFormat::Png).unwrap();
        let original = fs::read(&path).unwrap();

        let cfg = TransformConfig {
            max_pixel_buffer_bytes: 1024,
            ..TransformConfig::default()
        };
        let (engine, _) = engine_with(cfg);
        let mut file = discovered(&path);
        let err = engine
            .process(&mut file, classification(ContentType::Png, Confidence::High))
            .await
            .unwrap_err();

        assert!(matches!(err, TransformError::TooLarge(_)));
        assert!(err.to_string().contains("too large"));
        assert_eq!(fs::read(&path).unwrap(), original, "no output produced");
    }

    #[tokio::test]
    async fn test_sqlite_always_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Manifest.db");
        fs::write(&path, b"SQLite format 3\x00...").unwrap();

        let (engine, _) = engine_with(administrative());
        let mut file = discovered(&path);
        let outcome = engine
            .process(
                &mut file,
                classification(ContentType::Sqlite, Confidence::High),
            )
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Untouched);
        assert!(fs::metadata(&path).unwrap().len() > 0);
    }

    #[tokio::test]
    async fn test_snapshot_file_truncated_in_administrative_mode() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = dir.path().join("Snapshot");
        fs::create_dir(&snapshot).unwrap();
        let path = snapshot.join("staged.bin");
        fs::write(&path, b"staged content").unwrap();

        let (engine, _) = engine_with(administrative());
        let mut file = discovered(&path);
        let outcome = engine
            .process(
                &mut file,
                classification(ContentType::Unknown, Confidence::None),
            )
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Truncated);
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_snapshot_file_untouched_in_media_only_mode() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = dir.path().join("Snapshot");
        fs::create_dir(&snapshot).unwrap();
        let path = snapshot.join("staged.bin");
        fs::write(&path, b"staged content").unwrap();

        let (engine, _) = engine_with(TransformConfig::default());
        let mut file = discovered(&path);
        let outcome = engine
            .process(
                &mut file,
                classification(ContentType::Unknown, Confidence::None),
            )
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Untouched);
        assert_eq!(fs::read(&path).unwrap(), b"staged content");
    }

    #[tokio::test]
    async fn test_manifest_plist_kept_other_plists_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("Manifest.plist");
        let other = dir.path().join("Info.plist");
        fs::write(&manifest, b"bplist00manifest").unwrap();
        fs::write(&other, b"bplist00other").unwrap();

        let (engine, _) = engine_with(administrative());

        let mut file = discovered(&manifest);
        let outcome = engine
            .process(&mut file, classification(ContentType::Plist, Confidence::High))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Untouched);

        let mut file = discovered(&other);
        let outcome = engine
            .process(&mut file, classification(ContentType::Plist, Confidence::High))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Truncated);
        assert_eq!(fs::metadata(&other).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_unsupported_deleted_when_truncate_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mystery.bin");
        fs::write(&path, b"???").unwrap();

        let cfg = TransformConfig {
            media_only: false,
            truncate_unknown: false,
            ..TransformConfig::default()
        };
        let (engine, _) = engine_with(cfg);
        let mut file = discovered(&path);
        let outcome = engine
            .process(
                &mut file,
                classification(ContentType::Unknown, Confidence::None),
            )
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Deleted);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_every_process_counts_exactly_one_job() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        fs::write(&path, b"plain text").unwrap();

        let (engine, tracker) = engine_with(TransformConfig::default());
        for _ in 0..3 {
            let mut file = discovered(&path);
            engine
                .process(&mut file, classification(ContentType::Text, Confidence::Low))
                .await
                .unwrap();
        }

        assert_eq!(tracker.snapshot().total, 3);
        assert_eq!(tracker.snapshot().active, 0);
    }
}
