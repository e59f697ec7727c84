//! Video thumbnail conversion via external ffmpeg/ffprobe.
//!
//! A video file is replaced by a single JPEG frame grabbed near the start of
//! the stream. ffprobe answers two questions first, each under its own
//! deadline: does the container hold a video stream at all (audio-only files
//! are skipped untouched), and how long is it (for the seek offset). Both
//! probes are best-effort; any failure means "unknown" and the extraction
//! proceeds with the fallback offset.

use super::{Outcome, TransformEngine, TransformError};
use crate::governor::PoolClass;
use crate::replace;
use crate::tools::run_tool;
use image::ImageFormat;
use std::ffi::OsStr;
use std::path::Path;
use tracing::{info, warn};

const FFMPEG: &str = "ffmpeg";
const FFPROBE: &str = "ffprobe";

/// Upper bound on the thumbnail seek offset in seconds.
const MAX_THUMBNAIL_SEEK_SECS: f64 = 0.5;
/// Offset used when the duration is unknown or degenerate.
const FALLBACK_THUMBNAIL_SEEK_SECS: f64 = 0.1;

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
    }
}

/// Parse the stream-selection probe: does the container hold a video stream?
///
/// Returns `None` when the output cannot be parsed (treated as unknown).
pub fn parse_stream_probe(json: &str) -> Option<bool> {
    let probe: ffprobe_json::FfprobeOutput = serde_json::from_str(json).ok()?;
    let streams = probe.streams.unwrap_or_default();
    Some(
        streams
            .iter()
            .any(|s| s.codec_type.as_deref() == Some("video")),
    )
}

/// Parse the duration probe. Non-positive or unparsable durations are
/// "unknown", never an error.
pub fn parse_duration_probe(json: &str) -> Option<f64> {
    let probe: ffprobe_json::FfprobeOutput = serde_json::from_str(json).ok()?;
    let duration = probe.format?.duration?.parse::<f64>().ok()?;
    if duration > 0.0 {
        Some(duration)
    } else {
        None
    }
}

/// Seek offset for thumbnail extraction: half the duration capped at
/// [`MAX_THUMBNAIL_SEEK_SECS`], falling back to
/// [`FALLBACK_THUMBNAIL_SEEK_SECS`] when the duration is unavailable or the
/// computed offset is not positive.
pub fn thumbnail_seek_seconds(duration: Option<f64>) -> f64 {
    let Some(duration) = duration else {
        return FALLBACK_THUMBNAIL_SEEK_SECS;
    };

    let seek = (duration / 2.0).min(MAX_THUMBNAIL_SEEK_SECS);
    if seek <= 0.0 {
        FALLBACK_THUMBNAIL_SEEK_SECS
    } else {
        seek
    }
}

/// Format a seek offset for the ffmpeg `-ss` flag: three decimal places
/// with trailing zeros (and a bare trailing dot) trimmed.
pub fn format_seek_timestamp(seconds: f64) -> String {
    if seconds <= 0.0 {
        return "0".to_string();
    }

    let formatted = format!("{seconds:.3}");
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

impl TransformEngine {
    /// Replace a video file with a single resized JPEG frame.
    ///
    /// Audio-only containers and unresolvable tools are skips, not errors.
    pub(crate) async fn convert_video(&self, path: &Path) -> Result<Outcome, TransformError> {
        let _permit = self.pools.acquire(PoolClass::Video).await;

        if self.probe_video_stream(path).await == Some(false) {
            info!(path = %path.display(), "container has no video stream, skipping");
            return Ok(Outcome::Untouched);
        }

        let duration = self.probe_duration(path).await;
        let seek = thumbnail_seek_seconds(duration);

        let Some(ffmpeg) = self.tools.resolve(FFMPEG) else {
            info!(path = %path.display(), "ffmpeg not available, skipping video conversion");
            return Ok(Outcome::Untouched);
        };

        info!(path = %path.display(), seek, "extracting video thumbnail");

        let staged = replace::staging_file_for(path)?;
        let seek_arg = format_seek_timestamp(seek);
        let args: Vec<&OsStr> = vec![
            OsStr::new("-ss"),
            OsStr::new(&seek_arg),
            OsStr::new("-i"),
            path.as_os_str(),
            OsStr::new("-vframes"),
            OsStr::new("1"),
            OsStr::new("-f"),
            OsStr::new("image2"),
            OsStr::new("-update"),
            OsStr::new("1"),
            OsStr::new("-y"),
            staged.path().as_os_str(),
        ];
        run_tool(FFMPEG, &ffmpeg, args, self.cfg.video_deadline(), &self.shutdown).await?;

        let frame = std::fs::read(staged.path()).map_err(|source| TransformError::Io {
            path: staged.path().to_path_buf(),
            source,
        })?;
        let img = image::load_from_memory_with_format(&frame, ImageFormat::Jpeg).map_err(|e| {
            TransformError::Decode {
                path: path.to_path_buf(),
                reason: format!("extracted frame not a decodable JPEG: {e}"),
            }
        })?;

        let jpeg = self.encode_resized_jpeg(img)?;
        self.replace_with(path, &jpeg)
    }

    /// Probe whether `path` holds a video stream. `None` means unknown
    /// (missing tool, failed probe, unparsable output) and the conversion
    /// proceeds.
    async fn probe_video_stream(&self, path: &Path) -> Option<bool> {
        let ffprobe = self.tools.resolve(FFPROBE)?;

        let args: Vec<&OsStr> = vec![
            OsStr::new("-v"),
            OsStr::new("error"),
            OsStr::new("-print_format"),
            OsStr::new("json"),
            OsStr::new("-select_streams"),
            OsStr::new("v:0"),
            OsStr::new("-show_entries"),
            OsStr::new("stream=codec_type"),
            path.as_os_str(),
        ];

        match run_tool(FFPROBE, &ffprobe, args, self.cfg.probe_deadline(), &self.shutdown).await {
            Ok(output) => parse_stream_probe(&output),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "stream probe failed");
                None
            }
        }
    }

    /// Probe the container duration. Any failure is "duration unknown".
    async fn probe_duration(&self, path: &Path) -> Option<f64> {
        let ffprobe = self.tools.resolve(FFPROBE)?;

        let args: Vec<&OsStr> = vec![
            OsStr::new("-v"),
            OsStr::new("error"),
            OsStr::new("-print_format"),
            OsStr::new("json"),
            OsStr::new("-show_entries"),
            OsStr::new("format=duration"),
            path.as_os_str(),
        ];

        match run_tool(FFPROBE, &ffprobe, args, self.cfg.probe_deadline(), &self.shutdown).await {
            Ok(output) => parse_duration_probe(&output),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "duration probe failed");
                None
            }
        }
    }
}
