//! HEIC conversion via the external `heic-converter` tool.

use super::{Outcome, TransformEngine, TransformError};
use crate::governor::PoolClass;
use crate::replace;
use crate::tools::run_tool;
use image::ImageFormat;
use std::path::Path;
use tracing::info;

/// Name of the external HEIC decoder binary.
const HEIC_CONVERTER: &str = "heic-converter";

impl TransformEngine {
    /// Convert a HEIC file to a resized JPEG, overwriting the original.
    ///
    /// An unresolvable converter is not an error: the file is skipped and
    /// left untouched. The tool runs under the configured deadline.
    pub(crate) async fn convert_heic(&self, path: &Path) -> Result<Outcome, TransformError> {
        let _permit = self.pools.acquire(PoolClass::Heic).await;

        let Some(converter) = self.tools.resolve(HEIC_CONVERTER) else {
            info!(
                path = %path.display(),
                "heic-converter not available, skipping conversion"
            );
            return Ok(Outcome::Untouched);
        };

        info!(path = %path.display(), "converting HEIC to JPEG");

        // The tool writes its JPEG into a staging file next to the original;
        // the staging file is removed on drop whatever happens below.
        let staged = replace::staging_file_for(path)?;
        run_tool(
            HEIC_CONVERTER,
            &converter,
            [path.as_os_str(), staged.path().as_os_str()],
            self.cfg.heic_deadline(),
            &self.shutdown,
        )
        .await?;

        let produced =
            std::fs::read(staged.path()).map_err(|source| TransformError::Io {
                path: staged.path().to_path_buf(),
                source,
            })?;
        let img = image::load_from_memory_with_format(&produced, ImageFormat::Jpeg).map_err(
            |e| TransformError::Decode {
                path: path.to_path_buf(),
                reason: format!("converter output not a decodable JPEG: {e}"),
            },
        )?;

        let jpeg = self.encode_resized_jpeg(img)?;
        self.replace_with(path, &jpeg)
    }
}
