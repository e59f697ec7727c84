//! In-process raster converters: GIF, PNG, WEBP, and JPEG resize.

use super::{Outcome, TransformEngine, TransformError};
use crate::governor::PoolClass;
use crate::resize::{plan_resize, ResizePlan};
use image::ImageFormat;
use std::path::Path;
use tracing::info;

impl TransformEngine {
    /// Decode `path` as `format`, resize, re-encode as JPEG, and replace the
    /// original. GIF decodes go through the GIF pool; PNG and WEBP are
    /// unbounded aside from the allocation guard.
    pub(crate) async fn convert_raster(
        &self,
        path: &Path,
        format: ImageFormat,
        pool: Option<PoolClass>,
    ) -> Result<Outcome, TransformError> {
        let _permit = match pool {
            Some(class) => Some(self.pools.acquire(class).await),
            None => None,
        };

        info!(path = %path.display(), format = ?format, "converting image to JPEG");

        let Some(bytes) = self.read_source(path)? else {
            return Ok(Outcome::Untouched);
        };

        let img = image::load_from_memory_with_format(&bytes, format).map_err(|e| {
            TransformError::Decode {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }
        })?;

        let jpeg = self.encode_resized_jpeg(img)?;
        self.replace_with(path, &jpeg)
    }

    /// Resize a JPEG in place. A JPEG already at or under the target width
    /// is left byte-identical, which keeps repeated dispatches idempotent.
    pub(crate) async fn resize_jpeg(&self, path: &Path) -> Result<Outcome, TransformError> {
        let Some(bytes) = self.read_source(path)? else {
            return Ok(Outcome::Untouched);
        };

        let img = image::load_from_memory_with_format(&bytes, ImageFormat::Jpeg).map_err(|e| {
            TransformError::Decode {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }
        })?;

        let plan = plan_resize(
            img.width(),
            img.height(),
            self.cfg.target_width,
            self.cfg.max_pixel_buffer_bytes,
        )?;
        if plan == ResizePlan::PassThrough {
            return Ok(Outcome::Untouched);
        }

        info!(path = %path.display(), width = img.width(), "resizing JPEG");
        let jpeg = self.encode_resized_jpeg(img)?;
        self.replace_with(path, &jpeg)
    }
}
