//! Resize planning and nearest-neighbor downscaling.
//!
//! Images wider than the target width are scaled down preserving aspect
//! ratio; anything at or under the target passes through unchanged, which
//! makes the whole conversion idempotent under repeated dispatch. Before a
//! resize is applied the destination buffer is checked against a hard cap,
//! independent of available memory.

use image::imageops::FilterType;
use image::DynamicImage;
use thiserror::Error;

/// Bytes per pixel of the RGBA intermediate used for the cap check.
pub const RGBA_BYTES_PER_PIXEL: u64 = 4;

/// The planned resize would exceed the pixel-buffer cap.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error(
    "image too large to resize: {width}x{height} needs {required_bytes} bytes (cap {max_bytes})"
)]
pub struct ResizeRejected {
    pub width: u32,
    pub height: u32,
    pub required_bytes: u64,
    pub max_bytes: u64,
}

/// Outcome of planning a resize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizePlan {
    /// Width already at or under the target; the image is left as-is.
    PassThrough,
    /// Scale down to exactly these dimensions.
    Scale { width: u32, height: u32 },
}

/// Plan a resize of a `width` x `height` image to `target_width`.
///
/// The new height is `floor(height * target_width / width)`, at least 1.
/// Returns an error when the destination RGBA buffer would exceed
/// `max_buffer_bytes`.
pub fn plan_resize(
    width: u32,
    height: u32,
    target_width: u32,
    max_buffer_bytes: u64,
) -> Result<ResizePlan, ResizeRejected> {
    if width <= target_width {
        return Ok(ResizePlan::PassThrough);
    }

    let new_height = ((height as u64 * target_width as u64) / width as u64).max(1) as u32;
    let required_bytes = target_width as u64 * new_height as u64 * RGBA_BYTES_PER_PIXEL;

    if required_bytes > max_buffer_bytes {
        return Err(ResizeRejected {
            width: target_width,
            height: new_height,
            required_bytes,
            max_bytes: max_buffer_bytes,
        });
    }

    Ok(ResizePlan::Scale {
        width: target_width,
        height: new_height,
    })
}

/// Shrink `img` to `target_width` per [`plan_resize`], using
/// nearest-neighbor sampling. Pass-through returns the image unchanged.
pub fn shrink_to_width(
    img: DynamicImage,
    target_width: u32,
    max_buffer_bytes: u64,
) -> Result<DynamicImage, ResizeRejected> {
    match plan_resize(img.width(), img.height(), target_width, max_buffer_bytes)? {
        ResizePlan::PassThrough => Ok(img),
        ResizePlan::Scale { width, height } => {
            let resized = image::imageops::resize(&img, width, height, FilterType::Nearest);
            Ok(DynamicImage::ImageRgba8(resized))
        }
    }
}
