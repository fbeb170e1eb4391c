//! Image optimisation: shrink oversized raster images to fit a bounding box.
//!
//! The resolver only sees the [`ImageTransform`] trait, so tests can inject a
//! transform that fails on purpose. [`RasterTransform`] is the real one,
//! backed by the `image` crate.

use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;
use tracing::debug;

/// Error type for transform failures. Always non-fatal to the caller.
pub type TransformError = Box<dyn std::error::Error + Send + Sync>;

/// What a transform did to one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformOutcome {
    /// Already within bounds, or a format the transform does not handle.
    Unchanged,
    /// Re-encoded bytes, same format as the input.
    Resized(Vec<u8>),
}

/// Fits image bytes within `max_width × max_height`, keeping aspect ratio.
pub trait ImageTransform: Send + Sync {
    fn fit_within(
        &self,
        bytes: &[u8],
        content_type: &str,
        max_width: u32,
        max_height: u32,
    ) -> Result<TransformOutcome, TransformError>;
}

/// [`ImageTransform`] for PNG, JPEG, GIF, WebP and BMP.
#[derive(Debug, Clone, Copy, Default)]
pub struct RasterTransform;

impl ImageTransform for RasterTransform {
    fn fit_within(
        &self,
        bytes: &[u8],
        content_type: &str,
        max_width: u32,
        max_height: u32,
    ) -> Result<TransformOutcome, TransformError> {
        let Some(format) = raster_format(content_type) else {
            return Ok(TransformOutcome::Unchanged);
        };

        let img = image::load_from_memory_with_format(bytes, format)?;
        if img.width() <= max_width && img.height() <= max_height {
            return Ok(TransformOutcome::Unchanged);
        }

        let resized = img.resize(max_width, max_height, FilterType::Lanczos3);
        debug!(
            "Resized {}x{} → {}x{} ({content_type})",
            img.width(),
            img.height(),
            resized.width(),
            resized.height()
        );

        // The JPEG encoder rejects alpha channels.
        let resized = match format {
            ImageFormat::Jpeg => DynamicImage::ImageRgb8(resized.to_rgb8()),
            _ => resized,
        };

        let mut buf = Vec::new();
        resized.write_to(&mut Cursor::new(&mut buf), format)?;
        Ok(TransformOutcome::Resized(buf))
    }
}

fn raster_format(content_type: &str) -> Option<ImageFormat> {
    match content_type.trim().to_ascii_lowercase().as_str() {
        "image/png" => Some(ImageFormat::Png),
        "image/jpeg" | "image/jpg" => Some(ImageFormat::Jpeg),
        "image/gif" => Some(ImageFormat::Gif),
        "image/webp" => Some(ImageFormat::WebP),
        "image/bmp" => Some(ImageFormat::Bmp),
        _ => None,
    }
}
