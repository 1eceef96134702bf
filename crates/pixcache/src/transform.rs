//! Pre-cache image transforms and the image cost function.

use std::fmt;
use std::io::Cursor;
use std::sync::Arc;

use bytes::Bytes;
use image::{ImageFormat, ImageReader};

use crate::error::{FetchError, Result};

/// A transform applied to downloaded bytes before they are cached.
///
/// Runs on the blocking pool, so implementations may do CPU-heavy work.
pub trait ImageTransform: Send + Sync + fmt::Debug {
    fn apply(&self, data: Bytes) -> Result<Bytes>;
}

/// Center crop to `width x height` (clamped to the source), re-encoded as PNG.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropTransform {
    pub width: u32,
    pub height: u32,
}

impl CropTransform {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl ImageTransform for CropTransform {
    fn apply(&self, data: Bytes) -> Result<Bytes> {
        if self.width == 0 || self.height == 0 {
            return Ok(data);
        }

        let img = image::load_from_memory(&data)
            .map_err(|e| FetchError::Transform(format!("decode failed: {e}")))?;

        let width = self.width.min(img.width());
        let height = self.height.min(img.height());
        let x = (img.width() - width) / 2;
        let y = (img.height() - height) / 2;
        let cropped = img.crop_imm(x, y, width, height);

        let mut buffer = Vec::new();
        cropped
            .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
            .map_err(|e| FetchError::Transform(format!("encode failed: {e}")))?;
        Ok(Bytes::from(buffer))
    }
}

/// Memory-tier cost of an image: decoded pixel area read from the header, or the
/// byte length when the format is not recognized.
pub fn image_cost(data: &Bytes) -> u64 {
    ImageReader::new(Cursor::new(data.as_ref()))
        .with_guessed_format()
        .ok()
        .and_then(|reader| reader.into_dimensions().ok())
        .map(|(w, h)| u64::from(w) * u64::from(h))
        .unwrap_or(data.len() as u64)
}

/// Shared handle to a transform.
pub type SharedTransform = Arc<dyn ImageTransform>;
