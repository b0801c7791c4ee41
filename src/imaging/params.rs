//! Parameter types for raster operations.
//!
//! - [`Quality`]: JPEG encoding quality (1–100, default 90). Clamped on construction.
//! - [`CropParams`]: the rectangle to cut and the quality to store it at.

use crate::correction::PixelRect;

/// Quality setting for lossy image encoding (1-100).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quality(pub u32);

impl Quality {
    pub fn new(value: u32) -> Self {
        Self(value.clamp(1, 100))
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

impl Default for Quality {
    fn default() -> Self {
        Self(90)
    }
}

/// What to cut out of a decoded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropParams {
    /// `None` keeps the whole image (direct region responses are already cropped).
    pub rect: Option<PixelRect>,
    pub quality: Quality,
}
