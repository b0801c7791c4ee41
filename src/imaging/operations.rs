//! Decode, crop, and encode operations.
//!
//! Output is always baseline JPEG: the training corpus does not need alpha,
//! and IIIF servers deliver JPEG anyway.

use super::params::{CropParams, Quality};
use image::DynamicImage;
use image::codecs::jpeg::JpegEncoder;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImagingError {
    #[error("failed to decode image: {0}")]
    Decode(#[source] image::ImageError),
    #[error("failed to encode JPEG: {0}")]
    Encode(#[source] image::ImageError),
}

/// Encoded crop ready to be written to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RasterImage {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Decode any compiled-in format from memory.
pub fn decode(bytes: &[u8]) -> Result<DynamicImage, ImagingError> {
    image::load_from_memory(bytes).map_err(ImagingError::Decode)
}

/// Encode as RGB JPEG at the given quality.
pub fn encode_jpeg(img: &DynamicImage, quality: Quality) -> Result<Vec<u8>, ImagingError> {
    let mut buf = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut buf, quality.value() as u8);
    DynamicImage::from(img.to_rgb8())
        .write_with_encoder(encoder)
        .map_err(ImagingError::Encode)?;
    Ok(buf)
}

/// Cut `params.rect` out of `img` (or keep it whole) and encode the result.
///
/// The rectangle must already be clipped to the image; see
/// [`clip_to_extent`](crate::correction::clip_to_extent).
pub fn crop_and_encode(img: &DynamicImage, params: &CropParams) -> Result<RasterImage, ImagingError> {
    let cropped = match params.rect {
        Some(r) => img.crop_imm(r.x, r.y, r.width, r.height),
        None => img.clone(),
    };
    let bytes = encode_jpeg(&cropped, params.quality)?;
    Ok(RasterImage {
        bytes,
        width: cropped.width(),
        height: cropped.height(),
    })
}
