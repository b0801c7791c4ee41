//! Raster operations on fetched page and region images, pure Rust.
//!
//! | Operation | Crate / function |
//! |---|---|
//! | **Decode** (JPEG, PNG, TIFF, WebP) | `image::load_from_memory` |
//! | **Crop** | `DynamicImage::crop_imm` |
//! | **Encode → JPEG** | `image::codecs::jpeg::JpegEncoder` |
//!
//! The module is split into:
//! - **Parameters**: [`Quality`] and [`CropParams`], describing *what* to produce
//! - **Operations**: decode / crop / encode functions over in-memory bytes
//!
//! Nothing here touches the network or the filesystem; the fetch executor
//! hands bytes in and gets bytes out.

pub mod operations;
mod params;

pub use operations::{ImagingError, RasterImage, crop_and_encode, decode, encode_jpeg};
pub use params::{CropParams, Quality};
