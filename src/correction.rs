//! Scale correction for template bounding boxes.
//!
//! Symbolic encodings emit every glyph's box at the same template size. That
//! undersizes large multi-component symbols (ligatures spanning several notes)
//! and oversizes small ones. The correction expands each box per axis around
//! its center, then clips it to the page:
//!
//! ```text
//! w' = w · width_scale            x' = cx − w'/2
//! h' = h · height_scale           y' = cy − h'/2
//! ```
//!
//! where `(cx, cy)` is the box center (or the box origin itself under
//! [`TemplateAnchor::Center`]). This is a heuristic, not segmentation: some
//! crops keep neighbouring ink, some lose a stroke.
//!
//! Clipping is a separate step ([`clip_to_extent`]) because the page extent
//! is often unknown until the page image has been fetched; the fetch executor
//! applies the same policy again against the decoded image.

use crate::config::{ClipPolicy, ScaleConfig, TemplateAnchor};
use crate::region::RegionDescriptor;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GeometryError {
    #[error("region {x},{y},{width},{height} lies entirely outside the {extent_w}x{extent_h} image")]
    OutsideImage {
        x: i64,
        y: i64,
        width: i64,
        height: i64,
        extent_w: u32,
        extent_h: u32,
    },
    #[error("region {x},{y},{width},{height} has no area")]
    Empty {
        x: i64,
        y: i64,
        width: i64,
        height: i64,
    },
}

/// Rectangle in signed pixel space; may extend past the page before clipping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: i64,
    pub y: i64,
    pub width: i64,
    pub height: i64,
}

impl Rect {
    pub fn from_descriptor(d: &RegionDescriptor) -> Self {
        Self {
            x: i64::from(d.x),
            y: i64::from(d.y),
            width: i64::from(d.width),
            height: i64::from(d.height),
        }
    }

    /// Center point `(cx, cy)`.
    pub fn center(&self) -> (f64, f64) {
        (
            self.x as f64 + self.width as f64 / 2.0,
            self.y as f64 + self.height as f64 / 2.0,
        )
    }
}

/// Clipped rectangle, guaranteed non-empty and non-negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Expand a template rectangle per [`ScaleConfig`], keeping its center. No clipping.
pub fn scale_rect(rect: Rect, scale: &ScaleConfig) -> Rect {
    let (cx, cy) = match scale.anchor {
        TemplateAnchor::Corner => rect.center(),
        TemplateAnchor::Center => (rect.x as f64, rect.y as f64),
    };
    let pad = i64::from(scale.padding);
    // Float-to-int casts saturate; the additions must too.
    let width = ((rect.width as f64 * scale.width_scale).round() as i64)
        .max(i64::from(scale.min_width))
        .saturating_add(2 * pad);
    let height = ((rect.height as f64 * scale.height_scale).round() as i64)
        .max(i64::from(scale.min_height))
        .saturating_add(2 * pad);

    Rect {
        x: (cx - width as f64 / 2.0).round() as i64,
        y: (cy - height as f64 / 2.0).round() as i64,
        width,
        height,
    }
}

/// Clip one axis `[start, start + len)` to `[0, limit)`.
fn clip_axis(start: i64, len: i64, limit: Option<i64>, policy: ClipPolicy) -> (i64, i64) {
    let mut start = start;
    if policy == ClipPolicy::Shift {
        if start < 0 {
            start = 0;
        }
        if let Some(limit) = limit
            && start.saturating_add(len) > limit
        {
            start = (limit - len).max(0);
        }
    }
    let lo = start.max(0);
    let end = start.saturating_add(len);
    let hi = match limit {
        Some(limit) => end.min(limit),
        None => end,
    };
    (lo, hi - lo)
}

/// Bring a rectangle inside `[0, 0, extent)` according to `policy`.
///
/// With no extent only the origin is clamped to zero. Fails when nothing of
/// the rectangle remains.
pub fn clip_to_extent(
    rect: Rect,
    extent: Option<(u32, u32)>,
    policy: ClipPolicy,
) -> Result<PixelRect, GeometryError> {
    if rect.width <= 0 || rect.height <= 0 {
        return Err(GeometryError::Empty {
            x: rect.x,
            y: rect.y,
            width: rect.width,
            height: rect.height,
        });
    }
    let (limit_w, limit_h) = match extent {
        Some((w, h)) => (Some(i64::from(w)), Some(i64::from(h))),
        None => (None, None),
    };
    let (x, width) = clip_axis(rect.x, rect.width, limit_w, policy);
    let (y, height) = clip_axis(rect.y, rect.height, limit_h, policy);

    if width <= 0 || height <= 0 {
        let (extent_w, extent_h) = extent.unwrap_or((0, 0));
        return Err(GeometryError::OutsideImage {
            x: rect.x,
            y: rect.y,
            width: rect.width,
            height: rect.height,
            extent_w,
            extent_h,
        });
    }

    let to_u32 = |v: i64| u32::try_from(v).unwrap_or(u32::MAX);
    Ok(PixelRect {
        x: to_u32(x),
        y: to_u32(y),
        width: to_u32(width),
        height: to_u32(height),
    })
}

/// Correct a template-sourced descriptor: scale around its center, then clip.
///
/// `extent` is the page size when known up front.
pub fn correct(
    descriptor: &RegionDescriptor,
    scale: &ScaleConfig,
    extent: Option<(u32, u32)>,
) -> Result<RegionDescriptor, GeometryError> {
    let scaled = scale_rect(Rect::from_descriptor(descriptor), scale);
    let clipped = clip_to_extent(scaled, extent, scale.clip)?;
    Ok(RegionDescriptor {
        x: clipped.x,
        y: clipped.y,
        width: clipped.width,
        height: clipped.height,
        ..descriptor.clone()
    })
}
