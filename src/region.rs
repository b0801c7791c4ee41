//! Region descriptors: parsing IIIF region URLs and template boxes.
//!
//! Two annotation styles produce regions:
//!
//! - **Direct regions** come from IIIF Image API URLs that already name the
//!   exact pixel rectangle:
//!
//!   ```text
//!   https://host/iiif/MS73/page007/120,340,60,80/64,/0/default.jpg
//!   └──────── base_url ────────┘ └─ region ──┘ └─ size/rotation/quality ─┘
//!                     │     │
//!            manuscript     page_id
//!   ```
//!
//! - **Template regions** come from symbolic encodings whose boxes have a
//!   fixed template size. They must be corrected (see
//!   [`correction`](crate::correction)) before cropping.
//!
//! The two are a tagged [`Region`], so "needs correction" is a match arm rather
//! than a flag. Everything here is pure.

use crate::types::TemplateBox;
use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;

/// A path segment holding exactly four comma-separated integers.
static REGION_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+),(\d+),(\d+),(\d+)$").expect("valid region regex"));

const UNKNOWN: &str = "unknown";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedRegionError {
    #[error("no x,y,width,height region segment in {0}")]
    MissingRegion(String),
    #[error("region segment has no page segment before it in {0}")]
    MissingPage(String),
    #[error("region coordinate out of range in {0}")]
    Overflow(String),
    #[error("empty region {width}x{height} in {source_ref}")]
    Empty {
        width: u32,
        height: u32,
        source_ref: String,
    },
    #[error("template box has no image URL")]
    MissingImage,
}

/// Normalized pixel rectangle plus provenance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionDescriptor {
    /// Image reference without the region segment (IIIF) or the full image URL (template).
    pub base_url: String,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub page_id: String,
    pub manuscript: String,
}

impl RegionDescriptor {
    /// IIIF region token `x,y,w,h`.
    pub fn region_token(&self) -> String {
        format!("{},{},{},{}", self.x, self.y, self.width, self.height)
    }
}

/// A region descriptor tagged with how its geometry was obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Region {
    /// True-extent rectangle from a region-serving endpoint.
    Direct(RegionDescriptor),
    /// Template-sized rectangle on a full page image.
    Template {
        descriptor: RegionDescriptor,
        /// Known page size `(width, height)`, if the exporter supplied it.
        page_extent: Option<(u32, u32)>,
    },
}

impl Region {
    pub fn descriptor(&self) -> &RegionDescriptor {
        match self {
            Region::Direct(d) => d,
            Region::Template { descriptor, .. } => descriptor,
        }
    }
}

/// Parse a IIIF region URL into a direct region.
///
/// The region token is the first path segment made of four integers. The page
/// is the segment just before it (file extension dropped), the manuscript the
/// one before that.
pub fn resolve_iiif_url(url: &str) -> Result<RegionDescriptor, MalformedRegionError> {
    let trimmed = url.trim();
    let without_query = trimmed.split(['?', '#']).next().unwrap_or(trimmed);
    let (scheme, path) = match without_query.split_once("://") {
        Some((scheme, rest)) => (Some(scheme), rest),
        None => (None, without_query),
    };
    let segments: Vec<&str> = path.split('/').collect();

    let (region_pos, caps) = segments
        .iter()
        .enumerate()
        // Segment 0 is the host when a scheme is present.
        .skip(usize::from(scheme.is_some()))
        .find_map(|(i, seg)| REGION_TOKEN.captures(seg).map(|c| (i, c)))
        .ok_or_else(|| MalformedRegionError::MissingRegion(url.to_string()))?;

    let mut numbers = [0u32; 4];
    for (slot, group) in numbers.iter_mut().zip(1..=4usize) {
        *slot = caps[group]
            .parse()
            .map_err(|_| MalformedRegionError::Overflow(url.to_string()))?;
    }
    let [x, y, width, height] = numbers;
    if width == 0 || height == 0 {
        return Err(MalformedRegionError::Empty {
            width,
            height,
            source_ref: url.to_string(),
        });
    }

    let first_path = usize::from(scheme.is_some());
    if region_pos <= first_path {
        return Err(MalformedRegionError::MissingPage(url.to_string()));
    }
    let page_segment = segments[region_pos - 1];
    if page_segment.is_empty() {
        return Err(MalformedRegionError::MissingPage(url.to_string()));
    }
    let manuscript = if region_pos >= first_path + 2 {
        segments[region_pos - 2]
    } else {
        UNKNOWN
    };

    let base_path = segments[..region_pos].join("/");
    let base_url = match scheme {
        Some(scheme) => format!("{scheme}://{base_path}"),
        None => base_path,
    };

    Ok(RegionDescriptor {
        base_url,
        x,
        y,
        width,
        height,
        page_id: strip_extension(page_segment).to_string(),
        manuscript: non_empty_or_unknown(manuscript),
    })
}

/// Turn a template box into a template region. No string parsing of geometry.
pub fn resolve_template(b: &TemplateBox) -> Result<Region, MalformedRegionError> {
    let image = b.image.trim();
    if image.is_empty() {
        return Err(MalformedRegionError::MissingImage);
    }
    if b.width == 0 || b.height == 0 {
        return Err(MalformedRegionError::Empty {
            width: b.width,
            height: b.height,
            source_ref: image.to_string(),
        });
    }

    let page_id = b
        .page
        .as_deref()
        .filter(|p| !p.trim().is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| page_from_image_url(image));
    let manuscript = b
        .manuscript
        .as_deref()
        .filter(|m| !m.trim().is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| manuscript_from_image_url(image));
    let page_extent = match (b.page_width, b.page_height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => Some((w, h)),
        _ => None,
    };

    Ok(Region::Template {
        descriptor: RegionDescriptor {
            base_url: image.to_string(),
            x: b.x,
            y: b.y,
            width: b.width,
            height: b.height,
            page_id,
            manuscript,
        },
        page_extent,
    })
}

/// Build the IIIF request URL for a descriptor's rectangle at the given size token.
pub fn create_region_url(descriptor: &RegionDescriptor, size: &str) -> String {
    format!(
        "{}/{}/{}/0/default.jpg",
        descriptor.base_url.trim_end_matches('/'),
        descriptor.region_token(),
        size
    )
}

/// Build the IIIF URL for the whole page at maximum size.
pub fn full_image_url(base_url: &str) -> String {
    format!("{}/full/max/0/default.jpg", base_url.trim_end_matches('/'))
}

/// URL to fetch for a template region's page.
///
/// A template's image is either a direct image file (fetched as-is) or a IIIF
/// image base such as `…/csg-0390_007.jp2`, which is expanded to a full-size
/// request.
pub fn page_image_url(descriptor: &RegionDescriptor) -> String {
    const DIRECT_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "tif", "tiff", "webp", "gif"];
    let url = descriptor.base_url.as_str();
    let last = path_segments(url).last().copied().unwrap_or_default();
    let is_direct = last
        .rsplit_once('.')
        .is_some_and(|(_, ext)| DIRECT_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()));
    if is_direct {
        url.to_string()
    } else {
        full_image_url(url)
    }
}

fn path_segments(url: &str) -> Vec<&str> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let path = path.split_once("://").map(|(_, rest)| rest).unwrap_or(path);
    // Drop the host.
    path.split('/').skip(1).filter(|s| !s.is_empty()).collect()
}

/// Page identifier for a full-image URL.
///
/// For IIIF full-image requests (`…/{page}/full/max/0/default.jpg`) this is the
/// segment before `full`; otherwise the last segment's stem.
fn page_from_image_url(url: &str) -> String {
    let segments = path_segments(url);
    let page = match segments.iter().position(|s| *s == "full") {
        Some(pos) if pos > 0 => segments[pos - 1],
        _ => segments.last().copied().unwrap_or(UNKNOWN),
    };
    non_empty_or_unknown(strip_extension(page))
}

fn manuscript_from_image_url(url: &str) -> String {
    let segments = path_segments(url);
    let page_pos = match segments.iter().position(|s| *s == "full") {
        Some(pos) if pos > 0 => pos - 1,
        _ => segments.len().saturating_sub(1),
    };
    match page_pos.checked_sub(1) {
        Some(i) => non_empty_or_unknown(segments[i]),
        None => UNKNOWN.to_string(),
    }
}

fn strip_extension(segment: &str) -> &str {
    match segment.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty() && !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            stem
        }
        _ => segment,
    }
}

fn non_empty_or_unknown(s: &str) -> String {
    if s.is_empty() {
        UNKNOWN.to_string()
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPEC_URL: &str =
        "https://example.org/iiif/MS73/page007/120,340,60,80/64,/0/default.jpg";
    const ECODICES_URL: &str = "http://www.e-codices.unifr.ch/loris/csg/csg-0390/csg-0390_007.jp2/1425,1005,67,76/64,/0/default.jpg";

    fn template(image: &str) -> TemplateBox {
        TemplateBox {
            image: image.into(),
            x: 100,
            y: 100,
            width: 50,
            height: 50,
            page: None,
            manuscript: None,
            page_width: None,
            page_height: None,
        }
    }

    // =========================================================================
    // IIIF URLs
    // =========================================================================

    #[test]
    fn resolves_geometry_and_page() {
        let d = resolve_iiif_url(SPEC_URL).unwrap();
        assert_eq!((d.x, d.y, d.width, d.height), (120, 340, 60, 80));
        assert_eq!(d.page_id, "page007");
        assert_eq!(d.manuscript, "MS73");
        assert_eq!(d.base_url, "https://example.org/iiif/MS73/page007");
    }

    #[test]
    fn strips_image_extension_from_page() {
        let d = resolve_iiif_url(ECODICES_URL).unwrap();
        assert_eq!(d.page_id, "csg-0390_007");
        assert_eq!(d.manuscript, "csg-0390");
        assert_eq!(
            d.base_url,
            "http://www.e-codices.unifr.ch/loris/csg/csg-0390/csg-0390_007.jp2"
        );
        assert_eq!((d.x, d.y, d.width, d.height), (1425, 1005, 67, 76));
    }

    #[test]
    fn region_url_round_trips() {
        for url in [SPEC_URL, ECODICES_URL] {
            let d = resolve_iiif_url(url).unwrap();
            assert_eq!(create_region_url(&d, "64,"), url);
            assert_eq!(resolve_iiif_url(&create_region_url(&d, "full")).unwrap(), d);
        }
    }

    #[test]
    fn missing_region_token_is_malformed() {
        let err = resolve_iiif_url("https://example.org/iiif/MS73/page007/full/max/0/default.jpg")
            .unwrap_err();
        assert!(matches!(err, MalformedRegionError::MissingRegion(_)));
    }

    #[test]
    fn three_integers_is_malformed() {
        assert!(resolve_iiif_url("https://example.org/iiif/MS73/p1/1,2,3/64,/0/default.jpg").is_err());
    }

    #[test]
    fn zero_width_is_malformed() {
        let err = resolve_iiif_url("https://example.org/iiif/MS73/p1/10,10,0,5/64,/0/default.jpg")
            .unwrap_err();
        assert!(matches!(err, MalformedRegionError::Empty { width: 0, .. }));
    }

    #[test]
    fn region_directly_after_host_has_no_page() {
        let err = resolve_iiif_url("https://example.org/1,2,3,4/full/0/default.jpg").unwrap_err();
        assert!(matches!(err, MalformedRegionError::MissingPage(_)));
    }

    #[test]
    fn numeric_host_is_not_a_region() {
        // "1,2,3,4" as host must not match; no other region segment exists.
        assert!(resolve_iiif_url("https://1,2,3,4/a/b").is_err());
    }

    #[test]
    fn huge_coordinate_overflows() {
        let err = resolve_iiif_url("https://h/m/p/99999999999,1,2,3/64,/0/default.jpg").unwrap_err();
        assert!(matches!(err, MalformedRegionError::Overflow(_)));
    }

    #[test]
    fn query_string_is_ignored() {
        let d = resolve_iiif_url(&format!("{SPEC_URL}?token=abc")).unwrap();
        assert_eq!(d.width, 60);
    }

    #[test]
    fn manuscript_unknown_when_page_is_first_segment() {
        let d = resolve_iiif_url("https://h/page1/1,2,3,4/64,/0/default.jpg").unwrap();
        assert_eq!(d.page_id, "page1");
        assert_eq!(d.manuscript, "unknown");
    }

    #[test]
    fn full_image_url_from_base() {
        let d = resolve_iiif_url(SPEC_URL).unwrap();
        assert_eq!(
            full_image_url(&d.base_url),
            "https://example.org/iiif/MS73/page007/full/max/0/default.jpg"
        );
    }

    // =========================================================================
    // Template boxes
    // =========================================================================

    #[test]
    fn template_page_from_iiif_full_url() {
        let region =
            resolve_template(&template("https://h/iiif/MS73/MS73_154/full/max/0/default.jpg")).unwrap();
        let d = region.descriptor();
        assert_eq!(d.page_id, "MS73_154");
        assert_eq!(d.manuscript, "MS73");
        assert!(matches!(region, Region::Template { page_extent: None, .. }));
    }

    #[test]
    fn template_page_from_plain_image_url() {
        let region = resolve_template(&template("https://h/images/MS73_154.jpg")).unwrap();
        assert_eq!(region.descriptor().page_id, "MS73_154");
        assert_eq!(region.descriptor().manuscript, "images");
        assert_eq!(region.descriptor().base_url, "https://h/images/MS73_154.jpg");
    }

    #[test]
    fn page_image_url_keeps_direct_files() {
        let region = resolve_template(&template("https://h/images/MS73_154.jpg")).unwrap();
        assert_eq!(
            page_image_url(region.descriptor()),
            "https://h/images/MS73_154.jpg"
        );

        let region =
            resolve_template(&template("https://h/iiif/MS73/MS73_154/full/max/0/default.jpg")).unwrap();
        assert_eq!(
            page_image_url(region.descriptor()),
            "https://h/iiif/MS73/MS73_154/full/max/0/default.jpg"
        );
    }

    #[test]
    fn page_image_url_expands_iiif_base() {
        let region = resolve_template(&template(
            "http://www.e-codices.unifr.ch/loris/csg/csg-0390/csg-0390_007.jp2",
        ))
        .unwrap();
        assert_eq!(region.descriptor().page_id, "csg-0390_007");
        assert_eq!(
            page_image_url(region.descriptor()),
            "http://www.e-codices.unifr.ch/loris/csg/csg-0390/csg-0390_007.jp2/full/max/0/default.jpg"
        );
    }

    #[test]
    fn template_explicit_fields_win() {
        let mut b = template("https://h/images/x.jpg");
        b.page = Some("154r".into());
        b.manuscript = Some("CDN-Mlr MS 73".into());
        b.page_width = Some(2000);
        b.page_height = Some(3000);
        let region = resolve_template(&b).unwrap();
        assert_eq!(region.descriptor().page_id, "154r");
        assert_eq!(region.descriptor().manuscript, "CDN-Mlr MS 73");
        assert!(matches!(
            region,
            Region::Template {
                page_extent: Some((2000, 3000)),
                ..
            }
        ));
    }

    #[test]
    fn template_without_image_is_malformed() {
        assert_eq!(
            resolve_template(&template("  ")).unwrap_err(),
            MalformedRegionError::MissingImage
        );
    }

    #[test]
    fn template_zero_height_is_malformed() {
        let mut b = template("https://h/p.jpg");
        b.height = 0;
        assert!(resolve_template(&b).is_err());
    }
}
