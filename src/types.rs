//! Shared data model for annotation input.
//!
//! These types are what survives the VALIDATING boundary: the loosely-typed
//! JSON exported by the annotation viewer is checked in
//! [`annotations`](crate::annotations) and converted into these closed types.
//! Nothing downstream ever sees raw JSON.

use serde::{Deserialize, Serialize};

/// Optional provenance attached to an annotation batch by the viewer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMetadata {
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "dateAdded")]
    pub date_added: Option<String>,
}

/// A fixed-template bounding box emitted by a symbolic encoding (e.g. MEI).
///
/// The rectangle is the template's size, not the glyph's true extent, so it
/// always goes through the scale corrector before cropping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateBox {
    /// Exact URL of the full page image the box refers to.
    pub image: String,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manuscript: Option<String>,
    /// Page extent, when the exporter knows it. Enables clipping before fetch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_height: Option<u32>,
}

/// One entry of a record's `urls` list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RegionSource {
    /// IIIF image API URL naming the exact pixel rectangle.
    Url(String),
    /// Template bounding box with explicit integer fields.
    Template(TemplateBox),
}

impl RegionSource {
    /// Stable identity used for duplicate detection and the ledger's source column.
    pub fn source_key(&self) -> String {
        match self {
            RegionSource::Url(url) => url.clone(),
            RegionSource::Template(b) => {
                format!("{}#xywh={},{},{},{}", b.image, b.x, b.y, b.width, b.height)
            }
        }
    }
}

/// A validated annotation record: non-empty class and at least one region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationRecord {
    pub class: String,
    pub sources: Vec<RegionSource>,
    pub metadata: Option<RecordMetadata>,
}

/// A class with its merged, de-duplicated list of regions.
///
/// The position of a source in `sources` is its sequence index, which feeds
/// the output filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassBatch {
    pub class: String,
    pub sources: Vec<RegionSource>,
    pub metadata: Vec<RecordMetadata>,
}
