//! MEI facsimile import.
//!
//! Square-notation MEI encodes each neume component as an `<nc>` whose `facs`
//! attribute points at a `<zone>` in the `<facsimile>` section:
//!
//! ```xml
//! <zone xml:id="z12" ulx="410" uly="822" lrx="450" lry="862"/>
//! …
//! <nc facs="#z12" pname="g" oct="3" tilt="n"/>
//! ```
//!
//! Zones are emitted at the encoder's template size, so every component
//! becomes a [`TemplateBox`] on the page image and goes through scale
//! correction like any other template region. The class label is
//! `nc_{pname}{oct}` with an optional `_{tilt}` suffix.

use crate::config::MeiInput;
use crate::types::{AnnotationRecord, RecordMetadata, RegionSource, TemplateBox};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, warn};

/// Extent given to a zone that collapsed to a line on one axis.
pub const DEGENERATE_ZONE_EXTENT: u32 = 40;

/// Class used when a component has no pitch.
pub const UNKNOWN_CLASS: &str = "nc_unknown";

#[derive(Error, Debug)]
pub enum MeiError {
    #[error("failed to read MEI file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed MEI in {path}: {source}")]
    Xml {
        path: PathBuf,
        #[source]
        source: quick_xml::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Zone {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
}

/// Records recovered from one MEI document.
#[derive(Debug, Clone, Default)]
pub struct MeiImport {
    /// One record per `<nc>` with a resolvable zone, in document order.
    pub records: Vec<AnnotationRecord>,
    pub zones: usize,
    /// Components whose `facs` named a zone that does not exist.
    pub unresolved: usize,
}

/// Read and parse the MEI file named by `input`.
pub fn load_mei(input: &MeiInput) -> Result<MeiImport, MeiError> {
    let xml = fs::read_to_string(&input.path).map_err(|source| MeiError::Io {
        path: input.path.clone(),
        source,
    })?;
    let source_label = input
        .path
        .file_name()
        .map(|n| format!("mei:{}", n.to_string_lossy()))
        .unwrap_or_else(|| "mei".to_string());
    parse_mei(&xml, &input.image_url, &source_label).map_err(|source| MeiError::Xml {
        path: input.path.clone(),
        source,
    })
}

/// Parse an MEI document into template-region records on `image_url`.
pub fn parse_mei(
    xml: &str,
    image_url: &str,
    source_label: &str,
) -> Result<MeiImport, quick_xml::Error> {
    let mut reader = Reader::from_str(xml);
    let mut buf = Vec::new();
    let mut zones: HashMap<String, Zone> = HashMap::new();
    // (class, zone id) in document order; resolved after the whole document
    // has been read so zone order does not matter.
    let mut components: Vec<(String, String)> = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) | Event::Empty(e) => match e.local_name().as_ref() {
                b"zone" => {
                    if let Some((id, zone)) = read_zone(&e)? {
                        zones.insert(id, zone);
                    }
                }
                b"nc" => {
                    if let Some(component) = read_component(&e)? {
                        components.push(component);
                    }
                }
                _ => (),
            },
            Event::Eof => break,
            _ => (),
        }
        buf.clear();
    }

    let metadata = RecordMetadata {
        source: Some(source_label.to_string()),
        description: None,
        date_added: None,
    };
    let mut import = MeiImport {
        zones: zones.len(),
        ..MeiImport::default()
    };
    for (class, zone_id) in components {
        let Some(zone) = zones.get(&zone_id) else {
            warn!("MEI component {class} references unknown zone {zone_id}");
            import.unresolved += 1;
            continue;
        };
        import.records.push(AnnotationRecord {
            class,
            sources: vec![RegionSource::Template(TemplateBox {
                image: image_url.to_string(),
                x: zone.x,
                y: zone.y,
                width: zone.width,
                height: zone.height,
                page: None,
                manuscript: None,
                page_width: None,
                page_height: None,
            })],
            metadata: Some(metadata.clone()),
        });
    }
    debug!(
        zones = import.zones,
        components = import.records.len(),
        unresolved = import.unresolved,
        "parsed MEI"
    );
    Ok(import)
}

/// Attribute values keyed by local name (`xml:id` → `id`).
fn attributes(e: &BytesStart<'_>) -> Result<HashMap<String, String>, quick_xml::Error> {
    let mut out = HashMap::new();
    for attr in e.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        let value = attr.unescape_value()?.into_owned();
        out.insert(key, value);
    }
    Ok(out)
}

fn coordinate(attrs: &HashMap<String, String>, key: &str) -> u32 {
    attrs
        .get(key)
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .map(|v| v.round().clamp(0.0, f64::from(u32::MAX)) as u32)
        .unwrap_or(0)
}

fn read_zone(e: &BytesStart<'_>) -> Result<Option<(String, Zone)>, quick_xml::Error> {
    let attrs = attributes(e)?;
    let Some(id) = attrs.get("id").filter(|id| !id.is_empty()) else {
        return Ok(None);
    };
    let (ulx, uly) = (coordinate(&attrs, "ulx"), coordinate(&attrs, "uly"));
    let (lrx, lry) = (coordinate(&attrs, "lrx"), coordinate(&attrs, "lry"));

    let extent = |lo: u32, hi: u32| match hi.saturating_sub(lo) {
        0 => DEGENERATE_ZONE_EXTENT,
        n => n,
    };
    Ok(Some((
        id.clone(),
        Zone {
            x: ulx.min(lrx),
            y: uly.min(lry),
            width: extent(ulx.min(lrx), ulx.max(lrx)),
            height: extent(uly.min(lry), uly.max(lry)),
        },
    )))
}

fn read_component(e: &BytesStart<'_>) -> Result<Option<(String, String)>, quick_xml::Error> {
    let attrs = attributes(e)?;
    let Some(zone_id) = attrs
        .get("facs")
        .map(|f| f.trim().trim_start_matches('#'))
        .filter(|f| !f.is_empty())
    else {
        return Ok(None);
    };
    Ok(Some((component_class(&attrs), zone_id.to_string())))
}

fn component_class(attrs: &HashMap<String, String>) -> String {
    let get = |key: &str| attrs.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());
    match (get("pname"), get("oct")) {
        (Some(pname), Some(oct)) => match get("tilt") {
            Some(tilt) => format!("nc_{pname}{oct}_{tilt}"),
            None => format!("nc_{pname}{oct}"),
        },
        _ => UNKNOWN_CLASS.to_string(),
    }
}
