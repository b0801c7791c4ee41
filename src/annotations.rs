//! Annotation loading and validation.
//!
//! The viewer exports a JSON array of loosely-typed records:
//!
//! ```json
//! [
//!   {"type": "Virga", "urls": ["https://…/120,340,60,80/64,/0/default.jpg"],
//!    "metadata": {"source": "viewer", "dateAdded": "2024-03-01"}},
//!   {"class": "Pes", "urls": [{"image": "https://…/f154.jpg", "x": 10, "y": 20, "width": 40, "height": 40}]}
//! ]
//! ```
//!
//! Only a malformed top level is fatal ([`LoadError`]). Individual records and
//! `urls` entries that do not fit the closed [`AnnotationRecord`] shape are
//! dropped with a [`RecordValidationError`] and the run carries on.
//!
//! Valid records are then merged per class ([`merge_by_class`]). The order of
//! sources inside a merged class is the input order, with repeats removed, and
//! that order is what assigns sequence indices downstream.

use crate::organize::{InvalidClassError, sanitize_class};
use crate::types::{AnnotationRecord, ClassBatch, RecordMetadata, RegionSource, TemplateBox};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("failed to read annotations {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("annotations {path} are not valid JSON: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("annotations {path} must be a JSON array of records, found {found}")]
    NotAnArray { path: PathBuf, found: &'static str },
}

/// Why a record (or one of its entries) was dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordValidationError {
    #[error("record #{index} is not an object")]
    NotAnObject { index: usize },
    #[error("record #{index} has no class")]
    MissingClass { index: usize },
    #[error("record #{index} has an unusable class: {reason}")]
    InvalidClass {
        index: usize,
        reason: InvalidClassError,
    },
    #[error("record #{index} ({class}) has no urls")]
    MissingUrls { index: usize, class: String },
    #[error("record #{index} ({class}) urls is not a list")]
    UrlsNotAList { index: usize, class: String },
    #[error("record #{index} ({class}) has an empty urls list")]
    EmptyUrls { index: usize, class: String },
    #[error("record #{index} ({class}) entry #{entry}: {reason}")]
    InvalidEntry {
        index: usize,
        class: String,
        entry: usize,
        reason: String,
    },
    #[error("record #{index} ({class}) has no usable urls entries")]
    NoUsableEntries { index: usize, class: String },
}

impl RecordValidationError {
    /// Whether the whole record was dropped, as opposed to a single entry.
    pub fn drops_record(&self) -> bool {
        !matches!(self, RecordValidationError::InvalidEntry { .. })
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Read the annotation file and check that its top level is an array.
pub fn load_annotations(path: &Path) -> Result<Vec<Value>, LoadError> {
    let content = fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_annotations(&content).map_err(|e| match e {
        ParseFailure::Json(source) => LoadError::Json {
            path: path.to_path_buf(),
            source,
        },
        ParseFailure::NotAnArray(found) => LoadError::NotAnArray {
            path: path.to_path_buf(),
            found,
        },
    })
}

enum ParseFailure {
    Json(serde_json::Error),
    NotAnArray(&'static str),
}

fn parse_annotations(content: &str) -> Result<Vec<Value>, ParseFailure> {
    match serde_json::from_str::<Value>(content).map_err(ParseFailure::Json)? {
        Value::Array(items) => Ok(items),
        other => Err(ParseFailure::NotAnArray(json_kind(&other))),
    }
}

/// Result of the VALIDATING stage.
#[derive(Debug, Clone, Default)]
pub struct Validation {
    pub records: Vec<AnnotationRecord>,
    /// Dropped records and dropped entries, in input order.
    pub dropped: Vec<RecordValidationError>,
    /// Number of raw records seen.
    pub total: usize,
}

impl Validation {
    pub fn dropped_records(&self) -> usize {
        self.dropped.iter().filter(|e| e.drops_record()).count()
    }

    pub fn dropped_entries(&self) -> usize {
        self.dropped.len() - self.dropped_records()
    }
}

/// Convert raw JSON records into validated [`AnnotationRecord`]s.
///
/// Every drop is logged at warn level and collected for the run summary.
pub fn validate(values: Vec<Value>) -> Validation {
    let mut out = Validation {
        total: values.len(),
        ..Validation::default()
    };
    for (index, value) in values.into_iter().enumerate() {
        let mut entry_errors = Vec::new();
        match validate_record(index, value, &mut entry_errors) {
            Ok(record) => out.records.push(record),
            Err(err) => {
                warn!("dropping {err}");
                out.dropped.push(err);
            }
        }
        for err in entry_errors {
            warn!("dropping {err}");
            out.dropped.push(err);
        }
    }
    out
}

fn validate_record(
    index: usize,
    value: Value,
    entry_errors: &mut Vec<RecordValidationError>,
) -> Result<AnnotationRecord, RecordValidationError> {
    let Value::Object(mut map) = value else {
        return Err(RecordValidationError::NotAnObject { index });
    };

    let class = ["class", "type"]
        .iter()
        .find_map(|key| map.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .ok_or(RecordValidationError::MissingClass { index })?
        .to_string();
    sanitize_class(&class)
        .map_err(|reason| RecordValidationError::InvalidClass { index, reason })?;

    let urls = match map.remove("urls") {
        None | Some(Value::Null) => {
            return Err(RecordValidationError::MissingUrls { index, class });
        }
        Some(Value::Array(urls)) => urls,
        Some(_) => return Err(RecordValidationError::UrlsNotAList { index, class }),
    };
    if urls.is_empty() {
        return Err(RecordValidationError::EmptyUrls { index, class });
    }

    let mut sources = Vec::with_capacity(urls.len());
    for (entry, item) in urls.into_iter().enumerate() {
        match parse_entry(item) {
            Ok(source) => sources.push(source),
            Err(reason) => entry_errors.push(RecordValidationError::InvalidEntry {
                index,
                class: class.clone(),
                entry,
                reason,
            }),
        }
    }
    if sources.is_empty() {
        return Err(RecordValidationError::NoUsableEntries { index, class });
    }

    let metadata = match map.remove("metadata") {
        None | Some(Value::Null) => None,
        Some(raw) => match serde_json::from_value::<RecordMetadata>(raw) {
            Ok(m) => Some(m),
            Err(e) => {
                warn!("record #{index} ({class}): ignoring malformed metadata: {e}");
                None
            }
        },
    };

    Ok(AnnotationRecord {
        class,
        sources,
        metadata,
    })
}

fn parse_entry(item: Value) -> Result<RegionSource, String> {
    match item {
        Value::String(url) => {
            let url = url.trim();
            if url.is_empty() {
                Err("empty url".to_string())
            } else {
                Ok(RegionSource::Url(url.to_string()))
            }
        }
        Value::Object(_) => serde_json::from_value::<TemplateBox>(item)
            .map(RegionSource::Template)
            .map_err(|e| format!("invalid template box: {e}")),
        other => Err(format!("expected a url or a template box, found {}", json_kind(&other))),
    }
}

/// Result of merging records by class.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Merged {
    /// Classes in order of first appearance.
    pub batches: Vec<ClassBatch>,
    /// Sources dropped because the same class already listed them.
    pub duplicates: usize,
}

/// Merge records sharing a class string, dropping repeated sources.
pub fn merge_by_class(records: Vec<AnnotationRecord>) -> Merged {
    let mut merged = Merged::default();
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut seen: Vec<HashSet<String>> = Vec::new();

    for record in records {
        let pos = *positions.entry(record.class.clone()).or_insert_with(|| {
            merged.batches.push(ClassBatch {
                class: record.class.clone(),
                sources: Vec::new(),
                metadata: Vec::new(),
            });
            seen.push(HashSet::new());
            merged.batches.len() - 1
        });
        let batch = &mut merged.batches[pos];
        for source in record.sources {
            if seen[pos].insert(source.source_key()) {
                batch.sources.push(source);
            } else {
                merged.duplicates += 1;
            }
        }
        if let Some(metadata) = record.metadata {
            batch.metadata.push(metadata);
        }
    }
    merged
}

/// Keep only the batch whose class equals `filter`, when one is given.
pub fn filter_batches(batches: Vec<ClassBatch>, filter: Option<&str>) -> Vec<ClassBatch> {
    match filter {
        Some(class) => batches
            .into_iter()
            .filter(|b| b.class == class.trim())
            .collect(),
        None => batches,
    }
}

/// Per-class line of the analyze report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassSummary {
    pub class: String,
    pub entries: usize,
    /// Of which template boxes (need scale correction).
    pub template_entries: usize,
    /// Distinct `metadata.source` values seen for this class.
    pub sources: Vec<String>,
}

/// Counts reported by `--analyze-only`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Analysis {
    pub total_records: usize,
    pub valid_records: usize,
    /// Sorted by entry count (descending), then class name.
    pub classes: Vec<ClassSummary>,
    pub dropped: Vec<RecordValidationError>,
    pub duplicates: usize,
}

impl Analysis {
    pub fn total_entries(&self) -> usize {
        self.classes.iter().map(|c| c.entries).sum()
    }
}

/// Build the analyze report from the VALIDATING output and the merged classes.
pub fn analyze(validation: &Validation, merged: &Merged) -> Analysis {
    let mut classes: Vec<ClassSummary> = merged
        .batches
        .iter()
        .map(|batch| {
            let mut sources: Vec<String> = batch
                .metadata
                .iter()
                .filter_map(|m| m.source.clone())
                .collect();
            sources.sort();
            sources.dedup();
            ClassSummary {
                class: batch.class.clone(),
                entries: batch.sources.len(),
                template_entries: batch
                    .sources
                    .iter()
                    .filter(|s| matches!(s, RegionSource::Template(_)))
                    .count(),
                sources,
            }
        })
        .collect();
    classes.sort_by(|a, b| b.entries.cmp(&a.entries).then_with(|| a.class.cmp(&b.class)));

    Analysis {
        total_records: validation.total,
        valid_records: validation.records.len(),
        classes,
        dropped: validation.dropped.clone(),
        duplicates: merged.duplicates,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const U1: &str = "https://example.org/iiif/MS73/page007/120,340,60,80/64,/0/default.jpg";
    const U2: &str = "https://example.org/iiif/MS73/page007/500,200,60,80/64,/0/default.jpg";

    fn values(v: Value) -> Vec<Value> {
        match v {
            Value::Array(items) => items,
            _ => panic!("fixture must be an array"),
        }
    }

    // =========================================================================
    // Loading
    // =========================================================================

    #[test]
    fn top_level_object_is_load_error() {
        assert!(matches!(
            parse_annotations(r#"{"class": "Virga"}"#),
            Err(ParseFailure::NotAnArray("an object"))
        ));
    }

    #[test]
    fn invalid_json_is_load_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("a.json");
        fs::write(&path, "[{").unwrap();
        assert!(matches!(load_annotations(&path), Err(LoadError::Json { .. })));
    }

    #[test]
    fn missing_file_is_load_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        assert!(matches!(
            load_annotations(&tmp.path().join("missing.json")),
            Err(LoadError::Io { .. })
        ));
    }

    // =========================================================================
    // Validation
    // =========================================================================

    #[test]
    fn valid_record_passes() {
        let v = validate(values(json!([{"class": "Virga", "urls": [U1, U2]}])));
        assert_eq!(v.records.len(), 1);
        assert_eq!(v.records[0].sources.len(), 2);
        assert!(v.dropped.is_empty());
    }

    #[test]
    fn type_key_is_accepted_as_class() {
        let v = validate(values(json!([{"type": "Pes", "urls": [U1]}])));
        assert_eq!(v.records[0].class, "Pes");
    }

    #[test]
    fn malformed_records_dropped_not_fatal() {
        let v = validate(values(json!([
            "not a record",
            {"urls": [U1]},
            {"class": "  ", "urls": [U1]},
            {"class": "Virga"},
            {"class": "Virga", "urls": "nope"},
            {"class": "Virga", "urls": []},
            {"class": "../x", "urls": [U1]},
            {"class": "Clivis", "urls": [U1]},
        ])));
        assert_eq!(v.total, 8);
        assert_eq!(v.records.len(), 1);
        assert_eq!(v.records[0].class, "Clivis");
        assert_eq!(v.dropped_records(), 7);
        assert!(matches!(v.dropped[0], RecordValidationError::NotAnObject { index: 0 }));
        assert!(matches!(v.dropped[1], RecordValidationError::MissingClass { index: 1 }));
        assert!(matches!(v.dropped[2], RecordValidationError::MissingClass { index: 2 }));
        assert!(matches!(v.dropped[3], RecordValidationError::MissingUrls { .. }));
        assert!(matches!(v.dropped[4], RecordValidationError::UrlsNotAList { .. }));
        assert!(matches!(v.dropped[5], RecordValidationError::EmptyUrls { .. }));
        assert!(matches!(v.dropped[6], RecordValidationError::InvalidClass { .. }));
    }

    #[test]
    fn bad_entries_dropped_individually() {
        let v = validate(values(json!([{
            "class": "Virga",
            "urls": [U1, 42, "", {"image": "https://x/p.jpg", "x": 1}, null]
        }])));
        assert_eq!(v.records.len(), 1);
        assert_eq!(v.records[0].sources.len(), 1);
        assert_eq!(v.dropped_entries(), 4);
        assert_eq!(v.dropped_records(), 0);
    }

    #[test]
    fn record_with_only_bad_entries_is_dropped() {
        let v = validate(values(json!([{"class": "Virga", "urls": [1, 2]}])));
        assert!(v.records.is_empty());
        assert_eq!(v.dropped_records(), 1);
        assert_eq!(v.dropped_entries(), 2);
    }

    #[test]
    fn template_entries_parsed() {
        let v = validate(values(json!([{
            "class": "nc_g3",
            "urls": [{"image": "https://x/MS73_154.jpg", "x": 1, "y": 2, "width": 40, "height": 40}]
        }])));
        assert!(matches!(v.records[0].sources[0], RegionSource::Template(_)));
    }

    #[test]
    fn malformed_metadata_is_ignored() {
        let v = validate(values(json!([
            {"class": "Virga", "urls": [U1], "metadata": {"source": "viewer"}},
            {"class": "Pes", "urls": [U1], "metadata": "oops"},
        ])));
        assert_eq!(v.records.len(), 2);
        assert_eq!(
            v.records[0].metadata.as_ref().and_then(|m| m.source.as_deref()),
            Some("viewer")
        );
        assert_eq!(v.records[1].metadata, None);
    }

    // =========================================================================
    // Merge / filter / analyze
    // =========================================================================

    #[test]
    fn same_class_merged_and_deduplicated() {
        let v = validate(values(json!([
            {"class": "Virga", "urls": [U1]},
            {"class": "Pes", "urls": [U1]},
            {"class": "Virga", "urls": [U2, U1]},
        ])));
        let merged = merge_by_class(v.records);
        assert_eq!(merged.batches.len(), 2);
        assert_eq!(merged.batches[0].class, "Virga");
        assert_eq!(
            merged.batches[0].sources,
            vec![RegionSource::Url(U1.into()), RegionSource::Url(U2.into())]
        );
        assert_eq!(merged.batches[1].class, "Pes");
        assert_eq!(merged.duplicates, 1);
    }

    #[test]
    fn filter_keeps_exact_class_only() {
        let v = validate(values(json!([
            {"class": "Virga", "urls": [U1]},
            {"class": "Virga strata", "urls": [U2]},
        ])));
        let batches = filter_batches(merge_by_class(v.records).batches, Some("Virga"));
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].class, "Virga");
    }

    #[test]
    fn analysis_counts_and_orders_classes() {
        let v = validate(values(json!([
            {"class": "Pes", "urls": [U1], "metadata": {"source": "viewer"}},
            {"class": "Virga", "urls": [U1, U2]},
            {"class": "Pes", "urls": [U1], "metadata": {"source": "viewer"}},
            {"urls": [U1]},
        ])));
        let merged = merge_by_class(v.records.clone());
        let a = analyze(&v, &merged);

        assert_eq!(a.total_records, 4);
        assert_eq!(a.valid_records, 3);
        assert_eq!(a.classes[0].class, "Virga");
        assert_eq!(a.classes[0].entries, 2);
        assert_eq!(a.classes[1].sources, vec!["viewer".to_string()]);
        assert_eq!(a.duplicates, 1);
        assert_eq!(a.dropped.len(), 1);
        assert_eq!(a.total_entries(), 3);
    }
}
