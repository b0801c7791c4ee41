//! Shared test utilities for the pipeline tests.
//!
//! Fixture writers for annotation files and a run configuration tuned for
//! tests (no backoff delay, small worker pool).
//!
//! # Usage
//!
//! ```rust
//! use crate::test_helpers::*;
//!
//! let tmp = TempDir::new().unwrap();
//! let annotations = write_annotations(tmp.path(), &json!([
//!     {"class": "Virga", "urls": [region_url("MS73", "page007", 120, 340, 60, 80)]}
//! ]));
//! let config = test_config(&annotations, &tmp.path().join("out"));
//! ```

use serde_json::Value;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::config::ExtractConfig;
use crate::ledger::{ExtractionRecord, load_records};

// =========================================================================
// Fixture setup
// =========================================================================

/// Write `records` as `annotations.json` under `dir` and return its path.
pub fn write_annotations(dir: &Path, records: &Value) -> PathBuf {
    let path = dir.join("annotations.json");
    std::fs::write(&path, serde_json::to_string_pretty(records).unwrap()).unwrap();
    path
}

/// A IIIF region URL on `example.org` with a 64px thumbnail size segment.
pub fn region_url(manuscript: &str, page: &str, x: u32, y: u32, w: u32, h: u32) -> String {
    format!("https://example.org/iiif/{manuscript}/{page}/{x},{y},{w},{h}/64,/0/default.jpg")
}

/// Run configuration with zero retry delay, suitable for mock sources.
pub fn test_config(annotations: &Path, output_dir: &Path) -> ExtractConfig {
    let mut config = ExtractConfig::new(annotations, output_dir);
    config.settings.fetch.base_delay_ms = 0;
    config.settings.processing.workers = 2;
    config
}

// =========================================================================
// Output inspection
// =========================================================================

/// Ledger rows of a finished run, as an order-independent set.
pub fn ledger_set(config: &ExtractConfig) -> BTreeSet<(String, String, String, u32, u32, u32, u32)> {
    load_records(&config.ledger_path())
        .unwrap()
        .into_iter()
        .map(|r: ExtractionRecord| (r.directory, r.filename, r.class, r.x, r.y, r.width, r.height))
        .collect()
}

/// Relative paths of every image under the output root, sorted.
pub fn output_files(config: &ExtractConfig) -> Vec<String> {
    crate::organize::OutputOrganizer::new(&config.output_dir)
        .materialized_files()
        .unwrap()
        .into_iter()
        .map(|p| p.to_string_lossy().replace('\\', "/"))
        .collect()
}
