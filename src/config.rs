//! Extraction configuration.
//!
//! Two layers feed a run:
//!
//! 1. [`ExtractSettings`]: tunables loaded from an optional, sparse TOML file
//!    (`--config extract.toml`). Every key has a default; unknown keys are
//!    rejected to catch typos early.
//! 2. [`ExtractConfig`]: the immutable value a pipeline run is invoked with.
//!    It carries the paths and flags from the command line plus the resolved
//!    settings. Command-line flags override file values.
//!
//! ## Settings file
//!
//! ```toml
//! [scale]
//! width_scale = 2.5
//! height_scale = 2.7
//!
//! [processing]
//! workers = 8
//! ```
//!
//! See [`stock_config_toml`] for every key with its default.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Ledger filename used when `--metadata` is not given.
pub const DEFAULT_LEDGER_NAME: &str = "neume_metadata.csv";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Tunables loaded from the settings file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExtractSettings {
    /// Template bounding-box correction.
    pub scale: ScaleConfig,
    /// Network fetch and encoding.
    pub fetch: FetchConfig,
    /// Worker pool sizing.
    pub processing: ProcessingConfig,
}

impl ExtractSettings {
    /// Validate config values are within acceptable ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let scales = [
            ("scale.width_scale", self.scale.width_scale),
            ("scale.height_scale", self.scale.height_scale),
        ];
        for (key, value) in scales {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::Validation(format!(
                    "{key} must be a positive number, got {value}"
                )));
            }
        }
        if self.fetch.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "fetch.max_attempts must be at least 1".into(),
            ));
        }
        if !(1..=100).contains(&self.fetch.quality) {
            return Err(ConfigError::Validation(
                "fetch.quality must be 1-100".into(),
            ));
        }
        if self.fetch.region_size.trim().is_empty() {
            return Err(ConfigError::Validation(
                "fetch.region_size must not be empty".into(),
            ));
        }
        if self.processing.workers == 0 {
            return Err(ConfigError::Validation(
                "processing.workers must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Where a template box's `(x, y)` sits on the glyph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateAnchor {
    /// `(x, y)` is the upper-left corner.
    #[default]
    Corner,
    /// `(x, y)` is the glyph's center point.
    Center,
}

/// How a corrected rectangle that overflows the page is brought back inside.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClipPolicy {
    /// Trim the overflowing side only; the other side never moves.
    #[default]
    Shrink,
    /// Translate the rectangle back inside first, then trim what still overflows.
    Shift,
}

/// Per-axis expansion applied to template bounding boxes.
///
/// The defaults reproduce a plain symmetric 1.8× expansion. Dense manuscripts
/// tend to want something closer to 2.5 × 2.7.
///
/// At 1.8× a 50×50 box at (100, 100) becomes (80, 80, 90, 90) under the
/// default corner anchor; `anchor = "center"` reads (100, 100) as the glyph
/// center and gives (55, 55, 90, 90).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScaleConfig {
    pub width_scale: f64,
    pub height_scale: f64,
    /// Floor applied to the scaled width.
    pub min_width: u32,
    /// Floor applied to the scaled height.
    pub min_height: u32,
    /// Extra pixels added on every side after scaling.
    pub padding: u32,
    pub anchor: TemplateAnchor,
    pub clip: ClipPolicy,
}

impl Default for ScaleConfig {
    fn default() -> Self {
        Self {
            width_scale: 1.8,
            height_scale: 1.8,
            min_width: 0,
            min_height: 0,
            padding: 0,
            anchor: TemplateAnchor::Corner,
            clip: ClipPolicy::Shrink,
        }
    }
}

/// Network fetch settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FetchConfig {
    /// Per-request timeout.
    pub timeout_secs: u64,
    /// Total attempts for a transient failure, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on each further retry.
    pub base_delay_ms: u64,
    /// IIIF size token used when requesting a region directly.
    pub region_size: String,
    /// JPEG quality of the stored crops.
    pub quality: u32,
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_attempts: 3,
            base_delay_ms: 500,
            region_size: "full".to_string(),
            quality: 90,
            user_agent: concat!("neume-extract/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessingConfig {
    /// Number of concurrently executing extraction workers.
    pub workers: usize,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self { workers: 4 }
    }
}

/// MEI document to import alongside (or instead of) the JSON annotations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeiInput {
    pub path: PathBuf,
    /// URL of the page image the MEI zones refer to.
    pub image_url: String,
}

/// Immutable configuration for one pipeline invocation.
#[derive(Debug, Clone)]
pub struct ExtractConfig {
    /// Annotation collection. `None` only when an MEI input is given.
    pub annotations: Option<PathBuf>,
    pub mei: Option<MeiInput>,
    pub output_dir: PathBuf,
    /// Ledger path; defaults to `<output_dir>/neume_metadata.csv`.
    pub metadata: Option<PathBuf>,
    pub filter_class: Option<String>,
    /// Keep the existing ledger and append to it instead of starting fresh.
    pub append: bool,
    pub settings: ExtractSettings,
}

impl ExtractConfig {
    pub fn new(annotations: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            annotations: Some(annotations.into()),
            mei: None,
            output_dir: output_dir.into(),
            metadata: None,
            filter_class: None,
            append: false,
            settings: ExtractSettings::default(),
        }
    }

    /// Resolved ledger path.
    pub fn ledger_path(&self) -> PathBuf {
        self.metadata
            .clone()
            .unwrap_or_else(|| self.output_dir.join(DEFAULT_LEDGER_NAME))
    }

    pub fn workers(&self) -> usize {
        self.settings.processing.workers.max(1)
    }

    /// Check the run configuration before any work starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.settings.validate()?;
        if self.annotations.is_none() && self.mei.is_none() {
            return Err(ConfigError::Validation(
                "no annotation source: give an annotations file or an MEI input".into(),
            ));
        }
        if self.output_dir.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "output directory must not be empty".into(),
            ));
        }
        if let Some(filter) = &self.filter_class
            && filter.trim().is_empty()
        {
            return Err(ConfigError::Validation(
                "class filter must not be blank".into(),
            ));
        }
        Ok(())
    }
}

/// Load settings from a TOML file, or return the defaults when `path` is `None`.
///
/// The file is sparse: absent keys keep their defaults. The result is validated.
pub fn load_settings(path: Option<&Path>) -> Result<ExtractSettings, ConfigError> {
    let settings = match path {
        Some(path) => {
            let content = fs::read_to_string(path)?;
            toml::from_str::<ExtractSettings>(&content)?
        }
        None => ExtractSettings::default(),
    };
    settings.validate()?;
    Ok(settings)
}

/// Returns a fully-commented stock settings file with every key and its default.
///
/// Printed by `--print-config`.
pub fn stock_config_toml() -> &'static str {
    r##"# neume-extract settings
# ======================
#
# All keys are optional. Command-line flags override values set here.

[scale]
# Expansion applied to template bounding boxes (never to IIIF region URLs).
width_scale = 1.8
height_scale = 1.8
# Floors applied to the scaled size, in pixels.
min_width = 0
min_height = 0
# Extra pixels added on every side after scaling.
padding = 0
# Where the template (x, y) sits: "corner" (upper-left) or "center".
anchor = "corner"
# Overflow handling at the page edge: "shrink" trims the overflowing side,
# "shift" moves the box back inside first.
clip = "shrink"

[fetch]
timeout_secs = 30
# Attempts for transient failures (timeouts, 5xx), including the first.
max_attempts = 3
# First retry delay; doubles on each further retry.
base_delay_ms = 500
# IIIF size token for direct region requests ("full" for v2, "max" for v3).
region_size = "full"
# JPEG quality of stored crops (1-100).
quality = 90
user_agent = "neume-extract"

[processing]
# Concurrently executing extraction workers.
workers = 4
"##
}
