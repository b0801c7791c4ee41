//! Deterministic output layout.
//!
//! Every extracted image lands at
//!
//! ```text
//! <output_dir>/<sanitized-class>/<page>_<seq:03>.jpg
//! ```
//!
//! The path depends only on the class, the page id, and the sequence index the
//! controller assigned before dispatch. Two runs over the same input therefore
//! target the same files regardless of worker count or scheduling, which is
//! what makes "file already exists" a reliable already-extracted signal.
//!
//! Files are written to a sibling `<name>.part`, synced, then renamed into
//! place. A file at its final path is always complete.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

/// Extension of every stored crop.
pub const IMAGE_EXTENSION: &str = "jpg";

const PARTIAL_SUFFIX: &str = ".part";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidClassError {
    #[error("class name is empty")]
    Empty,
    #[error("class name {0:?} contains a path separator")]
    PathSeparator(String),
    #[error("class name {0:?} is only dots")]
    ParentReference(String),
    #[error("class name {0:?} contains control characters")]
    ControlCharacter(String),
}

#[derive(Error, Debug)]
pub enum WriteError {
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to scan output tree {path}: {source}")]
    Scan {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
}

/// Turn a class label into a directory name.
///
/// Whitespace runs become single underscores. Labels that could escape the
/// output root are rejected rather than rewritten, since two different labels
/// must never collapse onto one directory.
///
/// - `"Virga"` → `Virga`
/// - `"Punctum  inclinatum"` → `Punctum_inclinatum`
/// - `"Punctum..liq"` → `Punctum..liq`
/// - `"../etc"`, `".."` → error
pub fn sanitize_class(class: &str) -> Result<String, InvalidClassError> {
    let trimmed = class.trim();
    if trimmed.is_empty() {
        return Err(InvalidClassError::Empty);
    }
    if trimmed.contains(['/', '\\']) {
        return Err(InvalidClassError::PathSeparator(class.to_string()));
    }
    if trimmed
        .chars()
        .any(|c| c.is_control() && !c.is_whitespace())
    {
        return Err(InvalidClassError::ControlCharacter(class.to_string()));
    }
    let joined = trimmed.split_whitespace().collect::<Vec<_>>().join("_");
    if joined.chars().all(|c| c == '.') {
        return Err(InvalidClassError::ParentReference(class.to_string()));
    }
    Ok(joined)
}

/// Make a page id safe as a filename stem.
///
/// Page ids come from URL path segments and are normally clean already; any
/// separator, whitespace or control character is replaced by `_`.
fn sanitize_page(page: &str) -> String {
    let cleaned: String = page
        .trim()
        .chars()
        .map(|c| {
            if c == '/' || c == '\\' || c.is_whitespace() || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "page".to_string(),
        _ => cleaned,
    }
}

/// Maps tasks to output paths under one root and writes them atomically.
#[derive(Debug, Clone)]
pub struct OutputOrganizer {
    root: PathBuf,
}

impl OutputOrganizer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the output root. Failure here is fatal for the run.
    pub fn ensure_root(&self) -> Result<(), WriteError> {
        fs::create_dir_all(&self.root).map_err(|source| WriteError::CreateDir {
            path: self.root.clone(),
            source,
        })
    }

    /// Relative output path for one task. `class_dir` must already be sanitized.
    pub fn plan(&self, class_dir: &str, page: &str, sequence_index: usize) -> PathBuf {
        PathBuf::from(class_dir).join(format!(
            "{}_{:03}.{}",
            sanitize_page(page),
            sequence_index,
            IMAGE_EXTENSION
        ))
    }

    pub fn absolute(&self, relative: &Path) -> PathBuf {
        self.root.join(relative)
    }

    pub fn exists(&self, relative: &Path) -> bool {
        self.absolute(relative).is_file()
    }

    /// Write `bytes` to `relative` via a synced temp file and a rename.
    ///
    /// The class directory is created on first use; concurrent creation by
    /// several workers is fine since `create_dir_all` tolerates existing
    /// directories.
    pub fn store(&self, relative: &Path, bytes: &[u8]) -> Result<PathBuf, WriteError> {
        let target = self.absolute(relative);
        if let Some(dir) = target.parent() {
            fs::create_dir_all(dir).map_err(|source| WriteError::CreateDir {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        let mut partial = target.clone().into_os_string();
        partial.push(PARTIAL_SUFFIX);
        let partial = PathBuf::from(partial);

        let write = || -> io::Result<()> {
            let mut file = File::create(&partial)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            fs::rename(&partial, &target)
        };
        write().map_err(|source| {
            let _ = fs::remove_file(&partial);
            WriteError::Write {
                path: target.clone(),
                source,
            }
        })?;
        Ok(target)
    }

    /// Every stored crop under the root, as sorted relative paths.
    ///
    /// Leftover `.part` files from an interrupted run are not included.
    pub fn materialized_files(&self) -> Result<Vec<PathBuf>, WriteError> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(2).max_depth(2) {
            let entry = entry.map_err(|source| WriteError::Scan {
                path: self.root.clone(),
                source,
            })?;
            let path = entry.path();
            if entry.file_type().is_file()
                && path
                    .extension()
                    .is_some_and(|e| e.eq_ignore_ascii_case(IMAGE_EXTENSION))
                && let Ok(relative) = path.strip_prefix(&self.root)
            {
                files.push(relative.to_path_buf());
            }
        }
        files.sort();
        Ok(files)
    }
}

/// Pixel size of a stored image, read from its header.
pub fn stored_dimensions(path: &Path) -> Option<(u32, u32)> {
    image::image_dimensions(path).ok()
}
