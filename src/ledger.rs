//! Provenance ledger.
//!
//! One CSV row per extracted image, written append-only:
//!
//! ```text
//! filename,directory,class,manuscript,page,x,y,width,height,source_url
//! page007_000.jpg,Virga,Virga,MS73,page007,120,340,60,80,https://…
//! ```
//!
//! Rows are serialized through a mutex and flushed one by one, so the file on
//! disk is always a valid prefix of the complete ledger. Callers append a row
//! only after the image it describes has been stored.
//!
//! The ledger also answers "is this output already logged?" for re-runs; rows
//! are keyed by `directory/filename` and a key is never written twice.
//!
//! A run without `--append` reopens the ledger with [`MetadataLedger::open_retaining`]:
//! rows whose image is still on disk are carried over and the rest are dropped.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tracing::warn;

/// Column order of the ledger file.
pub const LEDGER_COLUMNS: [&str; 10] = [
    "filename",
    "directory",
    "class",
    "manuscript",
    "page",
    "x",
    "y",
    "width",
    "height",
    "source_url",
];

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("ledger IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("ledger CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// One ledger row. Field order is the column order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExtractionRecord {
    pub filename: String,
    /// Class directory, relative to the output root.
    pub directory: String,
    pub class: String,
    pub manuscript: String,
    pub page: String,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub source_url: String,
}

impl ExtractionRecord {
    /// `directory/filename`, the output path relative to the root.
    pub fn key(&self) -> String {
        ledger_key(&self.directory, &self.filename)
    }
}

fn ledger_key(directory: &str, filename: &str) -> String {
    format!("{directory}/{filename}")
}

struct LedgerInner {
    writer: csv::Writer<File>,
    keys: HashSet<String>,
    appended: usize,
}

/// Row counts after finalize.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerStats {
    /// Rows carried over from a previous run (`--append`).
    pub carried: usize,
    /// Rows written by this run.
    pub appended: usize,
}

impl LedgerStats {
    pub fn total(&self) -> usize {
        self.carried + self.appended
    }
}

impl fmt::Display for LedgerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.carried > 0 {
            write!(
                f,
                "{} rows ({} new, {} carried over)",
                self.total(),
                self.appended,
                self.carried
            )
        } else if self.appended == 1 {
            write!(f, "1 row")
        } else {
            write!(f, "{} rows", self.appended)
        }
    }
}

/// Append-only, internally serialized ledger writer.
pub struct MetadataLedger {
    path: PathBuf,
    carried: usize,
    inner: Mutex<LedgerInner>,
}

impl MetadataLedger {
    /// Open the ledger at `path`.
    ///
    /// With `append` an existing ledger is kept and its rows are loaded as
    /// already-logged keys; otherwise the file is truncated and a fresh header
    /// is written.
    pub fn open(path: &Path, append: bool) -> Result<Self, LedgerError> {
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            fs::create_dir_all(dir).map_err(|source| LedgerError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        let io_err = |source| LedgerError::Io {
            path: path.to_path_buf(),
            source,
        };

        let existing = if append && path.is_file() {
            load_records(path)?
        } else {
            Vec::new()
        };

        let (file, needs_header) = if append {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(io_err)?;
            let empty = file.metadata().map_err(io_err)?.len() == 0;
            (file, empty)
        } else {
            (File::create(path).map_err(io_err)?, true)
        };

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if needs_header {
            writer.write_record(LEDGER_COLUMNS)?;
            writer.flush().map_err(io_err)?;
        }

        let keys: HashSet<String> = existing.iter().map(ExtractionRecord::key).collect();
        Ok(Self {
            path: path.to_path_buf(),
            carried: keys.len(),
            inner: Mutex::new(LedgerInner {
                writer,
                keys,
                appended: 0,
            }),
        })
    }

    /// Open the ledger at `path` from scratch, keeping the existing rows that
    /// `keep` accepts.
    ///
    /// Kept rows are rewritten under a fresh header and count as carried
    /// over. An unreadable old ledger is discarded with a warning.
    pub fn open_retaining(
        path: &Path,
        keep: impl Fn(&ExtractionRecord) -> bool,
    ) -> Result<Self, LedgerError> {
        let existing = if path.is_file() {
            load_records(path).unwrap_or_else(|e| {
                warn!("discarding unreadable ledger {}: {e}", path.display());
                Vec::new()
            })
        } else {
            Vec::new()
        };

        let mut ledger = Self::open(path, false)?;
        let inner = ledger
            .inner
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for record in &existing {
            if keep(record) && inner.keys.insert(record.key()) {
                inner.writer.serialize(record)?;
            }
        }
        inner.writer.flush().map_err(|source| LedgerError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        ledger.carried = inner.keys.len();
        Ok(ledger)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a row for `directory/filename` is already in the ledger.
    pub fn contains(&self, directory: &str, filename: &str) -> bool {
        self.contains_key(&ledger_key(directory, filename))
    }

    /// Whether a row with key `directory/filename` is already in the ledger.
    pub fn contains_key(&self, key: &str) -> bool {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.keys.contains(key)
    }

    /// Append one row and flush it to disk.
    ///
    /// Returns `false` without writing when the key is already present.
    pub fn append(&self, record: &ExtractionRecord) -> Result<bool, LedgerError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let key = record.key();
        if inner.keys.contains(&key) {
            return Ok(false);
        }
        inner.writer.serialize(record)?;
        inner.writer.flush().map_err(|source| LedgerError::Io {
            path: self.path.clone(),
            source,
        })?;
        inner.keys.insert(key);
        inner.appended += 1;
        Ok(true)
    }

    /// Rows currently in the ledger, carried plus appended.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flush, sync, and close the ledger.
    pub fn finalize(self) -> Result<LedgerStats, LedgerError> {
        let inner = self.inner.into_inner().unwrap_or_else(PoisonError::into_inner);
        let io_err = |source| LedgerError::Io {
            path: self.path.clone(),
            source,
        };
        let file = inner
            .writer
            .into_inner()
            .map_err(|e| io_err(e.into_error()))?;
        file.sync_all().map_err(io_err)?;
        Ok(LedgerStats {
            carried: self.carried,
            appended: inner.appended,
        })
    }
}

/// Read every row of a ledger file.
pub fn load_records(path: &Path) -> Result<Vec<ExtractionRecord>, LedgerError> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut records = Vec::new();
    for row in reader.deserialize() {
        records.push(row?);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(filename: &str, class: &str) -> ExtractionRecord {
        ExtractionRecord {
            filename: filename.into(),
            directory: class.into(),
            class: class.into(),
            manuscript: "MS73".into(),
            page: "page007".into(),
            x: 120,
            y: 340,
            width: 60,
            height: 80,
            source_url: "https://example.org/iiif/MS73/page007/120,340,60,80/64,/0/default.jpg"
                .into(),
        }
    }

    #[test]
    fn fresh_ledger_has_header_even_when_empty() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("ledger.csv");
        let ledger = MetadataLedger::open(&path, false).unwrap();
        ledger.finalize().unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(
            content.trim_end(),
            "filename,directory,class,manuscript,page,x,y,width,height,source_url"
        );
    }

    #[test]
    fn appended_rows_round_trip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("ledger.csv");
        let ledger = MetadataLedger::open(&path, false).unwrap();
        assert!(ledger.append(&record("page007_000.jpg", "Virga")).unwrap());
        assert!(ledger.append(&record("page007_001.jpg", "Virga")).unwrap());
        let stats = ledger.finalize().unwrap();
        assert_eq!(stats.appended, 2);

        let rows = load_records(&path).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], record("page007_000.jpg", "Virga"));
    }

    #[test]
    fn duplicate_key_not_written_twice() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("ledger.csv");
        let ledger = MetadataLedger::open(&path, false).unwrap();
        assert!(ledger.append(&record("a.jpg", "Virga")).unwrap());
        assert!(!ledger.append(&record("a.jpg", "Virga")).unwrap());
        assert!(ledger.contains("Virga", "a.jpg"));
        assert!(!ledger.contains("Pes", "a.jpg"));
        ledger.finalize().unwrap();
        assert_eq!(load_records(&path).unwrap().len(), 1);
    }

    #[test]
    fn append_mode_keeps_prior_rows() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("ledger.csv");

        let first = MetadataLedger::open(&path, false).unwrap();
        first.append(&record("a.jpg", "Virga")).unwrap();
        first.finalize().unwrap();

        let second = MetadataLedger::open(&path, true).unwrap();
        assert!(second.contains("Virga", "a.jpg"));
        assert!(!second.append(&record("a.jpg", "Virga")).unwrap());
        assert!(second.append(&record("b.jpg", "Virga")).unwrap());
        let stats = second.finalize().unwrap();
        assert_eq!(stats, LedgerStats { carried: 1, appended: 1 });

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.matches("filename,directory").count(), 1);
        assert_eq!(load_records(&path).unwrap().len(), 2);
    }

    #[test]
    fn fresh_mode_truncates() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("ledger.csv");
        let first = MetadataLedger::open(&path, false).unwrap();
        first.append(&record("a.jpg", "Virga")).unwrap();
        first.finalize().unwrap();

        let second = MetadataLedger::open(&path, false).unwrap();
        assert!(second.is_empty());
        second.finalize().unwrap();
        assert!(load_records(&path).unwrap().is_empty());
    }

    #[test]
    fn retaining_open_keeps_accepted_rows_only() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("ledger.csv");
        let first = MetadataLedger::open(&path, false).unwrap();
        first.append(&record("a.jpg", "Virga")).unwrap();
        first.append(&record("b.jpg", "Virga")).unwrap();
        first.finalize().unwrap();

        let second = MetadataLedger::open_retaining(&path, |r| r.filename == "a.jpg").unwrap();
        assert!(second.contains_key("Virga/a.jpg"));
        assert!(!second.contains("Virga", "b.jpg"));
        assert!(second.append(&record("b.jpg", "Virga")).unwrap());
        let stats = second.finalize().unwrap();
        assert_eq!(stats, LedgerStats { carried: 1, appended: 1 });

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.matches("filename,directory").count(), 1);
        assert_eq!(load_records(&path).unwrap().len(), 2);
    }

    #[test]
    fn retaining_open_discards_unreadable_ledger() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("ledger.csv");
        fs::write(&path, "filename,directory\nonly,two,too,many\n").unwrap();

        let ledger = MetadataLedger::open_retaining(&path, |_| true).unwrap();
        assert!(ledger.is_empty());
        ledger.finalize().unwrap();
        assert!(load_records(&path).unwrap().is_empty());
    }

    #[test]
    fn append_mode_creates_missing_file_with_header() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested/ledger.csv");
        let ledger = MetadataLedger::open(&path, true).unwrap();
        ledger.append(&record("a.jpg", "Virga")).unwrap();
        ledger.finalize().unwrap();
        assert_eq!(load_records(&path).unwrap().len(), 1);
    }

    #[test]
    fn concurrent_appends_are_serialized() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("ledger.csv");
        let ledger = MetadataLedger::open(&path, false).unwrap();

        std::thread::scope(|s| {
            for t in 0..8 {
                let ledger = &ledger;
                s.spawn(move || {
                    for i in 0..25 {
                        let name = format!("p{t}_{i:03}.jpg");
                        ledger.append(&record(&name, "Virga")).unwrap();
                    }
                });
            }
        });
        assert_eq!(ledger.len(), 200);
        ledger.finalize().unwrap();

        let rows = load_records(&path).unwrap();
        assert_eq!(rows.len(), 200);
        let unique: HashSet<_> = rows.iter().map(ExtractionRecord::key).collect();
        assert_eq!(unique.len(), 200);
    }

    #[test]
    fn stats_display() {
        assert_eq!(LedgerStats { carried: 0, appended: 3 }.to_string(), "3 rows");
        assert_eq!(
            LedgerStats { carried: 2, appended: 3 }.to_string(),
            "5 rows (3 new, 2 carried over)"
        );
    }
}
