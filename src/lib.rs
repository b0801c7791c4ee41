//! # Neume Extract
//!
//! Turns annotation records (neume class → list of image regions) into a
//! locally materialized, class-sorted image corpus for training, with a
//! provenance ledger describing where every crop came from.
//!
//! # Architecture: One Pipeline, Pure Leaves
//!
//! ```text
//! annotations.json ─┐
//!                   ├→ LOADING → VALIDATING → EXTRACTING → FINALIZING
//! folio.mei ────────┘                            │
//!                         per task: resolve → correct → fetch+crop → store → ledger row
//! ```
//!
//! The leaves (region parsing, scale correction, crop geometry) are pure
//! functions over task-local data. Only three things are shared between
//! workers: the HTTP client, the output directory namespace, and the ledger.
//! Each of those is safe under concurrent use on its own, so the worker pool
//! needs no further coordination.
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`annotations`] | LOADING + VALIDATING: JSON records into closed types, merge by class, analyze report |
//! | [`mei`] | MEI facsimile zones into template-box records |
//! | [`region`] | IIIF region URL and template box parsing, request URL construction |
//! | [`correction`] | Center-preserving scale correction and clipping of template boxes |
//! | [`fetch`] | `ImageSource` trait, HTTP source, retry with backoff, fetch-and-crop executor |
//! | [`imaging`] | Decode, crop, JPEG encode |
//! | [`organize`] | Class sanitization, deterministic output paths, atomic writes |
//! | [`ledger`] | Append-only CSV provenance ledger |
//! | [`pipeline`] | State machine, worker pool, cancellation, run summary |
//! | [`config`] | TOML settings and the immutable per-run configuration |
//! | [`output`] | CLI output formatting |
//! | [`types`] | Shared data model (`AnnotationRecord`, `RegionSource`, `TemplateBox`) |
//!
//! # Design Decisions
//!
//! ## Direct vs Template Regions
//!
//! IIIF region URLs already encode the true extent of a glyph and are fetched
//! pre-cropped from the server. Template boxes (from MEI and similar symbolic
//! encodings) are emitted at one fixed size per glyph and must be expanded
//! before cropping. The two are separate variants of [`region::Region`], so
//! "does this need correction" is decided by a match, not a flag.
//!
//! Template regions are cropped locally from the full page. The corrected
//! rectangle may run past the page edge, and only the decoded page knows
//! where that edge is.
//!
//! ## Paths Fixed Before Dispatch
//!
//! Sequence indices are assigned from the merged input order before any work
//! starts. Output paths therefore depend only on the input, which is what
//! makes re-runs idempotent and the result independent of the worker count.
//!
//! ## File First, Row Second
//!
//! A crop is written to a temp file, synced, and renamed into place before its
//! ledger row is appended and flushed. A crash can leave an image without a
//! row, never a row without an image; the next run reclaims such images
//! without fetching the crop again.

pub mod annotations;
pub mod config;
pub mod correction;
pub mod fetch;
pub mod imaging;
pub mod ledger;
pub mod mei;
pub mod organize;
pub mod output;
pub mod pipeline;
pub mod region;
pub mod types;

#[cfg(test)]
pub(crate) mod test_helpers;
