//! Pipeline controller and worker pool.
//!
//! A run walks a fixed state machine:
//!
//! ```text
//! INIT → LOADING → VALIDATING → EXTRACTING → FINALIZING → DONE
//!   └───────┴──────────┴────────────┴────────────┴──────→ ABORTED
//! ```
//!
//! `--analyze-only` stops after VALIDATING and goes straight to DONE.
//!
//! ## Extraction
//!
//! The controller turns every merged class entry into one [`ExtractionTask`]
//! with a precomputed sequence index, then hands the whole list to a rayon
//! pool of `workers` threads. Each worker runs the task end to end:
//!
//! ```text
//! resolve region → correct (template only) → already on disk? → fetch + crop → store → ledger row
//! ```
//!
//! Per-task problems become a [`TaskOutcome`] and never stop the pool. The
//! only per-task error that ends a run is a failed write, which trips the
//! [`CancelToken`] so no further task starts; tasks already running finish.
//!
//! ## Re-runs
//!
//! A run without `--append` keeps the ledger rows whose image is still on
//! disk and drops the rest. An output file that already exists is never
//! fetched again: if the ledger has its row the task is skipped as already
//! extracted, otherwise the row is reclaimed with the geometry extraction
//! would have recorded. Running twice over the same input therefore fetches
//! nothing, adds no rows, and ends with the same ledger.
//!
//! ## Pages
//!
//! Template tasks are dispatched grouped by page, and each page is announced
//! to the executor once per task before dispatch, so a page is fetched once
//! and freed after its last task.

use crate::annotations::{self, Analysis, LoadError, Merged, Validation};
use crate::config::{ConfigError, ExtractConfig};
use crate::correction::{GeometryError, correct};
use crate::fetch::{ExtractError, FetchCropExecutor, FetchError, HttpSource, ImageSource};
use crate::ledger::{ExtractionRecord, LedgerError, LedgerStats, MetadataLedger};
use crate::mei::{self, MeiError};
use crate::organize::{OutputOrganizer, WriteError, sanitize_class, stored_dimensions};
use crate::region::{
    MalformedRegionError, Region, RegionDescriptor, page_image_url, resolve_iiif_url,
    resolve_template,
};
use crate::types::{ClassBatch, RegionSource};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineState {
    Init,
    Loading,
    Validating,
    Extracting,
    Finalizing,
    Done,
    Aborted,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Aborted)
    }

    /// Whether `self → next` is an edge of the state machine.
    pub fn can_transition_to(self, next: PipelineState) -> bool {
        use PipelineState::*;
        match (self, next) {
            (Done, _) | (Aborted, _) => false,
            (_, Aborted) => true,
            (Init, Loading)
            | (Loading, Validating)
            | (Validating, Extracting)
            | (Validating, Done)
            | (Extracting, Finalizing)
            | (Finalizing, Done) => true,
            _ => false,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Init => "INIT",
            PipelineState::Loading => "LOADING",
            PipelineState::Validating => "VALIDATING",
            PipelineState::Extracting => "EXTRACTING",
            PipelineState::Finalizing => "FINALIZING",
            PipelineState::Done => "DONE",
            PipelineState::Aborted => "ABORTED",
        };
        f.write_str(name)
    }
}

/// Fatal errors: the run ends ABORTED without (or before finishing) extraction.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Mei(#[from] MeiError),
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("failed to build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
    #[error("failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),
}

/// Shared stop flag. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One region to extract. Owned by the worker that runs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionTask {
    pub class: String,
    /// Sanitized class directory name.
    pub class_dir: String,
    pub source: RegionSource,
    pub sequence_index: usize,
}

/// Why a task produced no new image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyExtracted,
    MalformedRegion(MalformedRegionError),
    Geometry(GeometryError),
    FetchPermanent(FetchError),
    FetchRetriesExhausted(FetchError),
    Encode(String),
}

impl SkipReason {
    /// Histogram key used in the run summary.
    pub fn label(&self) -> &'static str {
        match self {
            SkipReason::AlreadyExtracted => "already-extracted",
            SkipReason::MalformedRegion(_) => "malformed-region",
            SkipReason::Geometry(_) => "geometry",
            SkipReason::FetchPermanent(_) => "fetch-permanent",
            SkipReason::FetchRetriesExhausted(_) => "fetch-retries-exhausted",
            SkipReason::Encode(_) => "encode",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::AlreadyExtracted => write!(f, "already extracted"),
            SkipReason::MalformedRegion(e) => write!(f, "{e}"),
            SkipReason::Geometry(e) => write!(f, "{e}"),
            SkipReason::FetchPermanent(e) | SkipReason::FetchRetriesExhausted(e) => {
                write!(f, "{e}")
            }
            SkipReason::Encode(msg) => write!(f, "{msg}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Extracted(ExtractionRecord),
    /// File was already on disk without a ledger row; the row was added.
    Reclaimed(ExtractionRecord),
    Skipped(SkipReason),
    /// Write or ledger failure. Fatal for the run.
    Failed(String),
    Cancelled,
}

/// Progress events for the CLI printer thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent {
    ClassQueued {
        class: String,
        tasks: usize,
    },
    TaskFinished {
        class: String,
        sequence_index: usize,
        /// Output path relative to the output root, when it could be planned.
        output: Option<String>,
        outcome: TaskOutcome,
    },
}

/// Why a run ended ABORTED after extraction started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    Interrupted,
    WriteFailed(String),
}

/// Everything the run reports at FINALIZING.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub attempted: usize,
    pub extracted: usize,
    pub reclaimed: usize,
    /// Skip counts by [`SkipReason::label`].
    pub skipped: BTreeMap<&'static str, usize>,
    pub failed: usize,
    pub cancelled: usize,
    pub dropped_records: usize,
    pub dropped_entries: usize,
    pub duplicates: usize,
    /// MEI components pointing at missing zones.
    pub unresolved_zones: usize,
    /// Images found on disk at EXTRACTING start with no ledger row.
    pub unlogged: usize,
    pub ledger: LedgerStats,
    pub final_state: Option<PipelineState>,
    pub abort: Option<AbortReason>,
}

impl RunSummary {
    pub fn skipped_total(&self) -> usize {
        self.skipped.values().sum()
    }

    fn tally(&mut self, outcome: &TaskOutcome) {
        match outcome {
            TaskOutcome::Extracted(_) => self.extracted += 1,
            TaskOutcome::Reclaimed(_) => self.reclaimed += 1,
            TaskOutcome::Skipped(reason) => *self.skipped.entry(reason.label()).or_default() += 1,
            TaskOutcome::Failed(_) => self.failed += 1,
            TaskOutcome::Cancelled => self.cancelled += 1,
        }
    }
}

/// Output of LOADING + VALIDATING.
struct Catalog {
    validation: Validation,
    merged: Merged,
    unresolved_zones: usize,
}

/// Drives one run over an [`ExtractConfig`].
pub struct PipelineController<S: ImageSource> {
    config: ExtractConfig,
    source: S,
    cancel: CancelToken,
    events: Option<Sender<TaskEvent>>,
    state: PipelineState,
}

impl PipelineController<HttpSource> {
    /// Controller backed by a real HTTP client built from the fetch settings.
    pub fn http(config: ExtractConfig) -> Result<Self, PipelineError> {
        let source = HttpSource::new(&config.settings.fetch)?;
        Ok(Self::new(config, source))
    }
}

impl<S: ImageSource> PipelineController<S> {
    pub fn new(config: ExtractConfig, source: S) -> Self {
        Self {
            config,
            source,
            cancel: CancelToken::new(),
            events: None,
            state: PipelineState::Init,
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_events(mut self, events: Sender<TaskEvent>) -> Self {
        self.events = Some(events);
        self
    }

    fn transition(&mut self, next: PipelineState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid transition {} → {}",
            self.state,
            next
        );
        info!("{} → {}", self.state, next);
        self.state = next;
    }

    fn fail(&mut self, err: PipelineError) -> PipelineError {
        warn!("aborting: {err}");
        if !self.state.is_terminal() {
            self.transition(PipelineState::Aborted);
        }
        err
    }

    fn emit(&self, event: TaskEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// LOADING + VALIDATING only, for `--analyze-only`.
    pub fn analyze(mut self) -> Result<Analysis, PipelineError> {
        let catalog = self.load_and_validate().map_err(|e| self.fail(e))?;
        let analysis = annotations::analyze(&catalog.validation, &catalog.merged);
        self.transition(PipelineState::Done);
        Ok(analysis)
    }

    /// Full run. Fatal errors before extraction are returned as `Err`;
    /// interruption and write failures during extraction end in an `Ok`
    /// summary whose `final_state` is ABORTED.
    pub fn run(mut self) -> Result<RunSummary, PipelineError> {
        let catalog = self.load_and_validate().map_err(|e| self.fail(e))?;
        self.extract(catalog).map_err(|e| self.fail(e))
    }

    fn load_and_validate(&mut self) -> Result<Catalog, PipelineError> {
        self.transition(PipelineState::Loading);
        self.config.validate()?;

        let raw = match &self.config.annotations {
            Some(path) => {
                let raw = annotations::load_annotations(path)?;
                info!("loaded {} records from {}", raw.len(), path.display());
                raw
            }
            None => Vec::new(),
        };
        let mei_import = match &self.config.mei {
            Some(input) => {
                let import = mei::load_mei(input)?;
                info!(
                    "loaded {} components from {}",
                    import.records.len(),
                    input.path.display()
                );
                Some(import)
            }
            None => None,
        };

        self.transition(PipelineState::Validating);
        let mut validation = annotations::validate(raw);
        let mut unresolved_zones = 0;
        if let Some(import) = mei_import {
            validation.total += import.records.len();
            validation.records.extend(import.records);
            unresolved_zones = import.unresolved;
        }
        let mut merged = annotations::merge_by_class(validation.records.clone());
        merged.batches =
            annotations::filter_batches(merged.batches, self.config.filter_class.as_deref());
        info!(
            "{} valid records, {} dropped, {} classes selected",
            validation.records.len(),
            validation.dropped_records(),
            merged.batches.len()
        );
        Ok(Catalog {
            validation,
            merged,
            unresolved_zones,
        })
    }

    fn extract(&mut self, catalog: Catalog) -> Result<RunSummary, PipelineError> {
        self.transition(PipelineState::Extracting);

        let organizer = OutputOrganizer::new(&self.config.output_dir);
        organizer.ensure_root()?;
        let on_disk: BTreeSet<String> = organizer
            .materialized_files()?
            .iter()
            .map(|rel| relative_key(rel))
            .collect();
        let ledger_path = self.config.ledger_path();
        let ledger = if self.config.append {
            MetadataLedger::open(&ledger_path, true)?
        } else {
            MetadataLedger::open_retaining(&ledger_path, |row| on_disk.contains(&row.key()))?
        };

        let mut summary = RunSummary {
            dropped_records: catalog.validation.dropped_records(),
            dropped_entries: catalog.validation.dropped_entries(),
            duplicates: catalog.merged.duplicates,
            unresolved_zones: catalog.unresolved_zones,
            ..RunSummary::default()
        };
        summary.unlogged = completeness_check(&on_disk, &ledger);

        let tasks = build_tasks(&catalog.merged.batches);
        for batch in &catalog.merged.batches {
            self.emit(TaskEvent::ClassQueued {
                class: batch.class.clone(),
                tasks: batch.sources.len(),
            });
        }
        summary.attempted = tasks.len();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.workers())
            .build()?;
        info!(
            "extracting {} regions with {} workers",
            tasks.len(),
            self.config.workers()
        );

        let executor = FetchCropExecutor::new(
            &self.source,
            &self.config.settings.fetch,
            self.config.settings.scale.clip,
        );
        let worker = Worker {
            config: &self.config,
            executor: &executor,
            organizer: &organizer,
            ledger: &ledger,
        };
        let cancel = &self.cancel;
        let events = &self.events;

        let mut planned: Vec<(Option<String>, &ExtractionTask, Result<Region, SkipReason>)> =
            tasks
                .iter()
                .map(|task| {
                    let region = worker.resolve(task);
                    let page = match &region {
                        Ok(template @ Region::Template { descriptor, .. }) => {
                            executor.expect_page(template);
                            Some(page_image_url(descriptor))
                        }
                        _ => None,
                    };
                    (page, task, region)
                })
                .collect();
        // Stable: tasks keep input order within a page.
        planned.sort_by(|a, b| a.0.cmp(&b.0));

        let outcomes: Vec<TaskOutcome> = pool.install(|| {
            planned
                .par_iter()
                .map(|(_, task, region)| {
                    let (outcome, output) = if cancel.is_cancelled() {
                        (TaskOutcome::Cancelled, None)
                    } else {
                        worker.run(task, region)
                    };
                    if let TaskOutcome::Failed(msg) = &outcome {
                        warn!("{}: {msg}; stopping dispatch", task.class);
                        cancel.cancel();
                    }
                    if let Some(tx) = events {
                        let _ = tx.send(TaskEvent::TaskFinished {
                            class: task.class.clone(),
                            sequence_index: task.sequence_index,
                            output,
                            outcome: outcome.clone(),
                        });
                    }
                    outcome
                })
                .collect()
        });

        for outcome in &outcomes {
            summary.tally(outcome);
        }
        summary.abort = outcomes
            .iter()
            .find_map(|o| match o {
                TaskOutcome::Failed(msg) => Some(AbortReason::WriteFailed(msg.clone())),
                _ => None,
            })
            .or_else(|| self.cancel.is_cancelled().then_some(AbortReason::Interrupted));

        self.transition(PipelineState::Finalizing);
        summary.ledger = ledger.finalize()?;
        info!("ledger: {}", summary.ledger);

        let final_state = if summary.abort.is_some() {
            PipelineState::Aborted
        } else {
            PipelineState::Done
        };
        self.transition(final_state);
        summary.final_state = Some(final_state);
        Ok(summary)
    }
}

/// Assign sequence indices before dispatch so paths never depend on scheduling.
///
/// Distinct class labels that sanitize to the same directory share one index
/// range, continuing where the previous label stopped.
fn build_tasks(batches: &[ClassBatch]) -> Vec<ExtractionTask> {
    let mut next_index: HashMap<String, usize> = HashMap::new();
    let mut tasks = Vec::new();
    for batch in batches {
        let class_dir = match sanitize_class(&batch.class) {
            Ok(dir) => dir,
            Err(e) => {
                warn!("skipping class {:?}: {e}", batch.class);
                continue;
            }
        };
        let start = next_index.entry(class_dir.clone()).or_insert(0);
        for (offset, source) in batch.sources.iter().enumerate() {
            tasks.push(ExtractionTask {
                class: batch.class.clone(),
                class_dir: class_dir.clone(),
                source: source.clone(),
                sequence_index: *start + offset,
            });
        }
        *start += batch.sources.len();
    }
    tasks
}

/// `directory/filename` of a path relative to the output root.
fn relative_key(relative: &Path) -> String {
    relative.to_string_lossy().replace('\\', "/")
}

/// Log stored images that have no ledger row. Returns their count.
fn completeness_check(on_disk: &BTreeSet<String>, ledger: &MetadataLedger) -> usize {
    let unlogged: Vec<&String> = on_disk
        .iter()
        .filter(|key| !ledger.contains_key(key))
        .collect();
    if !unlogged.is_empty() {
        info!(
            "{} stored images have no ledger row; matching tasks will reclaim them",
            unlogged.len()
        );
        for key in &unlogged {
            debug!("unlogged: {key}");
        }
    }
    unlogged.len()
}

/// Per-task context shared by all workers.
struct Worker<'a, S: ImageSource> {
    config: &'a ExtractConfig,
    executor: &'a FetchCropExecutor<'a, S>,
    organizer: &'a OutputOrganizer,
    ledger: &'a MetadataLedger,
}

impl<S: ImageSource> Worker<'_, S> {
    fn run(
        &self,
        task: &ExtractionTask,
        resolved: &Result<Region, SkipReason>,
    ) -> (TaskOutcome, Option<String>) {
        let region = match resolved {
            Ok(region) => region,
            Err(reason) => {
                debug!("{} #{}: skipped: {reason}", task.class, task.sequence_index);
                return (TaskOutcome::Skipped(reason.clone()), None);
            }
        };

        let descriptor = region.descriptor();
        let relative = self
            .organizer
            .plan(&task.class_dir, &descriptor.page_id, task.sequence_index);
        let output = relative_key(&relative);
        let outcome = self.extract_to(task, region, &relative);
        self.executor.release_page(region);
        match &outcome {
            TaskOutcome::Skipped(reason) => debug!("{output}: skipped: {reason}"),
            TaskOutcome::Failed(msg) => warn!("{output}: {msg}"),
            _ => debug!("{output}: {outcome:?}"),
        }
        (outcome, Some(output))
    }

    /// Resolve the task's region and, for template boxes, scale-correct it.
    fn resolve(&self, task: &ExtractionTask) -> Result<Region, SkipReason> {
        let region = match &task.source {
            RegionSource::Url(url) => resolve_iiif_url(url).map(Region::Direct),
            RegionSource::Template(b) => resolve_template(b),
        }
        .map_err(SkipReason::MalformedRegion)?;

        match region {
            Region::Template {
                descriptor,
                page_extent,
            } => {
                let corrected = correct(&descriptor, &self.config.settings.scale, page_extent)
                    .map_err(SkipReason::Geometry)?;
                Ok(Region::Template {
                    descriptor: corrected,
                    page_extent,
                })
            }
            direct => Ok(direct),
        }
    }

    fn extract_to(&self, task: &ExtractionTask, region: &Region, relative: &Path) -> TaskOutcome {
        let filename = relative
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();

        if self.organizer.exists(relative) {
            if self.ledger.contains(&task.class_dir, &filename) {
                return TaskOutcome::Skipped(SkipReason::AlreadyExtracted);
            }
            let stored = stored_dimensions(&self.organizer.absolute(relative));
            let geometry = match self.executor.stored_geometry(region, stored) {
                Ok(geometry) => geometry,
                Err(e) => return skip_for(e),
            };
            let record = ledger_row(task, filename, &geometry);
            return match self.ledger.append(&record) {
                Ok(_) => TaskOutcome::Reclaimed(record),
                Err(e) => TaskOutcome::Failed(e.to_string()),
            };
        }

        let extracted = match self.executor.execute(region) {
            Ok(extracted) => extracted,
            Err(e) => return skip_for(e),
        };

        // The row goes in only after the file is durably stored.
        if let Err(e) = self.organizer.store(relative, &extracted.image.bytes) {
            return TaskOutcome::Failed(e.to_string());
        }
        let record = ledger_row(task, filename, &extracted.descriptor);
        match self.ledger.append(&record) {
            Ok(_) => TaskOutcome::Extracted(record),
            Err(e) => TaskOutcome::Failed(e.to_string()),
        }
    }
}

fn skip_for(err: ExtractError) -> TaskOutcome {
    let reason = match err {
        ExtractError::Fetch(e) if e.is_transient() => SkipReason::FetchRetriesExhausted(e),
        ExtractError::Fetch(e) => SkipReason::FetchPermanent(e),
        ExtractError::Geometry(e) => SkipReason::Geometry(e),
        ExtractError::Encode(e) => SkipReason::Encode(e.to_string()),
    };
    TaskOutcome::Skipped(reason)
}

/// Ledger row for `task`, with the geometry that was (or would have been) cut.
fn ledger_row(
    task: &ExtractionTask,
    filename: String,
    geometry: &RegionDescriptor,
) -> ExtractionRecord {
    ExtractionRecord {
        filename,
        directory: task.class_dir.clone(),
        class: task.class.clone(),
        manuscript: geometry.manuscript.clone(),
        page: geometry.page_id.clone(),
        x: geometry.x,
        y: geometry.y,
        width: geometry.width,
        height: geometry.height,
        source_url: task.source.source_key(),
    }
}
