//! CLI output formatting.
//!
//! Every report is built by a pure `format_*` function returning lines, with a
//! thin `print_*` wrapper for stdout. Tests assert on the lines directly.
//!
//! # Output Format
//!
//! ## Analyze
//!
//! ```text
//! Classes
//!     Virga: 2 regions
//!     Pes: 1 region (1 template)
//!         Source: viewer
//!
//! Dropped
//!     record #3 has no class
//!
//! 3 regions in 2 classes from 3 of 4 records, 1 duplicate
//! ```
//!
//! ## Extract progress
//!
//! ```text
//! Virga (2 regions)
//!     000 Virga/page007_000.jpg: extracted 60x80
//!     001 Virga/page007_001.jpg: skipped (already-extracted): already extracted
//! ```
//!
//! ## Summary
//!
//! ```text
//! Attempted: 2
//! Extracted: 1
//! Skipped: 1
//!     already-extracted: 1
//! Ledger: 2 rows
//! State: DONE
//! ```

use crate::annotations::Analysis;
use crate::pipeline::{AbortReason, RunSummary, TaskEvent, TaskOutcome};

/// Indentation for nesting level `depth` (four spaces per level).
fn indent(depth: usize) -> String {
    "    ".repeat(depth)
}

fn count(n: usize, singular: &str, plural: &str) -> String {
    if n == 1 {
        format!("{n} {singular}")
    } else {
        format!("{n} {plural}")
    }
}

// ============================================================================
// Analyze
// ============================================================================

/// Format the `--analyze-only` report.
pub fn format_analysis(analysis: &Analysis) -> Vec<String> {
    let mut lines = vec!["Classes".to_string()];
    if analysis.classes.is_empty() {
        lines.push(format!("{}(none)", indent(1)));
    }
    for class in &analysis.classes {
        let mut line = format!(
            "{}{}: {}",
            indent(1),
            class.class,
            count(class.entries, "region", "regions")
        );
        if class.template_entries > 0 {
            line.push_str(&format!(" ({} template)", class.template_entries));
        }
        lines.push(line);
        for source in &class.sources {
            lines.push(format!("{}Source: {}", indent(2), source));
        }
    }

    if !analysis.dropped.is_empty() {
        lines.push(String::new());
        lines.push("Dropped".to_string());
        for reason in &analysis.dropped {
            lines.push(format!("{}{}", indent(1), reason));
        }
    }

    lines.push(String::new());
    let mut total = format!(
        "{} in {} from {} of {}",
        count(analysis.total_entries(), "region", "regions"),
        count(analysis.classes.len(), "class", "classes"),
        analysis.valid_records,
        count(analysis.total_records, "record", "records"),
    );
    if analysis.duplicates > 0 {
        total.push_str(&format!(
            ", {}",
            count(analysis.duplicates, "duplicate", "duplicates")
        ));
    }
    lines.push(total);
    lines
}

pub fn print_analysis(analysis: &Analysis) {
    for line in format_analysis(analysis) {
        println!("{}", line);
    }
}

// ============================================================================
// Extract progress
// ============================================================================

/// Format a single extraction progress event as display lines.
pub fn format_task_event(event: &TaskEvent) -> Vec<String> {
    match event {
        TaskEvent::ClassQueued { class, tasks } => {
            vec![format!("{} ({})", class, count(*tasks, "region", "regions"))]
        }
        TaskEvent::TaskFinished {
            sequence_index,
            output,
            outcome,
            ..
        } => {
            let status = match outcome {
                TaskOutcome::Extracted(r) => format!("extracted {}x{}", r.width, r.height),
                TaskOutcome::Reclaimed(_) => "reclaimed".to_string(),
                TaskOutcome::Skipped(reason) => format!("skipped ({}): {}", reason.label(), reason),
                TaskOutcome::Failed(msg) => format!("FAILED: {msg}"),
                TaskOutcome::Cancelled => "cancelled".to_string(),
            };
            let target = output.as_deref().unwrap_or("-");
            vec![format!(
                "{}{:03} {}: {}",
                indent(1),
                sequence_index,
                target,
                status
            )]
        }
    }
}

// ============================================================================
// Summary
// ============================================================================

/// Format the FINALIZING summary.
pub fn format_summary(summary: &RunSummary) -> Vec<String> {
    let mut lines = vec![
        format!("Attempted: {}", summary.attempted),
        format!("Extracted: {}", summary.extracted),
    ];
    if summary.reclaimed > 0 {
        lines.push(format!("Reclaimed: {}", summary.reclaimed));
    }
    lines.push(format!("Skipped: {}", summary.skipped_total()));
    for (reason, n) in &summary.skipped {
        lines.push(format!("{}{}: {}", indent(1), reason, n));
    }
    if summary.failed > 0 {
        lines.push(format!("Failed: {}", summary.failed));
    }
    if summary.cancelled > 0 {
        lines.push(format!("Cancelled: {}", summary.cancelled));
    }
    if summary.dropped_records + summary.dropped_entries + summary.duplicates > 0 {
        lines.push(format!(
            "Dropped: {}, {}, {}",
            count(summary.dropped_records, "record", "records"),
            count(summary.dropped_entries, "entry", "entries"),
            count(summary.duplicates, "duplicate", "duplicates"),
        ));
    }
    if summary.unresolved_zones > 0 {
        lines.push(format!("Unresolved MEI zones: {}", summary.unresolved_zones));
    }
    lines.push(format!("Ledger: {}", summary.ledger));
    if let Some(state) = summary.final_state {
        let mut line = format!("State: {state}");
        match &summary.abort {
            Some(AbortReason::Interrupted) => line.push_str(" (interrupted)"),
            Some(AbortReason::WriteFailed(msg)) => line.push_str(&format!(" ({msg})")),
            None => (),
        }
        lines.push(line);
    }
    lines
}

pub fn print_summary(summary: &RunSummary) {
    for line in format_summary(summary) {
        println!("{}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::{ClassSummary, RecordValidationError};
    use crate::ledger::{ExtractionRecord, LedgerStats};
    use crate::pipeline::{PipelineState, SkipReason};

    fn record() -> ExtractionRecord {
        ExtractionRecord {
            filename: "page007_000.jpg".into(),
            directory: "Virga".into(),
            class: "Virga".into(),
            manuscript: "MS73".into(),
            page: "page007".into(),
            x: 120,
            y: 340,
            width: 60,
            height: 80,
            source_url: "https://example.org/x".into(),
        }
    }

    #[test]
    fn indent_levels() {
        assert_eq!(indent(0), "");
        assert_eq!(indent(2), "        ");
    }

    // =========================================================================
    // Analyze
    // =========================================================================

    #[test]
    fn analysis_lists_classes_drops_and_totals() {
        let analysis = Analysis {
            total_records: 4,
            valid_records: 3,
            classes: vec![
                ClassSummary {
                    class: "Virga".into(),
                    entries: 2,
                    template_entries: 0,
                    sources: vec![],
                },
                ClassSummary {
                    class: "Pes".into(),
                    entries: 1,
                    template_entries: 1,
                    sources: vec!["viewer".into()],
                },
            ],
            dropped: vec![RecordValidationError::MissingClass { index: 3 }],
            duplicates: 1,
        };
        let lines = format_analysis(&analysis);
        assert_eq!(
            lines,
            vec![
                "Classes",
                "    Virga: 2 regions",
                "    Pes: 1 region (1 template)",
                "        Source: viewer",
                "",
                "Dropped",
                "    record #3 has no class",
                "",
                "3 regions in 2 classes from 3 of 4 records, 1 duplicate",
            ]
        );
    }

    #[test]
    fn empty_analysis() {
        let lines = format_analysis(&Analysis::default());
        assert_eq!(lines[1], "    (none)");
        assert_eq!(lines.last().unwrap(), "0 regions in 0 classes from 0 of 0 records");
    }

    // =========================================================================
    // Events
    // =========================================================================

    #[test]
    fn class_queued_line() {
        let event = TaskEvent::ClassQueued {
            class: "Virga".into(),
            tasks: 2,
        };
        assert_eq!(format_task_event(&event), vec!["Virga (2 regions)"]);
    }

    #[test]
    fn finished_task_lines() {
        let extracted = TaskEvent::TaskFinished {
            class: "Virga".into(),
            sequence_index: 0,
            output: Some("Virga/page007_000.jpg".into()),
            outcome: TaskOutcome::Extracted(record()),
        };
        assert_eq!(
            format_task_event(&extracted),
            vec!["    000 Virga/page007_000.jpg: extracted 60x80"]
        );

        let skipped = TaskEvent::TaskFinished {
            class: "Virga".into(),
            sequence_index: 12,
            output: Some("Virga/page007_012.jpg".into()),
            outcome: TaskOutcome::Skipped(SkipReason::AlreadyExtracted),
        };
        assert_eq!(
            format_task_event(&skipped),
            vec!["    012 Virga/page007_012.jpg: skipped (already-extracted): already extracted"]
        );

        let cancelled = TaskEvent::TaskFinished {
            class: "Virga".into(),
            sequence_index: 3,
            output: None,
            outcome: TaskOutcome::Cancelled,
        };
        assert_eq!(format_task_event(&cancelled), vec!["    003 -: cancelled"]);
    }

    // =========================================================================
    // Summary
    // =========================================================================

    #[test]
    fn summary_lists_skip_histogram() {
        let mut summary = RunSummary {
            attempted: 3,
            extracted: 1,
            ledger: LedgerStats {
                carried: 0,
                appended: 1,
            },
            final_state: Some(PipelineState::Done),
            ..RunSummary::default()
        };
        summary.skipped.insert("already-extracted", 1);
        summary.skipped.insert("fetch-permanent", 1);

        assert_eq!(
            format_summary(&summary),
            vec![
                "Attempted: 3",
                "Extracted: 1",
                "Skipped: 2",
                "    already-extracted: 1",
                "    fetch-permanent: 1",
                "Ledger: 1 row",
                "State: DONE",
            ]
        );
    }

    #[test]
    fn summary_shows_drops_and_abort() {
        let summary = RunSummary {
            attempted: 2,
            cancelled: 2,
            dropped_records: 1,
            dropped_entries: 2,
            final_state: Some(PipelineState::Aborted),
            abort: Some(AbortReason::Interrupted),
            ..RunSummary::default()
        };
        let lines = format_summary(&summary);
        assert!(lines.contains(&"Cancelled: 2".to_string()));
        assert!(lines.contains(&"Dropped: 1 record, 2 entries, 0 duplicates".to_string()));
        assert_eq!(lines.last().unwrap(), "State: ABORTED (interrupted)");
    }
}
