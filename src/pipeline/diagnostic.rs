//! Run artifacts: the certified spans file plus a report directory.
//!
//! **Output structure**:
//! ```text
//! {output}                    spans, one BoundarySpan per line
//! {report_dir}/
//!   coverage.json
//!   missing.json
//!   duplicates.json
//!   ordering.json
//!   ledger.json
//!   summary.json
//! ```
//!
//! The report directory defaults to `{output stem}-report` next to the
//! spans file. Everything is written before the caller decides the exit code.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::config;
use crate::pipeline::processor::{EngineError, EngineOutcome};

// ──────────────────────────────────────────────
// Directory resolution
// ──────────────────────────────────────────────

const REPORT_SUFFIX: &str = "-report";

/// `out/book.jsonl` → `out/book-report`.
pub fn default_report_dir(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| config::APP_NAME.to_string());
    output
        .parent()
        .unwrap_or_else(|| Path::new(""))
        .join(format!("{stem}{REPORT_SUFFIX}"))
}

fn create_dir(dir: &Path) -> Result<(), EngineError> {
    if dir.as_os_str().is_empty() {
        return Ok(());
    }
    std::fs::create_dir_all(dir).map_err(|source| EngineError::Output {
        path: dir.to_path_buf(),
        source,
    })
}

// ──────────────────────────────────────────────
// Writers
// ──────────────────────────────────────────────

/// Write a pretty-printed JSON artifact.
pub fn dump_json<T: Serialize>(
    dir: &Path,
    filename: &str,
    value: &T,
) -> Result<PathBuf, EngineError> {
    let path = dir.join(filename);
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(&path, json.as_bytes()).map_err(|source| EngineError::Output {
        path: path.clone(),
        source,
    })?;
    tracing::debug!(path = %path.display(), size = json.len(), "Report written");
    Ok(path)
}

/// Write one JSON value per line.
pub fn dump_jsonl<T: Serialize>(path: &Path, values: &[T]) -> Result<(), EngineError> {
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    let io_err = |source| EngineError::Output {
        path: path.to_path_buf(),
        source,
    };
    let mut out = BufWriter::new(File::create(path).map_err(io_err)?);
    for value in values {
        serde_json::to_writer(&mut out, value)?;
        out.write_all(b"\n").map_err(io_err)?;
    }
    out.flush().map_err(io_err)?;
    tracing::debug!(path = %path.display(), lines = values.len(), "JSONL written");
    Ok(())
}

// ──────────────────────────────────────────────
// Bundle
// ──────────────────────────────────────────────

#[derive(Serialize)]
struct OrderingReport<'a, V, D> {
    violations: &'a [V],
    drops: &'a [D],
}

#[derive(Serialize)]
struct SummaryCounts {
    spans: usize,
    required: u32,
    missing: usize,
    duplicates: usize,
    violations: usize,
    ordering_drops: usize,
    ledger_entries: usize,
}

#[derive(Serialize)]
struct Summary<'a> {
    run_id: String,
    started_at: String,
    duration_ms: u64,
    state: String,
    version: &'static str,
    counts: SummaryCounts,
    passed: bool,
    attempts: u32,
    repairs_applied: usize,
    detectors: &'a [crate::pipeline::detection::DetectorSummary],
}

/// Write spans and every report file. Returns the report directory used.
pub fn write_bundle(
    outcome: &EngineOutcome,
    output: &Path,
    report_dir: Option<&Path>,
) -> Result<PathBuf, EngineError> {
    dump_jsonl(output, &outcome.spans)?;

    let dir = report_dir
        .map(Path::to_path_buf)
        .unwrap_or_else(|| default_report_dir(output));
    create_dir(&dir)?;

    dump_json(&dir, "coverage.json", &outcome.coverage)?;
    dump_json(&dir, "missing.json", &outcome.missing)?;
    dump_json(&dir, "duplicates.json", &outcome.duplicates)?;
    dump_json(
        &dir,
        "ordering.json",
        &OrderingReport {
            violations: &outcome.violations,
            drops: &outcome.ordering_drops,
        },
    )?;
    dump_json(&dir, "ledger.json", &outcome.ledger)?;

    let summary = Summary {
        run_id: outcome.run_id.to_string(),
        started_at: outcome.started_at.to_rfc3339(),
        duration_ms: outcome.duration_ms,
        state: outcome.state.to_string(),
        version: config::APP_VERSION,
        counts: SummaryCounts {
            spans: outcome.spans.len(),
            required: outcome.coverage.required,
            missing: outcome.coverage.missing.len(),
            duplicates: outcome.duplicates.len(),
            violations: outcome.violations.len(),
            ordering_drops: outcome.ordering_drops.len(),
            ledger_entries: outcome.ledger.len(),
        },
        passed: outcome.passed(),
        attempts: outcome.attempts,
        repairs_applied: outcome.repairs_applied,
        detectors: &outcome.detectors,
    };
    dump_json(&dir, "summary.json", &summary)?;

    tracing::info!(
        output = %output.display(),
        report_dir = %dir.display(),
        spans = outcome.spans.len(),
        "Run artifacts written"
    );
    Ok(dir)
}

// ──────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::coverage::CoverageReport;
    use crate::pipeline::detection::DetectorKind;
    use crate::pipeline::escalation::{EscalationState, ResolutionLedger};
    use crate::pipeline::types::{BoundarySpan, DetectionMethod};

    fn outcome() -> EngineOutcome {
        let span = BoundarySpan {
            section_id: 1,
            start_element_id: "p2-0".into(),
            end_element_id: None,
            start_page: 2,
            end_page: 3,
            confidence: 0.9,
            evidence: DetectionMethod::Seeded { prior_confidence: 0.9 },
            detector: DetectorKind::Seeded,
            macro_section: None,
        };
        EngineOutcome {
            run_id: uuid::Uuid::new_v4(),
            started_at: chrono::Utc::now(),
            duration_ms: 12,
            state: EscalationState::Unresolved,
            spans: vec![
                span.clone(),
                BoundarySpan {
                    section_id: 2,
                    start_element_id: "p3-0".into(),
                    ..span
                },
            ],
            coverage: CoverageReport {
                required: 3,
                found_count: 2,
                missing: vec![3],
                ..CoverageReport::default()
            },
            ledger: ResolutionLedger::default(),
            missing: vec![],
            duplicates: vec![],
            violations: vec![],
            ordering_drops: vec![],
            detectors: vec![],
            attempts: 3,
            repairs_applied: 0,
        }
    }

    #[test]
    fn default_report_dir_sits_next_to_output() {
        assert_eq!(
            default_report_dir(Path::new("out/book.jsonl")),
            PathBuf::from("out/book-report")
        );
        assert_eq!(default_report_dir(Path::new("spans.jsonl")), PathBuf::from("spans-report"));
    }

    #[test]
    fn bundle_writes_spans_and_reports() {
        let tmp = tempfile::tempdir().unwrap();
        let output = tmp.path().join("nested").join("spans.jsonl");

        let dir = write_bundle(&outcome(), &output, None).unwrap();
        assert_eq!(dir, tmp.path().join("nested").join("spans-report"));

        let spans = std::fs::read_to_string(&output).unwrap();
        let lines: Vec<&str> = spans.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: BoundarySpan = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.section_id, 1);

        for name in [
            "coverage.json",
            "missing.json",
            "duplicates.json",
            "ordering.json",
            "ledger.json",
            "summary.json",
        ] {
            assert!(dir.join(name).exists(), "{name} missing");
        }

        let read = |name: &str| std::fs::read_to_string(dir.join(name)).unwrap();
        let summary: serde_json::Value = serde_json::from_str(&read("summary.json")).unwrap();
        assert_eq!(summary["state"], "unresolved");
        assert_eq!(summary["passed"], false);
        assert_eq!(summary["counts"]["missing"], 1);
        assert_eq!(summary["attempts"], 3);

        let ordering: serde_json::Value = serde_json::from_str(&read("ordering.json")).unwrap();
        assert!(ordering["violations"].as_array().unwrap().is_empty());
    }

    #[test]
    fn explicit_report_dir_is_used() {
        let tmp = tempfile::tempdir().unwrap();
        let reports = tmp.path().join("reports");
        let output = tmp.path().join("spans.jsonl");
        let dir = write_bundle(&outcome(), &output, Some(&reports)).unwrap();
        assert_eq!(dir, reports);
        assert!(reports.join("coverage.json").exists());
    }

    #[test]
    fn unwritable_output_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        let result = write_bundle(&outcome(), &blocker.join("spans.jsonl"), None);
        assert!(matches!(result, Err(EngineError::Output { .. })));
    }
}
