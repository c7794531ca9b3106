//! Boundary detection: candidates, context checks, assembly, consensus.

pub mod glyph;
pub mod candidates;
pub mod context;
pub mod ordering;
pub mod assemble;
pub mod consensus;
pub mod detectors;

pub use assemble::{DuplicateReport, OrderingViolation};
pub use consensus::ConsensusMerger;
pub use detectors::*;
pub use ordering::OrderingDrop;

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};

use rayon::prelude::*;

use crate::config::EngineConfig;
use crate::pipeline::document::Document;
use crate::pipeline::types::BoundarySpan;

/// Merged result of every detector over one document.
#[derive(Debug, Clone, Default)]
pub struct DetectionPass {
    pub spans: Vec<BoundarySpan>,
    pub runs: Vec<DetectorRun>,
    pub violations: Vec<OrderingViolation>,
}

impl DetectionPass {
    /// One report per section number. The report of the detector whose span
    /// survived the merge wins; otherwise the first run's report is kept.
    pub fn duplicates(&self) -> impl Iterator<Item = &DuplicateReport> + '_ {
        let survivors: HashMap<u32, DetectorKind> =
            self.spans.iter().map(|s| (s.section_id, s.detector)).collect();
        let mut by_section: BTreeMap<u32, &DuplicateReport> = BTreeMap::new();
        for report in self.runs.iter().flat_map(|r| r.duplicates.iter()) {
            let survived = survivors.get(&report.section_id) == Some(&report.detector);
            match by_section.entry(report.section_id) {
                Entry::Vacant(slot) => {
                    slot.insert(report);
                }
                Entry::Occupied(mut slot) => {
                    if survived {
                        slot.insert(report);
                    }
                }
            }
        }
        by_section.into_values()
    }

    pub fn ordering_drops(&self) -> impl Iterator<Item = (DetectorKind, &OrderingDrop)> {
        self.runs
            .iter()
            .flat_map(|r| r.ordering_drops.iter().map(move |d| (r.detector, d)))
    }

    pub fn summaries(&self) -> Vec<DetectorSummary> {
        self.runs.iter().map(DetectorRun::summary).collect()
    }

    pub fn section_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.spans.iter().map(|s| s.section_id)
    }
}

/// Run every detector in parallel and merge in trust order.
///
/// Detectors only read the document, so completion order never affects
/// the merged result.
pub fn detect_all(
    doc: &Document,
    config: &EngineConfig,
    detectors: &[Box<dyn BoundaryDetector>],
) -> DetectionPass {
    let _span =
        tracing::info_span!("detect", units = doc.len(), detectors = detectors.len()).entered();

    let mut runs: Vec<DetectorRun> = detectors
        .par_iter()
        .map(|detector| {
            let _span = tracing::info_span!("detector", kind = %detector.kind()).entered();
            detector.detect(doc, config)
        })
        .collect();
    runs.sort_by_key(|r| r.detector);

    let spans = ConsensusMerger::new(&config.detectors.trust_order).merge(doc, &runs);
    let violations = assemble::ordering_violations(&spans);

    tracing::info!(spans = spans.len(), violations = violations.len(), "Detection pass merged");

    DetectionPass {
        spans,
        runs,
        violations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::TextUnit;

    #[test]
    fn parallel_detectors_merge_deterministically() {
        let doc = Document::new(
            vec![
                TextUnit::new("a", 1, 0, "1"),
                TextUnit::new("b", 1, 1, "The road forks."),
                TextUnit::new("c", 2, 0, "2"),
                TextUnit::new("d", 2, 1, "A bridge."),
            ],
            vec![],
        )
        .unwrap();
        let config = EngineConfig::default();
        let forward: Vec<Box<dyn BoundaryDetector>> =
            vec![Box::new(LayoutScanDetector), Box::new(CodeScanDetector)];
        let backward: Vec<Box<dyn BoundaryDetector>> =
            vec![Box::new(CodeScanDetector), Box::new(LayoutScanDetector)];

        let a = detect_all(&doc, &config, &forward);
        let b = detect_all(&doc, &config, &backward);
        assert_eq!(a.spans, b.spans);
        assert_eq!(a.spans.len(), 2);
        assert!(a.spans.iter().all(|s| s.detector == DetectorKind::LayoutScan));
        assert_eq!(a.summaries().len(), 2);
    }

    #[test]
    fn repeated_number_is_reported_once() {
        let doc = Document::new(
            vec![
                TextUnit::new("a", 1, 0, "1"),
                TextUnit::new("b", 1, 1, "The road forks."),
                TextUnit::new("c", 2, 0, "2"),
                TextUnit::new("d", 2, 1, "A bridge spans the river."),
                TextUnit::new("e", 2, 2, "2"),
                TextUnit::new("f", 2, 3, "Boats."),
                TextUnit::new("g", 3, 0, "3"),
                TextUnit::new("h", 3, 1, "The far bank."),
            ],
            vec![],
        )
        .unwrap();
        let config = EngineConfig::default();
        let detectors: Vec<Box<dyn BoundaryDetector>> =
            vec![Box::new(LayoutScanDetector), Box::new(CodeScanDetector)];

        let pass = detect_all(&doc, &config, &detectors);
        let raw = pass.runs.iter().map(|r| r.duplicates.len()).sum::<usize>();
        assert!(raw >= 1);

        let reports: Vec<&DuplicateReport> = pass.duplicates().collect();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].section_id, 2);
        let two = pass.spans.iter().find(|s| s.section_id == 2).unwrap();
        if raw > 1 {
            assert_eq!(reports[0].detector, two.detector);
        }
        assert_eq!(reports[0].chosen_element_id, two.start_element_id);
    }
}
