//! Merge span sets from several detectors into one.
//!
//! The most trusted detector with any spans is primary. A section the
//! primary lacks is taken from a fallback only when the fallback's start
//! sits strictly between the primary's neighbouring sections.

use std::collections::{BTreeMap, HashSet};

use super::assemble::link_spans;
use super::detectors::DetectorRun;
use super::DetectorKind;
use crate::pipeline::document::Document;
use crate::pipeline::types::BoundarySpan;

pub struct ConsensusMerger<'a> {
    trust_order: &'a [DetectorKind],
}

impl<'a> ConsensusMerger<'a> {
    pub fn new(trust_order: &'a [DetectorKind]) -> Self {
        Self { trust_order }
    }

    fn rank(&self, kind: DetectorKind) -> (usize, DetectorKind) {
        let idx = self
            .trust_order
            .iter()
            .position(|k| *k == kind)
            .unwrap_or(self.trust_order.len());
        (idx, kind)
    }

    pub fn merge(&self, doc: &Document, runs: &[DetectorRun]) -> Vec<BoundarySpan> {
        let mut ordered: Vec<&DetectorRun> = runs.iter().filter(|r| !r.spans.is_empty()).collect();
        ordered.sort_by_key(|r| self.rank(r.detector));

        let Some((primary, fallbacks)) = ordered.split_first() else {
            return Vec::new();
        };

        let mut merged: BTreeMap<u32, BoundarySpan> = primary
            .spans
            .iter()
            .map(|s| (s.section_id, s.clone()))
            .collect();
        let mut used_starts: HashSet<String> =
            merged.values().map(|s| s.start_element_id.clone()).collect();

        for run in fallbacks {
            let mut filled = 0usize;
            for span in &run.spans {
                if merged.contains_key(&span.section_id)
                    || used_starts.contains(&span.start_element_id)
                {
                    continue;
                }
                if !fits_between_neighbours(doc, &merged, span) {
                    tracing::debug!(
                        section = span.section_id,
                        detector = %run.detector,
                        "Fallback span outside its neighbours, skipped"
                    );
                    continue;
                }
                used_starts.insert(span.start_element_id.clone());
                merged.insert(span.section_id, span.clone());
                filled += 1;
            }
            if filled > 0 {
                tracing::info!(
                    detector = %run.detector,
                    primary = %primary.detector,
                    filled,
                    "Fallback detector filled gaps"
                );
            }
        }

        link_spans(doc, merged.into_values().collect())
    }
}

fn fits_between_neighbours(
    doc: &Document,
    merged: &BTreeMap<u32, BoundarySpan>,
    span: &BoundarySpan,
) -> bool {
    let Some(position) = doc.position_of(&span.start_element_id) else {
        return false;
    };
    let prev = merged
        .range(..span.section_id)
        .next_back()
        .and_then(|(_, s)| doc.position_of(&s.start_element_id));
    let next = merged
        .range(span.section_id + 1..)
        .next()
        .and_then(|(_, s)| doc.position_of(&s.start_element_id));

    prev.map_or(true, |p| p < position) && next.map_or(true, |n| position < n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{DetectionMethod, TextUnit};

    fn doc() -> Document {
        let units = (1..=6)
            .map(|p| TextUnit::new(format!("u{p}"), p, 0, "x"))
            .collect();
        Document::new(units, vec![]).unwrap()
    }

    fn span(section_id: u32, element: &str, detector: DetectorKind) -> BoundarySpan {
        BoundarySpan {
            section_id,
            start_element_id: element.into(),
            end_element_id: None,
            start_page: 0,
            end_page: 0,
            confidence: 0.7,
            evidence: DetectionMethod::Seeded { prior_confidence: 0.7 },
            detector,
            macro_section: None,
        }
    }

    fn run(detector: DetectorKind, spans: Vec<BoundarySpan>) -> DetectorRun {
        DetectorRun {
            detector,
            spans,
            ..DetectorRun::empty(detector)
        }
    }

    const ORDER: &[DetectorKind] = &[
        DetectorKind::Seeded,
        DetectorKind::LayoutScan,
        DetectorKind::CodeScan,
    ];

    #[test]
    fn fallback_fills_gap_between_neighbours() {
        let d = doc();
        let layout = run(
            DetectorKind::LayoutScan,
            vec![span(1, "u1", DetectorKind::LayoutScan), span(3, "u4", DetectorKind::LayoutScan)],
        );
        let code = run(
            DetectorKind::CodeScan,
            vec![span(2, "u2", DetectorKind::CodeScan), span(3, "u3", DetectorKind::CodeScan)],
        );
        let merged = ConsensusMerger::new(ORDER).merge(&d, &[code, layout]);

        let got: Vec<(u32, &str, DetectorKind)> = merged
            .iter()
            .map(|s| (s.section_id, s.start_element_id.as_str(), s.detector))
            .collect();
        assert_eq!(
            got,
            vec![
                (1, "u1", DetectorKind::LayoutScan),
                (2, "u2", DetectorKind::CodeScan),
                (3, "u4", DetectorKind::LayoutScan),
            ]
        );
        assert_eq!(merged[1].end_element_id.as_deref(), Some("u4"));
    }

    #[test]
    fn fallback_out_of_place_is_rejected() {
        let d = doc();
        let layout = run(
            DetectorKind::LayoutScan,
            vec![span(1, "u1", DetectorKind::LayoutScan), span(3, "u2", DetectorKind::LayoutScan)],
        );
        let code = run(DetectorKind::CodeScan, vec![span(2, "u5", DetectorKind::CodeScan)]);
        let merged = ConsensusMerger::new(ORDER).merge(&d, &[layout, code]);
        assert_eq!(merged.len(), 2);
        assert!(merged.iter().all(|s| s.section_id != 2));
    }

    #[test]
    fn empty_primary_defers_to_next_detector() {
        let d = doc();
        let layout = DetectorRun::empty(DetectorKind::LayoutScan);
        let code = run(DetectorKind::CodeScan, vec![span(1, "u1", DetectorKind::CodeScan)]);
        let merged = ConsensusMerger::new(ORDER).merge(&d, &[layout, code]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].detector, DetectorKind::CodeScan);
    }

    #[test]
    fn unknown_start_elements_dropped() {
        let d = doc();
        let seeded = run(
            DetectorKind::Seeded,
            vec![span(1, "u1", DetectorKind::Seeded), span(2, "gone", DetectorKind::Seeded)],
        );
        let merged = ConsensusMerger::new(ORDER).merge(&d, &[seeded]);
        assert_eq!(merged.len(), 1);
    }
}
