//! Coverage check over a certified span set.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::config::{EngineConfig, SectionRange};
use crate::pipeline::detection::assemble::out_of_order_ids;
use crate::pipeline::types::BoundarySpan;

/// Result of one coverage evaluation. A failing report is a normal outcome.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct CoverageReport {
    pub range: Option<SectionRange>,
    pub required: u32,
    pub known_missing: Vec<u32>,
    /// Distinct in-range ids with a span.
    pub found_count: u32,
    /// In-range ids with no span, allow-list subtracted.
    pub missing: Vec<u32>,
    /// Allow-listed ids that indeed have no span.
    pub absent_known: Vec<u32>,
    pub out_of_range: Vec<u32>,
    /// In-range ids whose span breaks ascending order. Counted as missing.
    pub out_of_order: Vec<u32>,
    pub passed: bool,
}

impl CoverageReport {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

pub struct CoverageValidator<'a> {
    config: &'a EngineConfig,
}

impl<'a> CoverageValidator<'a> {
    pub fn new(config: &'a EngineConfig) -> Self {
        Self { config }
    }

    /// `spans` must be in document order, as detection links them.
    pub fn evaluate(&self, spans: &[BoundarySpan]) -> CoverageReport {
        let range = self.config.range;
        let known: BTreeSet<u32> = self
            .config
            .known_missing
            .iter()
            .copied()
            .filter(|id| range.contains(*id))
            .collect();

        let (in_range, stray): (Vec<BoundarySpan>, Vec<BoundarySpan>) =
            spans.iter().cloned().partition(|s| range.contains(s.section_id));
        let out_of_range: BTreeSet<u32> = stray.iter().map(|s| s.section_id).collect();
        let out_of_order = out_of_order_ids(&in_range);
        let found: BTreeSet<u32> = in_range
            .iter()
            .map(|s| s.section_id)
            .filter(|id| !out_of_order.contains(id))
            .collect();

        let mut missing = Vec::new();
        let mut absent_known = Vec::new();
        for id in range.iter() {
            if found.contains(&id) {
                continue;
            }
            if known.contains(&id) {
                absent_known.push(id);
            } else {
                missing.push(id);
            }
        }

        let found_count = found.len() as u32;
        let required = self.config.required_coverage();
        let passed = out_of_order.is_empty()
            && match self.config.min_coverage {
                Some(min) => found_count >= min,
                None => missing.is_empty(),
            };

        if !out_of_order.is_empty() {
            tracing::debug!(ids = ?out_of_order, "Spans out of section order");
        }
        if !passed {
            tracing::debug!(
                found = found_count,
                required,
                missing = missing.len(),
                "Coverage below threshold"
            );
        }

        CoverageReport {
            range: Some(range),
            required,
            known_missing: known.into_iter().collect(),
            found_count,
            missing,
            absent_known,
            out_of_range: out_of_range.into_iter().collect(),
            out_of_order,
            passed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::detection::DetectorKind;
    use crate::pipeline::types::DetectionMethod;

    fn span(id: u32) -> BoundarySpan {
        BoundarySpan {
            section_id: id,
            start_element_id: format!("e{id}"),
            end_element_id: None,
            start_page: id,
            end_page: id,
            confidence: 0.7,
            evidence: DetectionMethod::Seeded { prior_confidence: 0.7 },
            detector: DetectorKind::CodeScan,
            macro_section: None,
        }
    }

    fn config(max: u32) -> EngineConfig {
        EngineConfig {
            range: SectionRange { min: 1, max },
            ..EngineConfig::default()
        }
    }

    #[test]
    fn full_coverage_passes() {
        let config = config(3);
        let report = CoverageValidator::new(&config).evaluate(&[span(1), span(2), span(3)]);
        assert!(report.passed);
        assert_eq!(report.found_count, 3);
        assert!(report.missing.is_empty());
    }

    #[test]
    fn allow_list_is_subtracted() {
        let mut config = config(5);
        config.known_missing = vec![4];
        let spans = [span(1), span(2), span(3), span(5)];
        let report = CoverageValidator::new(&config).evaluate(&spans);
        assert!(report.passed);
        assert_eq!(report.absent_known, vec![4]);
        assert_eq!(report.required, 4);
    }

    #[test]
    fn gaps_and_out_of_range_are_reported() {
        let config = config(5);
        let report = CoverageValidator::new(&config).evaluate(&[span(1), span(3), span(9)]);
        assert!(!report.passed);
        assert_eq!(report.missing, vec![2, 4, 5]);
        assert_eq!(report.out_of_range, vec![9]);
        assert_eq!(report.found_count, 2);
    }

    #[test]
    fn inverted_ids_count_as_missing() {
        let config = config(3);
        let report = CoverageValidator::new(&config).evaluate(&[span(1), span(3), span(2)]);
        assert!(!report.passed);
        assert_eq!(report.out_of_order, vec![3]);
        assert_eq!(report.missing, vec![3]);
        assert_eq!(report.found_count, 2);
    }

    #[test]
    fn inversion_fails_even_under_threshold() {
        let mut config = config(5);
        config.min_coverage = Some(2);
        let spans = [span(1), span(4), span(2), span(3)];
        let report = CoverageValidator::new(&config).evaluate(&spans);
        assert_eq!(report.out_of_order, vec![4]);
        assert_eq!(report.found_count, 3);
        assert!(!report.passed);
    }

    #[test]
    fn stray_out_of_range_ids_do_not_break_order() {
        let config = config(3);
        let spans = [span(1), span(250), span(2), span(3)];
        let report = CoverageValidator::new(&config).evaluate(&spans);
        assert!(report.out_of_order.is_empty());
        assert_eq!(report.out_of_range, vec![250]);
        assert!(report.passed);
    }

    #[test]
    fn explicit_threshold_tolerates_gaps() {
        let mut config = config(5);
        config.min_coverage = Some(3);
        let report = CoverageValidator::new(&config).evaluate(&[span(1), span(2), span(4)]);
        assert!(report.passed);
        assert_eq!(report.missing, vec![3, 5]);
    }
}
