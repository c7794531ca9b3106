//! Detector strategies. Each runs the full candidate → validate → assemble
//! chain its own way and returns an independent span set for consensus.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::assemble::{link_spans, BoundaryAssembler, DuplicateReport};
use super::candidates::{body_preview, text_supports_number, CandidateGenerator};
use super::context::ContextValidator;
use super::ordering::{OrderingDrop, OrderingFilter};
use crate::config::EngineConfig;
use crate::pipeline::completion::{
    build_scan_prompt, parse_header_list, CompletionClient, SCAN_SYSTEM_PROMPT,
};
use crate::pipeline::document::Document;
use crate::pipeline::escalation::cache::{CacheMode, RepairCache};
use crate::pipeline::types::{BoundaryCandidate, BoundarySpan, DetectionMethod, TextUnit};

/// Confidence of a header claimed by the model scan and confirmed in the text.
const MODEL_SCAN_CONFIDENCE: f32 = 0.75;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    /// Previously certified spans supplied by the caller.
    Seeded,
    /// Structure hints plus centering.
    LayoutScan,
    /// Text patterns only.
    CodeScan,
    /// Completion-model header scan over page batches.
    ModelScan,
}

impl fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Seeded => write!(f, "seeded"),
            Self::LayoutScan => write!(f, "layout_scan"),
            Self::CodeScan => write!(f, "code_scan"),
            Self::ModelScan => write!(f, "model_scan"),
        }
    }
}

/// Output of one detector over one document.
#[derive(Debug, Clone)]
pub struct DetectorRun {
    pub detector: DetectorKind,
    pub spans: Vec<BoundarySpan>,
    pub duplicates: Vec<DuplicateReport>,
    pub ordering_drops: Vec<OrderingDrop>,
    pub candidates: usize,
}

impl DetectorRun {
    pub fn empty(detector: DetectorKind) -> Self {
        Self {
            detector,
            spans: Vec::new(),
            duplicates: Vec::new(),
            ordering_drops: Vec::new(),
            candidates: 0,
        }
    }

    pub fn summary(&self) -> DetectorSummary {
        DetectorSummary {
            detector: self.detector,
            candidates: self.candidates,
            spans: self.spans.len(),
            duplicates: self.duplicates.len(),
            ordering_drops: self.ordering_drops.len(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DetectorSummary {
    pub detector: DetectorKind,
    pub candidates: usize,
    pub spans: usize,
    pub duplicates: usize,
    pub ordering_drops: usize,
}

pub trait BoundaryDetector: Send + Sync {
    fn kind(&self) -> DetectorKind;

    fn detect(&self, doc: &Document, config: &EngineConfig) -> DetectorRun;
}

/// Context checks, ordering filter, then assembly.
fn finish_scan(
    doc: &Document,
    config: &EngineConfig,
    kind: DetectorKind,
    candidates: Vec<BoundaryCandidate>,
    centering: bool,
) -> DetectorRun {
    let generated = candidates.len();

    let validator = ContextValidator::new(&config.validator);
    let validator = if centering {
        validator
    } else {
        validator.without_centering()
    };
    let validated = validator.filter(doc, candidates);

    let ordering = OrderingFilter::new(config.validator.ordering_page_threshold).apply(validated);
    let assembly = BoundaryAssembler::new(&config.assembler, kind).assemble(doc, ordering.kept);

    tracing::info!(
        detector = %kind,
        candidates = generated,
        spans = assembly.spans.len(),
        duplicates = assembly.duplicates.len(),
        ordering_drops = ordering.dropped.len(),
        "Detector run complete"
    );

    DetectorRun {
        detector: kind,
        spans: assembly.spans,
        duplicates: assembly.duplicates,
        ordering_drops: ordering.dropped,
        candidates: generated,
    }
}

// ──────────────────────────────────────────────
// Code and layout scans
// ──────────────────────────────────────────────

/// Text patterns and glyph expansion, ignoring upstream layout.
pub struct CodeScanDetector;

impl BoundaryDetector for CodeScanDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::CodeScan
    }

    fn detect(&self, doc: &Document, config: &EngineConfig) -> DetectorRun {
        let candidates = CandidateGenerator::new(&config.generator, config.range)
            .without_structure_hints()
            .generate(doc);
        finish_scan(doc, config, self.kind(), candidates, false)
    }
}

/// Text patterns plus structure hints and the centering check.
pub struct LayoutScanDetector;

impl BoundaryDetector for LayoutScanDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::LayoutScan
    }

    fn detect(&self, doc: &Document, config: &EngineConfig) -> DetectorRun {
        let candidates = CandidateGenerator::new(&config.generator, config.range).generate(doc);
        finish_scan(doc, config, self.kind(), candidates, config.validator.centering_enabled)
    }
}

// ──────────────────────────────────────────────
// Seeded
// ──────────────────────────────────────────────

/// Re-certifies previously certified spans against the current document.
pub struct SeededDetector {
    spans: Vec<BoundarySpan>,
}

impl SeededDetector {
    pub fn new(spans: Vec<BoundarySpan>) -> Self {
        Self { spans }
    }
}

impl BoundaryDetector for SeededDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Seeded
    }

    fn detect(&self, doc: &Document, config: &EngineConfig) -> DetectorRun {
        let mut skipped = 0usize;
        let spans: Vec<BoundarySpan> = self
            .spans
            .iter()
            .filter(|s| {
                let keep = config.range.contains(s.section_id)
                    && doc.get(&s.start_element_id).is_some_and(|u| doc.is_gameplay(u.page));
                if !keep {
                    skipped += 1;
                }
                keep
            })
            .cloned()
            .map(|mut s| {
                s.detector = DetectorKind::Seeded;
                if let DetectionMethod::Seeded { prior_confidence } = &mut s.evidence {
                    if *prior_confidence == 0.0 {
                        *prior_confidence = s.confidence;
                    }
                }
                s
            })
            .collect();

        if skipped > 0 {
            tracing::warn!(skipped, "Seed spans with unknown or out-of-range starts ignored");
        }

        DetectorRun {
            detector: DetectorKind::Seeded,
            candidates: self.spans.len(),
            spans: link_spans(doc, spans),
            duplicates: Vec::new(),
            ordering_drops: Vec::new(),
        }
    }
}

// ──────────────────────────────────────────────
// Model scan
// ──────────────────────────────────────────────

/// Asks a completion model for headers, one batch of pages per call.
/// Every claim is checked against the unit's own text before use.
pub struct ModelScanDetector {
    client: Arc<dyn CompletionClient>,
    cache: Arc<RepairCache>,
}

impl ModelScanDetector {
    pub fn new(client: Arc<dyn CompletionClient>, cache: Arc<RepairCache>) -> Self {
        Self { client, cache }
    }

    fn scan_batch(
        &self,
        doc: &Document,
        config: &EngineConfig,
        units: &[&TextUnit],
    ) -> Vec<BoundaryCandidate> {
        let model = config.models.scan_model.as_str();
        let prompt = build_scan_prompt(units, config.range);
        let ids: Vec<String> = units.iter().map(|u| u.element_id.clone()).collect();
        let page = units.first().map(|u| u.page).unwrap_or(0);
        let key = RepairCache::key(CacheMode::Scan, model, &prompt, &ids);

        let response = self.cache.get_or_call(page, CacheMode::Scan, model, &key, || {
            self.client.generate(model, &prompt, SCAN_SYSTEM_PROMPT)
        });
        let claims = match response.and_then(|r| parse_header_list(&r)) {
            Ok(claims) => claims,
            Err(e) => {
                tracing::warn!(page, error = %e, "Model scan batch failed, skipping");
                return Vec::new();
            }
        };

        let batch: HashSet<&str> = ids.iter().map(String::as_str).collect();
        claims
            .into_iter()
            .filter_map(|claim| {
                if !batch.contains(claim.element_id.as_str())
                    || !config.range.contains(claim.section_id)
                {
                    return None;
                }
                let idx = doc.index_of(&claim.element_id)?;
                let unit = doc.unit(idx);
                if !text_supports_number(&unit.text, claim.section_id, &config.generator) {
                    tracing::debug!(
                        element = %claim.element_id,
                        section = claim.section_id,
                        "Model claim not supported by unit text"
                    );
                    return None;
                }
                Some(BoundaryCandidate {
                    section_id: claim.section_id,
                    element_id: unit.element_id.clone(),
                    position: unit.position(),
                    page: unit.page,
                    confidence: MODEL_SCAN_CONFIDENCE,
                    method: DetectionMethod::ModelAssisted {
                        model: model.to_string(),
                        raw_text: unit.text.trim().to_string(),
                    },
                    trusted: false,
                    body_preview: body_preview(doc, idx, config.generator.preview_chars),
                })
            })
            .collect()
    }
}

impl BoundaryDetector for ModelScanDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::ModelScan
    }

    fn detect(&self, doc: &Document, config: &EngineConfig) -> DetectorRun {
        let mut pages: Vec<u32> = doc.gameplay_indices().map(|i| doc.unit(i).page).collect();
        pages.dedup();

        let max_chars = config.detectors.model_scan_max_unit_chars;
        let mut candidates = Vec::new();
        for chunk in pages.chunks(config.detectors.model_scan_batch_pages.max(1) as usize) {
            let (Some(&first), Some(&last)) = (chunk.first(), chunk.last()) else {
                continue;
            };
            let units: Vec<&TextUnit> = doc
                .units_in_pages(first, last)
                .iter()
                .filter(|u| doc.is_gameplay(u.page) && doc.repair_mark(&u.element_id).is_none())
                .filter(|u| {
                    let len = u.text.trim().chars().count();
                    len > 0 && len <= max_chars
                })
                .collect();
            if units.is_empty() {
                continue;
            }
            candidates.extend(self.scan_batch(doc, config, &units));
        }

        // Repaired units surface the same way in every detector.
        let generator = CandidateGenerator::new(&config.generator, config.range);
        for idx in doc.gameplay_indices() {
            if doc.repair_mark(&doc.unit(idx).element_id).is_some() {
                candidates.extend(generator.candidates_for_unit(doc, idx));
            }
        }

        finish_scan(doc, config, self.kind(), candidates, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::completion::MockCompletionClient;
    use crate::pipeline::types::StructureKind;

    fn book() -> Document {
        Document::new(
            vec![
                TextUnit::new("a0", 1, 0, "1"),
                TextUnit::new("a1", 1, 1, "You wake in a cell."),
                // Off-centre footer number tagged as furniture.
                TextUnit::new("a2", 1, 2, "2").with_structure(StructureKind::PageFooter, None, 0.9),
                TextUnit::new("b0", 2, 0, "2"),
                TextUnit::new("b1", 2, 1, "A guard appears."),
                TextUnit::new("c0", 3, 0, "3O"),
                TextUnit::new("c1", 3, 1, "Stairs lead down."),
            ],
            vec![],
        )
        .unwrap()
    }

    fn ids(run: &DetectorRun) -> Vec<(u32, &str)> {
        run.spans
            .iter()
            .map(|s| (s.section_id, s.start_element_id.as_str()))
            .collect()
    }

    #[test]
    fn layout_scan_respects_furniture_tags() {
        let config = EngineConfig::default();
        let run = LayoutScanDetector.detect(&book(), &config);
        assert_eq!(ids(&run), vec![(1, "a0"), (2, "b0"), (30, "c0")]);
        assert_eq!(run.detector, DetectorKind::LayoutScan);
    }

    #[test]
    fn code_scan_sees_untagged_duplicates() {
        let config = EngineConfig::default();
        let run = CodeScanDetector.detect(&book(), &config);
        assert_eq!(run.duplicates.len(), 1);
        assert_eq!(run.duplicates[0].section_id, 2);
        assert_eq!(run.duplicates[0].chosen_element_id, "b0");
    }

    #[test]
    fn seeded_detector_keeps_known_starts() {
        let config = EngineConfig::default();
        let doc = book();
        let first = LayoutScanDetector.detect(&doc, &config);
        let mut seeds = first.spans.clone();
        seeds.push(BoundarySpan {
            section_id: 99,
            start_element_id: "vanished".into(),
            ..first.spans[0].clone()
        });

        let run = SeededDetector::new(seeds).detect(&doc, &config);
        assert_eq!(ids(&run), ids(&first));
        assert!(run.spans.iter().all(|s| s.detector == DetectorKind::Seeded));
        assert_eq!(run.spans[0].evidence, first.spans[0].evidence);
    }

    #[test]
    fn model_scan_validates_claims_against_text() {
        let config = EngineConfig::default();
        let client = Arc::new(MockCompletionClient::new(
            r#"{"headers": [
                {"element_id": "a0", "section_id": 1},
                {"element_id": "b0", "section_id": 2},
                {"element_id": "c0", "section_id": 30},
                {"element_id": "c1", "section_id": 31},
                {"element_id": "zz", "section_id": 4}
            ]}"#,
        ));
        let detector = ModelScanDetector::new(client.clone(), Arc::new(RepairCache::in_memory()));
        let run = detector.detect(&book(), &config);
        assert_eq!(ids(&run), vec![(1, "a0"), (2, "b0"), (30, "c0")]);
        assert!(run
            .spans
            .iter()
            .all(|s| s.evidence.label() == "model_assisted"));

        // Second run is served from cache.
        let calls = client.calls();
        detector.detect(&book(), &config);
        assert_eq!(client.calls(), calls);
    }

    #[test]
    fn model_scan_failure_yields_empty_run() {
        let config = EngineConfig::default();
        let detector = ModelScanDetector::new(
            Arc::new(MockCompletionClient::unreachable()),
            Arc::new(RepairCache::in_memory()),
        );
        let run = detector.detect(&book(), &config);
        assert!(run.spans.is_empty());
    }
}
