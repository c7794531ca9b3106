//! Escalation state machine: Detect → Validate → Repair(tier) → Detect,
//! ending in Certified or Unresolved.
//!
//! One attempt runs every configured tier in cost order. Each tier that finds
//! anything sends the loop back through detection on a freshly repaired
//! document before the next tier runs. Attempts are bounded by `max_retries`.

use std::collections::HashMap;
use std::time::Instant;

use super::ledger::{AttemptOutcome, LedgerAttempt, ResolutionLedger};
use super::{
    missing_report, EscalationState, MissingSection, RepairTier, RepairWindow, Repairer,
    TierOutcome,
};
use crate::config::EngineConfig;
use crate::pipeline::coverage::{CoverageReport, CoverageValidator};
use crate::pipeline::detection::DetectionPass;
use crate::pipeline::document::{Document, RepairSet};
use crate::pipeline::report::{EngineEvent, ReportSink};

/// Final state of one escalation run.
#[derive(Debug, Clone)]
pub struct EscalationResult {
    pub state: EscalationState,
    pub pass: DetectionPass,
    /// Document the final pass ran on, with every repair applied.
    pub document: Document,
    pub coverage: CoverageReport,
    pub ledger: ResolutionLedger,
    pub missing: Vec<MissingSection>,
    /// Repair attempts started (0 when the first pass already certified).
    pub attempts: u32,
    pub repairs_applied: usize,
}

pub struct EscalationController<'a> {
    config: &'a EngineConfig,
    repairers: Vec<Box<dyn Repairer + 'a>>,
    sink: &'a dyn ReportSink,
}

impl<'a> EscalationController<'a> {
    /// Tiers always run cheapest first, whatever order they are passed in.
    pub fn new(
        config: &'a EngineConfig,
        mut repairers: Vec<Box<dyn Repairer + 'a>>,
        sink: &'a dyn ReportSink,
    ) -> Self {
        repairers.sort_by_key(|r| r.tier());
        Self {
            config,
            repairers,
            sink,
        }
    }

    pub fn run(
        &self,
        base: &Document,
        detect: impl Fn(&Document) -> DetectionPass,
    ) -> EscalationResult {
        let started = Instant::now();
        let max_retries = self.config.escalation.max_retries;

        let mut state = EscalationState::Detect;
        let mut doc = base.clone();
        let mut repairs = RepairSet::new();
        let mut pass = DetectionPass::default();
        let mut coverage = CoverageReport::default();
        let mut ledger: Option<ResolutionLedger> = None;
        let mut found_by: HashMap<u32, RepairTier> = HashMap::new();
        let mut attempt = 0u32;
        let mut next_tier = 0usize;

        loop {
            tracing::debug!(%state, attempt, "Escalation state");
            self.sink.emit(EngineEvent::StateChanged { state, attempt });

            state = match state {
                EscalationState::Detect => {
                    pass = detect(&doc);
                    self.sink.emit(EngineEvent::DetectionFinished {
                        attempt,
                        spans: pass.spans.len(),
                        duplicates: pass.duplicates().count(),
                        violations: pass.violations.len(),
                    });
                    EscalationState::Validate
                }

                EscalationState::Validate => {
                    coverage = CoverageValidator::new(self.config).evaluate(&pass.spans);
                    self.sink.emit(EngineEvent::CoverageChecked {
                        found: coverage.found_count,
                        required: coverage.required,
                        missing: coverage.missing.len(),
                        passed: coverage.passed,
                    });

                    let ledger = ledger.get_or_insert_with(|| {
                        let mut ledger = ResolutionLedger::new();
                        for &id in &coverage.absent_known {
                            ledger.resolve_absent(id);
                        }
                        ledger
                    });
                    for id in pass.section_ids() {
                        if ledger.is_open(id) && !coverage.missing.contains(&id) {
                            ledger.resolve_found(id, found_by.get(&id).copied());
                        }
                    }
                    for &id in &coverage.missing {
                        ledger.open(id);
                    }

                    if coverage.missing.is_empty() {
                        terminal(coverage.passed)
                    } else if attempt > 0 && next_tier < self.repairers.len() {
                        next_tier += 1;
                        EscalationState::Repair(self.repairers[next_tier - 1].tier())
                    } else if attempt < max_retries && !self.repairers.is_empty() {
                        attempt += 1;
                        next_tier = 1;
                        tracing::info!(
                            attempt,
                            missing = coverage.missing.len(),
                            "Starting repair attempt"
                        );
                        EscalationState::Repair(self.repairers[0].tier())
                    } else {
                        terminal(coverage.passed)
                    }
                }

                EscalationState::Repair(tier) => {
                    let ledger = ledger.get_or_insert_with(ResolutionLedger::new);
                    let found = self.run_tier(
                        tier,
                        attempt,
                        &doc,
                        &pass,
                        &coverage,
                        ledger,
                        &mut repairs,
                        &mut found_by,
                    );
                    if found > 0 {
                        doc = base.with_repairs(&repairs);
                        EscalationState::Detect
                    } else {
                        EscalationState::Validate
                    }
                }

                EscalationState::Certified | EscalationState::Unresolved => break,
            };
        }

        let mut ledger = ledger.unwrap_or_default();
        ledger.close_unresolved();
        let snippet_chars = self.config.escalation.snippet_chars;
        let missing = missing_report(&doc, &pass.spans, &coverage.missing, snippet_chars);

        tracing::info!(
            %state,
            attempts = attempt,
            spans = pass.spans.len(),
            missing = coverage.missing.len(),
            repairs = doc.repair_count(),
            "Escalation finished"
        );
        self.sink.emit(EngineEvent::Finished {
            state,
            spans: pass.spans.len(),
            missing: coverage.missing.len(),
            duration_ms: started.elapsed().as_millis() as u64,
        });

        EscalationResult {
            state,
            repairs_applied: doc.repair_count(),
            pass,
            document: doc,
            coverage,
            ledger,
            missing,
            attempts: attempt,
        }
    }

    /// Run one tier over every missing section. Returns how many were found.
    #[allow(clippy::too_many_arguments)]
    fn run_tier(
        &self,
        tier: RepairTier,
        attempt: u32,
        doc: &Document,
        pass: &DetectionPass,
        coverage: &CoverageReport,
        ledger: &mut ResolutionLedger,
        repairs: &mut RepairSet,
        found_by: &mut HashMap<u32, RepairTier>,
    ) -> usize {
        let Some(repairer) = self.repairers.iter().find(|r| r.tier() == tier) else {
            return 0;
        };

        let mut found = 0;
        for &section_id in &coverage.missing {
            let widen = attempt.saturating_sub(1);
            let window = RepairWindow::for_section(doc, &pass.spans, section_id, widen);
            let _span =
                tracing::info_span!("repair", section = section_id, attempt, %tier).entered();

            let (outcome, evidence) = match repairer.repair(doc, &window) {
                Ok(TierOutcome::Found { repairs: set, evidence }) => {
                    repairs.extend(set);
                    found_by.insert(section_id, tier);
                    found += 1;
                    (AttemptOutcome::Found, evidence)
                }
                Ok(TierOutcome::NotFound { evidence }) => (AttemptOutcome::NotFound, evidence),
                Ok(TierOutcome::Skipped { reason }) => (AttemptOutcome::Skipped, reason),
                Err(e) => {
                    tracing::warn!(
                        section = section_id,
                        %tier,
                        error = %e,
                        "Repair call failed, continuing"
                    );
                    (AttemptOutcome::Failed, e.to_string())
                }
            };

            ledger.record(
                section_id,
                LedgerAttempt {
                    attempt,
                    tier,
                    candidate_pages: window.pages(),
                    evidence,
                    outcome,
                },
            );
            self.sink.emit(EngineEvent::RepairAttempted {
                section_id,
                attempt,
                tier,
                outcome,
            });
        }
        found
    }
}

fn terminal(passed: bool) -> EscalationState {
    if passed {
        EscalationState::Certified
    } else {
        EscalationState::Unresolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::config::SectionRange;
    use crate::pipeline::completion::CompletionError;
    use crate::pipeline::detection::{
        detect_all, BoundaryDetector, CodeScanDetector, LayoutScanDetector,
    };
    use crate::pipeline::escalation::ledger::Resolution;
    use crate::pipeline::escalation::{RepairError, TextRepairer, UnavailableRepairer};
    use crate::pipeline::report::MemorySink;
    use crate::pipeline::types::TextUnit;

    fn config(min: u32, max: u32) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.range = SectionRange { min, max };
        config
    }

    fn detectors() -> Vec<Box<dyn BoundaryDetector>> {
        vec![Box::new(LayoutScanDetector), Box::new(CodeScanDetector)]
    }

    /// Always fails, counting calls.
    struct BrokenRepairer {
        calls: Arc<AtomicUsize>,
    }

    impl Repairer for BrokenRepairer {
        fn tier(&self) -> RepairTier {
            RepairTier::Model
        }

        fn repair(
            &self,
            _doc: &Document,
            _window: &RepairWindow,
        ) -> Result<TierOutcome, RepairError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(RepairError::Completion(CompletionError::OllamaConnection(
                "http://localhost:11434".into(),
            )))
        }
    }

    #[test]
    fn complete_first_pass_certifies_without_repairs() {
        let config = config(1, 2);
        let doc = Document::new(
            vec![
                TextUnit::new("a", 1, 0, "1"),
                TextUnit::new("b", 1, 1, "Go north."),
                TextUnit::new("c", 2, 0, "2"),
                TextUnit::new("d", 2, 1, "The end."),
            ],
            vec![],
        )
        .unwrap();
        let sink = MemorySink::new();
        let dets = detectors();
        let repairers: Vec<Box<dyn Repairer>> =
            vec![Box::new(TextRepairer::new(config.generator.clone()))];
        let controller = EscalationController::new(&config, repairers, &sink);

        let result = controller.run(&doc, |d| detect_all(d, &config, &dets));
        assert_eq!(result.state, EscalationState::Certified);
        assert_eq!(result.attempts, 0);
        assert!(result.ledger.is_empty());
        assert!(sink
            .events()
            .iter()
            .all(|e| !matches!(e, EngineEvent::RepairAttempted { .. })));
    }

    #[test]
    fn text_tier_fills_merged_header() {
        let config = config(1, 3);
        let doc = Document::new(
            vec![
                TextUnit::new("a", 1, 0, "1"),
                TextUnit::new("b", 1, 1, "You wake in a cell."),
                TextUnit::new("c", 2, 0, "2 The guard is asleep."),
                TextUnit::new("d", 3, 0, "3"),
                TextUnit::new("e", 3, 1, "Freedom."),
            ],
            vec![],
        )
        .unwrap();
        let sink = MemorySink::new();
        let dets = detectors();
        let repairers: Vec<Box<dyn Repairer>> =
            vec![Box::new(TextRepairer::new(config.generator.clone()))];
        let controller = EscalationController::new(&config, repairers, &sink);

        let result = controller.run(&doc, |d| detect_all(d, &config, &dets));
        assert_eq!(result.state, EscalationState::Certified);
        assert_eq!(result.attempts, 1);
        assert!(result.coverage.passed);
        assert_eq!(
            result.ledger.get(2).unwrap().resolution,
            Resolution::ResolvedFound {
                tier: Some(RepairTier::Text)
            }
        );
        let two = result.pass.spans.iter().find(|s| s.section_id == 2).unwrap();
        assert_eq!(two.start_element_id, "c");
    }

    #[test]
    fn failures_are_recorded_and_bounded() {
        let mut config = config(1, 3);
        config.escalation.max_retries = 2;
        let doc = Document::new(
            vec![
                TextUnit::new("a", 1, 0, "1"),
                TextUnit::new("b", 1, 1, "You wake in a cell."),
            ],
            vec![],
        )
        .unwrap();
        let sink = MemorySink::new();
        let dets = detectors();
        let calls = Arc::new(AtomicUsize::new(0));
        let controller = EscalationController::new(
            &config,
            vec![
                Box::new(BrokenRepairer { calls: calls.clone() }),
                Box::new(UnavailableRepairer::new(RepairTier::Vision, "no page images")),
            ],
            &sink,
        );

        let result = controller.run(&doc, |d| detect_all(d, &config, &dets));
        assert_eq!(result.state, EscalationState::Unresolved);
        assert_eq!(result.attempts, 2);
        // Two missing sections, two attempts.
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(result.ledger.unresolved(), vec![2, 3]);

        let entry = result.ledger.get(2).unwrap();
        let outcomes: Vec<AttemptOutcome> = entry.attempts.iter().map(|a| a.outcome).collect();
        assert_eq!(
            outcomes,
            vec![
                AttemptOutcome::Failed,
                AttemptOutcome::Skipped,
                AttemptOutcome::Failed,
                AttemptOutcome::Skipped
            ]
        );
        assert_eq!(result.missing.len(), 2);
    }

    #[test]
    fn allow_listed_ids_resolve_absent() {
        let mut config = config(1, 3);
        config.known_missing = vec![3];
        let doc = Document::new(
            vec![
                TextUnit::new("a", 1, 0, "1"),
                TextUnit::new("b", 1, 1, "Go on."),
                TextUnit::new("c", 2, 0, "2"),
                TextUnit::new("d", 2, 1, "Fin."),
            ],
            vec![],
        )
        .unwrap();
        let sink = MemorySink::new();
        let dets = detectors();
        let controller = EscalationController::new(&config, Vec::new(), &sink);

        let result = controller.run(&doc, |d| detect_all(d, &config, &dets));
        assert_eq!(result.state, EscalationState::Certified);
        assert_eq!(result.ledger.get(3).unwrap().resolution, Resolution::ResolvedAbsent);
        assert!(result.ledger.get(3).unwrap().attempts.is_empty());
    }

    #[test]
    fn inverted_spans_are_never_certified() {
        let config = config(1, 3);
        let doc = Document::new(
            vec![
                TextUnit::new("a", 1, 0, "1"),
                TextUnit::new("b", 2, 0, "3"),
                TextUnit::new("c", 3, 0, "2"),
            ],
            vec![],
        )
        .unwrap();
        let span = |id: u32, element: &str| crate::pipeline::types::BoundarySpan {
            section_id: id,
            start_element_id: element.into(),
            end_element_id: None,
            start_page: 1,
            end_page: 1,
            confidence: 0.7,
            evidence: crate::pipeline::types::DetectionMethod::Seeded { prior_confidence: 0.7 },
            detector: crate::pipeline::detection::DetectorKind::Seeded,
            macro_section: None,
        };
        let inverted = vec![span(1, "a"), span(3, "b"), span(2, "c")];
        let sink = MemorySink::new();
        let controller = EscalationController::new(&config, Vec::new(), &sink);

        let result = controller.run(&doc, |_| DetectionPass {
            spans: inverted.clone(),
            ..DetectionPass::default()
        });
        assert_eq!(result.state, EscalationState::Unresolved);
        assert!(!result.coverage.passed);
        assert_eq!(result.coverage.out_of_order, vec![3]);
        assert_eq!(result.ledger.unresolved(), vec![3]);
    }
}
