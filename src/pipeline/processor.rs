//! Section engine orchestrator.
//!
//! Single entry point that drives one certification run:
//! load → detect (all strategies) → validate coverage → escalate → outcome.
//!
//! Uses trait-based DI for every external engine (`CompletionClient`,
//! `VisionOcrEngine`, `PageImageSource`, `ReportSink`) so the orchestrator
//! stays fully testable with mock implementations.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::config::{ConfigError, EngineConfig};
use crate::pipeline::completion::{CompletionClient, CompletionError};
use crate::pipeline::coverage::CoverageReport;
use crate::pipeline::detection::{
    detect_all, BoundaryDetector, CodeScanDetector, DetectorKind, DetectorSummary, DuplicateReport,
    LayoutScanDetector, ModelScanDetector, OrderingDrop, OrderingViolation, SeededDetector,
};
use crate::pipeline::document::Document;
use crate::pipeline::escalation::{
    EscalationController, EscalationState, MissingSection, ModelRepairer, RepairCache, RepairTier,
    Repairer, ResolutionLedger, TextRepairer, UnavailableRepairer, VisionRepairer,
};
use crate::pipeline::extraction::{PageImageSource, VisionOcrEngine};
use crate::pipeline::input::{load_regions, load_spans, load_units, InputError};
use crate::pipeline::report::{EngineEvent, ReportSink, TracingSink};
use crate::pipeline::types::{BoundarySpan, MacroRegion, TextUnit};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Hard failures. A coverage gap is not an error: it is reported in
/// `EngineOutcome` and the caller decides what it means.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Input error: {0}")]
    Input(#[from] InputError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Model client error: {0}")]
    Completion(#[from] CompletionError),

    #[error("Cannot write {path}: {source}")]
    Output {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// Ordering-filter drop, tagged with the detector that made it.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DetectorDrop {
    pub detector: DetectorKind,
    #[serde(flatten)]
    pub drop: OrderingDrop,
}

/// Everything one run produced, certified or not.
#[derive(Debug, Clone, Serialize)]
pub struct EngineOutcome {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub state: EscalationState,
    pub spans: Vec<BoundarySpan>,
    pub coverage: CoverageReport,
    pub ledger: ResolutionLedger,
    pub missing: Vec<MissingSection>,
    pub duplicates: Vec<DuplicateReport>,
    pub violations: Vec<OrderingViolation>,
    pub ordering_drops: Vec<DetectorDrop>,
    pub detectors: Vec<DetectorSummary>,
    pub attempts: u32,
    pub repairs_applied: usize,
}

impl EngineOutcome {
    pub fn passed(&self) -> bool {
        self.coverage.passed
    }

    /// 0 when coverage passed or gaps are tolerated, 1 otherwise.
    pub fn exit_code(&self, allow_missing: bool) -> u8 {
        if self.passed() || allow_missing {
            0
        } else {
            1
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct SectionEngine {
    config: EngineConfig,
    completion: Option<Arc<dyn CompletionClient>>,
    vision: Option<Arc<dyn VisionOcrEngine>>,
    page_images: Option<Arc<dyn PageImageSource>>,
    cache: Arc<RepairCache>,
    sink: Arc<dyn ReportSink>,
}

impl SectionEngine {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            config,
            completion: None,
            vision: None,
            page_images: None,
            cache: Arc::new(RepairCache::in_memory()),
            sink: Arc::new(TracingSink),
        })
    }

    pub fn with_completion(mut self, client: Arc<dyn CompletionClient>) -> Self {
        self.completion = Some(client);
        self
    }

    pub fn with_vision(mut self, engine: Arc<dyn VisionOcrEngine>) -> Self {
        self.vision = Some(engine);
        self
    }

    pub fn with_page_images(mut self, images: Arc<dyn PageImageSource>) -> Self {
        self.page_images = Some(images);
        self
    }

    pub fn with_cache(mut self, cache: Arc<RepairCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Load inputs from disk and run. Any malformed input fails before
    /// detection starts.
    pub fn run_files(
        &self,
        units: &Path,
        regions: Option<&Path>,
        seeds: Option<&Path>,
    ) -> Result<EngineOutcome, EngineError> {
        let units = load_units(units)?;
        let regions = regions.map(load_regions).transpose()?.unwrap_or_default();
        let seeds = seeds.map(load_spans).transpose()?.unwrap_or_default();
        self.run(units, regions, seeds)
    }

    pub fn run(
        &self,
        units: Vec<TextUnit>,
        regions: Vec<MacroRegion>,
        seeds: Vec<BoundarySpan>,
    ) -> Result<EngineOutcome, EngineError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let start = Instant::now();
        let _span = tracing::info_span!("certify", %run_id).entered();

        let doc = Document::new(units, regions)?;
        let mut pages: Vec<u32> = doc.units().iter().map(|u| u.page).collect();
        pages.dedup();
        self.sink.emit(EngineEvent::DocumentLoaded {
            units: doc.len(),
            pages: pages.len() as u32,
            regions: doc.regions().len(),
            seeds: seeds.len(),
        });
        tracing::info!(
            units = doc.len(),
            pages = pages.len(),
            range_min = self.config.range.min,
            range_max = self.config.range.max,
            "Certifying section boundaries"
        );

        let detectors = self.detectors(seeds);
        let controller =
            EscalationController::new(&self.config, self.repairers(), self.sink.as_ref());
        let result = controller.run(&doc, |d| detect_all(d, &self.config, &detectors));

        let duplicates = result.pass.duplicates().cloned().collect();
        let ordering_drops = result
            .pass
            .ordering_drops()
            .map(|(detector, drop)| DetectorDrop {
                detector,
                drop: drop.clone(),
            })
            .collect();

        Ok(EngineOutcome {
            run_id,
            started_at,
            duration_ms: start.elapsed().as_millis() as u64,
            state: result.state,
            detectors: result.pass.summaries(),
            violations: result.pass.violations,
            spans: result.pass.spans,
            coverage: result.coverage,
            ledger: result.ledger,
            missing: result.missing,
            duplicates,
            ordering_drops,
            attempts: result.attempts,
            repairs_applied: result.repairs_applied,
        })
    }

    /// Detectors named in the trust order, skipping those that cannot run.
    fn detectors(&self, seeds: Vec<BoundarySpan>) -> Vec<Box<dyn BoundaryDetector>> {
        let mut detectors: Vec<Box<dyn BoundaryDetector>> = Vec::new();
        let mut seeds = Some(seeds).filter(|s| !s.is_empty());

        for kind in &self.config.detectors.trust_order {
            if detectors.iter().any(|d| d.kind() == *kind) {
                continue;
            }
            match kind {
                DetectorKind::Seeded => {
                    if let Some(seeds) = seeds.take() {
                        detectors.push(Box::new(SeededDetector::new(seeds)));
                    }
                }
                DetectorKind::LayoutScan => detectors.push(Box::new(LayoutScanDetector)),
                DetectorKind::CodeScan => detectors.push(Box::new(CodeScanDetector)),
                DetectorKind::ModelScan => {
                    if !self.config.detectors.model_scan {
                        continue;
                    }
                    match &self.completion {
                        Some(client) => detectors.push(Box::new(ModelScanDetector::new(
                            client.clone(),
                            self.cache.clone(),
                        ))),
                        None => {
                            tracing::warn!("Model scan enabled but no completion client configured")
                        }
                    }
                }
            }
        }

        if seeds.is_some() {
            tracing::warn!(
                "Seed spans supplied but 'seeded' is not in the trust order; ignoring them"
            );
        }
        detectors
    }

    /// Enabled tiers; a tier missing its client, engine or images is kept as
    /// a skipped placeholder so the ledger shows why it never ran.
    fn repairers(&self) -> Vec<Box<dyn Repairer>> {
        let escalation = &self.config.escalation;
        let mut repairers: Vec<Box<dyn Repairer>> = Vec::new();

        if escalation.text_repair {
            repairers.push(Box::new(TextRepairer::new(self.config.generator.clone())));
        }

        if escalation.model_repair {
            match &self.completion {
                Some(client) => repairers.push(Box::new(ModelRepairer::new(
                    client.clone(),
                    self.cache.clone(),
                    self.config.models.repair_model.clone(),
                    escalation.max_window_units,
                ))),
                None => repairers.push(Box::new(UnavailableRepairer::new(
                    RepairTier::Model,
                    "no completion client configured",
                ))),
            }
        }

        if escalation.vision_repair {
            match (&self.vision, &self.page_images) {
                (Some(engine), Some(images)) => repairers.push(Box::new(VisionRepairer::new(
                    engine.clone(),
                    images.clone(),
                    self.cache.clone(),
                    self.config.generator.clone(),
                    escalation.max_vision_pages,
                ))),
                (None, _) => repairers.push(Box::new(UnavailableRepairer::new(
                    RepairTier::Vision,
                    "no vision OCR engine configured",
                ))),
                (_, None) => repairers.push(Box::new(UnavailableRepairer::new(
                    RepairTier::Vision,
                    "no page images configured",
                ))),
            }
        }

        repairers
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
