use std::fmt;

use serde::{Deserialize, Serialize};

use super::detection::DetectorKind;

// ──────────────────────────────────────────────
// Text units
// ──────────────────────────────────────────────

/// One OCR'd line or block, as produced upstream. Read-only to the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TextUnit {
    pub element_id: String,
    pub page: u32,
    /// Reading order within the page.
    #[serde(alias = "order", alias = "sequence")]
    pub seq: u32,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<BoundingBox>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub centered: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structure: Option<StructureHint>,
    /// Placement of units inserted by repairs relative to `seq`.
    #[serde(skip)]
    pub slot: Slot,
}

impl TextUnit {
    pub fn new(
        element_id: impl Into<String>,
        page: u32,
        seq: u32,
        text: impl Into<String>,
    ) -> Self {
        Self {
            element_id: element_id.into(),
            page,
            seq,
            text: text.into(),
            bbox: None,
            centered: None,
            structure: None,
            slot: Slot::Original,
        }
    }

    pub fn with_bbox(mut self, x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        self.bbox = Some(BoundingBox { x0, y0, x1, y1 });
        self
    }

    pub fn with_structure(
        mut self,
        kind: StructureKind,
        number: Option<u32>,
        confidence: f32,
    ) -> Self {
        self.structure = Some(StructureHint {
            kind,
            number,
            confidence,
        });
        self
    }

    pub fn position(&self) -> DocPosition {
        DocPosition {
            page: self.page,
            seq: self.seq,
            slot: self.slot,
        }
    }

    pub fn structure_kind(&self) -> Option<StructureKind> {
        self.structure.as_ref().map(|s| s.kind)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BoundingBox {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl BoundingBox {
    pub fn center_x(&self) -> f32 {
        (self.x0 + self.x1) / 2.0
    }
}

/// Upstream structural classification of a unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StructureHint {
    pub kind: StructureKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<u32>,
    #[serde(default = "default_hint_confidence")]
    pub confidence: f32,
}

fn default_hint_confidence() -> f32 {
    1.0
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StructureKind {
    SectionHeader,
    PageHeader,
    PageFooter,
    ListItem,
    Body,
}

impl StructureKind {
    /// Page furniture and list items never start a section.
    pub fn suppresses_candidates(self) -> bool {
        matches!(self, Self::PageHeader | Self::PageFooter | Self::ListItem)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Slot {
    Before,
    #[default]
    Original,
    After,
}

/// Total document order: page, in-page sequence, then repair slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DocPosition {
    pub page: u32,
    pub seq: u32,
    pub slot: Slot,
}

impl fmt::Display for DocPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}#{}", self.page, self.seq)
    }
}

// ──────────────────────────────────────────────
// Macro regions
// ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MacroRegionKind {
    FrontMatter,
    Gameplay,
    EndMatter,
}

impl fmt::Display for MacroRegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FrontMatter => write!(f, "front_matter"),
            Self::Gameplay => write!(f, "gameplay"),
            Self::EndMatter => write!(f, "end_matter"),
        }
    }
}

/// Inclusive page interval tagged with its macro-region.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct MacroRegion {
    pub kind: MacroRegionKind,
    pub start_page: u32,
    pub end_page: u32,
}

impl MacroRegion {
    pub fn contains(&self, page: u32) -> bool {
        page >= self.start_page && page <= self.end_page
    }
}

// ──────────────────────────────────────────────
// Detection evidence
// ──────────────────────────────────────────────

/// Which literal or glyph rule produced a code-scan number.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExpansionRule {
    /// The whole unit is 1–3 digits.
    ExactDigits,
    /// "Section42", "Section 42", "§ 42".
    SectionPrefix,
    /// A short stray token before the number: "in 4".
    StrayPrefix,
    /// Digits fused to a capitalised word: "272Text".
    FusedPrefix,
    /// OCR glyph substitution over a short token.
    GlyphSubstitution,
}

/// How a candidate was found, with a fixed evidence schema per variant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum DetectionMethod {
    GlyphPattern {
        raw_text: String,
        rule: ExpansionRule,
        /// Characters rewritten by the confusion table (0 for literal rules).
        #[serde(default)]
        substitutions: u32,
    },
    StructuralTag {
        raw_text: String,
        tag_confidence: f32,
    },
    ModelAssisted {
        model: String,
        raw_text: String,
    },
    TextRepair {
        raw_text: String,
    },
    VisionOcr {
        model: String,
        page: u32,
        line: String,
    },
    Seeded {
        prior_confidence: f32,
    },
}

impl DetectionMethod {
    pub fn label(&self) -> &'static str {
        match self {
            Self::GlyphPattern { .. } => "glyph_pattern_expansion",
            Self::StructuralTag { .. } => "structural_tag",
            Self::ModelAssisted { .. } => "model_assisted",
            Self::TextRepair { .. } => "text_repair",
            Self::VisionOcr { .. } => "vision_ocr",
            Self::Seeded { .. } => "seeded",
        }
    }
}

// ──────────────────────────────────────────────
// Candidates and spans
// ──────────────────────────────────────────────

/// Hypothesis that a unit starts section `section_id`. Never edited after creation.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BoundaryCandidate {
    pub section_id: u32,
    pub element_id: String,
    #[serde(skip)]
    pub position: DocPosition,
    pub page: u32,
    pub confidence: f32,
    pub method: DetectionMethod,
    /// Trusted classification overrides the sentence-boundary heuristic.
    pub trusted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_preview: Option<String>,
}

/// One certified section and where it starts and ends.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BoundarySpan {
    pub section_id: u32,
    pub start_element_id: String,
    pub end_element_id: Option<String>,
    pub start_page: u32,
    pub end_page: u32,
    pub confidence: f32,
    #[serde(default = "default_span_evidence")]
    pub evidence: DetectionMethod,
    #[serde(default = "default_span_detector")]
    pub detector: DetectorKind,
    pub macro_section: Option<MacroRegionKind>,
}

fn default_span_detector() -> DetectorKind {
    DetectorKind::Seeded
}

/// Seed records without evidence; the seeded detector fills in the prior.
fn default_span_evidence() -> DetectionMethod {
    DetectionMethod::Seeded { prior_confidence: 0.0 }
}
