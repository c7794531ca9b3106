//! Gap repair: bounded escalation through text, model and vision tiers.
//!
//! Repairers never edit a document. Each returns a `RepairSet` overlay; the
//! controller applies every overlay found so far to the original document and
//! re-runs detection on the result.

pub mod cache;
pub mod ledger;
pub mod text_repair;
pub mod model_repair;
pub mod vision_repair;
pub mod controller;

pub use cache::{CacheEntry, CacheMode, RepairCache};
pub use controller::{EscalationController, EscalationResult};
pub use ledger::{AttemptOutcome, LedgerAttempt, LedgerEntry, Resolution, ResolutionLedger};
pub use model_repair::ModelRepairer;
pub use text_repair::TextRepairer;
pub use vision_repair::VisionRepairer;

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::completion::CompletionError;
use super::detection::candidates::contains_number_token;
use super::document::{Document, RepairSet};
use super::extraction::ExtractionError;
use super::types::{BoundarySpan, DocPosition, TextUnit};

/// Units quoted per missing section when nothing mentions its number.
const FALLBACK_SNIPPETS: usize = 3;
const MAX_SNIPPETS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairTier {
    Text,
    Model,
    Vision,
}

impl fmt::Display for RepairTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Model => write!(f, "model"),
            Self::Vision => write!(f, "vision"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "tier", rename_all = "snake_case")]
pub enum EscalationState {
    Detect,
    Validate,
    Repair(RepairTier),
    Certified,
    Unresolved,
}

impl EscalationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Certified | Self::Unresolved)
    }
}

impl fmt::Display for EscalationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Detect => write!(f, "detect"),
            Self::Validate => write!(f, "validate"),
            Self::Repair(tier) => write!(f, "repair({tier})"),
            Self::Certified => write!(f, "certified"),
            Self::Unresolved => write!(f, "unresolved"),
        }
    }
}

#[derive(Error, Debug)]
pub enum RepairError {
    #[error("Completion call failed: {0}")]
    Completion(#[from] CompletionError),

    #[error("Page image or vision OCR failed: {0}")]
    Extraction(#[from] ExtractionError),
}

// ──────────────────────────────────────────────
// Repair windows
// ──────────────────────────────────────────────

/// Certified section adjacent to a missing one.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NeighborRef {
    pub section_id: u32,
    pub element_id: String,
    pub page: u32,
    #[serde(skip)]
    pub position: DocPosition,
}

/// Where a missing section can start: between its nearest certified
/// neighbours, widened by one page per attempt after the first.
#[derive(Debug, Clone)]
pub struct RepairWindow {
    pub section_id: u32,
    pub first_page: u32,
    pub last_page: u32,
    pub previous: Option<NeighborRef>,
    pub next: Option<NeighborRef>,
    /// Start elements of certified spans.
    pub occupied: HashSet<String>,
    /// Restrict units to positions strictly between the neighbours.
    pub bounded: bool,
}

impl RepairWindow {
    pub fn for_section(
        doc: &Document,
        spans: &[BoundarySpan],
        section_id: u32,
        widen: u32,
    ) -> Self {
        let neighbour = |span: &BoundarySpan| {
            doc.position_of(&span.start_element_id).map(|position| NeighborRef {
                section_id: span.section_id,
                element_id: span.start_element_id.clone(),
                page: span.start_page,
                position,
            })
        };
        let previous = spans
            .iter()
            .filter(|s| s.section_id < section_id)
            .max_by_key(|s| s.section_id)
            .and_then(neighbour);
        let next = spans
            .iter()
            .filter(|s| s.section_id > section_id)
            .min_by_key(|s| s.section_id)
            .and_then(neighbour);

        let (previous, next) = match (previous, next) {
            (Some(p), Some(n)) if p.position > n.position => (Some(n), Some(p)),
            other => other,
        };

        let gameplay_first = doc
            .gameplay_indices()
            .next()
            .map(|i| doc.unit(i).page)
            .unwrap_or_else(|| doc.first_page());
        let gameplay_last = doc.last_gameplay_page();

        let first_page = previous
            .as_ref()
            .map_or(gameplay_first, |p| p.page)
            .saturating_sub(widen)
            .max(gameplay_first);
        let last_page = next
            .as_ref()
            .map_or(gameplay_last, |n| n.page)
            .saturating_add(widen)
            .min(gameplay_last)
            .max(first_page);

        Self {
            section_id,
            first_page,
            last_page,
            previous,
            next,
            occupied: spans.iter().map(|s| s.start_element_id.clone()).collect(),
            bounded: widen == 0,
        }
    }

    pub fn pages(&self) -> Vec<u32> {
        (self.first_page..=self.last_page).collect()
    }

    /// Gameplay units in the window that do not already start a section.
    pub fn units<'d>(&self, doc: &'d Document) -> Vec<(usize, &'d TextUnit)> {
        let start = doc.page_range(self.first_page).start;
        let end = doc.page_range(self.last_page).end.max(start);
        (start..end)
            .map(|i| (i, doc.unit(i)))
            .filter(|(_, u)| doc.is_gameplay(u.page) && !self.occupied.contains(&u.element_id))
            .filter(|(_, u)| !self.bounded || self.within_neighbours(u.position()))
            .collect()
    }

    fn within_neighbours(&self, position: DocPosition) -> bool {
        self.previous.as_ref().map_or(true, |p| position > p.position)
            && self.next.as_ref().map_or(true, |n| position < n.position)
    }
}

// ──────────────────────────────────────────────
// Repairer trait
// ──────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum TierOutcome {
    Found { repairs: RepairSet, evidence: String },
    NotFound { evidence: String },
    /// The tier cannot run at all (disabled or missing a dependency).
    Skipped { reason: String },
}

/// One escalation tier. Implementations only read the document.
pub trait Repairer: Send + Sync {
    fn tier(&self) -> RepairTier;

    fn repair(&self, doc: &Document, window: &RepairWindow) -> Result<TierOutcome, RepairError>;
}

/// Stands in for a tier whose client, engine or images are not configured.
pub struct UnavailableRepairer {
    tier: RepairTier,
    reason: String,
}

impl UnavailableRepairer {
    pub fn new(tier: RepairTier, reason: impl Into<String>) -> Self {
        Self {
            tier,
            reason: reason.into(),
        }
    }
}

impl Repairer for UnavailableRepairer {
    fn tier(&self) -> RepairTier {
        self.tier
    }

    fn repair(&self, _doc: &Document, _window: &RepairWindow) -> Result<TierOutcome, RepairError> {
        Ok(TierOutcome::Skipped {
            reason: self.reason.clone(),
        })
    }
}

// ──────────────────────────────────────────────
// Missing-section report
// ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Snippet {
    pub element_id: String,
    pub page: u32,
    pub text: String,
}

/// What a reviewer needs to place a section the engine could not find.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MissingSection {
    pub section_id: u32,
    pub candidate_pages: Vec<u32>,
    pub previous: Option<NeighborRef>,
    pub next: Option<NeighborRef>,
    pub snippets: Vec<Snippet>,
}

pub fn missing_report(
    doc: &Document,
    spans: &[BoundarySpan],
    missing: &[u32],
    snippet_chars: usize,
) -> Vec<MissingSection> {
    missing
        .iter()
        .map(|&section_id| {
            let window = RepairWindow::for_section(doc, spans, section_id, 0);
            let units = window.units(doc);

            let mentioning: Vec<&TextUnit> = units
                .iter()
                .map(|(_, u)| *u)
                .filter(|u| contains_number_token(&u.text, section_id))
                .collect();
            let chosen: Vec<&TextUnit> = if mentioning.is_empty() {
                units
                    .iter()
                    .map(|(_, u)| *u)
                    .filter(|u| !u.text.trim().is_empty())
                    .take(FALLBACK_SNIPPETS)
                    .collect()
            } else {
                mentioning
            };

            MissingSection {
                section_id,
                candidate_pages: window.pages(),
                snippets: chosen
                    .into_iter()
                    .take(MAX_SNIPPETS)
                    .map(|u| Snippet {
                        element_id: u.element_id.clone(),
                        page: u.page,
                        text: u.text.trim().chars().take(snippet_chars).collect(),
                    })
                    .collect(),
                previous: window.previous,
                next: window.next,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::detection::DetectorKind;
    use crate::pipeline::types::DetectionMethod;

    fn span(id: u32, element: &str, page: u32) -> BoundarySpan {
        BoundarySpan {
            section_id: id,
            start_element_id: element.into(),
            end_element_id: None,
            start_page: page,
            end_page: page,
            confidence: 0.7,
            evidence: DetectionMethod::Seeded { prior_confidence: 0.7 },
            detector: DetectorKind::CodeScan,
            macro_section: None,
        }
    }

    fn book() -> Document {
        Document::new(
            vec![
                TextUnit::new("a0", 1, 0, "1"),
                TextUnit::new("a1", 1, 1, "You wake."),
                TextUnit::new("b0", 2, 0, "The hall is dark."),
                TextUnit::new("b1", 2, 1, "Return to 2 later."),
                TextUnit::new("c0", 3, 0, "3"),
                TextUnit::new("c1", 3, 1, "A door."),
                TextUnit::new("d0", 4, 0, "Dust."),
            ],
            vec![],
        )
        .unwrap()
    }

    #[test]
    fn window_is_bounded_by_neighbours() {
        let doc = book();
        let spans = vec![span(1, "a0", 1), span(3, "c0", 3)];
        let window = RepairWindow::for_section(&doc, &spans, 2, 0);
        assert_eq!(window.pages(), vec![1, 2, 3]);
        let units = window.units(&doc);
        let ids: Vec<&str> = units.iter().map(|(_, u)| u.element_id.as_str()).collect();
        assert_eq!(ids, ["a1", "b0", "b1"]);
    }

    #[test]
    fn widened_window_drops_position_bound() {
        let doc = book();
        let spans = vec![span(1, "a0", 1), span(3, "c0", 3)];
        let window = RepairWindow::for_section(&doc, &spans, 2, 1);
        assert_eq!(window.pages(), vec![1, 2, 3, 4]);
        let units = window.units(&doc);
        let ids: Vec<&str> = units.iter().map(|(_, u)| u.element_id.as_str()).collect();
        assert!(ids.contains(&"c1"));
        assert!(!ids.contains(&"c0"));
    }

    #[test]
    fn inverted_neighbours_are_swapped() {
        let doc = book();
        let spans = vec![span(1, "c0", 3), span(3, "a0", 1)];
        let window = RepairWindow::for_section(&doc, &spans, 2, 0);
        assert_eq!(window.previous.as_ref().unwrap().section_id, 3);
        assert_eq!(window.first_page, 1);
        assert_eq!(window.last_page, 3);
    }

    #[test]
    fn missing_report_prefers_mentions() {
        let doc = book();
        let spans = vec![span(1, "a0", 1), span(3, "c0", 3)];
        let report = missing_report(&doc, &spans, &[2], 8);
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].snippets.len(), 1);
        assert_eq!(report[0].snippets[0].element_id, "b1");
        assert_eq!(report[0].snippets[0].text, "Return t");
        assert_eq!(report[0].next.as_ref().unwrap().section_id, 3);
    }

    #[test]
    fn state_serializes_with_tier() {
        let json = serde_json::to_string(&EscalationState::Repair(RepairTier::Model)).unwrap();
        assert_eq!(json, r#"{"state":"repair","tier":"model"}"#);
        assert_eq!(EscalationState::Repair(RepairTier::Vision).to_string(), "repair(vision)");
        assert!(EscalationState::Unresolved.is_terminal());
    }
}
