//! Local context checks for candidates: sentence boundaries and centering.
//!
//! Both checks only look at the candidate's own page. The centering test is
//! relative to the page's own spread of line centres, so skewed or offset
//! scans are judged against themselves rather than a fixed column.

use std::collections::HashMap;

use serde::Serialize;

use super::candidates::is_header_like;
use crate::config::ValidatorConfig;
use crate::pipeline::document::Document;
use crate::pipeline::types::{BoundaryCandidate, TextUnit};

/// Why a candidate failed a context check.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ContextRejection {
    MidSentence { prev_ends: bool, next_starts: bool },
    OffCenter { offset: f32, tolerance: f32 },
    MarkedNotCentered,
    UnknownElement,
}

/// Horizontal centring statistics for one page.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageCentering {
    pub mean: f32,
    pub tolerance: f32,
}

impl PageCentering {
    pub fn offset(&self, center_x: f32) -> f32 {
        (center_x - self.mean).abs()
    }
}

pub struct ContextValidator<'a> {
    config: &'a ValidatorConfig,
    check_centering: bool,
}

impl<'a> ContextValidator<'a> {
    pub fn new(config: &'a ValidatorConfig) -> Self {
        Self {
            config,
            check_centering: config.centering_enabled,
        }
    }

    /// Sentence check only.
    pub fn without_centering(mut self) -> Self {
        self.check_centering = false;
        self
    }

    /// Keep candidates that pass every enabled check.
    pub fn filter(
        &self,
        doc: &Document,
        candidates: Vec<BoundaryCandidate>,
    ) -> Vec<BoundaryCandidate> {
        let mut centering_cache: HashMap<u32, Option<PageCentering>> = HashMap::new();
        let before = candidates.len();

        let kept: Vec<BoundaryCandidate> = candidates
            .into_iter()
            .filter(|candidate| match self.validate(doc, candidate, &mut centering_cache) {
                Ok(()) => true,
                Err(rejection) => {
                    tracing::debug!(
                        section = candidate.section_id,
                        element = %candidate.element_id,
                        ?rejection,
                        "Context check rejected candidate"
                    );
                    false
                }
            })
            .collect();

        tracing::debug!(before, after = kept.len(), "Context validation complete");
        kept
    }

    pub fn validate(
        &self,
        doc: &Document,
        candidate: &BoundaryCandidate,
        centering_cache: &mut HashMap<u32, Option<PageCentering>>,
    ) -> Result<(), ContextRejection> {
        let idx = doc
            .index_of(&candidate.element_id)
            .ok_or(ContextRejection::UnknownElement)?;

        // Repaired units were already checked by the tier that produced them.
        if doc.repair_mark(&candidate.element_id).is_some() {
            return Ok(());
        }

        if !candidate.trusted {
            check_sentence_boundary(doc, idx)?;
        }

        if self.check_centering {
            let unit = doc.unit(idx);
            match unit.centered {
                Some(true) => {}
                Some(false) => return Err(ContextRejection::MarkedNotCentered),
                None => {
                    if let Some(bbox) = unit.bbox {
                        let centering = *centering_cache.entry(unit.page).or_insert_with(|| {
                            page_centering(doc.page_units(unit.page), self.config)
                        });
                        if let Some(centering) = centering {
                            let offset = centering.offset(bbox.center_x());
                            if offset > centering.tolerance {
                                return Err(ContextRejection::OffCenter {
                                    offset,
                                    tolerance: centering.tolerance,
                                });
                            }
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

/// The previous unit must close a sentence and the next must open one.
pub fn check_sentence_boundary(doc: &Document, idx: usize) -> Result<(), ContextRejection> {
    let (prev, next) = doc.page_neighbors(idx);
    let prev_ends = prev.map_or(true, |u| ends_sentence(&u.text) || is_header_like(&u.text));
    let next_starts = next.map_or(true, |u| starts_sentence(&u.text) || is_header_like(&u.text));

    if prev_ends && next_starts {
        Ok(())
    } else {
        Err(ContextRejection::MidSentence {
            prev_ends,
            next_starts,
        })
    }
}

const CLOSERS: &[char] = &['"', '\'', '\u{201d}', '\u{2019}', ')', ']', '\u{bb}'];
const OPENERS: &[char] = &['"', '\'', '\u{201c}', '\u{2018}', '(', '[', '\u{ab}'];

pub fn ends_sentence(text: &str) -> bool {
    let trimmed = text.trim_end().trim_end_matches(CLOSERS);
    if trimmed.is_empty() {
        return text.trim().is_empty();
    }
    trimmed.ends_with(['.', '!', '?', '\u{2026}'])
}

pub fn starts_sentence(text: &str) -> bool {
    let trimmed = text.trim_start().trim_start_matches(OPENERS);
    match trimmed.chars().next() {
        None => text.trim().is_empty(),
        Some(c) => c.is_uppercase() || c.is_ascii_digit(),
    }
}

/// Mean line centre and tolerance for a page, or `None` with too few boxes.
pub fn page_centering(units: &[TextUnit], config: &ValidatorConfig) -> Option<PageCentering> {
    let boxes: Vec<_> = units.iter().filter_map(|u| u.bbox).collect();
    if boxes.len() < config.min_lines_for_centering.max(1) {
        return None;
    }

    let n = boxes.len() as f32;
    let centers: Vec<f32> = boxes.iter().map(|b| b.center_x()).collect();
    let mean = centers.iter().sum::<f32>() / n;
    let variance = centers.iter().map(|c| (c - mean).powi(2)).sum::<f32>() / n;
    let std_dev = variance.sqrt();

    let left = boxes.iter().map(|b| b.x0).fold(f32::INFINITY, f32::min);
    let right = boxes.iter().map(|b| b.x1).fold(f32::NEG_INFINITY, f32::max);
    let floor = config.centering_floor_ratio * (right - left).max(0.0);

    Some(PageCentering {
        mean,
        tolerance: (config.centering_sigma * std_dev).max(floor),
    })
}
