//! Tier 3: re-OCR page images with a vision model and insert the header
//! line the primary OCR lost.
//!
//! The synthetic unit is anchored next to the original unit whose text
//! matches the OCR line after (or before) the header, so it lands at the
//! right reading position without touching the original units.

use std::sync::Arc;

use sha2::{Digest, Sha256};

use super::cache::{CacheMode, RepairCache};
use super::{RepairError, RepairTier, RepairWindow, Repairer, TierOutcome};
use crate::config::GeneratorConfig;
use crate::pipeline::detection::candidates::extract_literal;
use crate::pipeline::detection::glyph::expand_token;
use crate::pipeline::document::{Document, RepairMark, RepairSet};
use crate::pipeline::extraction::{
    ExtractionError, PageImageSource, VisionOcrEngine, VisionOcrResult, VISION_USER_PROMPT,
};
use crate::pipeline::types::{DetectionMethod, Slot, StructureKind, TextUnit};

const VISION_REPAIR_CONFIDENCE: f32 = 0.9;

/// Lowest OCR confidence factor applied to a vision repair mark.
const MIN_OCR_FACTOR: f32 = 0.5;

/// OCR lines examined on each side of the header when anchoring.
const ANCHOR_LOOKAROUND: usize = 3;

/// Normalized prefix length compared between OCR lines and units.
const ANCHOR_PREFIX_CHARS: usize = 24;
const MIN_ANCHOR_CHARS: usize = 4;

pub struct VisionRepairer {
    engine: Arc<dyn VisionOcrEngine>,
    images: Arc<dyn PageImageSource>,
    cache: Arc<RepairCache>,
    generator: GeneratorConfig,
    max_pages: usize,
}

impl VisionRepairer {
    pub fn new(
        engine: Arc<dyn VisionOcrEngine>,
        images: Arc<dyn PageImageSource>,
        cache: Arc<RepairCache>,
        generator: GeneratorConfig,
        max_pages: usize,
    ) -> Self {
        Self {
            engine,
            images,
            cache,
            generator,
            max_pages: max_pages.max(1),
        }
    }

    /// Pages between the neighbours first, then the widened margins.
    fn candidate_pages(&self, window: &RepairWindow) -> Vec<u32> {
        let low = window.previous.as_ref().map_or(window.first_page, |p| p.page);
        let high = window.next.as_ref().map_or(window.last_page, |n| n.page);
        let (inner, outer): (Vec<u32>, Vec<u32>) = window
            .pages()
            .into_iter()
            .partition(|p| *p >= low && *p <= high);
        inner.into_iter().chain(outer).take(self.max_pages).collect()
    }

    /// The whole OCR result is cached as JSON so a cache hit keeps the
    /// engine's confidence.
    fn transcribe(&self, page: u32) -> Result<VisionOcrResult, ExtractionError> {
        let bytes = self.images.page_image(page)?;
        let model = self.engine.model_name().to_string();
        let ids = [format!("page-{page}"), format!("{:x}", Sha256::digest(&bytes))];
        let key = RepairCache::key(CacheMode::Vision, &model, VISION_USER_PROMPT, &ids);
        let raw = self.cache.get_or_call(page, CacheMode::Vision, &model, &key, || {
            let result = self.engine.extract_text_from_image(&bytes)?;
            serde_json::to_string(&result)
                .map_err(|e| ExtractionError::OcrProcessing(e.to_string()))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            ExtractionError::OcrProcessing(format!(
                "cached transcription for page {page} is unreadable: {e}"
            ))
        })
    }

    fn line_matches(&self, line: &str, number: u32) -> bool {
        if line == number.to_string() || extract_literal(line).is_some_and(|(n, _)| n == number) {
            return true;
        }
        let compact_len = line.chars().filter(|c| !c.is_whitespace()).count();
        let anchored =
            !self.generator.require_digit_anchor || line.chars().any(|c| c.is_ascii_digit());
        let glyphs = &self.generator;
        compact_len <= glyphs.max_glyph_token_len
            && anchored
            && expand_token(line, &glyphs.confusion, glyphs.expansion_cap).contains(number)
    }

    /// Build the synthetic header for the first matching line on `page`.
    fn place(
        &self,
        doc: &Document,
        window: &RepairWindow,
        page: u32,
        ocr: &VisionOcrResult,
    ) -> Option<(RepairSet, String)> {
        let number = window.section_id;
        let lines = ocr.lines();
        let line_idx = lines.iter().position(|l| self.line_matches(l, number))?;

        let page_units: Vec<&TextUnit> = window
            .units(doc)
            .into_iter()
            .map(|(_, u)| u)
            .filter(|u| u.page == page)
            .collect();
        if page_units.is_empty() {
            tracing::debug!(page, section = number, "Vision match on a page with no open units");
            return None;
        }

        let (anchor, slot) = choose_anchor(&lines, line_idx, &page_units)?;

        let id = format!("vision-p{page}-{number}");
        let mut unit = TextUnit::new(id, page, anchor.seq, number.to_string());
        unit.slot = slot;
        unit.centered = Some(true);
        let unit = unit.with_structure(
            StructureKind::SectionHeader,
            Some(number),
            VISION_REPAIR_CONFIDENCE,
        );

        let line = lines[line_idx].to_string();
        let evidence = format!(
            "page {page} line {} '{line}' placed {:?} {} (ocr confidence {:.2})",
            line_idx + 1,
            slot,
            anchor.element_id,
            ocr.confidence
        );
        let mut repairs = RepairSet::new();
        repairs.insert(
            unit,
            RepairMark {
                section_id: number,
                confidence: mark_confidence(ocr.confidence),
                tier: RepairTier::Vision,
                method: DetectionMethod::VisionOcr {
                    model: self.engine.model_name().to_string(),
                    page,
                    line,
                },
            },
        );
        Some((repairs, evidence))
    }
}

impl Repairer for VisionRepairer {
    fn tier(&self) -> RepairTier {
        RepairTier::Vision
    }

    fn repair(&self, doc: &Document, window: &RepairWindow) -> Result<TierOutcome, RepairError> {
        let pages = self.candidate_pages(window);
        let mut failures = 0usize;
        let mut last_error = None;

        for &page in &pages {
            let ocr = match self.transcribe(page) {
                Ok(ocr) => ocr,
                Err(e) => {
                    tracing::warn!(
                        page,
                        section = window.section_id,
                        error = %e,
                        "Vision re-OCR failed for page"
                    );
                    failures += 1;
                    last_error = Some(e);
                    continue;
                }
            };
            if let Some((repairs, evidence)) = self.place(doc, window, page, &ocr) {
                return Ok(TierOutcome::Found { repairs, evidence });
            }
        }

        if let Some(e) = last_error.filter(|_| failures == pages.len()) {
            return Err(e.into());
        }
        Ok(TierOutcome::NotFound {
            evidence: format!("no OCR line matched {} on pages {pages:?}", window.section_id),
        })
    }
}

/// Scale the tier confidence by how readable the OCR output looked.
fn mark_confidence(ocr_confidence: f32) -> f32 {
    VISION_REPAIR_CONFIDENCE * ocr_confidence.clamp(MIN_OCR_FACTOR, 1.0)
}

fn normalize(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .take(ANCHOR_PREFIX_CHARS)
        .collect()
}

fn same_text(a: &str, b: &str) -> bool {
    let len = a.chars().count().min(b.chars().count());
    len >= MIN_ANCHOR_CHARS && a.chars().take(len).eq(b.chars().take(len))
}

fn find_unit<'d>(line: &str, units: &[&'d TextUnit]) -> Option<&'d TextUnit> {
    let wanted = normalize(line);
    units.iter().copied().find(|u| same_text(&wanted, &normalize(&u.text)))
}

/// Before the unit matching a following line, after one matching a
/// preceding line, else at the page edge nearest the header.
fn choose_anchor<'d>(
    lines: &[&str],
    line_idx: usize,
    units: &[&'d TextUnit],
) -> Option<(&'d TextUnit, Slot)> {
    let following = lines.iter().skip(line_idx + 1).take(ANCHOR_LOOKAROUND);
    for line in following {
        if let Some(unit) = find_unit(line, units) {
            return Some((unit, Slot::Before));
        }
    }

    let preceding = lines[line_idx.saturating_sub(ANCHOR_LOOKAROUND)..line_idx].iter().rev();
    for line in preceding {
        if let Some(unit) = find_unit(line, units) {
            return Some((unit, Slot::After));
        }
    }

    if line_idx * 2 < lines.len() {
        units.first().map(|u| (*u, Slot::Before))
    } else {
        units.last().map(|u| (*u, Slot::After))
    }
}
