//! Tier 1: look for the missing number in the window's own text.

use super::{RepairError, RepairTier, RepairWindow, Repairer, TierOutcome};
use crate::config::GeneratorConfig;
use crate::pipeline::detection::candidates::{extract_literal, has_page_range, is_navigation_text};
use crate::pipeline::detection::context::ends_sentence;
use crate::pipeline::detection::glyph::expand_token;
use crate::pipeline::document::{Document, RepairMark, RepairSet};
use crate::pipeline::types::DetectionMethod;

const TEXT_REPAIR_CONFIDENCE: f32 = 0.85;

/// How a unit's text carries the number; lower is stronger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum MatchKind {
    Literal,
    Glyph,
    LeadingToken,
    AfterSentence,
}

pub struct TextRepairer {
    generator: GeneratorConfig,
}

impl TextRepairer {
    pub fn new(generator: GeneratorConfig) -> Self {
        Self { generator }
    }

    fn match_kind(&self, text: &str, number: u32) -> Option<MatchKind> {
        if extract_literal(text).is_some_and(|(n, _)| n == number) {
            return Some(MatchKind::Literal);
        }

        let compact_len = text.chars().filter(|c| !c.is_whitespace()).count();
        let anchored =
            !self.generator.require_digit_anchor || text.chars().any(|c| c.is_ascii_digit());
        let glyphs = &self.generator;
        if compact_len <= glyphs.max_glyph_token_len
            && anchored
            && expand_token(text, &glyphs.confusion, glyphs.expansion_cap).contains(number)
        {
            return Some(MatchKind::Glyph);
        }

        let needle = number.to_string();
        if let Some(rest) = text.strip_prefix(needle.as_str()) {
            if rest.chars().next().is_some_and(|c| !c.is_ascii_digit()) {
                return Some(MatchKind::LeadingToken);
            }
        }

        self.sentence_start_token(text, &needle)
            .then_some(MatchKind::AfterSentence)
    }

    /// "The guard falls. 80 You step over him." A token right after a
    /// sentence end that no navigation phrase introduces.
    fn sentence_start_token(&self, text: &str, needle: &str) -> bool {
        let mut offset = 0;
        while let Some(found) = text[offset..].find(needle) {
            let start = offset + found;
            let end = start + needle.len();
            offset = end;

            let bounded_left = text[..start].chars().last().map_or(true, |c| !c.is_ascii_digit());
            let bounded_right = text[end..].chars().next().map_or(true, |c| !c.is_ascii_digit());
            if !bounded_left || !bounded_right {
                continue;
            }

            let before = text[..start].trim_end();
            if before.is_empty() || !ends_sentence(before) {
                continue;
            }
            let lower = before.to_lowercase();
            if self
                .generator
                .navigation_phrases
                .iter()
                .any(|p| lower.ends_with(p.as_str()))
            {
                continue;
            }
            return true;
        }
        false
    }

    fn follows_navigation(&self, doc: &Document, idx: usize) -> bool {
        let Some(prev) = idx.checked_sub(1).map(|i| doc.unit(i)) else {
            return false;
        };
        let lower = prev.text.trim_end().to_lowercase();
        self.generator
            .navigation_phrases
            .iter()
            .any(|p| lower.ends_with(p.as_str()))
    }
}

impl Repairer for TextRepairer {
    fn tier(&self) -> RepairTier {
        RepairTier::Text
    }

    fn repair(&self, doc: &Document, window: &RepairWindow) -> Result<TierOutcome, RepairError> {
        let number = window.section_id;
        let mut best: Option<(MatchKind, usize)> = None;

        for (idx, unit) in window.units(doc) {
            if doc.repair_mark(&unit.element_id).is_some() {
                continue;
            }
            let text = unit.text.trim();
            if text.is_empty()
                || has_page_range(text)
                || is_navigation_text(text, &self.generator.navigation_phrases)
                || self.follows_navigation(doc, idx)
            {
                continue;
            }
            if let Some(kind) = self.match_kind(text, number) {
                if best.map_or(true, |(b, _)| kind < b) {
                    best = Some((kind, idx));
                }
            }
        }

        let Some((kind, idx)) = best else {
            return Ok(TierOutcome::NotFound {
                evidence: format!(
                    "no unit on pages {}..={} carries {number}",
                    window.first_page, window.last_page
                ),
            });
        };

        let unit = doc.unit(idx);
        tracing::debug!(section = number, element = %unit.element_id, ?kind, "Text repair match");

        let mut repairs = RepairSet::new();
        repairs.mark(
            unit.element_id.clone(),
            RepairMark {
                section_id: number,
                confidence: TEXT_REPAIR_CONFIDENCE,
                tier: RepairTier::Text,
                method: DetectionMethod::TextRepair {
                    raw_text: unit.text.trim().to_string(),
                },
            },
        );
        Ok(TierOutcome::Found {
            repairs,
            evidence: format!("{:?} match in {} on page {}", kind, unit.element_id, unit.page),
        })
    }
}
