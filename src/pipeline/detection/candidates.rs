//! Candidate generation: which units might start a numbered section.
//!
//! Literal patterns are tried first ("42", "Section42", "in 4", "272Text"),
//! then glyph-confusion expansion over short tokens. Structure hints from
//! upstream classification can suppress a unit outright or raise confidence.

use std::sync::LazyLock;

use regex::Regex;

use super::glyph::{expand_token, parse_section_number};
use crate::config::{GeneratorConfig, SectionRange};
use crate::pipeline::document::Document;
use crate::pipeline::types::{BoundaryCandidate, DetectionMethod, ExpansionRule, StructureKind};

static PAGE_RANGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{1,4}\s*[-–—]\s*\d{1,4}\b").unwrap());

static EXACT_DIGITS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d{1,3})$").unwrap());

static SECTION_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(?:section|sect\.?|§)\s*(\d{1,3})\b").unwrap());

static STRAY_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z]{1,2}\s+(\d{1,3})$").unwrap());

static FUSED_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{1,3})[A-Z][a-z]").unwrap());

/// Lower bound for glyph-substituted candidates.
const MIN_GLYPH_CONFIDENCE: f32 = 0.4;

/// Confidence lost per substituted glyph.
const SUBSTITUTION_PENALTY: f32 = 0.05;

pub struct CandidateGenerator<'a> {
    config: &'a GeneratorConfig,
    range: SectionRange,
    use_structure: bool,
}

impl<'a> CandidateGenerator<'a> {
    pub fn new(config: &'a GeneratorConfig, range: SectionRange) -> Self {
        Self {
            config,
            range,
            use_structure: true,
        }
    }

    /// Ignore upstream structure hints (plain code scan).
    pub fn without_structure_hints(mut self) -> Self {
        self.use_structure = false;
        self
    }

    /// Candidates for every gameplay unit, in document order.
    pub fn generate(&self, doc: &Document) -> Vec<BoundaryCandidate> {
        let mut out = Vec::new();
        for idx in doc.gameplay_indices() {
            out.extend(self.candidates_for_unit(doc, idx));
        }
        tracing::debug!(candidates = out.len(), "Candidate generation complete");
        out
    }

    pub fn candidates_for_unit(&self, doc: &Document, idx: usize) -> Vec<BoundaryCandidate> {
        let unit = doc.unit(idx);

        if let Some(mark) = doc.repair_mark(&unit.element_id) {
            if !self.range.contains(mark.section_id) {
                return Vec::new();
            }
            return vec![BoundaryCandidate {
                section_id: mark.section_id,
                element_id: unit.element_id.clone(),
                position: unit.position(),
                page: unit.page,
                confidence: mark.confidence,
                method: mark.method.clone(),
                trusted: true,
                body_preview: body_preview(doc, idx, self.config.preview_chars),
            }];
        }

        let text = unit.text.trim();
        if text.is_empty() {
            return Vec::new();
        }

        let hint = if self.use_structure {
            unit.structure.as_ref()
        } else {
            None
        };
        if hint.is_some_and(|h| h.kind.suppresses_candidates()) {
            return Vec::new();
        }
        if has_page_range(text) || is_navigation_text(text, &self.config.navigation_phrases) {
            return Vec::new();
        }

        let mut claims = self.claims_for_text(text);

        let mut trusted = false;
        if let Some(hint) = hint.filter(|h| h.kind == StructureKind::SectionHeader) {
            let hint_trusted = hint.confidence >= self.config.trusted_tag_threshold;
            match hint.number {
                Some(number) => {
                    if let Some(claim) = claims.iter_mut().find(|c| c.number == number) {
                        claim.confidence = claim.confidence.max(hint.confidence);
                        claim.trusted = hint_trusted;
                    } else if contains_number_token(text, number) {
                        claims.push(Claim {
                            number,
                            confidence: hint.confidence,
                            method: DetectionMethod::StructuralTag {
                                raw_text: text.to_string(),
                                tag_confidence: hint.confidence,
                            },
                            trusted: hint_trusted,
                        });
                    }
                }
                None => trusted = hint_trusted && claims.len() == 1,
            }
        }

        claims
            .into_iter()
            .filter(|c| self.range.contains(c.number))
            .map(|c| BoundaryCandidate {
                section_id: c.number,
                element_id: unit.element_id.clone(),
                position: unit.position(),
                page: unit.page,
                confidence: c.confidence.clamp(0.0, 1.0),
                method: c.method,
                trusted: c.trusted || trusted,
                body_preview: body_preview(doc, idx, self.config.preview_chars),
            })
            .collect()
    }

    fn claims_for_text(&self, text: &str) -> Vec<Claim> {
        let base = self.config.base_confidence;

        if let Some((number, rule)) = extract_literal(text) {
            return vec![Claim {
                number,
                confidence: base,
                method: DetectionMethod::GlyphPattern {
                    raw_text: text.to_string(),
                    rule,
                    substitutions: 0,
                },
                trusted: false,
            }];
        }

        let compact_len = text.chars().filter(|c| !c.is_whitespace()).count();
        if compact_len == 0 || compact_len > self.config.max_glyph_token_len {
            return Vec::new();
        }
        if self.config.require_digit_anchor && !text.chars().any(|c| c.is_ascii_digit()) {
            return Vec::new();
        }

        let expansion = expand_token(text, &self.config.confusion, self.config.expansion_cap);
        if expansion.truncated {
            tracing::debug!(text, "Glyph expansion hit the combination cap");
        }
        expansion
            .numbers
            .into_iter()
            .map(|(number, substitutions)| Claim {
                number,
                confidence: (base - SUBSTITUTION_PENALTY * substitutions as f32)
                    .max(MIN_GLYPH_CONFIDENCE.min(base)),
                method: DetectionMethod::GlyphPattern {
                    raw_text: text.to_string(),
                    rule: if substitutions == 0 {
                        ExpansionRule::ExactDigits
                    } else {
                        ExpansionRule::GlyphSubstitution
                    },
                    substitutions,
                },
                trusted: false,
            })
            .collect()
    }
}

struct Claim {
    number: u32,
    confidence: f32,
    method: DetectionMethod,
    trusted: bool,
}

/// Literal header patterns, tried before any glyph substitution.
pub fn extract_literal(text: &str) -> Option<(u32, ExpansionRule)> {
    let text = text.trim();
    let rules: [(&Regex, ExpansionRule); 4] = [
        (&*EXACT_DIGITS, ExpansionRule::ExactDigits),
        (&*SECTION_PREFIX, ExpansionRule::SectionPrefix),
        (&*STRAY_PREFIX, ExpansionRule::StrayPrefix),
        (&*FUSED_PREFIX, ExpansionRule::FusedPrefix),
    ];
    rules.iter().find_map(|(re, rule)| {
        re.captures(text)
            .and_then(|caps| caps.get(1))
            .and_then(|m| parse_section_number(m.as_str()))
            .map(|n| (n, *rule))
    })
}

pub fn has_page_range(text: &str) -> bool {
    PAGE_RANGE.is_match(text)
}

pub fn is_navigation_text(text: &str, phrases: &[String]) -> bool {
    let lower = text.trim_start().to_lowercase();
    phrases.iter().any(|p| lower.starts_with(p.as_str()))
}

/// Bare number or "Section N" line: the shape of a header, whatever its context.
pub fn is_header_like(text: &str) -> bool {
    let text = text.trim();
    EXACT_DIGITS.is_match(text) || (SECTION_PREFIX.is_match(text) && text.len() <= 12)
}

/// `number` appears as a whole digit run in `text`.
pub fn contains_number_token(text: &str, number: u32) -> bool {
    let needle = number.to_string();
    text.split(|c: char| !c.is_ascii_digit())
        .any(|run| run == needle)
}

/// Whether `text` can plausibly be a header for `number`: a literal
/// pattern, a standalone token, or a glyph expansion of a short token.
pub fn text_supports_number(text: &str, number: u32, config: &GeneratorConfig) -> bool {
    let text = text.trim();
    if extract_literal(text).is_some_and(|(n, _)| n == number)
        || contains_number_token(text, number)
    {
        return true;
    }
    let compact_len = text.chars().filter(|c| !c.is_whitespace()).count();
    compact_len > 0
        && compact_len <= config.max_glyph_token_len
        && expand_token(text, &config.confusion, config.expansion_cap).contains(number)
}

/// Text following the unit at `idx`, up to the next header-like unit.
pub fn body_preview(doc: &Document, idx: usize, max_chars: usize) -> Option<String> {
    let start_page = doc.unit(idx).page;
    let mut preview = String::new();
    for unit in doc.units().iter().skip(idx + 1) {
        if unit.page > start_page + 1
            || is_header_like(&unit.text)
            || doc.repair_mark(&unit.element_id).is_some()
        {
            break;
        }
        let text = unit.text.trim();
        if text.is_empty() {
            continue;
        }
        if !preview.is_empty() {
            preview.push(' ');
        }
        preview.push_str(text);
        if preview.chars().count() >= max_chars {
            break;
        }
    }

    if preview.is_empty() {
        None
    } else {
        Some(preview.chars().take(max_chars).collect())
    }
}
