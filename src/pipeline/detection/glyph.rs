//! OCR glyph-confusion expansion.
//!
//! Each character of a short token maps to the strings it may really have
//! been ("O" → "0", "l" → "1", "." → ""). The cross product is walked in a
//! fixed mixed-radix order and cut off at a hard cap, so the same token and
//! table always yield the same numbers.

use std::collections::BTreeMap;

/// Numbers recovered from one token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlyphExpansion {
    /// Candidate number → fewest substitutions that produced it.
    pub numbers: BTreeMap<u32, u32>,
    /// Combinations examined (never above the cap).
    pub combinations: usize,
    /// The cross product was larger than the cap.
    pub truncated: bool,
}

impl GlyphExpansion {
    pub fn is_empty(&self) -> bool {
        self.numbers.is_empty()
    }

    pub fn contains(&self, number: u32) -> bool {
        self.numbers.contains_key(&number)
    }
}

/// Expand `token` into every plausible 1–3 digit number.
///
/// Whitespace is ignored. A character that is neither a digit nor in the
/// table makes the whole token non-numeric.
pub fn expand_token(
    token: &str,
    table: &BTreeMap<char, Vec<String>>,
    cap: usize,
) -> GlyphExpansion {
    let mut options: Vec<Vec<(&str, u32)>> = Vec::new();
    for c in token.chars().filter(|c| !c.is_whitespace()) {
        if c.is_ascii_digit() {
            let start = c as usize - '0' as usize;
            options.push(vec![(&DIGITS[start..start + 1], 0)]);
        } else if let Some(subs) = table.get(&c) {
            if subs.is_empty() {
                return GlyphExpansion::default();
            }
            options.push(subs.iter().map(|s| (s.as_str(), 1)).collect());
        } else {
            return GlyphExpansion::default();
        }
    }

    if options.is_empty() || cap == 0 {
        return GlyphExpansion::default();
    }

    let total = options
        .iter()
        .try_fold(1usize, |acc, o| acc.checked_mul(o.len()))
        .unwrap_or(usize::MAX);
    let limit = total.min(cap);

    let mut expansion = GlyphExpansion {
        numbers: BTreeMap::new(),
        combinations: limit,
        truncated: total > cap,
    };

    let mut counters = vec![0usize; options.len()];
    let mut candidate = String::with_capacity(options.len());
    for _ in 0..limit {
        candidate.clear();
        let mut substitutions = 0;
        for (slot, &choice) in counters.iter().enumerate() {
            let (text, cost) = options[slot][choice];
            candidate.push_str(text);
            substitutions += cost;
        }

        if let Some(number) = parse_section_number(&candidate) {
            expansion
                .numbers
                .entry(number)
                .and_modify(|best| *best = (*best).min(substitutions))
                .or_insert(substitutions);
        }

        // Advance the mixed-radix counter, last position fastest.
        for slot in (0..counters.len()).rev() {
            counters[slot] += 1;
            if counters[slot] < options[slot].len() {
                break;
            }
            counters[slot] = 0;
        }
    }

    expansion
}

const DIGITS: &str = "0123456789";

/// 1–3 ASCII digits, no leading zero.
pub fn parse_section_number(s: &str) -> Option<u32> {
    if s.is_empty() || s.len() > 3 || s.starts_with('0') {
        return None;
    }
    if !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}
