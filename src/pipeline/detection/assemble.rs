//! Boundary assembly: one winner per section number, then linked spans.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;

use serde::Serialize;

use super::candidates::is_header_like;
use super::DetectorKind;
use crate::config::AssemblerConfig;
use crate::pipeline::document::Document;
use crate::pipeline::types::{BoundaryCandidate, BoundarySpan, MacroRegionKind};

// ──────────────────────────────────────────────
// Reports
// ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DuplicateAlternative {
    pub element_id: String,
    pub page: u32,
    pub follow_text: usize,
    /// Sørensen–Dice similarity of this alternative's body preview to the winner's.
    pub similarity: f64,
    /// Sits between the resolved neighbouring sections.
    pub in_order: bool,
    /// In order and within the dedup margin of the winner.
    pub ambiguous: bool,
}

/// A section number claimed by more than one unit.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DuplicateReport {
    pub section_id: u32,
    pub detector: DetectorKind,
    pub chosen_element_id: String,
    pub chosen_page: u32,
    pub chosen_follow_text: usize,
    pub alternatives: Vec<DuplicateAlternative>,
    pub ambiguous: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OrderingViolation {
    EndBeforeStart {
        section_id: u32,
        start_page: u32,
        end_page: u32,
    },
    IdInversion {
        section_id: u32,
        page: u32,
        previous_section_id: u32,
        previous_page: u32,
    },
}

#[derive(Debug, Clone, Default)]
pub struct Assembly {
    pub spans: Vec<BoundarySpan>,
    pub duplicates: Vec<DuplicateReport>,
}

// ──────────────────────────────────────────────
// Assembler
// ──────────────────────────────────────────────

pub struct BoundaryAssembler<'a> {
    config: &'a AssemblerConfig,
    detector: DetectorKind,
}

impl<'a> BoundaryAssembler<'a> {
    pub fn new(config: &'a AssemblerConfig, detector: DetectorKind) -> Self {
        Self { config, detector }
    }

    pub fn assemble(&self, doc: &Document, candidates: Vec<BoundaryCandidate>) -> Assembly {
        let candidate_units: HashSet<&str> =
            candidates.iter().map(|c| c.element_id.as_str()).collect();
        let max_pages = self.config.follow_text_max_pages;
        let scores: Vec<usize> = candidates
            .iter()
            .map(|c| follow_text_strength(doc, &c.element_id, &candidate_units, max_pages))
            .collect();

        let per_unit = best_claim_per_unit(&candidates);

        let mut by_number: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
        for &i in &per_unit {
            by_number.entry(candidates[i].section_id).or_default().push(i);
        }

        // Single claims fix the order. Repeated numbers resolve in id order
        // and only consider claims that sit between their resolved
        // neighbours, when any do.
        let mut chosen: BTreeMap<u32, usize> = by_number
            .iter()
            .filter(|(_, group)| group.len() == 1)
            .map(|(&id, group)| (id, group[0]))
            .collect();
        let mut duplicates = Vec::new();
        for (&section_id, group) in by_number.iter().filter(|(_, group)| group.len() > 1) {
            let lower = chosen
                .range(..section_id)
                .next_back()
                .map(|(_, &i)| candidates[i].position);
            let upper = chosen
                .range((Bound::Excluded(section_id), Bound::Unbounded))
                .next()
                .map(|(_, &i)| candidates[i].position);
            let fits = |i: usize| {
                let position = candidates[i].position;
                lower.map_or(true, |l| position > l) && upper.map_or(true, |u| position < u)
            };

            let fitting: Vec<usize> = group.iter().copied().filter(|&i| fits(i)).collect();
            let pool = if fitting.is_empty() { group.as_slice() } else { fitting.as_slice() };
            let best = strongest(pool, &candidates, &scores);

            duplicates.push(self.duplicate_report(
                section_id,
                best,
                group,
                &candidates,
                &scores,
                &fits,
            ));
            chosen.insert(section_id, best);
        }
        let winners: Vec<usize> = chosen.into_values().collect();

        let spans = winners
            .into_iter()
            .map(|i| {
                let c = &candidates[i];
                BoundarySpan {
                    section_id: c.section_id,
                    start_element_id: c.element_id.clone(),
                    end_element_id: None,
                    start_page: c.page,
                    end_page: c.page,
                    confidence: c.confidence,
                    evidence: c.method.clone(),
                    detector: self.detector,
                    macro_section: None,
                }
            })
            .collect();

        Assembly {
            spans: link_spans(doc, spans),
            duplicates,
        }
    }

    fn duplicate_report(
        &self,
        section_id: u32,
        best: usize,
        group: &[usize],
        candidates: &[BoundaryCandidate],
        scores: &[usize],
        fits: &dyn Fn(usize) -> bool,
    ) -> DuplicateReport {
        let chosen = &candidates[best];
        let chosen_preview = chosen.body_preview.as_deref().unwrap_or("");
        let margin = self.config.dedup_margin as usize;

        let alternatives: Vec<DuplicateAlternative> = group
            .iter()
            .filter(|&&i| i != best)
            .map(|&i| {
                let c = &candidates[i];
                let in_order = fits(i);
                let preview = c.body_preview.as_deref().unwrap_or("");
                DuplicateAlternative {
                    element_id: c.element_id.clone(),
                    page: c.page,
                    follow_text: scores[i],
                    similarity: strsim::sorensen_dice(chosen_preview, preview),
                    in_order,
                    ambiguous: in_order && scores[best].saturating_sub(scores[i]) <= margin,
                }
            })
            .collect();

        let ambiguous = alternatives.iter().any(|a| a.ambiguous);
        if ambiguous {
            tracing::info!(
                section = section_id,
                chosen = %chosen.element_id,
                alternatives = alternatives.len(),
                "Ambiguous duplicate header"
            );
        }

        DuplicateReport {
            section_id,
            detector: self.detector,
            chosen_element_id: chosen.element_id.clone(),
            chosen_page: chosen.page,
            chosen_follow_text: scores[best],
            alternatives,
            ambiguous,
        }
    }
}

/// Most follow text wins; ties keep the earliest position.
fn strongest(pool: &[usize], candidates: &[BoundaryCandidate], scores: &[usize]) -> usize {
    pool.iter()
        .copied()
        .reduce(|best, i| {
            let earlier = candidates[i].position < candidates[best].position;
            let stronger = scores[i] > scores[best] || (scores[i] == scores[best] && earlier);
            if stronger {
                i
            } else {
                best
            }
        })
        .unwrap_or(pool[0])
}

/// One claim per unit: a glyph-expanded token can yield several numbers,
/// but a unit starts at most one section. Highest confidence wins, then
/// the lower number.
fn best_claim_per_unit(candidates: &[BoundaryCandidate]) -> Vec<usize> {
    let mut best: HashMap<&str, usize> = HashMap::new();
    for (i, c) in candidates.iter().enumerate() {
        best.entry(c.element_id.as_str())
            .and_modify(|current| {
                let cur = &candidates[*current];
                let better = c.trusted && !cur.trusted
                    || (c.trusted == cur.trusted
                        && (c.confidence > cur.confidence
                            || (c.confidence == cur.confidence && c.section_id < cur.section_id)));
                if better {
                    *current = i;
                }
            })
            .or_insert(i);
    }
    let mut kept: Vec<usize> = best.into_values().collect();
    kept.sort_unstable();
    kept
}

/// Alphanumeric characters of body text after a header, up to the next
/// header-like unit or candidate, within `max_pages` pages.
pub fn follow_text_strength(
    doc: &Document,
    element_id: &str,
    candidate_units: &HashSet<&str>,
    max_pages: u32,
) -> usize {
    let Some(idx) = doc.index_of(element_id) else {
        return 0;
    };
    let start_page = doc.unit(idx).page;
    let limit = start_page.saturating_add(max_pages);

    // Fused headers ("272Text fused") carry body text in the same unit.
    let own = doc.unit(idx).text.chars().filter(|c| c.is_alphabetic()).count();

    let mut total = own;
    for unit in &doc.units()[idx + 1..] {
        if unit.page > limit
            || candidate_units.contains(unit.element_id.as_str())
            || is_header_like(&unit.text)
        {
            break;
        }
        total += unit.text.chars().filter(|c| c.is_alphanumeric()).count();
    }
    total
}

/// Sort spans by start position, drop unknown or repeated starts, and set
/// each span's end to the next span's start. Earlier entries win repeats.
pub fn link_spans(doc: &Document, spans: Vec<BoundarySpan>) -> Vec<BoundarySpan> {
    let mut seen_ids = HashSet::new();
    let mut seen_starts = HashSet::new();
    let mut positioned = Vec::with_capacity(spans.len());

    for span in spans {
        let Some(position) = doc.position_of(&span.start_element_id) else {
            tracing::debug!(
                section = span.section_id,
                element = %span.start_element_id,
                "Dropping span with unknown start element"
            );
            continue;
        };
        if seen_ids.contains(&span.section_id) || seen_starts.contains(&span.start_element_id) {
            continue;
        }
        seen_ids.insert(span.section_id);
        seen_starts.insert(span.start_element_id.clone());
        positioned.push((position, span));
    }

    positioned.sort_by(|(pa, a), (pb, b)| pa.cmp(pb).then_with(|| a.section_id.cmp(&b.section_id)));

    let last_page = doc.last_gameplay_page();
    let starts: Vec<(String, u32)> = positioned
        .iter()
        .map(|(_, s)| (s.start_element_id.clone(), s.start_page))
        .collect();

    positioned
        .into_iter()
        .enumerate()
        .map(|(i, (position, mut span))| {
            span.start_page = position.page;
            match starts.get(i + 1) {
                Some((next_id, next_page)) => {
                    span.end_element_id = Some(next_id.clone());
                    span.end_page = *next_page;
                }
                None => {
                    span.end_element_id = None;
                    span.end_page = last_page.max(span.start_page);
                }
            }
            span.macro_section = macro_section_for(doc, span.start_page);
            span
        })
        .collect()
}

fn macro_section_for(doc: &Document, page: u32) -> Option<MacroRegionKind> {
    if doc.regions().is_empty() {
        return None;
    }
    if doc.is_gameplay(page) {
        Some(MacroRegionKind::Gameplay)
    } else {
        doc.region_of(page)
    }
}

/// End-before-start spans and section-id inversions along document order.
pub fn ordering_violations(spans: &[BoundarySpan]) -> Vec<OrderingViolation> {
    let mut out = Vec::new();
    for span in spans {
        if span.end_page < span.start_page {
            out.push(OrderingViolation::EndBeforeStart {
                section_id: span.section_id,
                start_page: span.start_page,
                end_page: span.end_page,
            });
        }
    }
    for pair in spans.windows(2) {
        if pair[1].section_id < pair[0].section_id {
            out.push(OrderingViolation::IdInversion {
                section_id: pair[1].section_id,
                page: pair[1].start_page,
                previous_section_id: pair[0].section_id,
                previous_page: pair[0].start_page,
            });
        }
    }
    out
}

/// Section ids that break ascending order along the document.
///
/// Keeps a longest strictly increasing run of ids and returns the rest,
/// sorted. An empty result means the spans are strictly ordered.
pub fn out_of_order_ids(spans: &[BoundarySpan]) -> Vec<u32> {
    let ids: Vec<u32> = spans.iter().map(|s| s.section_id).collect();
    let mut tails: Vec<usize> = Vec::new();
    let mut previous: Vec<Option<usize>> = vec![None; ids.len()];

    for (i, &id) in ids.iter().enumerate() {
        let at = tails.partition_point(|&t| ids[t] < id);
        previous[i] = at.checked_sub(1).map(|p| tails[p]);
        if at == tails.len() {
            tails.push(i);
        } else {
            tails[at] = i;
        }
    }

    let mut kept = vec![false; ids.len()];
    let mut cursor = tails.last().copied();
    while let Some(i) = cursor {
        kept[i] = true;
        cursor = previous[i];
    }

    let mut out: Vec<u32> = ids
        .iter()
        .zip(&kept)
        .filter(|(_, keep)| !**keep)
        .map(|(&id, _)| id)
        .collect();
    out.sort_unstable();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GeneratorConfig, SectionRange};
    use crate::pipeline::detection::candidates::CandidateGenerator;
    use crate::pipeline::types::{DetectionMethod, MacroRegion, TextUnit};

    fn body(id: &str, page: u32, seq: u32, alnum: usize) -> TextUnit {
        TextUnit::new(id, page, seq, format!("{}.", "a".repeat(alnum)))
    }

    fn assemble(units: Vec<TextUnit>) -> (Document, Assembly) {
        let doc = Document::new(units, vec![]).unwrap();
        let gen_config = GeneratorConfig::default();
        let candidates =
            CandidateGenerator::new(&gen_config, SectionRange::default()).generate(&doc);
        let config = AssemblerConfig::default();
        let assembly =
            BoundaryAssembler::new(&config, DetectorKind::CodeScan).assemble(&doc, candidates);
        (doc, assembly)
    }

    #[test]
    fn strongest_follow_text_wins_in_either_order() {
        // Header "7" appears twice: once before 180 chars of body, once before 40.
        let (_, strong_first) = assemble(vec![
            TextUnit::new("h1", 3, 0, "7"),
            body("b1", 3, 1, 180),
            TextUnit::new("h2", 3, 2, "7"),
            body("b2", 3, 3, 40),
        ]);
        assert_eq!(strong_first.spans.len(), 1);
        assert_eq!(strong_first.spans[0].start_element_id, "h1");

        let (_, weak_first) = assemble(vec![
            TextUnit::new("h1", 3, 0, "7"),
            body("b1", 3, 1, 40),
            TextUnit::new("h2", 3, 2, "7"),
            body("b2", 3, 3, 180),
        ]);
        assert_eq!(weak_first.spans[0].start_element_id, "h2");

        let report = &weak_first.duplicates[0];
        assert_eq!(report.chosen_follow_text, 180);
        assert_eq!(report.alternatives[0].follow_text, 40);
        assert!(!report.ambiguous);
    }

    #[test]
    fn equal_strength_keeps_earliest() {
        let (_, assembly) = assemble(vec![
            TextUnit::new("h1", 3, 0, "7"),
            body("b1", 3, 1, 60),
            TextUnit::new("h2", 4, 0, "7"),
            body("b2", 4, 1, 60),
        ]);
        assert_eq!(assembly.spans[0].start_element_id, "h1");
        assert!(assembly.duplicates[0].ambiguous);
        assert!((assembly.duplicates[0].alternatives[0].similarity - 1.0).abs() < 1e-9);
    }

    #[test]
    fn spans_link_to_next_start() {
        let (doc, assembly) = assemble(vec![
            TextUnit::new("h1", 1, 0, "1"),
            body("b1", 1, 1, 30),
            TextUnit::new("h2", 2, 0, "2"),
            body("b2", 2, 1, 30),
            TextUnit::new("h3", 3, 0, "3"),
            body("b3", 4, 0, 30),
        ]);
        let spans = &assembly.spans;
        assert_eq!(spans.len(), 3);
        assert_eq!(spans[0].end_element_id.as_deref(), Some("h2"));
        assert_eq!(spans[0].end_page, 2);
        assert_eq!(spans[2].end_element_id, None);
        assert_eq!(spans[2].end_page, doc.last_gameplay_page());
        assert!(ordering_violations(spans).is_empty());
    }

    #[test]
    fn link_drops_unknown_and_repeated_starts() {
        let doc = Document::new(
            vec![TextUnit::new("a", 1, 0, "1"), TextUnit::new("b", 2, 0, "2")],
            vec![MacroRegion {
                kind: MacroRegionKind::Gameplay,
                start_page: 1,
                end_page: 2,
            }],
        )
        .unwrap();
        let span = |id: u32, el: &str| BoundarySpan {
            section_id: id,
            start_element_id: el.into(),
            end_element_id: None,
            start_page: 0,
            end_page: 0,
            confidence: 0.7,
            evidence: DetectionMethod::Seeded { prior_confidence: 0.7 },
            detector: DetectorKind::Seeded,
            macro_section: None,
        };
        let linked = link_spans(
            &doc,
            vec![span(2, "b"), span(1, "a"), span(3, "zz"), span(1, "b")],
        );
        let ids: Vec<u32> = linked.iter().map(|s| s.section_id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(linked[0].start_page, 1);
        assert_eq!(linked[0].macro_section, Some(MacroRegionKind::Gameplay));
    }

    #[test]
    fn inversions_reported() {
        let (_, assembly) = assemble(vec![
            TextUnit::new("h1", 1, 0, "5"),
            body("b1", 1, 1, 30),
            TextUnit::new("h2", 2, 0, "4"),
            body("b2", 2, 1, 30),
        ]);
        let violations = ordering_violations(&assembly.spans);
        assert_eq!(violations.len(), 1);
        assert!(matches!(
            violations[0],
            OrderingViolation::IdInversion { section_id: 4, previous_section_id: 5, .. }
        ));
    }

    #[test]
    fn repeated_number_prefers_claim_between_neighbours() {
        // A stray "2" after section 3 carries far more text than the real header.
        let (_, assembly) = assemble(vec![
            TextUnit::new("h1", 1, 0, "1"),
            body("b1", 1, 1, 30),
            TextUnit::new("h2", 2, 0, "2"),
            TextUnit::new("b2", 2, 1, "A guard."),
            TextUnit::new("h3", 3, 0, "3"),
            body("b3", 3, 1, 30),
            TextUnit::new("dice", 4, 0, "2"),
            body("rules", 4, 1, 400),
        ]);
        let starts: Vec<(u32, &str)> = assembly
            .spans
            .iter()
            .map(|s| (s.section_id, s.start_element_id.as_str()))
            .collect();
        assert_eq!(starts, vec![(1, "h1"), (2, "h2"), (3, "h3")]);
        assert!(ordering_violations(&assembly.spans).is_empty());

        let report = assembly.duplicates.iter().find(|d| d.section_id == 2).unwrap();
        assert_eq!(report.chosen_element_id, "h2");
        assert_eq!(report.alternatives[0].element_id, "dice");
        assert!(!report.alternatives[0].in_order);
        assert!(!report.ambiguous);
    }

    #[test]
    fn out_of_order_ids_keep_longest_ascending_run() {
        let (_, assembly) = assemble(vec![
            TextUnit::new("h1", 1, 0, "1"),
            body("b1", 1, 1, 30),
            TextUnit::new("h50", 2, 0, "50"),
            body("b50", 2, 1, 30),
            TextUnit::new("h2", 3, 0, "2"),
            body("b2", 3, 1, 30),
            TextUnit::new("h3", 4, 0, "3"),
            body("b3", 4, 1, 30),
        ]);
        assert_eq!(out_of_order_ids(&assembly.spans), vec![50]);
        assert!(out_of_order_ids(&assembly.spans[..2]).is_empty());
    }

    #[test]
    fn one_section_per_unit() {
        // "4!" expands to 4 and 41 at equal confidence; the lower number is kept.
        let (_, assembly) = assemble(vec![TextUnit::new("h", 1, 0, "4!"), body("b", 1, 1, 10)]);
        assert_eq!(assembly.spans.len(), 1);
        assert_eq!(assembly.spans[0].section_id, 4);
    }
}
