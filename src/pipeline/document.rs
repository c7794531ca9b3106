//! Sorted, indexed view over the text units of one book.
//!
//! Repairs never patch a `Document` in place: `with_repairs` returns a new
//! document carrying the overlay, and detection re-runs on it from scratch.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Serialize;

use super::escalation::RepairTier;
use super::input::InputError;
use super::types::{DetectionMethod, DocPosition, MacroRegion, MacroRegionKind, TextUnit};

/// A repair's claim that a unit starts a section.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RepairMark {
    pub section_id: u32,
    pub confidence: f32,
    pub tier: RepairTier,
    pub method: DetectionMethod,
}

/// Overlay produced by one or more repair tiers.
#[derive(Debug, Clone, Default)]
pub struct RepairSet {
    marks: BTreeMap<String, RepairMark>,
    inserted: Vec<TextUnit>,
}

impl RepairSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&mut self, element_id: impl Into<String>, mark: RepairMark) {
        self.marks.insert(element_id.into(), mark);
    }

    /// Add a synthetic unit together with the mark that explains it.
    pub fn insert(&mut self, unit: TextUnit, mark: RepairMark) {
        self.marks.insert(unit.element_id.clone(), mark);
        self.inserted.push(unit);
    }

    pub fn extend(&mut self, other: RepairSet) {
        self.marks.extend(other.marks);
        self.inserted.extend(other.inserted);
    }

    pub fn is_empty(&self) -> bool {
        self.marks.is_empty() && self.inserted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.marks.len()
    }
}

#[derive(Debug, Clone)]
pub struct Document {
    units: Vec<TextUnit>,
    index: HashMap<String, usize>,
    regions: Vec<MacroRegion>,
    repairs: HashMap<String, RepairMark>,
}

impl Document {
    pub fn new(mut units: Vec<TextUnit>, regions: Vec<MacroRegion>) -> Result<Self, InputError> {
        if units.is_empty() {
            return Err(InputError::EmptyInput);
        }

        let mut seen = HashSet::with_capacity(units.len());
        for unit in &units {
            if !seen.insert(unit.element_id.as_str()) {
                return Err(InputError::DuplicateElementId(unit.element_id.clone()));
            }
        }

        units.sort_by(|a, b| {
            a.position()
                .cmp(&b.position())
                .then_with(|| a.element_id.cmp(&b.element_id))
        });
        let index = build_index(&units);

        Ok(Self {
            units,
            index,
            regions,
            repairs: HashMap::new(),
        })
    }

    /// New document with `repairs` applied. Inserted units whose id already
    /// exists are skipped.
    pub fn with_repairs(&self, repairs: &RepairSet) -> Document {
        let mut units = self.units.clone();
        for unit in &repairs.inserted {
            if !self.index.contains_key(&unit.element_id)
                && !units.iter().any(|u| u.element_id == unit.element_id)
            {
                units.push(unit.clone());
            }
        }
        units.sort_by(|a, b| {
            a.position()
                .cmp(&b.position())
                .then_with(|| a.element_id.cmp(&b.element_id))
        });
        let index = build_index(&units);

        let mut marks = self.repairs.clone();
        for (id, mark) in &repairs.marks {
            if index.contains_key(id) {
                marks.insert(id.clone(), mark.clone());
            }
        }

        Document {
            units,
            index,
            regions: self.regions.clone(),
            repairs: marks,
        }
    }

    pub fn units(&self) -> &[TextUnit] {
        &self.units
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn unit(&self, idx: usize) -> &TextUnit {
        &self.units[idx]
    }

    pub fn index_of(&self, element_id: &str) -> Option<usize> {
        self.index.get(element_id).copied()
    }

    pub fn get(&self, element_id: &str) -> Option<&TextUnit> {
        self.index_of(element_id).map(|i| &self.units[i])
    }

    pub fn position_of(&self, element_id: &str) -> Option<DocPosition> {
        self.get(element_id).map(TextUnit::position)
    }

    pub fn regions(&self) -> &[MacroRegion] {
        &self.regions
    }

    pub fn repair_mark(&self, element_id: &str) -> Option<&RepairMark> {
        self.repairs.get(element_id)
    }

    pub fn repair_count(&self) -> usize {
        self.repairs.len()
    }

    pub fn region_of(&self, page: u32) -> Option<MacroRegionKind> {
        self.regions.iter().find(|r| r.contains(page)).map(|r| r.kind)
    }

    /// Without regions every page is gameplay. With regions but no explicit
    /// gameplay range, anything outside front/end matter is gameplay.
    pub fn is_gameplay(&self, page: u32) -> bool {
        if self.regions.is_empty() {
            return true;
        }
        let has_gameplay = self
            .regions
            .iter()
            .any(|r| r.kind == MacroRegionKind::Gameplay);
        match self.region_of(page) {
            Some(MacroRegionKind::Gameplay) => true,
            Some(_) => false,
            None => !has_gameplay,
        }
    }

    /// Indices of gameplay units, in document order.
    pub fn gameplay_indices(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.units.len()).filter(move |&i| self.is_gameplay(self.units[i].page))
    }

    pub fn last_gameplay_page(&self) -> u32 {
        self.units
            .iter()
            .rev()
            .find(|u| self.is_gameplay(u.page))
            .or_else(|| self.units.last())
            .map(|u| u.page)
            .unwrap_or(0)
    }

    /// Index range of the units on `page`.
    pub fn page_range(&self, page: u32) -> std::ops::Range<usize> {
        let start = self.units.partition_point(|u| u.page < page);
        let end = self.units.partition_point(|u| u.page <= page);
        start..end
    }

    pub fn page_units(&self, page: u32) -> &[TextUnit] {
        &self.units[self.page_range(page)]
    }

    /// Same-page units immediately before and after `idx`.
    pub fn page_neighbors(&self, idx: usize) -> (Option<&TextUnit>, Option<&TextUnit>) {
        let page = self.units[idx].page;
        let prev = idx
            .checked_sub(1)
            .map(|i| &self.units[i])
            .filter(|u| u.page == page);
        let next = self.units.get(idx + 1).filter(|u| u.page == page);
        (prev, next)
    }

    /// Units whose page lies in `first..=last`.
    pub fn units_in_pages(&self, first: u32, last: u32) -> &[TextUnit] {
        let start = self.units.partition_point(|u| u.page < first);
        let end = self.units.partition_point(|u| u.page <= last);
        &self.units[start..end.max(start)]
    }

    pub fn first_page(&self) -> u32 {
        self.units.first().map(|u| u.page).unwrap_or(0)
    }

    pub fn last_page(&self) -> u32 {
        self.units.last().map(|u| u.page).unwrap_or(0)
    }
}

fn build_index(units: &[TextUnit]) -> HashMap<String, usize> {
    units
        .iter()
        .enumerate()
        .map(|(i, u)| (u.element_id.clone(), i))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::Slot;

    fn unit(id: &str, page: u32, seq: u32, text: &str) -> TextUnit {
        TextUnit::new(id, page, seq, text)
    }

    #[test]
    fn sorts_by_position() {
        let doc = Document::new(
            vec![unit("b", 2, 0, "x"), unit("a", 1, 3, "y"), unit("c", 1, 1, "z")],
            vec![],
        )
        .unwrap();
        let ids: Vec<&str> = doc.units().iter().map(|u| u.element_id.as_str()).collect();
        assert_eq!(ids, ["c", "a", "b"]);
        assert_eq!(doc.index_of("b"), Some(2));
    }

    #[test]
    fn duplicate_ids_rejected() {
        let err =
            Document::new(vec![unit("a", 1, 0, "x"), unit("a", 1, 1, "y")], vec![]).unwrap_err();
        assert!(matches!(err, InputError::DuplicateElementId(id) if id == "a"));
    }

    #[test]
    fn gameplay_scoping() {
        let regions = vec![
            MacroRegion {
                kind: MacroRegionKind::FrontMatter,
                start_page: 1,
                end_page: 2,
            },
            MacroRegion {
                kind: MacroRegionKind::Gameplay,
                start_page: 3,
                end_page: 5,
            },
        ];
        let doc = Document::new(
            vec![unit("a", 1, 0, "x"), unit("b", 3, 0, "y"), unit("c", 9, 0, "z")],
            regions,
        )
        .unwrap();
        assert!(!doc.is_gameplay(1));
        assert!(doc.is_gameplay(4));
        assert!(!doc.is_gameplay(9));
        assert_eq!(doc.gameplay_indices().collect::<Vec<_>>(), vec![1]);
        assert_eq!(doc.last_gameplay_page(), 3);
    }

    #[test]
    fn page_neighbors_stay_on_page() {
        let doc = Document::new(
            vec![unit("a", 1, 0, "x"), unit("b", 2, 0, "y"), unit("c", 2, 1, "z")],
            vec![],
        )
        .unwrap();
        let (prev, next) = doc.page_neighbors(1);
        assert!(prev.is_none());
        assert_eq!(next.unwrap().element_id, "c");
    }

    #[test]
    fn repairs_produce_new_document() {
        let doc = Document::new(
            vec![unit("a", 1, 0, "Body."), unit("b", 1, 1, "More.")],
            vec![],
        )
        .unwrap();
        let mut repairs = RepairSet::new();
        let mut header = unit("vision-p1-80", 1, 1, "80");
        header.slot = Slot::Before;
        repairs.insert(
            header,
            RepairMark {
                section_id: 80,
                confidence: 0.9,
                tier: RepairTier::Vision,
                method: DetectionMethod::VisionOcr {
                    model: "m".into(),
                    page: 1,
                    line: "80".into(),
                },
            },
        );

        let repaired = doc.with_repairs(&repairs);
        assert_eq!(doc.len(), 2);
        assert_eq!(repaired.len(), 3);
        assert_eq!(repaired.unit(1).element_id, "vision-p1-80");
        assert!(repaired.repair_mark("vision-p1-80").is_some());
        assert!(doc.repair_mark("vision-p1-80").is_none());
    }
}
