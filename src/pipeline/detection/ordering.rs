//! Global reading-order check across all candidates of one detector run.
//!
//! Sections in a gamebook appear in ascending order. A pair of candidates
//! conflicts when the lower number sits more than `page_threshold` pages
//! after the higher one. Candidates are removed greedily until no pair
//! conflicts.

use std::cmp::Ordering;

use serde::Serialize;

use crate::pipeline::types::BoundaryCandidate;

/// A candidate removed for breaking reading order.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OrderingDrop {
    pub section_id: u32,
    pub element_id: String,
    pub page: u32,
    pub conflicts: usize,
}

#[derive(Debug, Clone, Default)]
pub struct OrderingOutcome {
    pub kept: Vec<BoundaryCandidate>,
    pub dropped: Vec<OrderingDrop>,
}

pub struct OrderingFilter {
    page_threshold: u32,
}

impl OrderingFilter {
    pub fn new(page_threshold: u32) -> Self {
        Self { page_threshold }
    }

    pub fn conflicts(&self, a: &BoundaryCandidate, b: &BoundaryCandidate) -> bool {
        let (low, high) = match a.section_id.cmp(&b.section_id) {
            Ordering::Less => (a, b),
            Ordering::Greater => (b, a),
            Ordering::Equal => return false,
        };
        low.page > high.page.saturating_add(self.page_threshold)
    }

    pub fn apply(&self, mut candidates: Vec<BoundaryCandidate>) -> OrderingOutcome {
        candidates.sort_by(|a, b| {
            a.position
                .cmp(&b.position)
                .then_with(|| a.section_id.cmp(&b.section_id))
        });

        let n = candidates.len();
        let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); n];
        for i in 0..n {
            for j in (i + 1)..n {
                if self.conflicts(&candidates[i], &candidates[j]) {
                    adjacency[i].push(j);
                    adjacency[j].push(i);
                }
            }
        }

        let mut degree: Vec<usize> = adjacency.iter().map(Vec::len).collect();
        let mut alive = vec![true; n];
        let mut dropped = Vec::new();

        loop {
            let victim = (0..n)
                .filter(|&i| alive[i] && degree[i] > 0)
                .max_by(|&a, &b| drop_priority(&candidates, &degree, a, b));
            let Some(victim) = victim else { break };

            alive[victim] = false;
            for &other in &adjacency[victim] {
                if alive[other] {
                    degree[other] -= 1;
                }
            }

            let c = &candidates[victim];
            tracing::debug!(
                section = c.section_id,
                element = %c.element_id,
                page = c.page,
                conflicts = adjacency[victim].len(),
                "Dropped out-of-order candidate"
            );
            dropped.push(OrderingDrop {
                section_id: c.section_id,
                element_id: c.element_id.clone(),
                page: c.page,
                conflicts: adjacency[victim].len(),
            });
        }

        let kept = candidates
            .into_iter()
            .zip(alive)
            .filter_map(|(c, keep)| keep.then_some(c))
            .collect();

        OrderingOutcome { kept, dropped }
    }
}

/// Greater means "drop first": more live conflicts, untrusted, lower
/// confidence, later position.
fn drop_priority(
    candidates: &[BoundaryCandidate],
    degree: &[usize],
    a: usize,
    b: usize,
) -> Ordering {
    let (ca, cb) = (&candidates[a], &candidates[b]);
    degree[a]
        .cmp(&degree[b])
        .then_with(|| cb.trusted.cmp(&ca.trusted))
        .then_with(|| cb.confidence.total_cmp(&ca.confidence))
        .then_with(|| ca.position.cmp(&cb.position))
        .then_with(|| ca.section_id.cmp(&cb.section_id))
}
