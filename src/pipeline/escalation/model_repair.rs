//! Tier 2: ask a completion model which window unit starts the section.

use std::sync::Arc;

use super::cache::{CacheMode, RepairCache};
use super::{RepairError, RepairTier, RepairWindow, Repairer, TierOutcome};
use crate::pipeline::completion::{
    build_repair_prompt, parse_repair_answer, CompletionClient, REPAIR_SYSTEM_PROMPT,
};
use crate::pipeline::document::{Document, RepairMark, RepairSet};
use crate::pipeline::types::{DetectionMethod, TextUnit};

const MODEL_REPAIR_CONFIDENCE: f32 = 0.8;

pub struct ModelRepairer {
    client: Arc<dyn CompletionClient>,
    cache: Arc<RepairCache>,
    model: String,
    max_units: usize,
}

impl ModelRepairer {
    pub fn new(
        client: Arc<dyn CompletionClient>,
        cache: Arc<RepairCache>,
        model: impl Into<String>,
        max_units: usize,
    ) -> Self {
        Self {
            client,
            cache,
            model: model.into(),
            max_units: max_units.max(1),
        }
    }
}

impl Repairer for ModelRepairer {
    fn tier(&self) -> RepairTier {
        RepairTier::Model
    }

    fn repair(&self, doc: &Document, window: &RepairWindow) -> Result<TierOutcome, RepairError> {
        let number = window.section_id;
        let units: Vec<&TextUnit> = window
            .units(doc)
            .into_iter()
            .map(|(_, u)| u)
            .filter(|u| !u.text.trim().is_empty() && doc.repair_mark(&u.element_id).is_none())
            .take(self.max_units)
            .collect();
        if units.is_empty() {
            return Ok(TierOutcome::NotFound {
                evidence: "window holds no unclaimed text".into(),
            });
        }

        let prompt = build_repair_prompt(
            number,
            window.previous.as_ref().map(|p| p.section_id),
            window.next.as_ref().map(|n| n.section_id),
            &units,
        );
        let ids: Vec<String> = units.iter().map(|u| u.element_id.clone()).collect();
        let key = RepairCache::key(CacheMode::Repair, &self.model, &prompt, &ids);

        let response = self
            .cache
            .get_or_call(window.first_page, CacheMode::Repair, &self.model, &key, || {
                self.client.generate(&self.model, &prompt, REPAIR_SYSTEM_PROMPT)
            })?;
        let answer = parse_repair_answer(&response)?;

        let Some(element_id) = answer.element_id else {
            return Ok(TierOutcome::NotFound {
                evidence: format!("model found no header for {number} among {} units", ids.len()),
            });
        };
        if answer.section_id.is_some_and(|id| id != number) {
            return Ok(TierOutcome::NotFound {
                evidence: format!(
                    "model answered section {:?} instead of {number}",
                    answer.section_id
                ),
            });
        }
        let Some(unit) = units.iter().find(|u| u.element_id == element_id) else {
            return Ok(TierOutcome::NotFound {
                evidence: format!("model answered '{element_id}', outside the window"),
            });
        };

        let mut repairs = RepairSet::new();
        repairs.mark(
            element_id.clone(),
            RepairMark {
                section_id: number,
                confidence: MODEL_REPAIR_CONFIDENCE,
                tier: RepairTier::Model,
                method: DetectionMethod::ModelAssisted {
                    model: self.model.clone(),
                    raw_text: unit.text.trim().to_string(),
                },
            },
        );
        Ok(TierOutcome::Found {
            repairs,
            evidence: format!("{} answered {element_id} on page {}", self.model, unit.page),
        })
    }
}
