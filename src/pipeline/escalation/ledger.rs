//! Per-section audit trail of escalation attempts.
//!
//! Append-only: attempts are never removed, and a resolution only moves
//! forward except when a found section is lost again on a later pass.

use std::collections::BTreeMap;

use serde::{Serialize, Serializer};

use super::RepairTier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Found,
    NotFound,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LedgerAttempt {
    pub attempt: u32,
    pub tier: RepairTier,
    pub candidate_pages: Vec<u32>,
    pub evidence: String,
    pub outcome: AttemptOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Resolution {
    Open,
    ResolvedFound { tier: Option<RepairTier> },
    ResolvedAbsent,
    Unresolved,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LedgerEntry {
    pub section_id: u32,
    pub attempts: Vec<LedgerAttempt>,
    pub resolution: Resolution,
}

impl LedgerEntry {
    fn new(section_id: u32) -> Self {
        Self {
            section_id,
            attempts: Vec::new(),
            resolution: Resolution::Open,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolutionLedger {
    entries: BTreeMap<u32, LedgerEntry>,
}

impl ResolutionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `section_id` as missing. A previously found section that went
    /// missing again is reopened.
    pub fn open(&mut self, section_id: u32) {
        let entry = self
            .entries
            .entry(section_id)
            .or_insert_with(|| LedgerEntry::new(section_id));
        if matches!(entry.resolution, Resolution::ResolvedFound { .. } | Resolution::Unresolved) {
            entry.resolution = Resolution::Open;
        }
    }

    pub fn record(&mut self, section_id: u32, attempt: LedgerAttempt) {
        self.entries
            .entry(section_id)
            .or_insert_with(|| LedgerEntry::new(section_id))
            .attempts
            .push(attempt);
    }

    pub fn is_open(&self, section_id: u32) -> bool {
        self.entries
            .get(&section_id)
            .is_some_and(|e| e.resolution == Resolution::Open)
    }

    pub fn resolve_found(&mut self, section_id: u32, tier: Option<RepairTier>) {
        if let Some(entry) = self.entries.get_mut(&section_id) {
            entry.resolution = Resolution::ResolvedFound { tier };
        }
    }

    /// Allow-listed section confirmed absent; no repair is attempted.
    pub fn resolve_absent(&mut self, section_id: u32) {
        self.entries
            .entry(section_id)
            .or_insert_with(|| LedgerEntry::new(section_id))
            .resolution = Resolution::ResolvedAbsent;
    }

    /// Close every open entry as unresolved.
    pub fn close_unresolved(&mut self) {
        for entry in self.entries.values_mut() {
            if entry.resolution == Resolution::Open {
                entry.resolution = Resolution::Unresolved;
            }
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = &LedgerEntry> {
        self.entries.values()
    }

    pub fn get(&self, section_id: u32) -> Option<&LedgerEntry> {
        self.entries.get(&section_id)
    }

    pub fn unresolved(&self) -> Vec<u32> {
        self.entries
            .values()
            .filter(|e| e.resolution == Resolution::Unresolved)
            .map(|e| e.section_id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for ResolutionLedger {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.entries.values())
    }
}
