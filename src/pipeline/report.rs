//! Engine progress events.
//!
//! The engine never holds global progress state: every component that reports
//! progress receives a `&dyn ReportSink` from its caller.

use std::sync::Mutex;

use serde::Serialize;

use super::escalation::ledger::AttemptOutcome;
use super::escalation::{EscalationState, RepairTier};

/// Progress events emitted while certifying one book.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    DocumentLoaded {
        units: usize,
        pages: u32,
        regions: usize,
        seeds: usize,
    },
    DetectionFinished {
        attempt: u32,
        spans: usize,
        duplicates: usize,
        violations: usize,
    },
    CoverageChecked {
        found: u32,
        required: u32,
        missing: usize,
        passed: bool,
    },
    StateChanged {
        state: EscalationState,
        attempt: u32,
    },
    RepairAttempted {
        section_id: u32,
        attempt: u32,
        tier: RepairTier,
        outcome: AttemptOutcome,
    },
    Finished {
        state: EscalationState,
        spans: usize,
        missing: usize,
        duration_ms: u64,
    },
}

pub trait ReportSink: Send + Sync {
    fn emit(&self, event: EngineEvent);
}

/// Forwards events to `tracing`.
pub struct TracingSink;

impl ReportSink for TracingSink {
    fn emit(&self, event: EngineEvent) {
        match &event {
            EngineEvent::RepairAttempted {
                outcome: AttemptOutcome::Failed,
                ..
            } => tracing::warn!(?event, "Engine event"),
            EngineEvent::StateChanged { .. } | EngineEvent::RepairAttempted { .. } => {
                tracing::debug!(?event, "Engine event")
            }
            _ => tracing::info!(?event, "Engine event"),
        }
    }
}

/// Records events in memory.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<EngineEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl ReportSink for MemorySink {
    fn emit(&self, event: EngineEvent) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).push(event);
    }
}
