//! Event observation.
//!
//! Taps are listeners that observe transitions without taking part in the
//! cascade: logging, recorders in tests, progress reporting.

use crate::bus::Listener;
use crate::events::{CaseEvent, Envelope, RunEvent, StudyEvent};

/// Logs every transition through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTap;

impl Listener<RunEvent> for TracingTap {
    fn on_event(&self, envelope: &Envelope<RunEvent>) {
        match envelope.event {
            RunEvent::SubmissionError | RunEvent::DeletionError => {
                tracing::warn!(run_id = envelope.source, event = ?envelope.event, "run transition")
            }
            _ => tracing::info!(run_id = envelope.source, event = ?envelope.event, "run transition"),
        }
    }
}

impl Listener<CaseEvent> for TracingTap {
    fn on_event(&self, envelope: &Envelope<CaseEvent>) {
        match envelope.event {
            CaseEvent::Failed | CaseEvent::MaxFlexError | CaseEvent::PreparationFailed => {
                tracing::warn!(case_id = envelope.source, event = ?envelope.event, "case transition")
            }
            _ => tracing::info!(case_id = envelope.source, event = ?envelope.event, "case transition"),
        }
    }
}

impl Listener<StudyEvent> for TracingTap {
    fn on_event(&self, envelope: &Envelope<StudyEvent>) {
        tracing::info!(study_id = envelope.source, event = ?envelope.event, "study transition");
    }
}
