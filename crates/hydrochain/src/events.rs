//! Transition events, one flat enum per aggregate.
//!
//! Events are facts: each one is emitted after the aggregate that produced
//! it has been persisted with its post-state.

use crate::model::{CaseState, StudyState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Run lifecycle transitions reported by the Run Controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunEvent {
    SubmissionRequested,
    SubmissionSuccess,
    SubmissionError,
    ExecutionStart,
    ExecutionEnd,
    ExecutionTimeout,
    DeletionRequested,
    DeletionError,
    DeletionSuccess,
}

/// Case transitions. `Completed` and `Failed` are terminal and emitted
/// exactly once per case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CaseEvent {
    Initialized,
    PreparationStarted,
    Prepared,
    PreparationFailed,
    SubmissionStarted,
    Queued,
    ExecutionStarted,
    ExecutionFailed,
    Infeasible,
    DataError,
    ConvergenceError,
    NotConverged,
    FlexRequested,
    FlexSuccess,
    MaxFlexError,
    Repaired,
    TimedOut,
    Completed,
    Failed,
}

impl CaseEvent {
    /// Case state persisted before this event is emitted, when the event
    /// corresponds to a state entry.
    pub fn post_state(&self) -> Option<CaseState> {
        Some(match self {
            CaseEvent::Initialized => CaseState::Initialized,
            CaseEvent::PreparationStarted => CaseState::Preparing,
            CaseEvent::Prepared => CaseState::Prepared,
            CaseEvent::PreparationFailed => CaseState::PrepError,
            CaseEvent::SubmissionStarted => CaseState::StartingExecution,
            CaseEvent::Queued => CaseState::WaitingInQueue,
            CaseEvent::ExecutionStarted => CaseState::Executing,
            CaseEvent::ExecutionFailed => CaseState::ExecError,
            CaseEvent::DataError => CaseState::DataError,
            CaseEvent::ConvergenceError => CaseState::ConvergenceError,
            CaseEvent::NotConverged => CaseState::NotConverged,
            CaseEvent::FlexRequested => CaseState::Flexibilizing,
            CaseEvent::MaxFlexError => CaseState::MaxFlexError,
            CaseEvent::TimedOut => CaseState::CommunicationError,
            CaseEvent::Completed => CaseState::Done,
            CaseEvent::Failed => CaseState::Error,
            CaseEvent::Infeasible | CaseEvent::FlexSuccess | CaseEvent::Repaired => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CaseEvent::Completed | CaseEvent::Failed)
    }
}

/// Study transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StudyEvent {
    PrepareRequested,
    PrepareSuccess,
    PrepareError,
    StartRequested,
    StartSuccess,
    StartError,
    NextCase,
    Done,
    Error,
}

impl StudyEvent {
    pub fn post_state(&self) -> Option<StudyState> {
        match self {
            StudyEvent::PrepareSuccess => Some(StudyState::Started),
            StudyEvent::StartSuccess => Some(StudyState::Executing),
            StudyEvent::Done => Some(StudyState::Done),
            StudyEvent::Error | StudyEvent::PrepareError | StudyEvent::StartError => {
                Some(StudyState::Error)
            }
            _ => None,
        }
    }
}

/// An event together with the id of the aggregate that emitted it.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<E> {
    pub source: i64,
    pub event: E,
    pub at: DateTime<Utc>,
}

impl<E> Envelope<E> {
    pub fn new(source: i64, event: E) -> Self {
        Self {
            source,
            event,
            at: Utc::now(),
        }
    }
}
