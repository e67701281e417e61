//! Study, Case and Run aggregates.
//!
//! Ownership is strictly downward: a [`Study`] owns its [`Case`]s, a [`Case`]
//! owns its [`Run`]s. Upward references are ids only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};

pub type StudyId = i64;
pub type CaseId = i64;
pub type RunId = i64;

/// Reason recorded on Runs closed by rehydration.
pub const ABANDONED: &str = "abandoned";

// ============================================================================
// Program
// ============================================================================

/// Planning model executed by a case.
///
/// Long-horizon cases are monthly (revision 0); short-horizon cases are
/// weekly and keyed by a revision index greater than zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum Program {
    LongHorizon,
    ShortHorizon,
}

impl Program {
    pub fn as_str(&self) -> &'static str {
        match self {
            Program::LongHorizon => "long_horizon",
            Program::ShortHorizon => "short_horizon",
        }
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Program {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "long_horizon" => Ok(Program::LongHorizon),
            "short_horizon" => Ok(Program::ShortHorizon),
            other => Err(format!("unknown program: {other}")),
        }
    }
}

// ============================================================================
// Study
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StudyState {
    NotStarted,
    Started,
    Executing,
    Done,
    Error,
}

impl StudyState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StudyState::Done | StudyState::Error)
    }
}

/// The outermost container: one chained execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Study {
    pub id: StudyId,
    pub name: String,
    /// Anchor for the relative case paths.
    pub base_path: PathBuf,
    pub state: StudyState,
    /// Owned cases in chain order.
    pub case_ids: Vec<CaseId>,
}

impl Study {
    pub fn new(name: impl Into<String>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            base_path: base_path.into(),
            state: StudyState::NotStarted,
            case_ids: Vec::new(),
        }
    }
}

// ============================================================================
// Case
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CaseState {
    NotStarted,
    Initialized,
    Preparing,
    Prepared,
    PrepError,
    StartingExecution,
    WaitingInQueue,
    Executing,
    DataError,
    ConvergenceError,
    NotConverged,
    MaxFlexError,
    Flexibilizing,
    Done,
    CommunicationError,
    ExecError,
    Error,
}

impl CaseState {
    /// `Done` and `Error` are absorbing.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CaseState::Done | CaseState::Error)
    }

    /// States in which a Run is expected to be alive on the scheduler.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            CaseState::StartingExecution
                | CaseState::WaitingInQueue
                | CaseState::Executing
                | CaseState::Flexibilizing
        )
    }

    pub const ALL: [CaseState; 17] = [
        CaseState::NotStarted,
        CaseState::Initialized,
        CaseState::Preparing,
        CaseState::Prepared,
        CaseState::PrepError,
        CaseState::StartingExecution,
        CaseState::WaitingInQueue,
        CaseState::Executing,
        CaseState::DataError,
        CaseState::ConvergenceError,
        CaseState::NotConverged,
        CaseState::MaxFlexError,
        CaseState::Flexibilizing,
        CaseState::Done,
        CaseState::CommunicationError,
        CaseState::ExecError,
        CaseState::Error,
    ];
}

/// One model execution in the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Case {
    pub id: CaseId,
    pub study_id: StudyId,
    /// Relative to the study base path. Unique within the study.
    pub path: PathBuf,
    pub name: String,
    pub year: i32,
    pub month: u32,
    /// 0 for monthly cases, > 0 for weekly revisions.
    pub revision: u32,
    pub program: Program,
    pub state: CaseState,
    /// Runs in submission order.
    pub run_ids: Vec<RunId>,
}

impl Case {
    /// Chain position: `(year, month, revision)` lexicographic.
    pub fn chain_key(&self) -> (i32, u32, u32) {
        (self.year, self.month, self.revision)
    }

    /// Every run after the first is a flex (or retry) attempt.
    pub fn flex_count(&self) -> usize {
        self.run_ids.len().saturating_sub(1)
    }

    pub fn absolute_path(&self, base_path: &Path) -> PathBuf {
        base_path.join(&self.path)
    }

    /// `(year, month)` of the calendar month before this case's month.
    pub fn previous_month(&self) -> (i32, u32) {
        if self.month <= 1 {
            (self.year - 1, 12)
        } else {
            (self.year, self.month - 1)
        }
    }
}

/// Total order of cases within a study; ties fall back to the id so the
/// order stays deterministic.
pub fn chain_order(a: &Case, b: &Case) -> Ordering {
    a.chain_key()
        .cmp(&b.chain_key())
        .then_with(|| a.id.cmp(&b.id))
}

// ============================================================================
// Run
// ============================================================================

/// Closed set of job states reported by the Queue Adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunState {
    NotStarted,
    Waiting,
    Running,
    Deleting,
    Error,
    Timeout,
    Finished,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Error | RunState::Timeout | RunState::Finished)
    }
}

/// One submission attempt of a case to the batch scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub case_id: CaseId,
    /// Opaque scheduler job id, known after submission.
    pub job_id: Option<String>,
    /// Canonical job name on the scheduler.
    pub name: String,
    pub working_dir: PathBuf,
    pub program: Program,
    pub version: String,
    pub processors: u32,
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub submitted: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub ended: Option<DateTime<Utc>>,
    pub state: RunState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<String>,
}

impl Run {
    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Moves the run to `next`, stamping `started` / `ended` on first entry.
    ///
    /// Terminal runs never move again; the call is ignored and `false` is
    /// returned.
    pub fn enter(&mut self, next: RunState, now: DateTime<Utc>) -> bool {
        if self.state.is_terminal() || self.state == next {
            return false;
        }
        if next == RunState::Running && self.started.is_none() {
            self.started = Some(now);
        }
        if next.is_terminal() && self.ended.is_none() {
            let floor = self.started.unwrap_or(now);
            self.ended = Some(now.max(floor));
        }
        self.state = next;
        true
    }

    /// Closes a non-terminal run as an error with the given reason.
    pub fn close(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> bool {
        if self.enter(RunState::Error, now) {
            self.end_reason = Some(reason.into());
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn run() -> Run {
        Run {
            id: 1,
            case_id: 1,
            job_id: None,
            name: "case".into(),
            working_dir: "/tmp/case".into(),
            program: Program::ShortHorizon,
            version: "31".into(),
            processors: 8,
            executable: "/usr/bin/model".into(),
            args: vec![],
            submitted: Utc::now(),
            started: None,
            ended: None,
            state: RunState::NotStarted,
            end_reason: None,
        }
    }

    fn case(year: i32, month: u32, revision: u32, id: CaseId) -> Case {
        Case {
            id,
            study_id: 1,
            path: PathBuf::from(format!("{year}_{month:02}_rv{revision}")),
            name: String::new(),
            year,
            month,
            revision,
            program: Program::ShortHorizon,
            state: CaseState::NotStarted,
            run_ids: vec![],
        }
    }

    #[test]
    fn test_timestamps_follow_state_entry() {
        let mut r = run();
        let t0 = Utc::now();
        assert!(r.enter(RunState::Waiting, t0));
        assert!(r.started.is_none() && r.ended.is_none());

        assert!(r.enter(RunState::Running, t0 + Duration::seconds(5)));
        assert_eq!(r.started, Some(t0 + Duration::seconds(5)));

        assert!(r.enter(RunState::Finished, t0 + Duration::seconds(9)));
        assert_eq!(r.ended, Some(t0 + Duration::seconds(9)));
        assert!(r.started <= r.ended);
    }

    #[test]
    fn test_terminal_run_never_moves() {
        let mut r = run();
        let now = Utc::now();
        r.enter(RunState::Timeout, now);
        assert!(!r.enter(RunState::Running, now));
        assert!(!r.close("again", now));
        assert_eq!(r.state, RunState::Timeout);
        assert!(r.end_reason.is_none());
    }

    #[test]
    fn test_ended_never_precedes_started() {
        let mut r = run();
        let now = Utc::now();
        r.enter(RunState::Running, now);
        // Clock skew between poll and close must not break started <= ended.
        r.close(ABANDONED, now - Duration::seconds(30));
        assert!(r.started <= r.ended);
        assert_eq!(r.end_reason.as_deref(), Some(ABANDONED));
    }

    #[test]
    fn test_flex_count() {
        let mut c = case(2020, 1, 1, 1);
        assert_eq!(c.flex_count(), 0);
        c.run_ids = vec![1];
        assert_eq!(c.flex_count(), 0);
        c.run_ids = vec![1, 2, 3];
        assert_eq!(c.flex_count(), 2);
    }

    #[test]
    fn test_chain_order_is_total_under_shuffle() {
        let expected = vec![
            case(2019, 12, 3, 7),
            case(2020, 1, 0, 1),
            case(2020, 1, 1, 2),
            case(2020, 1, 2, 3),
            case(2020, 2, 0, 4),
            case(2021, 1, 0, 5),
        ];
        for _ in 0..32 {
            let mut shuffled = expected.clone();
            fastrand::shuffle(&mut shuffled);
            shuffled.sort_by(chain_order);
            assert_eq!(shuffled, expected);
        }
    }

    #[test]
    fn test_previous_month_wraps_year() {
        assert_eq!(case(2020, 1, 0, 1).previous_month(), (2019, 12));
        assert_eq!(case(2020, 7, 0, 1).previous_month(), (2020, 6));
    }

    #[test]
    fn test_case_json_round_trip() {
        let mut c = case(2020, 2, 0, 4);
        c.program = Program::LongHorizon;
        c.state = CaseState::Flexibilizing;
        c.run_ids = vec![9, 12];
        let json = serde_json::to_string(&c).unwrap();
        let back: Case = serde_json::from_str(&json).unwrap();
        assert_eq!(back, c);
    }
}
