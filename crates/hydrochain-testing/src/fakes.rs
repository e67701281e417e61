//! In-memory collaborators with scripted answers and call journals.
//!
//! Every fake is a cheap handle over shared state: clone it into [`Deps`]
//! and keep a clone in the test to script it and inspect what it saw.
//!
//! [`Deps`]: hydrochain::Deps

use async_trait::async_trait;
use hydrochain::collaborators::{CaseRef, ChainedValue, ChainingService, FlexService, ReservoirRuleService};
use hydrochain::events::Envelope;
use hydrochain::model::{Program, Run, RunState};
use hydrochain::strategy::{ConvergenceCriteria, Outcome, ProgramStrategy, StrategyFactory};
use hydrochain::{Listener, QueueAdapter, QueueError, ServiceError};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn names(cases: &[CaseRef]) -> Vec<String> {
    cases.iter().map(|c| c.name.clone()).collect()
}

// ============================================================================
// Queue
// ============================================================================

#[derive(Default)]
struct QueueState {
    default_script: Vec<RunState>,
    /// Keyed by (run name, submission attempt starting at 1).
    scripts: HashMap<(String, usize), Vec<RunState>>,
    rejected: HashSet<(String, usize)>,
    attempts: HashMap<String, usize>,
    /// Job id to (script, polls served).
    jobs: HashMap<String, (Vec<RunState>, usize)>,
    next_job: u64,
    submitted: Vec<String>,
    deleted: Vec<String>,
}

/// Scheduler double. Each submitted job walks a script of polled states;
/// the last state repeats once the script is exhausted.
#[derive(Clone)]
pub struct FakeQueue {
    state: Arc<Mutex<QueueState>>,
}

impl Default for FakeQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeQueue {
    /// Every job starts running on the first poll and finishes on the next.
    pub fn new() -> Self {
        let state = QueueState {
            default_script: vec![RunState::Running, RunState::Finished],
            next_job: 1000,
            ..QueueState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Script for the `attempt`-th submission (1-based) of `run_name`.
    pub fn script(&self, run_name: &str, attempt: usize, states: &[RunState]) {
        lock(&self.state)
            .scripts
            .insert((run_name.to_string(), attempt), states.to_vec());
    }

    /// Makes the `attempt`-th submission of `run_name` fail.
    pub fn reject(&self, run_name: &str, attempt: usize) {
        lock(&self.state).rejected.insert((run_name.to_string(), attempt));
    }

    /// Run names in submission order.
    pub fn submitted(&self) -> Vec<String> {
        lock(&self.state).submitted.clone()
    }

    /// Job ids in deletion order.
    pub fn deleted(&self) -> Vec<String> {
        lock(&self.state).deleted.clone()
    }
}

#[async_trait]
impl QueueAdapter for FakeQueue {
    async fn submit(&self, run: &mut Run) -> Result<(), QueueError> {
        let mut state = lock(&self.state);
        let attempt = {
            let n = state.attempts.entry(run.name.clone()).or_default();
            *n += 1;
            *n
        };
        let key = (run.name.clone(), attempt);
        if state.rejected.contains(&key) {
            return Err(QueueError::Unparseable(format!("job {} rejected", run.name)));
        }

        let script = state
            .scripts
            .get(&key)
            .cloned()
            .unwrap_or_else(|| state.default_script.clone());
        state.next_job += 1;
        let job_id = state.next_job.to_string();
        state.jobs.insert(job_id.clone(), (script, 0));
        state.submitted.push(run.name.clone());
        run.job_id = Some(job_id);
        Ok(())
    }

    async fn poll(&self, run: &Run) -> Result<RunState, QueueError> {
        let job_id = run.job_id.as_deref().ok_or(QueueError::NotSubmitted(run.id))?;
        let mut state = lock(&self.state);
        let Some((script, served)) = state.jobs.get_mut(job_id) else {
            return Ok(RunState::Finished);
        };
        let polled = script
            .get(*served)
            .or_else(|| script.last())
            .copied()
            .unwrap_or(RunState::Finished);
        *served += 1;
        Ok(polled)
    }

    async fn delete(&self, run: &Run) -> Result<(), QueueError> {
        let job_id = run.job_id.clone().ok_or(QueueError::NotSubmitted(run.id))?;
        let mut state = lock(&self.state);
        state.jobs.remove(&job_id);
        state.deleted.push(job_id);
        Ok(())
    }
}

// ============================================================================
// Auxiliary services
// ============================================================================

/// One chaining request as seen by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainCall {
    pub sources: Vec<String>,
    pub destination: String,
    pub variable: String,
}

#[derive(Clone, Default)]
pub struct RecordingChaining {
    calls: Arc<Mutex<Vec<ChainCall>>>,
    failure: Arc<Mutex<Option<u16>>>,
}

impl RecordingChaining {
    /// Answers every later call with `status`.
    pub fn fail_with(&self, status: u16) {
        *lock(&self.failure) = Some(status);
    }

    pub fn calls(&self) -> Vec<ChainCall> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl ChainingService for RecordingChaining {
    async fn chain(
        &self,
        sources: &[CaseRef],
        destination: &CaseRef,
        variable: &str,
    ) -> Result<Vec<ChainedValue>, ServiceError> {
        lock(&self.calls).push(ChainCall {
            sources: names(sources),
            destination: destination.name.clone(),
            variable: variable.to_string(),
        });
        if let Some(status) = *lock(&self.failure) {
            return Err(ServiceError::Status {
                status,
                body: "chaining refused".into(),
            });
        }
        Ok(vec![ChainedValue {
            id: destination.name.clone(),
            value: json!(variable),
        }])
    }
}

#[derive(Clone, Default)]
pub struct RecordingFlex {
    calls: Arc<Mutex<Vec<String>>>,
    refuse: Arc<Mutex<bool>>,
}

impl RecordingFlex {
    pub fn refuse(&self) {
        *lock(&self.refuse) = true;
    }

    /// Case names in request order.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl FlexService for RecordingFlex {
    async fn flexibilize(&self, case: &CaseRef) -> Result<Vec<Value>, ServiceError> {
        lock(&self.calls).push(case.name.clone());
        if *lock(&self.refuse) {
            return Err(ServiceError::Status {
                status: 422,
                body: "nothing left to relax".into(),
            });
        }
        Ok(vec![json!({"case": case.name, "relaxed": 1})])
    }
}

/// One reservoir-rule request as seen by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RulesCall {
    pub sources: Vec<String>,
    pub destination: String,
    pub rules: usize,
}

#[derive(Clone, Default)]
pub struct RecordingReservoir {
    calls: Arc<Mutex<Vec<RulesCall>>>,
}

impl RecordingReservoir {
    pub fn calls(&self) -> Vec<RulesCall> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl ReservoirRuleService for RecordingReservoir {
    async fn apply_rules(
        &self,
        sources: &[CaseRef],
        destination: &CaseRef,
        rules: &[Value],
    ) -> Result<Vec<Value>, ServiceError> {
        lock(&self.calls).push(RulesCall {
            sources: names(sources),
            destination: destination.name.clone(),
            rules: rules.len(),
        });
        Ok(rules.to_vec())
    }
}

// ============================================================================
// Strategy
// ============================================================================

/// One program strategy call.
#[derive(Debug, Clone, PartialEq)]
pub enum StrategyCall {
    Prepare { case: String, program: Program },
    Evaluate { case: String, run_id: i64 },
    RepairConvergence { case: String },
    RelaxConvergence { case: String, criteria: ConvergenceCriteria },
}

#[derive(Default)]
struct StrategyState {
    outcomes: HashMap<String, VecDeque<Outcome>>,
    failing: HashSet<String>,
    calls: Vec<StrategyCall>,
}

/// Strategy with per-case outcome queues. A case without queued outcomes
/// evaluates to `Done`.
#[derive(Clone, Default)]
pub struct ScriptedStrategy {
    state: Arc<Mutex<StrategyState>>,
}

impl ScriptedStrategy {
    /// Queues outcomes for successive evaluations of `case`.
    pub fn outcomes(&self, case: &str, outcomes: &[Outcome]) {
        lock(&self.state)
            .outcomes
            .entry(case.to_string())
            .or_default()
            .extend(outcomes.iter().copied());
    }

    /// Makes every hook except `evaluate` fail for `case`.
    pub fn fail_hooks(&self, case: &str) {
        lock(&self.state).failing.insert(case.to_string());
    }

    pub fn calls(&self) -> Vec<StrategyCall> {
        lock(&self.state).calls.clone()
    }

    fn record(&self, call: StrategyCall, case: &str) -> anyhow::Result<()> {
        let mut state = lock(&self.state);
        state.calls.push(call);
        if state.failing.contains(case) {
            anyhow::bail!("scripted hook failure for {case}");
        }
        Ok(())
    }
}

#[async_trait]
impl ProgramStrategy for ScriptedStrategy {
    async fn prepare(&self, case: &CaseRef) -> anyhow::Result<()> {
        self.record(
            StrategyCall::Prepare {
                case: case.name.clone(),
                program: case.program,
            },
            &case.name,
        )
    }

    async fn evaluate(&self, case: &CaseRef, run: &Run) -> anyhow::Result<Outcome> {
        let mut state = lock(&self.state);
        state.calls.push(StrategyCall::Evaluate {
            case: case.name.clone(),
            run_id: run.id,
        });
        Ok(state
            .outcomes
            .get_mut(&case.name)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Outcome::Done))
    }

    async fn repair_convergence(&self, case: &CaseRef) -> anyhow::Result<()> {
        self.record(
            StrategyCall::RepairConvergence {
                case: case.name.clone(),
            },
            &case.name,
        )
    }

    async fn relax_convergence(&self, case: &CaseRef, criteria: &ConvergenceCriteria) -> anyhow::Result<()> {
        self.record(
            StrategyCall::RelaxConvergence {
                case: case.name.clone(),
                criteria: *criteria,
            },
            &case.name,
        )
    }
}

impl StrategyFactory for ScriptedStrategy {
    fn strategy(&self, _program: Program) -> Arc<dyn ProgramStrategy> {
        Arc::new(self.clone())
    }
}

// ============================================================================
// Events
// ============================================================================

/// Tap that keeps every envelope it sees.
pub struct EventRecorder<E> {
    seen: Arc<Mutex<Vec<Envelope<E>>>>,
}

impl<E> Clone for EventRecorder<E> {
    fn clone(&self) -> Self {
        Self {
            seen: Arc::clone(&self.seen),
        }
    }
}

impl<E> Default for EventRecorder<E> {
    fn default() -> Self {
        Self {
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<E: Clone> EventRecorder<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn envelopes(&self) -> Vec<Envelope<E>> {
        lock(&self.seen).clone()
    }

    pub fn events(&self) -> Vec<E> {
        lock(&self.seen).iter().map(|e| e.event.clone()).collect()
    }

    /// Events emitted by the aggregate `source`.
    pub fn from_source(&self, source: i64) -> Vec<E> {
        lock(&self.seen)
            .iter()
            .filter(|e| e.source == source)
            .map(|e| e.event.clone())
            .collect()
    }

    pub fn clear(&self) {
        lock(&self.seen).clear();
    }
}

impl<E: Clone + Send + 'static> Listener<E> for EventRecorder<E> {
    fn on_event(&self, envelope: &Envelope<E>) {
        lock(&self.seen).push(envelope.clone());
    }
}
