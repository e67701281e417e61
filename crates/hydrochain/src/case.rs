//! Case state machine.
//!
//! The Case is the only level that makes policy decisions: it prepares the
//! deck, submits Runs, evaluates outputs and chooses between finishing,
//! flexibilizing, repairing convergence, retrying or giving up.
//!
//! Decisions are taken by [`CasePolicy`], a pure [`Machine`]; [`CaseMachine`]
//! carries them out. Every state entry is persisted through a Case unit of
//! work before the matching [`CaseEvent`] is emitted.

use crate::bus::{EventBus, Inbox, Listener};
use crate::collaborators::CaseRef;
use crate::deps::Deps;
use crate::error::{OrchestratorError, Result};
use crate::events::{CaseEvent, RunEvent};
use crate::machine::Machine;
use crate::model::{chain_order, Case, CaseId, CaseState, Program, RunState};
use crate::recovery::abandon_active_runs;
use crate::rules;
use crate::run::RunController;
use crate::store::StoreExt;
use crate::strategy::{ConvergenceCriteria, Outcome, ProgramStrategy};
use std::path::PathBuf;
use std::sync::Arc;

// ============================================================================
// Decisions
// ============================================================================

/// What the Case reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseInput {
    Run(RunEvent),
    Evaluated(Outcome),
}

/// What the Case must do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseCommand {
    /// Known input with nothing to do in this state.
    Observe,
    /// Plain state entry (queued, executing).
    Enter(CaseState),
    Evaluate,
    Complete,
    Flexibilize,
    RepairConvergence,
    RelaxConvergence,
    /// Timed out: record the communication error and delete the job.
    DeleteRun,
    Resubmit,
    /// Enter `via` when given, then `Error`.
    Fail { via: Option<CaseState> },
}

/// Pure transition table of a Case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CasePolicy {
    pub state: CaseState,
    pub flex_count: usize,
    pub max_flex: usize,
    /// Cap on runs spent on flexibilization plus timeout and convergence
    /// retries.
    pub max_retries: usize,
}

impl CasePolicy {
    pub fn new(case: &Case, deps: &Deps) -> Self {
        let max_flex = deps.settings.max_flex_per_case as usize;
        Self {
            state: case.state,
            flex_count: case.flex_count(),
            max_flex,
            max_retries: max_flex + deps.settings.max_resubmissions_per_case as usize,
        }
    }

    fn can_retry(&self) -> bool {
        self.flex_count < self.max_retries
    }

    fn on_outcome(&self, outcome: Outcome) -> CaseCommand {
        match outcome {
            Outcome::Done => CaseCommand::Complete,
            Outcome::Infeasible if self.flex_count < self.max_flex => CaseCommand::Flexibilize,
            Outcome::Infeasible => CaseCommand::Fail {
                via: Some(CaseState::MaxFlexError),
            },
            Outcome::DataError => CaseCommand::Fail {
                via: Some(CaseState::DataError),
            },
            Outcome::ConvergenceError if self.can_retry() => CaseCommand::RepairConvergence,
            Outcome::ConvergenceError => CaseCommand::Fail {
                via: Some(CaseState::ConvergenceError),
            },
            Outcome::NotConverged if self.can_retry() => CaseCommand::RelaxConvergence,
            Outcome::NotConverged => CaseCommand::Fail {
                via: Some(CaseState::NotConverged),
            },
        }
    }
}

impl Machine for CasePolicy {
    type Event = CaseInput;
    type Command = CaseCommand;

    fn decide(&mut self, input: &CaseInput) -> Option<CaseCommand> {
        use CaseState as S;
        use RunEvent as R;

        if self.state.is_terminal() {
            return None;
        }

        let command = match (self.state, *input) {
            (S::StartingExecution, CaseInput::Run(R::SubmissionRequested)) => CaseCommand::Observe,
            (S::StartingExecution, CaseInput::Run(R::SubmissionSuccess)) => {
                CaseCommand::Enter(S::WaitingInQueue)
            }
            (S::StartingExecution | S::WaitingInQueue, CaseInput::Run(R::SubmissionError)) => {
                CaseCommand::Fail {
                    via: Some(S::ExecError),
                }
            }
            (S::StartingExecution | S::WaitingInQueue, CaseInput::Run(R::ExecutionStart)) => {
                CaseCommand::Enter(S::Executing)
            }
            (S::WaitingInQueue | S::Executing, CaseInput::Run(R::ExecutionEnd)) => {
                CaseCommand::Evaluate
            }
            (S::WaitingInQueue | S::Executing, CaseInput::Run(R::ExecutionTimeout)) => {
                CaseCommand::DeleteRun
            }
            (S::WaitingInQueue | S::Executing, CaseInput::Run(R::DeletionRequested)) => {
                CaseCommand::Observe
            }
            (S::CommunicationError, CaseInput::Run(R::DeletionRequested)) => CaseCommand::Observe,
            (S::CommunicationError, CaseInput::Run(R::DeletionSuccess)) if self.can_retry() => {
                CaseCommand::Resubmit
            }
            (S::CommunicationError, CaseInput::Run(R::DeletionSuccess)) => {
                CaseCommand::Fail { via: None }
            }
            (S::CommunicationError, CaseInput::Run(R::DeletionError)) => {
                CaseCommand::Fail { via: None }
            }
            (S::WaitingInQueue | S::Executing, CaseInput::Evaluated(outcome)) => {
                self.on_outcome(outcome)
            }
            _ => return None,
        };
        Some(command)
    }
}

fn event_for(state: CaseState) -> Option<CaseEvent> {
    Some(match state {
        CaseState::Initialized => CaseEvent::Initialized,
        CaseState::Preparing => CaseEvent::PreparationStarted,
        CaseState::Prepared => CaseEvent::Prepared,
        CaseState::PrepError => CaseEvent::PreparationFailed,
        CaseState::StartingExecution => CaseEvent::SubmissionStarted,
        CaseState::WaitingInQueue => CaseEvent::Queued,
        CaseState::Executing => CaseEvent::ExecutionStarted,
        CaseState::ExecError => CaseEvent::ExecutionFailed,
        CaseState::DataError => CaseEvent::DataError,
        CaseState::ConvergenceError => CaseEvent::ConvergenceError,
        CaseState::NotConverged => CaseEvent::NotConverged,
        CaseState::Flexibilizing => CaseEvent::FlexRequested,
        CaseState::MaxFlexError => CaseEvent::MaxFlexError,
        CaseState::CommunicationError => CaseEvent::TimedOut,
        CaseState::Done => CaseEvent::Completed,
        CaseState::Error => CaseEvent::Failed,
        CaseState::NotStarted => return None,
    })
}

// ============================================================================
// Machine
// ============================================================================

pub struct CaseMachine {
    case: Case,
    deps: Deps,
    base_path: PathBuf,
    rules: Arc<Vec<serde_json::Value>>,
    bus: EventBus<CaseEvent>,
    run: Option<RunController>,
    run_inbox: Inbox<RunEvent>,
    run_taps: Vec<Arc<dyn Listener<RunEvent>>>,
}

impl CaseMachine {
    /// Loads the case and re-binds its last Run when that run is still
    /// active.
    pub async fn load(
        case_id: CaseId,
        base_path: PathBuf,
        rules: Arc<Vec<serde_json::Value>>,
        deps: &Deps,
    ) -> Result<Self> {
        let case = deps.store.load_case(case_id).await?;
        let mut machine = Self {
            bus: EventBus::new(case.id),
            case,
            deps: deps.clone(),
            base_path,
            rules,
            run: None,
            run_inbox: Inbox::new(),
            run_taps: Vec::new(),
        };

        if let Some(&run_id) = machine.case.run_ids.last() {
            let controller = RunController::attach(run_id, deps).await?;
            if controller.is_active() {
                machine.bind_run(controller);
            }
        }
        Ok(machine)
    }

    pub fn id(&self) -> CaseId {
        self.case.id
    }

    /// Last persisted snapshot.
    pub fn case(&self) -> &Case {
        &self.case
    }

    pub fn state(&self) -> CaseState {
        self.case.state
    }

    pub fn subscribe(&mut self, listener: Arc<dyn Listener<CaseEvent>>) {
        self.bus.subscribe(listener);
    }

    /// Taps attached to every Run controller this case binds.
    pub fn subscribe_runs(&mut self, listener: Arc<dyn Listener<RunEvent>>) {
        if let Some(run) = self.run.as_mut() {
            run.subscribe(Arc::clone(&listener));
        }
        self.run_taps.push(listener);
    }

    fn bind_run(&mut self, mut controller: RunController) {
        controller.subscribe(Arc::new(self.run_inbox.clone()));
        for tap in &self.run_taps {
            controller.subscribe(Arc::clone(tap));
        }
        self.run = Some(controller);
    }

    fn case_ref(&self) -> CaseRef {
        CaseRef::of(&self.case, &self.base_path)
    }

    fn strategy(&self) -> Arc<dyn ProgramStrategy> {
        self.deps.strategies.strategy(self.case.program)
    }

    /// Persists `state`, then emits its event.
    async fn enter(&mut self, state: CaseState) -> Result<()> {
        let mut case = self.case.clone();
        case.state = state;
        self.deps.store.save_case(&case).await?;
        self.case = case;
        if let Some(event) = event_for(state) {
            self.bus.emit(event);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    /// Purges stale active runs and moves to `Initialized`.
    pub async fn initialize(&mut self) -> Result<()> {
        if self.case.state.is_terminal() {
            tracing::debug!(case_id = self.case.id, state = ?self.case.state, "initialize skipped");
            return Ok(());
        }

        let purged = abandon_active_runs(self.deps.store.as_ref(), self.case.id).await?;
        if !purged.is_empty() {
            tracing::warn!(case_id = self.case.id, runs = ?purged, "purged stale active runs");
        }
        self.run = None;
        self.case = self.deps.store.load_case(self.case.id).await?;
        self.enter(CaseState::Initialized).await
    }

    /// Prepares the deck: local preparation, chaining from completed cases
    /// and monthly reservoir rules.
    pub async fn prepare(&mut self) -> Result<()> {
        if self.case.state.is_terminal() {
            return Ok(());
        }
        self.enter(CaseState::Preparing).await?;

        match self.run_preparation().await? {
            Ok(()) => self.enter(CaseState::Prepared).await,
            Err(reason) => {
                tracing::error!(case_id = self.case.id, %reason, "preparation failed");
                self.enter(CaseState::PrepError).await?;
                self.enter(CaseState::Error).await
            }
        }
    }

    /// Outer error: storage. Inner error: the preparation step that failed.
    async fn run_preparation(&mut self) -> Result<std::result::Result<(), String>> {
        let destination = self.case_ref();
        let settings = Arc::clone(&self.deps.settings);
        let retry = settings.retry_policy();

        if let Err(err) = self.strategy().prepare(&destination).await {
            return Ok(Err(format!("local preparation: {err:#}")));
        }

        let mut prior: Vec<Case> = self
            .deps
            .store
            .cases_of(self.case.study_id)
            .await?
            .into_iter()
            .filter(|c| {
                c.id != self.case.id
                    && c.state == CaseState::Done
                    && chain_order(c, &self.case).is_lt()
            })
            .collect();
        prior.sort_by(chain_order);

        if prior.is_empty() {
            tracing::info!(case_id = self.case.id, "first case in chain, chaining skipped");
            return Ok(Ok(()));
        }

        let sources: Vec<CaseRef> = prior
            .iter()
            .map(|c| CaseRef::of(c, &self.base_path))
            .collect();
        for variable in rules::chaining_variables(self.case.program, &settings) {
            let chaining = Arc::clone(&self.deps.chaining);
            let result = retry
                .run("chain", || {
                    let chaining = Arc::clone(&chaining);
                    let (sources, destination) = (&sources, &destination);
                    async move { chaining.chain(sources, destination, variable).await }
                })
                .await;
            match result {
                Ok(values) => tracing::info!(
                    case_id = self.case.id,
                    variable = %variable,
                    sources = sources.len(),
                    values = values.len(),
                    "chained"
                ),
                Err(err) => return Ok(Err(format!("chaining `{variable}`: {err}"))),
            }
        }

        if self.rules.is_empty() {
            return Ok(Ok(()));
        }
        let (year, month) = self.case.previous_month();
        let rule_sources: Vec<CaseRef> = prior
            .iter()
            .filter(|c| c.program == Program::ShortHorizon && (c.year, c.month) == (year, month))
            .map(|c| CaseRef::of(c, &self.base_path))
            .collect();
        if rule_sources.is_empty() {
            tracing::warn!(
                case_id = self.case.id,
                year,
                month,
                "no short-horizon case in the previous month, reservoir rules skipped"
            );
            return Ok(Ok(()));
        }

        let strategy = self.strategy();
        let reservoir = Arc::clone(&self.deps.reservoir);
        let rules = Arc::clone(&self.rules);
        let result = retry
            .run("apply_rules", || {
                let (strategy, reservoir, rules) = (&strategy, &reservoir, &rules);
                let (sources, destination) = (&rule_sources, &destination);
                async move {
                    strategy
                        .apply_rules(sources, destination, rules, reservoir.as_ref())
                        .await
                }
            })
            .await;
        match result {
            Ok(applied) => {
                tracing::info!(case_id = self.case.id, applied = applied.len(), "reservoir rules applied");
                Ok(Ok(()))
            }
            Err(err) => Ok(Err(format!("reservoir rules: {err}"))),
        }
    }

    /// Creates a fresh Run and submits it.
    pub async fn start_execution(&mut self) -> Result<()> {
        if self.case.state.is_terminal() {
            return Ok(());
        }
        if let Some(run) = &self.run {
            if run.is_active() {
                tracing::error!(
                    case_id = self.case.id,
                    run_id = run.id(),
                    "refusing to start a second active run"
                );
                return Ok(());
            }
        }

        let spec = rules::run_spec(&self.case, &self.base_path, &self.deps.settings);
        let controller = RunController::create(self.case.id, spec, &self.deps).await?;

        let mut case = self.case.clone();
        case.run_ids.push(controller.id());
        case.state = CaseState::StartingExecution;
        self.deps.store.save_case(&case).await?;
        self.case = case;
        self.bus.emit(CaseEvent::SubmissionStarted);

        self.bind_run(controller);
        if let Some(run) = self.run.as_mut() {
            run.start().await?;
        }
        self.process_run_events().await
    }

    /// Polls the active Run, or resumes the case when nothing is in flight.
    pub async fn monitor(&mut self) -> Result<()> {
        if self.case.state.is_terminal() {
            return Ok(());
        }
        match self.run.as_mut() {
            Some(run) if run.is_active() => {
                // A start that failed before submitting is retried, not polled.
                if run.run().state == RunState::NotStarted {
                    run.start().await?;
                } else {
                    run.monitor().await?;
                }
                self.process_run_events().await
            }
            _ => self.advance().await,
        }
    }

    /// Moves the case forward from whatever state was persisted.
    pub async fn advance(&mut self) -> Result<()> {
        use CaseState as S;

        match self.case.state {
            S::Done | S::Error => return Ok(()),
            S::NotStarted => {
                self.initialize().await?;
                self.prepare().await?;
            }
            S::Initialized | S::Preparing => self.prepare().await?,
            S::Prepared => {}
            S::PrepError | S::ExecError | S::DataError | S::MaxFlexError => {
                return self.enter(S::Error).await;
            }
            S::StartingExecution | S::WaitingInQueue | S::Executing => {
                if let Some(run) = self.run.as_mut() {
                    if run.run().state == RunState::NotStarted {
                        run.start().await?;
                    }
                    if run.is_active() {
                        return self.process_run_events().await;
                    }
                }
            }
            S::Flexibilizing => return self.flexibilize(false).await,
            S::ConvergenceError => return self.repair_convergence(false).await,
            S::NotConverged => return self.relax_convergence(false).await,
            S::CommunicationError => {
                if self.run.as_ref().is_some_and(|r| r.is_active()) {
                    return self.delete_run(false).await;
                }
            }
        }

        if matches!(
            self.case.state,
            S::Prepared
                | S::StartingExecution
                | S::WaitingInQueue
                | S::Executing
                | S::CommunicationError
        ) {
            self.start_execution().await?;
        }
        Ok(())
    }

    /// Drains Run events in emission order and executes the decisions.
    async fn process_run_events(&mut self) -> Result<()> {
        while let Some(envelope) = self.run_inbox.pop() {
            let current = self.run.as_ref().map(RunController::id);
            if current != Some(envelope.source) {
                tracing::debug!(
                    case_id = self.case.id,
                    run_id = envelope.source,
                    event = ?envelope.event,
                    "event from a superseded run ignored"
                );
                continue;
            }
            self.handle(CaseInput::Run(envelope.event)).await?;
        }
        Ok(())
    }

    async fn handle(&mut self, input: CaseInput) -> Result<()> {
        let mut policy = CasePolicy::new(&self.case, &self.deps);
        let Some(command) = policy.decide(&input) else {
            if self.case.state.is_terminal() {
                tracing::debug!(case_id = self.case.id, ?input, "input after terminal state ignored");
            } else {
                tracing::warn!(
                    case_id = self.case.id,
                    state = ?self.case.state,
                    ?input,
                    "no transition for input, ignored"
                );
            }
            return Ok(());
        };
        // Commands resubmit and drain run events again, so the cycle back
        // into `handle` goes through a boxed future.
        Box::pin(self.execute(command)).await
    }

    async fn execute(&mut self, command: CaseCommand) -> Result<()> {
        match command {
            CaseCommand::Observe => Ok(()),
            CaseCommand::Enter(state) => self.enter(state).await,
            CaseCommand::Evaluate => self.evaluate().await,
            CaseCommand::Complete => self.enter(CaseState::Done).await,
            CaseCommand::Flexibilize => self.flexibilize(true).await,
            CaseCommand::RepairConvergence => self.repair_convergence(true).await,
            CaseCommand::RelaxConvergence => self.relax_convergence(true).await,
            CaseCommand::DeleteRun => self.delete_run(true).await,
            CaseCommand::Resubmit => self.start_execution().await,
            CaseCommand::Fail { via } => self.fail(via).await,
        }
    }

    async fn evaluate(&mut self) -> Result<()> {
        let Some(run) = self.run.as_ref().map(|r| r.run().clone()) else {
            return Err(OrchestratorError::Invariant(format!(
                "case {} evaluated without a run",
                self.case.id
            )));
        };

        let outcome = match self.strategy().evaluate(&self.case_ref(), &run).await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(case_id = self.case.id, run_id = run.id, error = %format!("{err:#}"), "evaluation failed");
                Outcome::DataError
            }
        };
        tracing::info!(case_id = self.case.id, run_id = run.id, %outcome, "run evaluated");

        if outcome == Outcome::Infeasible {
            self.bus.emit(CaseEvent::Infeasible);
        }
        self.handle(CaseInput::Evaluated(outcome)).await
    }

    async fn flexibilize(&mut self, enter: bool) -> Result<()> {
        if enter {
            self.enter(CaseState::Flexibilizing).await?;
        }
        let case_ref = self.case_ref();
        let flex = Arc::clone(&self.deps.flex);
        let result = self
            .deps
            .settings
            .retry_policy()
            .run("flexibilize", || {
                let (flex, case_ref) = (&flex, &case_ref);
                async move { flex.flexibilize(case_ref).await }
            })
            .await;

        match result {
            Ok(details) => {
                tracing::info!(
                    case_id = self.case.id,
                    flex_count = self.case.flex_count() + 1,
                    adjustments = details.len(),
                    "case flexibilized"
                );
                self.bus.emit(CaseEvent::FlexSuccess);
                self.start_execution().await
            }
            Err(err) => {
                tracing::error!(case_id = self.case.id, error = %err, "flexibilization failed");
                self.fail(None).await
            }
        }
    }

    async fn repair_convergence(&mut self, enter: bool) -> Result<()> {
        if enter {
            self.enter(CaseState::ConvergenceError).await?;
        }
        match self.strategy().repair_convergence(&self.case_ref()).await {
            Ok(()) => {
                self.bus.emit(CaseEvent::Repaired);
                self.start_execution().await
            }
            Err(err) => {
                tracing::error!(case_id = self.case.id, error = %format!("{err:#}"), "convergence repair failed");
                self.fail(None).await
            }
        }
    }

    async fn relax_convergence(&mut self, enter: bool) -> Result<()> {
        if enter {
            self.enter(CaseState::NotConverged).await?;
        }
        let criteria = ConvergenceCriteria {
            max_gap: self.deps.settings.convergence_max_gap,
            max_iterations: self.deps.settings.max_decomp_iterations,
        };
        match self
            .strategy()
            .relax_convergence(&self.case_ref(), &criteria)
            .await
        {
            Ok(()) => {
                self.bus.emit(CaseEvent::Repaired);
                self.start_execution().await
            }
            Err(err) => {
                tracing::error!(case_id = self.case.id, error = %format!("{err:#}"), "convergence relaxation failed");
                self.fail(None).await
            }
        }
    }

    async fn delete_run(&mut self, enter: bool) -> Result<()> {
        if enter {
            self.enter(CaseState::CommunicationError).await?;
        }
        if let Some(run) = self.run.as_mut() {
            run.delete().await?;
        }
        Ok(())
    }

    async fn fail(&mut self, via: Option<CaseState>) -> Result<()> {
        if let Some(state) = via {
            self.enter(state).await?;
        }
        if via == Some(CaseState::ExecError) {
            // A job refused by the scheduler may still sit in its queue.
            if let Some(run) = self.run.as_mut() {
                if run.run().job_id.is_some() {
                    run.delete().await?;
                }
            }
        }
        self.enter(CaseState::Error).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(state: CaseState, flex_count: usize) -> CasePolicy {
        CasePolicy {
            state,
            flex_count,
            max_flex: 2,
            max_retries: 4,
        }
    }

    fn decide(state: CaseState, flex_count: usize, input: CaseInput) -> Option<CaseCommand> {
        policy(state, flex_count).decide(&input)
    }

    #[test]
    fn test_submission_path() {
        assert_eq!(
            decide(CaseState::StartingExecution, 0, CaseInput::Run(RunEvent::SubmissionSuccess)),
            Some(CaseCommand::Enter(CaseState::WaitingInQueue))
        );
        assert_eq!(
            decide(CaseState::WaitingInQueue, 0, CaseInput::Run(RunEvent::ExecutionStart)),
            Some(CaseCommand::Enter(CaseState::Executing))
        );
        assert_eq!(
            decide(CaseState::Executing, 0, CaseInput::Run(RunEvent::ExecutionEnd)),
            Some(CaseCommand::Evaluate)
        );
        assert_eq!(
            decide(CaseState::StartingExecution, 0, CaseInput::Run(RunEvent::SubmissionError)),
            Some(CaseCommand::Fail {
                via: Some(CaseState::ExecError)
            })
        );
    }

    #[test]
    fn test_flex_budget() {
        let infeasible = CaseInput::Evaluated(Outcome::Infeasible);
        assert_eq!(
            decide(CaseState::Executing, 0, infeasible),
            Some(CaseCommand::Flexibilize)
        );
        assert_eq!(
            decide(CaseState::Executing, 1, infeasible),
            Some(CaseCommand::Flexibilize)
        );
        assert_eq!(
            decide(CaseState::Executing, 2, infeasible),
            Some(CaseCommand::Fail {
                via: Some(CaseState::MaxFlexError)
            })
        );
    }

    #[test]
    fn test_outcomes_map_one_to_one() {
        let eval = |o| decide(CaseState::Executing, 0, CaseInput::Evaluated(o));
        assert_eq!(eval(Outcome::Done), Some(CaseCommand::Complete));
        assert_eq!(
            eval(Outcome::DataError),
            Some(CaseCommand::Fail {
                via: Some(CaseState::DataError)
            })
        );
        assert_eq!(eval(Outcome::ConvergenceError), Some(CaseCommand::RepairConvergence));
        assert_eq!(eval(Outcome::NotConverged), Some(CaseCommand::RelaxConvergence));
    }

    #[test]
    fn test_retry_loops_are_bounded() {
        assert_eq!(
            decide(CaseState::Executing, 4, CaseInput::Evaluated(Outcome::NotConverged)),
            Some(CaseCommand::Fail {
                via: Some(CaseState::NotConverged)
            })
        );
        assert_eq!(
            decide(CaseState::CommunicationError, 3, CaseInput::Run(RunEvent::DeletionSuccess)),
            Some(CaseCommand::Resubmit)
        );
        assert_eq!(
            decide(CaseState::CommunicationError, 4, CaseInput::Run(RunEvent::DeletionSuccess)),
            Some(CaseCommand::Fail { via: None })
        );
    }

    #[test]
    fn test_timeout_then_deletion() {
        assert_eq!(
            decide(CaseState::Executing, 0, CaseInput::Run(RunEvent::ExecutionTimeout)),
            Some(CaseCommand::DeleteRun)
        );
        assert_eq!(
            decide(CaseState::CommunicationError, 0, CaseInput::Run(RunEvent::DeletionError)),
            Some(CaseCommand::Fail { via: None })
        );
    }

    #[test]
    fn test_terminal_states_absorb_every_input() {
        let inputs = [
            CaseInput::Run(RunEvent::ExecutionEnd),
            CaseInput::Run(RunEvent::SubmissionSuccess),
            CaseInput::Run(RunEvent::DeletionSuccess),
            CaseInput::Evaluated(Outcome::Infeasible),
        ];
        for state in [CaseState::Done, CaseState::Error] {
            for input in inputs {
                assert_eq!(decide(state, 0, input), None);
            }
        }
    }

    #[test]
    fn test_unmapped_inputs_are_rejected() {
        assert_eq!(
            decide(CaseState::Prepared, 0, CaseInput::Run(RunEvent::ExecutionEnd)),
            None
        );
        assert_eq!(
            decide(CaseState::Initialized, 0, CaseInput::Evaluated(Outcome::Done)),
            None
        );
    }

    #[test]
    fn test_every_state_except_not_started_has_an_event() {
        for state in CaseState::ALL {
            let event = event_for(state);
            assert_eq!(event.is_none(), state == CaseState::NotStarted);
            if let Some(event) = event {
                assert_eq!(event.post_state(), Some(state));
            }
        }
    }
}
