//! Run Controller: one scheduler job lifecycle.
//!
//! The controller reports facts. It submits, polls and deletes through the
//! [`QueueAdapter`], persists every state change through a Run unit of work,
//! and only then emits the corresponding [`RunEvent`]. It never decides what
//! a Case should do about those facts.

use crate::bus::{EventBus, Listener};
use crate::deps::Deps;
use crate::error::{QueueError, Result};
use crate::events::RunEvent;
use crate::model::{CaseId, Run, RunId, RunState};
use crate::queue::QueueAdapter;
use crate::retry::RetryPolicy;
use crate::rules::RunSpec;
use crate::store::{Store, StoreExt};
use chrono::Utc;
use std::sync::Arc;

/// Event announced when the scheduler state moves from `previous` to
/// `polled`, if any.
pub fn run_transition(previous: RunState, polled: RunState) -> Option<RunEvent> {
    use RunState::*;
    match (previous, polled) {
        (p, n) if p == n => None,
        (NotStarted, Waiting) => Some(RunEvent::SubmissionSuccess),
        (_, Running) => Some(RunEvent::ExecutionStart),
        (_, Finished) => Some(RunEvent::ExecutionEnd),
        (_, Timeout) => Some(RunEvent::ExecutionTimeout),
        (_, Deleting) => Some(RunEvent::DeletionRequested),
        (NotStarted | Waiting, Error) => Some(RunEvent::SubmissionError),
        (Deleting, Error) => Some(RunEvent::DeletionError),
        (Running, Error) => Some(RunEvent::ExecutionEnd),
        _ => None,
    }
}

pub struct RunController {
    run: Run,
    store: Arc<dyn Store>,
    queue: Arc<dyn QueueAdapter>,
    retry: RetryPolicy,
    bus: EventBus<RunEvent>,
}

impl RunController {
    /// Persists a new `NotStarted` run for `case_id` and binds a controller
    /// to it.
    pub async fn create(case_id: CaseId, spec: RunSpec, deps: &Deps) -> Result<Self> {
        let record = Run {
            id: 0,
            case_id,
            job_id: None,
            name: spec.name,
            working_dir: spec.working_dir,
            program: spec.program,
            version: spec.version,
            processors: spec.processors,
            executable: spec.executable,
            args: spec.args,
            submitted: Utc::now(),
            started: None,
            ended: None,
            state: RunState::NotStarted,
            end_reason: None,
        };

        let mut uow = deps.store.runs().await?;
        let run = uow.create(record).await?;
        uow.commit().await?;

        tracing::debug!(run_id = run.id, case_id, "run created");
        Ok(Self::bind(run, deps))
    }

    /// Binds a controller to an already persisted run.
    pub async fn attach(run_id: RunId, deps: &Deps) -> Result<Self> {
        let run = deps.store.load_run(run_id).await?;
        Ok(Self::bind(run, deps))
    }

    fn bind(run: Run, deps: &Deps) -> Self {
        Self {
            bus: EventBus::new(run.id),
            run,
            store: Arc::clone(&deps.store),
            queue: Arc::clone(&deps.queue),
            retry: deps.settings.retry_policy(),
        }
    }

    pub fn id(&self) -> RunId {
        self.run.id
    }

    /// Last persisted snapshot of the run.
    pub fn run(&self) -> &Run {
        &self.run
    }

    pub fn is_active(&self) -> bool {
        self.run.is_active()
    }

    pub fn subscribe(&mut self, listener: Arc<dyn Listener<RunEvent>>) {
        self.bus.subscribe(listener);
    }

    async fn persist(&mut self, run: Run) -> Result<()> {
        self.store.save_run(&run).await?;
        self.run = run;
        Ok(())
    }

    /// Submits the run to the scheduler.
    pub async fn start(&mut self) -> Result<()> {
        let run = self.store.load_run(self.run.id).await?;
        if run.state != RunState::NotStarted {
            tracing::warn!(run_id = run.id, state = ?run.state, "start ignored, run already submitted");
            self.run = run;
            return Ok(());
        }
        self.run = run.clone();
        self.bus.emit(RunEvent::SubmissionRequested);

        let queue = Arc::clone(&self.queue);
        let submitted = self
            .retry
            .run("submit", || {
                let queue = Arc::clone(&queue);
                let mut attempt = run.clone();
                async move { queue.submit(&mut attempt).await.map(|_| attempt) }
            })
            .await;

        let now = Utc::now();
        match submitted {
            Ok(mut run) => {
                run.submitted = now;
                run.enter(RunState::Waiting, now);
                tracing::info!(
                    run_id = run.id,
                    job_id = run.job_id.as_deref().unwrap_or_default(),
                    name = %run.name,
                    "job submitted"
                );
                self.persist(run).await?;
                self.bus.emit(RunEvent::SubmissionSuccess);
            }
            Err(err) => {
                let mut run = run;
                tracing::error!(run_id = run.id, error = %err, "job submission failed");
                run.close(format!("submission failed: {err}"), now);
                self.persist(run).await?;
                self.bus.emit(RunEvent::SubmissionError);
            }
        }
        Ok(())
    }

    /// Polls the scheduler and reports a change against the persisted state.
    pub async fn monitor(&mut self) -> Result<()> {
        let mut run = self.store.load_run(self.run.id).await?;
        self.run = run.clone();
        if run.state.is_terminal() || run.state == RunState::NotStarted {
            return Ok(());
        }

        let queue = Arc::clone(&self.queue);
        let snapshot = run.clone();
        let polled = match self
            .retry
            .run("poll", || {
                let queue = Arc::clone(&queue);
                let snapshot = snapshot.clone();
                async move { queue.poll(&snapshot).await }
            })
            .await
        {
            Ok(state) => state,
            Err(err) => {
                tracing::warn!(run_id = run.id, error = %err, "poll failed, keeping last known state");
                return Ok(());
            }
        };

        if polled == run.state {
            return Ok(());
        }
        if polled == RunState::NotStarted {
            tracing::error!(
                run_id = run.id,
                state = ?run.state,
                "scheduler reported a submitted run as not started"
            );
            return Ok(());
        }

        let previous = run.state;
        let event = run_transition(previous, polled);
        run.enter(polled, Utc::now());
        if polled == RunState::Error {
            run.end_reason = Some("scheduler reported an error state".to_string());
        }
        self.persist(run).await?;

        match event {
            Some(event) => self.bus.emit(event),
            None => tracing::warn!(
                run_id = self.run.id,
                from = ?previous,
                to = ?polled,
                "state change without a run event"
            ),
        }
        Ok(())
    }

    /// Removes the job from the scheduler.
    ///
    /// Terminal runs keep their state; an active run is closed once the
    /// scheduler has accepted the deletion so a later poll cannot report it
    /// as finished.
    pub async fn delete(&mut self) -> Result<()> {
        let mut run = self.store.load_run(self.run.id).await?;
        if run.is_active() && run.state != RunState::Deleting {
            run.enter(RunState::Deleting, Utc::now());
            self.persist(run.clone()).await?;
        } else {
            self.run = run.clone();
        }
        self.bus.emit(RunEvent::DeletionRequested);

        let deleted: std::result::Result<(), QueueError> = if run.job_id.is_none() {
            Ok(())
        } else {
            let queue = Arc::clone(&self.queue);
            let snapshot = run.clone();
            self.retry
                .run("delete", || {
                    let queue = Arc::clone(&queue);
                    let snapshot = snapshot.clone();
                    async move { queue.delete(&snapshot).await }
                })
                .await
        };

        match deleted {
            Ok(()) => {
                if run.close("deleted", Utc::now()) {
                    self.persist(run).await?;
                }
                self.bus.emit(RunEvent::DeletionSuccess);
            }
            Err(err) => {
                tracing::error!(run_id = run.id, error = %err, "job deletion failed");
                self.bus.emit(RunEvent::DeletionError);
            }
        }
        Ok(())
    }
}
