//! Driver loop.
//!
//! The engine owns the Study machine and issues one `monitor()` tick per poll
//! interval. A tick runs the whole Run → Case → Study cascade to completion
//! before the next one starts; nothing runs in parallel.

use crate::bus::Listener;
use crate::deps::Deps;
use crate::error::Result;
use crate::events::{CaseEvent, RunEvent, StudyEvent};
use crate::model::StudyState;
use crate::recovery::{self, RehydrationReport};
use crate::study::StudyMachine;
use crate::tap::TracingTap;
use std::future::Future;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::Instrument;
use uuid::Uuid;

/// How the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Finished(StudyState),
    Interrupted,
}

#[derive(Default)]
pub struct EngineBuilder {
    study_taps: Vec<Arc<dyn Listener<StudyEvent>>>,
    case_taps: Vec<Arc<dyn Listener<CaseEvent>>>,
    run_taps: Vec<Arc<dyn Listener<RunEvent>>>,
    tracing: bool,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            tracing: true,
            ..Self::default()
        }
    }

    /// Disables the built-in [`TracingTap`].
    pub fn without_tracing_tap(mut self) -> Self {
        self.tracing = false;
        self
    }

    pub fn with_study_tap(mut self, tap: Arc<dyn Listener<StudyEvent>>) -> Self {
        self.study_taps.push(tap);
        self
    }

    pub fn with_case_tap(mut self, tap: Arc<dyn Listener<CaseEvent>>) -> Self {
        self.case_taps.push(tap);
        self
    }

    pub fn with_run_tap(mut self, tap: Arc<dyn Listener<RunEvent>>) -> Self {
        self.run_taps.push(tap);
        self
    }

    pub fn build(self, deps: Deps) -> Engine {
        let mut study = StudyMachine::new(deps.clone());
        if self.tracing {
            study.subscribe(Arc::new(TracingTap));
            study.subscribe_cases(Arc::new(TracingTap));
            study.subscribe_runs(Arc::new(TracingTap));
        }
        for tap in self.study_taps {
            study.subscribe(tap);
        }
        for tap in self.case_taps {
            study.subscribe_cases(tap);
        }
        for tap in self.run_taps {
            study.subscribe_runs(tap);
        }
        Engine {
            deps,
            study,
            ticks: 0,
        }
    }
}

pub struct Engine {
    deps: Deps,
    study: StudyMachine,
    ticks: u64,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn study(&self) -> &StudyMachine {
        &self.study
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Prepares the study, reconciles persisted state, then starts it.
    pub async fn boot(&mut self) -> Result<RehydrationReport> {
        self.study.prepare().await?;
        let study_id = self.study_id()?;
        let report = recovery::rehydrate(self.deps.store.as_ref(), study_id).await?;
        self.study.start().await?;
        Ok(report)
    }

    fn study_id(&self) -> Result<i64> {
        self.study.study().map(|s| s.id).ok_or_else(|| {
            crate::error::OrchestratorError::Invariant("study not prepared".into())
        })
    }

    /// Runs one monitor cascade and returns the resulting study state.
    pub async fn tick(&mut self) -> Result<StudyState> {
        self.ticks += 1;
        let span = tracing::info_span!("tick", tick = self.ticks, tick_id = %Uuid::new_v4());
        self.study.monitor().instrument(span).await?;
        self.study_state()
    }

    fn study_state(&self) -> Result<StudyState> {
        self.study.state().ok_or_else(|| {
            crate::error::OrchestratorError::Invariant("study not prepared".into())
        })
    }

    /// Ticks every poll interval until the study is terminal or `shutdown`
    /// resolves. A failed tick is logged and retried on the next one; the
    /// persisted state is the recovery point.
    pub async fn run_until<S>(&mut self, shutdown: S) -> Result<Exit>
    where
        S: Future<Output = ()>,
    {
        let state = self.study_state()?;
        if state.is_terminal() {
            return Ok(Exit::Finished(state));
        }

        let mut interval = tokio::time::interval(self.deps.settings.poll_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    tracing::warn!(ticks = self.ticks, "shutdown requested, leaving state for rehydration");
                    return Ok(Exit::Interrupted);
                }
                _ = interval.tick() => {}
            }

            match self.tick().await {
                Ok(state) if state.is_terminal() => {
                    tracing::info!(?state, ticks = self.ticks, "study finished");
                    return Ok(Exit::Finished(state));
                }
                Ok(_) => {}
                Err(err) => tracing::error!(error = %err, tick = self.ticks, "tick failed"),
            }
        }
    }
}
