//! Study state machine: walks the case chain in order.
//!
//! The Study never decides how a case recovers. It activates the earliest
//! case that is not `Done`, forwards ticks to it, and reacts only to the
//! case's terminal events.

use crate::bus::{EventBus, Inbox, Listener};
use crate::case::CaseMachine;
use crate::deps::Deps;
use crate::error::{OrchestratorError, Result};
use crate::events::{CaseEvent, RunEvent, StudyEvent};
use crate::machine::Machine;
use crate::model::{chain_order, Case, CaseState, Study, StudyState};
use crate::rules::{self, CaseCoordinates};
use crate::store::StoreExt;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// What the Study does about a case event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StudyCommand {
    AdvanceToNext,
    Halt,
}

/// Pure reaction of the Study to events of its active case.
#[derive(Debug, Default, Clone, Copy)]
pub struct StudyPolicy;

impl Machine for StudyPolicy {
    type Event = CaseEvent;
    type Command = StudyCommand;

    fn decide(&mut self, event: &CaseEvent) -> Option<StudyCommand> {
        match event {
            CaseEvent::Completed => Some(StudyCommand::AdvanceToNext),
            CaseEvent::Failed => Some(StudyCommand::Halt),
            _ => None,
        }
    }
}

/// One line of the case list: a case directory relative to the base path.
pub fn parse_case_list(contents: &str) -> Vec<PathBuf> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(PathBuf::from)
        .collect()
}

pub struct StudyMachine {
    study: Option<Study>,
    deps: Deps,
    rules: Arc<Vec<serde_json::Value>>,
    bus: EventBus<StudyEvent>,
    current: Option<CaseMachine>,
    case_inbox: Inbox<CaseEvent>,
    case_taps: Vec<Arc<dyn Listener<CaseEvent>>>,
    run_taps: Vec<Arc<dyn Listener<RunEvent>>>,
}

impl StudyMachine {
    pub fn new(deps: Deps) -> Self {
        let source = deps.settings.study_id.unwrap_or_default();
        Self {
            study: None,
            deps,
            rules: Arc::new(Vec::new()),
            bus: EventBus::new(source),
            current: None,
            case_inbox: Inbox::new(),
            case_taps: Vec::new(),
            run_taps: Vec::new(),
        }
    }

    pub fn subscribe(&mut self, listener: Arc<dyn Listener<StudyEvent>>) {
        self.bus.subscribe(listener);
    }

    /// Taps attached to every Case machine this study activates.
    pub fn subscribe_cases(&mut self, listener: Arc<dyn Listener<CaseEvent>>) {
        if let Some(case) = self.current.as_mut() {
            case.subscribe(Arc::clone(&listener));
        }
        self.case_taps.push(listener);
    }

    /// Taps attached to every Run controller of every case.
    pub fn subscribe_runs(&mut self, listener: Arc<dyn Listener<RunEvent>>) {
        if let Some(case) = self.current.as_mut() {
            case.subscribe_runs(Arc::clone(&listener));
        }
        self.run_taps.push(listener);
    }

    pub fn study(&self) -> Option<&Study> {
        self.study.as_ref()
    }

    pub fn state(&self) -> Option<StudyState> {
        self.study.as_ref().map(|s| s.state)
    }

    pub fn current_case(&self) -> Option<&CaseMachine> {
        self.current.as_ref()
    }

    pub fn rules(&self) -> &[serde_json::Value] {
        &self.rules
    }

    fn loaded(&self) -> Result<&Study> {
        self.study
            .as_ref()
            .ok_or_else(|| OrchestratorError::Invariant("study used before prepare".into()))
    }

    /// Persists `state` on the study, then emits `event`.
    async fn transition(&mut self, state: StudyState, event: StudyEvent) -> Result<()> {
        let mut study = self.loaded()?.clone();
        study.state = state;
        self.deps.store.save_study(&study).await?;
        self.study = Some(study);
        self.bus.emit(event);
        Ok(())
    }

    // ------------------------------------------------------------------
    // prepare
    // ------------------------------------------------------------------

    /// Loads or reconstructs the study and loads the monthly rules.
    pub async fn prepare(&mut self) -> Result<()> {
        self.bus.emit(StudyEvent::PrepareRequested);

        match self.load_or_reconstruct().await {
            Ok(study) => {
                self.bus.set_source(study.id);
                self.study = Some(study);
            }
            Err(err) => {
                tracing::error!(error = %err, "study preparation failed");
                self.bus.emit(StudyEvent::PrepareError);
                return Err(err);
            }
        }

        if let Err(err) = self.load_rules().await {
            tracing::error!(error = %err, "reservoir rules could not be loaded");
            self.transition(StudyState::Error, StudyEvent::PrepareError).await?;
            return Err(err);
        }

        let state = self.loaded()?.state;
        if state.is_terminal() {
            tracing::info!(?state, "study already finished, nothing to prepare");
            return Ok(());
        }
        // A resumed study passes through `Started` again; `start()` moves it
        // back to `Executing`.
        self.transition(StudyState::Started, StudyEvent::PrepareSuccess).await
    }

    async fn load_or_reconstruct(&self) -> Result<Study> {
        let settings = &self.deps.settings;
        let existing = {
            let mut uow = self.deps.store.studies().await?;
            match settings.study_id {
                Some(id) => uow.read(id).await?,
                None => uow
                    .list()
                    .await?
                    .into_iter()
                    .find(|s| s.name == settings.study_name && s.base_path == settings.base_path),
            }
        };

        let study = match existing {
            Some(study) => study,
            None => {
                if let Some(id) = settings.study_id {
                    tracing::warn!(study_id = id, "configured study not found, reconstructing");
                }
                let mut uow = self.deps.store.studies().await?;
                let study = uow
                    .create(Study::new(&settings.study_name, &settings.base_path))
                    .await?;
                uow.commit().await?;
                tracing::info!(study_id = study.id, name = %study.name, "study created");
                study
            }
        };

        if study.case_ids.is_empty() && self.deps.store.cases_of(study.id).await?.is_empty() {
            return self.reconstruct_cases(study).await;
        }
        Ok(study)
    }

    /// Creates the cases of `study` from the case list file.
    async fn reconstruct_cases(&self, mut study: Study) -> Result<Study> {
        let settings = &self.deps.settings;
        let list_path = settings.resolve(&settings.case_list_file);
        let contents = tokio::fs::read_to_string(&list_path).await.map_err(|e| {
            OrchestratorError::CaseList(format!("{}: {e}", list_path.display()))
        })?;

        let mut seen = HashSet::new();
        let mut entries: Vec<(PathBuf, CaseCoordinates)> = Vec::new();
        for path in parse_case_list(&contents) {
            if !seen.insert(path.clone()) {
                return Err(OrchestratorError::CaseList(format!(
                    "duplicate case {}",
                    path.display()
                )));
            }
            let coords =
                rules::parse_case_path(&path, settings).map_err(OrchestratorError::CaseList)?;
            entries.push((path, coords));
        }
        if entries.is_empty() {
            return Err(OrchestratorError::CaseList(format!(
                "{} lists no cases",
                list_path.display()
            )));
        }
        entries.sort_by_key(|(_, c)| (c.year, c.month, c.revision));

        let mut uow = self.deps.store.cases().await?;
        let mut ids = Vec::with_capacity(entries.len());
        for (path, coords) in entries {
            let case = uow
                .create(Case {
                    id: 0,
                    study_id: study.id,
                    name: rules::case_name(&coords, settings),
                    path,
                    year: coords.year,
                    month: coords.month,
                    revision: coords.revision,
                    program: coords.program,
                    state: CaseState::NotStarted,
                    run_ids: Vec::new(),
                })
                .await?;
            ids.push(case.id);
        }
        uow.commit().await?;

        study.case_ids = ids;
        self.deps.store.save_study(&study).await?;
        tracing::info!(study_id = study.id, cases = study.case_ids.len(), "study reconstructed");
        Ok(study)
    }

    async fn load_rules(&mut self) -> Result<()> {
        let settings = &self.deps.settings;
        let Some(file) = settings.reservoir_rules_file.as_deref() else {
            return Ok(());
        };
        let path = settings.resolve(file);
        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| OrchestratorError::Config(format!("{}: {e}", path.display())))?;
        let rules: Vec<serde_json::Value> = serde_json::from_str(&raw)
            .map_err(|e| OrchestratorError::Config(format!("{}: {e}", path.display())))?;
        tracing::info!(rules = rules.len(), path = %path.display(), "reservoir rules loaded");
        self.rules = Arc::new(rules);
        Ok(())
    }

    // ------------------------------------------------------------------
    // start / monitor
    // ------------------------------------------------------------------

    pub async fn start(&mut self) -> Result<()> {
        self.bus.emit(StudyEvent::StartRequested);
        let state = self.loaded()?.state;
        match state {
            StudyState::Done | StudyState::Error => {
                tracing::info!(?state, "study already finished");
                return Ok(());
            }
            StudyState::NotStarted => {
                self.transition(StudyState::Error, StudyEvent::StartError).await?;
                return Err(OrchestratorError::Invariant(
                    "study started before prepare".into(),
                ));
            }
            StudyState::Started | StudyState::Executing => {}
        }

        self.transition(StudyState::Executing, StudyEvent::StartSuccess).await?;
        self.activate_next().await?;
        self.process_case_events().await
    }

    /// One tick: drives the active case and folds its events.
    pub async fn monitor(&mut self) -> Result<()> {
        let state = self.loaded()?.state;
        if state.is_terminal() {
            return Ok(());
        }

        match self.current.as_mut() {
            Some(case) => case.monitor().await?,
            None => self.activate_next().await?,
        }
        self.process_case_events().await?;

        let study = self.loaded()?.clone();
        self.deps.store.save_study(&study).await?;
        Ok(())
    }

    /// Activates the earliest case that is not `Done`, or finishes the
    /// study when none is left.
    async fn activate_next(&mut self) -> Result<()> {
        self.current = None;
        let study = self.loaded()?.clone();

        let mut cases = self.deps.store.cases_of(study.id).await?;
        cases.sort_by(chain_order);

        let Some(next) = cases.into_iter().find(|c| c.state != CaseState::Done) else {
            tracing::info!(study_id = study.id, "all cases done");
            return self.transition(StudyState::Done, StudyEvent::Done).await;
        };
        if next.state == CaseState::Error {
            tracing::error!(study_id = study.id, case_id = next.id, "case in error, study halted");
            return self.transition(StudyState::Error, StudyEvent::Error).await;
        }

        let mut machine = CaseMachine::load(
            next.id,
            study.base_path.clone(),
            Arc::clone(&self.rules),
            &self.deps,
        )
        .await?;
        machine.subscribe(Arc::new(self.case_inbox.clone()));
        for tap in &self.case_taps {
            machine.subscribe(Arc::clone(tap));
        }
        for tap in &self.run_taps {
            machine.subscribe_runs(Arc::clone(tap));
        }

        tracing::info!(study_id = study.id, case_id = next.id, name = %next.name, "next case");
        self.deps.store.save_study(&study).await?;
        self.bus.emit(StudyEvent::NextCase);

        self.current = Some(machine);
        if let Some(case) = self.current.as_mut() {
            case.advance().await?;
        }
        Ok(())
    }

    /// Drains case events; a completed case activates the next one within
    /// the same tick.
    async fn process_case_events(&mut self) -> Result<()> {
        let mut policy = StudyPolicy;
        loop {
            let mut advance = false;
            while let Some(envelope) = self.case_inbox.pop() {
                let current = self.current.as_ref().map(CaseMachine::id);
                if current != Some(envelope.source) {
                    tracing::debug!(case_id = envelope.source, event = ?envelope.event, "event from an inactive case ignored");
                    continue;
                }
                match policy.decide(&envelope.event) {
                    Some(StudyCommand::AdvanceToNext) => advance = true,
                    Some(StudyCommand::Halt) => {
                        tracing::error!(case_id = envelope.source, "case failed, study halted");
                        self.current = None;
                        return self.transition(StudyState::Error, StudyEvent::Error).await;
                    }
                    None => {}
                }
            }
            if !advance {
                return Ok(());
            }
            self.activate_next().await?;
        }
    }

    pub fn base_path(&self) -> Option<&Path> {
        self.study.as_ref().map(|s| s.base_path.as_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_reacts_to_terminal_events_only() {
        let mut policy = StudyPolicy;
        assert_eq!(policy.decide(&CaseEvent::Completed), Some(StudyCommand::AdvanceToNext));
        assert_eq!(policy.decide(&CaseEvent::Failed), Some(StudyCommand::Halt));
        assert_eq!(policy.decide(&CaseEvent::Queued), None);
        assert_eq!(policy.decide(&CaseEvent::FlexSuccess), None);
    }

    #[test]
    fn test_case_list_skips_blanks_and_comments() {
        let list = "# study\n2020_01_rv0/newave\n\n  2020_01_rv1/decomp  \n#2020_01_rv2/decomp\n";
        assert_eq!(
            parse_case_list(list),
            vec![
                PathBuf::from("2020_01_rv0/newave"),
                PathBuf::from("2020_01_rv1/decomp"),
            ]
        );
    }
}
