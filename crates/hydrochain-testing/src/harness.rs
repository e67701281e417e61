//! A study on a temporary directory, wired to the fakes.

use crate::fakes::{EventRecorder, FakeQueue, RecordingChaining, RecordingFlex, RecordingReservoir, ScriptedStrategy};
use anyhow::{ensure, Context};
use hydrochain::events::{CaseEvent, Envelope, RunEvent, StudyEvent};
use hydrochain::model::{chain_order, Case, Run, Study, StudyState};
use hydrochain::store::{Store, StoreExt};
use hydrochain::{Deps, Engine, Listener, Settings, SyncFormat};
use hydrochain_persistence::JsonFileStore;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

pub const CASE_LIST: &str = "casos.txt";
pub const RULES_FILE: &str = "rules.json";

pub struct Harness {
    dir: TempDir,
    pub settings: Settings,
    pub store: Arc<JsonFileStore>,
    pub queue: FakeQueue,
    pub chaining: RecordingChaining,
    pub flex: RecordingFlex,
    pub reservoir: RecordingReservoir,
    pub strategy: ScriptedStrategy,
    pub study_events: EventRecorder<StudyEvent>,
    pub case_events: EventRecorder<CaseEvent>,
    pub run_events: EventRecorder<RunEvent>,
    pub probe: PersistenceProbe,
}

impl Harness {
    /// Writes `cases` (relative case directories) as the case list of a
    /// fresh study. One chaining variable, `earm`, is configured.
    pub async fn new(cases: &[&str]) -> anyhow::Result<Self> {
        let dir = tempfile::tempdir().context("creating study directory")?;
        tokio::fs::write(dir.path().join(CASE_LIST), cases.join("\n"))
            .await
            .context("writing case list")?;

        let mut settings = Settings::new("harness", dir.path());
        settings.chaining_vars = vec!["earm".to_string()];
        settings.poll_interval = 1;

        let store = Arc::new(JsonFileStore::open(dir.path(), SyncFormat::Pretty).await?);
        let probe = PersistenceProbe::new(&store);

        Ok(Self {
            dir,
            settings,
            store,
            queue: FakeQueue::new(),
            chaining: RecordingChaining::default(),
            flex: RecordingFlex::default(),
            reservoir: RecordingReservoir::default(),
            strategy: ScriptedStrategy::default(),
            study_events: EventRecorder::new(),
            case_events: EventRecorder::new(),
            run_events: EventRecorder::new(),
            probe,
        })
    }

    pub fn base_path(&self) -> &Path {
        self.dir.path()
    }

    /// Writes `rules` as the monthly reservoir rules file.
    pub async fn with_rules(&mut self, rules: serde_json::Value) -> anyhow::Result<()> {
        tokio::fs::write(self.dir.path().join(RULES_FILE), serde_json::to_vec(&rules)?).await?;
        self.settings.reservoir_rules_file = Some(PathBuf::from(RULES_FILE));
        Ok(())
    }

    /// Replaces the queue, as a restarted process would see a fresh
    /// scheduler connection.
    pub fn restart_queue(&mut self) {
        self.queue = FakeQueue::new();
    }

    pub fn deps(&self) -> Deps {
        Deps {
            settings: Arc::new(self.settings.clone()),
            store: self.store.clone(),
            queue: Arc::new(self.queue.clone()),
            chaining: Arc::new(self.chaining.clone()),
            flex: Arc::new(self.flex.clone()),
            reservoir: Arc::new(self.reservoir.clone()),
            strategies: Arc::new(self.strategy.clone()),
        }
    }

    /// An engine with every recorder and the persistence probe attached.
    pub fn engine(&self) -> Engine {
        Engine::builder()
            .with_study_tap(Arc::new(self.probe.clone()))
            .with_case_tap(Arc::new(self.probe.clone()))
            .with_study_tap(Arc::new(self.study_events.clone()))
            .with_case_tap(Arc::new(self.case_events.clone()))
            .with_run_tap(Arc::new(self.run_events.clone()))
            .build(self.deps())
    }

    /// Ticks until the study is terminal, checking the run invariants after
    /// every tick. Fails after `max_ticks`.
    pub async fn drive(&self, engine: &mut Engine, max_ticks: u64) -> anyhow::Result<StudyState> {
        for _ in 0..max_ticks {
            if let Some(state) = engine.study().state().filter(StudyState::is_terminal) {
                return Ok(state);
            }
            engine.tick().await?;
            self.check_invariants().await?;
        }
        anyhow::bail!("study not finished after {max_ticks} ticks")
    }

    /// Boots a new engine and drives it to a terminal state.
    pub async fn run_study(&self, max_ticks: u64) -> anyhow::Result<StudyState> {
        let mut engine = self.engine();
        engine.boot().await?;
        self.drive(&mut engine, max_ticks).await
    }

    pub async fn study(&self) -> anyhow::Result<Study> {
        let mut uow = self.store.studies().await?;
        uow.list()
            .await?
            .into_iter()
            .next()
            .context("no study persisted")
    }

    /// Cases in chain order.
    pub async fn cases(&self) -> anyhow::Result<Vec<Case>> {
        let study = self.study().await?;
        let mut cases = self.store.cases_of(study.id).await?;
        cases.sort_by(chain_order);
        Ok(cases)
    }

    pub async fn case(&self, name: &str) -> anyhow::Result<Case> {
        self.cases()
            .await?
            .into_iter()
            .find(|c| c.name == name)
            .with_context(|| format!("no case named {name}"))
    }

    /// Runs of `case_name` in id order.
    pub async fn runs(&self, case_name: &str) -> anyhow::Result<Vec<Run>> {
        let case = self.case(case_name).await?;
        let mut runs = self.store.runs_of(case.id).await?;
        runs.sort_by_key(|r| r.id);
        Ok(runs)
    }

    /// Run timestamps, the one-active-run rule and the run list of every case.
    pub async fn check_invariants(&self) -> anyhow::Result<()> {
        for case in self.cases().await? {
            let runs = self.store.runs_of(case.id).await?;
            let active = runs.iter().filter(|r| r.is_active()).count();
            ensure!(active <= 1, "case {} has {active} active runs", case.name);

            let mut ids: Vec<_> = runs.iter().map(|r| r.id).collect();
            ids.sort_unstable();
            ensure!(
                ids == case.run_ids,
                "case {} lists runs {:?} but {:?} are stored",
                case.name,
                case.run_ids,
                ids
            );

            for run in &runs {
                ensure!(
                    run.ended.is_some() == run.state.is_terminal(),
                    "run {} in {:?} has ended = {:?}",
                    run.id,
                    run.state,
                    run.ended
                );
                if let (Some(started), Some(ended)) = (run.started, run.ended) {
                    ensure!(started <= ended, "run {} ended before it started", run.id);
                }
            }
        }
        Ok(())
    }
}

/// Tap that reads the documents on disk while an event is being delivered
/// and records every event whose post-state is not persisted yet.
#[derive(Clone)]
pub struct PersistenceProbe {
    studies_path: PathBuf,
    cases_path: PathBuf,
    violations: Arc<Mutex<Vec<String>>>,
}

impl PersistenceProbe {
    pub fn new(store: &JsonFileStore) -> Self {
        Self {
            studies_path: store.studies_path().to_path_buf(),
            cases_path: store.cases_path().to_path_buf(),
            violations: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn violations(&self) -> Vec<String> {
        self.violations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn violation(&self, message: String) {
        self.violations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(message);
    }

    fn read<T: serde::de::DeserializeOwned>(path: &Path) -> Vec<T> {
        std::fs::read(path)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default()
    }
}

impl Listener<CaseEvent> for PersistenceProbe {
    fn on_event(&self, envelope: &Envelope<CaseEvent>) {
        let Some(expected) = envelope.event.post_state() else {
            return;
        };
        let cases: Vec<Case> = Self::read(&self.cases_path);
        match cases.iter().find(|c| c.id == envelope.source) {
            Some(case) if case.state == expected => {}
            Some(case) => self.violation(format!(
                "case {} emitted {:?} while persisted as {:?}",
                case.id, envelope.event, case.state
            )),
            None => self.violation(format!("case {} emitted {:?} but is not persisted", envelope.source, envelope.event)),
        }
    }
}

impl Listener<StudyEvent> for PersistenceProbe {
    fn on_event(&self, envelope: &Envelope<StudyEvent>) {
        let Some(expected) = envelope.event.post_state() else {
            return;
        };
        let studies: Vec<Study> = Self::read(&self.studies_path);
        if let Some(study) = studies.iter().find(|s| s.id == envelope.source) {
            if study.state != expected {
                self.violation(format!(
                    "study {} emitted {:?} while persisted as {:?}",
                    study.id, envelope.event, study.state
                ));
            }
        }
    }
}
