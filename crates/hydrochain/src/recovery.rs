//! Startup reconciliation of persisted state.
//!
//! After a crash nothing in memory survives, so every Run that was still
//! active is orphaned: the scheduler may or may not have it, and nobody will
//! poll it again. Rehydration closes those runs, re-links the case run lists
//! and rewinds in-flight cases to `Prepared` so the next tick re-submits.

use crate::error::Result;
use crate::model::{CaseId, CaseState, RunId, StudyId, ABANDONED};
use crate::store::{Store, StoreExt};
use chrono::Utc;

/// What a rehydration pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RehydrationReport {
    pub abandoned_runs: Vec<RunId>,
    pub reverted_cases: Vec<CaseId>,
    /// Cases whose run list was missing persisted runs.
    pub relinked_cases: Vec<CaseId>,
    /// Earliest case in chain order that is not `Done`.
    pub resume_at: Option<CaseId>,
}

impl RehydrationReport {
    pub fn is_clean(&self) -> bool {
        self.abandoned_runs.is_empty()
            && self.reverted_cases.is_empty()
            && self.relinked_cases.is_empty()
    }
}

/// Closes every non-terminal run of `case_id` as abandoned, in one scope.
pub async fn abandon_active_runs(store: &dyn Store, case_id: CaseId) -> Result<Vec<RunId>> {
    let mut uow = store.runs().await?;
    let now = Utc::now();
    let mut closed = Vec::new();
    for mut run in uow.list_by_parent(case_id).await? {
        if run.close(ABANDONED, now) {
            uow.update(&run).await?;
            closed.push(run.id);
        }
    }
    uow.commit().await?;
    Ok(closed)
}

/// Reconciles every case of `study_id`. Running it twice in a row changes
/// nothing the second time.
pub async fn rehydrate(store: &dyn Store, study_id: StudyId) -> Result<RehydrationReport> {
    let study = store.load_study(study_id).await?;
    let mut report = RehydrationReport::default();

    let mut cases = store.cases_of(study.id).await?;
    cases.sort_by(crate::model::chain_order);

    for case in &cases {
        let abandoned = abandon_active_runs(store, case.id).await?;
        for run_id in &abandoned {
            tracing::warn!(case_id = case.id, run_id, "run abandoned");
        }
        report.abandoned_runs.extend(abandoned);

        let mut persisted: Vec<RunId> = store.runs_of(case.id).await?.iter().map(|r| r.id).collect();
        persisted.sort_unstable();

        let mut updated = case.clone();
        let missing: Vec<RunId> = persisted
            .iter()
            .copied()
            .filter(|id| !updated.run_ids.contains(id))
            .collect();
        if !missing.is_empty() {
            updated.run_ids.extend(missing);
            updated.run_ids.sort_unstable();
            report.relinked_cases.push(case.id);
        }

        if updated.state.is_in_flight() {
            tracing::info!(case_id = case.id, from = ?updated.state, "case rewound to prepared");
            updated.state = CaseState::Prepared;
            report.reverted_cases.push(case.id);
        }

        if &updated != case {
            store.save_case(&updated).await?;
        }
    }

    report.resume_at = cases
        .iter()
        .find(|c| c.state != CaseState::Done)
        .map(|c| c.id);

    tracing::info!(
        study_id,
        abandoned = report.abandoned_runs.len(),
        reverted = report.reverted_cases.len(),
        resume_at = ?report.resume_at,
        "rehydration finished"
    );
    Ok(report)
}
