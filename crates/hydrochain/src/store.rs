//! Repositories and the unit-of-work boundary.
//!
//! Every mutation happens inside a [`UnitOfWork`] scope. A scope exposes one
//! typed repository and persists its writes only when [`UnitOfWork::commit`]
//! is called; dropping it without committing leaves storage unchanged.
//!
//! The discipline callers follow: open, read, perform a bounded set of
//! writes, commit once. No caller holds two scopes of the same aggregate
//! family at the same time.

use crate::error::StoreError;
use crate::model::{Case, CaseId, Run, RunId, Study, StudyId};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// A persisted aggregate.
pub trait Aggregate: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    const KIND: &'static str;

    fn id(&self) -> i64;
    fn set_id(&mut self, id: i64);
    /// Id of the owning aggregate; `None` for the root.
    fn parent_id(&self) -> Option<i64>;

    /// Whether `self` and `other` collide on a unique key other than the id.
    fn conflicts_with(&self, _other: &Self) -> bool {
        false
    }
}

impl Aggregate for Study {
    const KIND: &'static str = "study";

    fn id(&self) -> i64 {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = id;
    }

    fn parent_id(&self) -> Option<i64> {
        None
    }
}

impl Aggregate for Case {
    const KIND: &'static str = "case";

    fn id(&self) -> i64 {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = id;
    }

    fn parent_id(&self) -> Option<i64> {
        Some(self.study_id)
    }

    /// A relative case path appears once per study.
    fn conflicts_with(&self, other: &Self) -> bool {
        self.study_id == other.study_id && self.path == other.path
    }
}

impl Aggregate for Run {
    const KIND: &'static str = "run";

    fn id(&self) -> i64 {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = id;
    }

    fn parent_id(&self) -> Option<i64> {
        Some(self.case_id)
    }
}

/// Transactional scope over one aggregate family.
#[async_trait]
pub trait UnitOfWork<T: Aggregate>: Send {
    /// Inserts `record`, assigning its id. The returned copy carries the id.
    async fn create(&mut self, record: T) -> Result<T, StoreError>;

    async fn read(&mut self, id: i64) -> Result<Option<T>, StoreError>;

    /// Replaces the stored record with the same id.
    async fn update(&mut self, record: &T) -> Result<(), StoreError>;

    /// Returns whether a record was removed.
    async fn delete(&mut self, id: i64) -> Result<bool, StoreError>;

    async fn list(&mut self) -> Result<Vec<T>, StoreError>;

    async fn list_by_parent(&mut self, parent_id: i64) -> Result<Vec<T>, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

/// Opens unit-of-work scopes for each aggregate family.
#[async_trait]
pub trait Store: Send + Sync {
    async fn studies(&self) -> Result<Box<dyn UnitOfWork<Study>>, StoreError>;
    async fn cases(&self) -> Result<Box<dyn UnitOfWork<Case>>, StoreError>;
    async fn runs(&self) -> Result<Box<dyn UnitOfWork<Run>>, StoreError>;
}

async fn load<T: Aggregate>(mut uow: Box<dyn UnitOfWork<T>>, id: i64) -> Result<T, StoreError> {
    uow.read(id).await?.ok_or(StoreError::NotFound { kind: T::KIND, id })
}

async fn save<T: Aggregate>(mut uow: Box<dyn UnitOfWork<T>>, record: &T) -> Result<(), StoreError> {
    uow.update(record).await?;
    uow.commit().await
}

/// Single-record helpers: each call is one scope with at most one commit.
#[async_trait]
pub trait StoreExt: Store {
    async fn load_study(&self, id: StudyId) -> Result<Study, StoreError> {
        load(self.studies().await?, id).await
    }

    async fn load_case(&self, id: CaseId) -> Result<Case, StoreError> {
        load(self.cases().await?, id).await
    }

    async fn load_run(&self, id: RunId) -> Result<Run, StoreError> {
        load(self.runs().await?, id).await
    }

    async fn save_study(&self, study: &Study) -> Result<(), StoreError> {
        save(self.studies().await?, study).await
    }

    async fn save_case(&self, case: &Case) -> Result<(), StoreError> {
        save(self.cases().await?, case).await
    }

    async fn save_run(&self, run: &Run) -> Result<(), StoreError> {
        save(self.runs().await?, run).await
    }

    async fn cases_of(&self, study_id: StudyId) -> Result<Vec<Case>, StoreError> {
        self.cases().await?.list_by_parent(study_id).await
    }

    async fn runs_of(&self, case_id: CaseId) -> Result<Vec<Run>, StoreError> {
        self.runs().await?.list_by_parent(case_id).await
    }
}

impl<S: Store + ?Sized> StoreExt for S {}

/// Deletes a study together with its cases and their runs, leaves first.
///
/// Returns `false` when the study did not exist.
pub async fn delete_study(store: &dyn Store, study_id: StudyId) -> Result<bool, StoreError> {
    let cases = store.cases_of(study_id).await?;

    let mut runs = store.runs().await?;
    for case in &cases {
        for run in runs.list_by_parent(case.id).await? {
            runs.delete(run.id).await?;
        }
    }
    runs.commit().await?;

    let mut case_uow = store.cases().await?;
    for case in &cases {
        case_uow.delete(case.id).await?;
    }
    case_uow.commit().await?;

    let mut studies = store.studies().await?;
    let removed = studies.delete(study_id).await?;
    studies.commit().await?;
    Ok(removed)
}
