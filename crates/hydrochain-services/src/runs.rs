//! Runs kept by the run-model service.
//!
//! When the service is enabled it is the authoritative Run store; Studies
//! and Cases stay in the local backend. [`SplitStore`] routes each
//! aggregate family to its owner.
//!
//! The service assigns ids, so creates are sent at once. Updates and
//! deletes are staged in the scope and sent in order on commit; a dropped
//! scope sends nothing.

use crate::client::HttpClient;
use async_trait::async_trait;
use hydrochain::model::{Case, Run, Study};
use hydrochain::store::{Store, UnitOfWork};
use hydrochain::{ServiceError, StoreError};
use std::sync::Arc;

fn store_error(err: ServiceError, id: Option<i64>) -> StoreError {
    match (&err, id) {
        (ServiceError::Status { status: 404, .. }, Some(id)) => StoreError::NotFound { kind: "run", id },
        (ServiceError::Status { status, body }, _) if *status < 500 => {
            StoreError::Constraint(format!("run service answered {status}: {body}"))
        }
        _ => StoreError::Backend(err.to_string()),
    }
}

#[derive(Debug, Clone)]
enum Staged {
    Update(Run),
    Delete(i64),
}

impl Staged {
    fn id(&self) -> i64 {
        match self {
            Staged::Update(run) => run.id,
            Staged::Delete(id) => *id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RemoteRunStore {
    http: HttpClient,
}

impl RemoteRunStore {
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }

    pub fn scope(&self) -> RemoteRunScope {
        RemoteRunScope {
            http: self.http.clone(),
            staged: Vec::new(),
        }
    }
}

pub struct RemoteRunScope {
    http: HttpClient,
    staged: Vec<Staged>,
}

impl RemoteRunScope {
    /// Latest staged operation for `id`.
    fn pending(&self, id: i64) -> Option<&Staged> {
        self.staged.iter().rev().find(|s| s.id() == id)
    }

    /// Applies staged operations on top of a listing from the service.
    fn overlay(&self, runs: Vec<Run>) -> Vec<Run> {
        runs.into_iter()
            .filter_map(|run| match self.pending(run.id) {
                Some(Staged::Delete(_)) => None,
                Some(Staged::Update(staged)) => Some(staged.clone()),
                None => Some(run),
            })
            .collect()
    }
}

#[async_trait]
impl UnitOfWork<Run> for RemoteRunScope {
    async fn create(&mut self, record: Run) -> Result<Run, StoreError> {
        let created: Run = self
            .http
            .post("/runs", &record)
            .await
            .map_err(|e| store_error(e, None))?;
        tracing::debug!(run_id = created.id, case_id = created.case_id, "run registered");
        Ok(created)
    }

    async fn read(&mut self, id: i64) -> Result<Option<Run>, StoreError> {
        match self.pending(id) {
            Some(Staged::Delete(_)) => return Ok(None),
            Some(Staged::Update(run)) => return Ok(Some(run.clone())),
            None => {}
        }
        self.http
            .get_optional(&format!("/runs/{id}"))
            .await
            .map_err(|e| store_error(e, Some(id)))
    }

    async fn update(&mut self, record: &Run) -> Result<(), StoreError> {
        self.staged.push(Staged::Update(record.clone()));
        Ok(())
    }

    async fn delete(&mut self, id: i64) -> Result<bool, StoreError> {
        if matches!(self.pending(id), Some(Staged::Delete(_))) {
            return Ok(false);
        }
        let exists = self.read(id).await?.is_some();
        if exists {
            self.staged.push(Staged::Delete(id));
        }
        Ok(exists)
    }

    async fn list(&mut self) -> Result<Vec<Run>, StoreError> {
        let runs: Vec<Run> = self.http.get("/runs").await.map_err(|e| store_error(e, None))?;
        Ok(self.overlay(runs))
    }

    async fn list_by_parent(&mut self, parent_id: i64) -> Result<Vec<Run>, StoreError> {
        let runs: Vec<Run> = self
            .http
            .get(&format!("/runs?case_id={parent_id}"))
            .await
            .map_err(|e| store_error(e, None))?;
        Ok(self.overlay(runs))
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        for op in &self.staged {
            match op {
                Staged::Update(run) => self
                    .http
                    .put(&format!("/runs/{}", run.id), run)
                    .await
                    .map_err(|e| store_error(e, Some(run.id)))?,
                Staged::Delete(id) => {
                    self.http
                        .delete(&format!("/runs/{id}"))
                        .await
                        .map_err(|e| store_error(e, Some(*id)))?;
                }
            }
        }
        Ok(())
    }
}

/// Studies and Cases from `local`, Runs from the run-model service.
pub struct SplitStore {
    local: Arc<dyn Store>,
    runs: RemoteRunStore,
}

impl SplitStore {
    pub fn new(local: Arc<dyn Store>, runs: RemoteRunStore) -> Self {
        Self { local, runs }
    }
}

#[async_trait]
impl Store for SplitStore {
    async fn studies(&self) -> Result<Box<dyn UnitOfWork<Study>>, StoreError> {
        self.local.studies().await
    }

    async fn cases(&self) -> Result<Box<dyn UnitOfWork<Case>>, StoreError> {
        self.local.cases().await
    }

    async fn runs(&self) -> Result<Box<dyn UnitOfWork<Run>>, StoreError> {
        Ok(Box::new(self.runs.scope()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hydrochain::model::{Program, RunState};
    use hydrochain::store::StoreExt;
    use std::path::PathBuf;
    use std::time::Duration;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn run(id: i64) -> Run {
        Run {
            id,
            case_id: 3,
            job_id: None,
            name: "decomp_2020_01_rv1".into(),
            working_dir: PathBuf::from("/data/pmo/2020_01_rv1/decomp"),
            program: Program::ShortHorizon,
            version: "31.0.2".into(),
            processors: 72,
            executable: PathBuf::from("/opt/decomp/run.sh"),
            args: vec!["31.0.2".into()],
            submitted: Utc::now(),
            started: None,
            ended: None,
            state: RunState::NotStarted,
            end_reason: None,
        }
    }

    async fn store(server: &MockServer) -> RemoteRunStore {
        RemoteRunStore::new(HttpClient::new(&server.uri(), Duration::from_secs(5)).unwrap())
    }

    #[tokio::test]
    async fn test_create_is_immediate_and_takes_the_service_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/runs"))
            .respond_with(ResponseTemplate::new(201).set_body_json(run(17)))
            .expect(1)
            .mount(&server)
            .await;

        let mut scope = store(&server).await.scope();
        let created = scope.create(run(0)).await.unwrap();
        assert_eq!(created.id, 17);
    }

    #[tokio::test]
    async fn test_updates_are_sent_on_commit_only() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/runs/17"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let remote = store(&server).await;

        let mut dropped = remote.scope();
        dropped.update(&run(17)).await.unwrap();
        drop(dropped);

        let mut scope = Box::new(remote.scope());
        let mut updated = run(17);
        updated.state = RunState::Waiting;
        scope.update(&updated).await.unwrap();
        assert_eq!(scope.read(17).await.unwrap().unwrap().state, RunState::Waiting);
        scope.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_missing_run() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/runs/99"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let mut scope = store(&server).await.scope();
        assert!(scope.read(99).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_by_case_overlays_staged_deletes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/runs"))
            .and(query_param("case_id", "3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(vec![run(1), run(2)]))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/runs/1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(run(1)))
            .mount(&server)
            .await;

        let mut scope = store(&server).await.scope();
        assert!(scope.delete(1).await.unwrap());
        let ids: Vec<i64> = scope.list_by_parent(3).await.unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![2]);
    }

    #[tokio::test]
    async fn test_server_errors_are_transient_backend_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;
        let mut scope = store(&server).await.scope();
        let err = scope.read(5).await.unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));
    }

    #[tokio::test]
    async fn test_split_store_routes_runs_remotely() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/runs/4"))
            .respond_with(ResponseTemplate::new(200).set_body_json(run(4)))
            .mount(&server)
            .await;

        struct NoLocal;

        #[async_trait]
        impl Store for NoLocal {
            async fn studies(&self) -> Result<Box<dyn UnitOfWork<Study>>, StoreError> {
                Err(StoreError::Backend("unused".into()))
            }
            async fn cases(&self) -> Result<Box<dyn UnitOfWork<Case>>, StoreError> {
                Err(StoreError::Backend("unused".into()))
            }
            async fn runs(&self) -> Result<Box<dyn UnitOfWork<Run>>, StoreError> {
                Err(StoreError::Backend("unused".into()))
            }
        }

        let split = SplitStore::new(Arc::new(NoLocal), store(&server).await);
        assert_eq!(split.load_run(4).await.unwrap().id, 4);
        assert!(split.studies().await.is_err());
    }
}
