//! Clients of the chaining, flexibilization and reservoir-rule services.
//!
//! Each service is a single JSON endpoint. Cases travel as
//! `{id, program}` where `id` is the base62 encoding of the case's absolute
//! path and `program` is the configured wire name of its program.

use crate::base62;
use crate::client::HttpClient;
use async_trait::async_trait;
use hydrochain::collaborators::{CaseRef, ChainedValue, ChainingService, FlexService, ReservoirRuleService};
use hydrochain::{PerProgram, ServiceError};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CasePayload {
    pub id: String,
    pub program: String,
}

impl CasePayload {
    pub fn new(case: &CaseRef, names: &PerProgram<String>) -> Self {
        Self {
            id: base62::encode_path(&case.path),
            program: names.get(case.program).clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChainRequest<'a> {
    sources: Vec<CasePayload>,
    destination: CasePayload,
    variable: &'a str,
}

#[derive(Debug, Serialize)]
struct RulesRequest<'a> {
    sources: Vec<CasePayload>,
    destination: CasePayload,
    rules: &'a [Value],
}

fn payloads(cases: &[CaseRef], names: &PerProgram<String>) -> Vec<CasePayload> {
    cases.iter().map(|c| CasePayload::new(c, names)).collect()
}

pub struct ChainingClient {
    http: HttpClient,
    names: PerProgram<String>,
}

impl ChainingClient {
    pub fn new(http: HttpClient, names: PerProgram<String>) -> Self {
        Self { http, names }
    }
}

#[async_trait]
impl ChainingService for ChainingClient {
    async fn chain(
        &self,
        sources: &[CaseRef],
        destination: &CaseRef,
        variable: &str,
    ) -> Result<Vec<ChainedValue>, ServiceError> {
        let request = ChainRequest {
            sources: payloads(sources, &self.names),
            destination: CasePayload::new(destination, &self.names),
            variable,
        };
        tracing::debug!(destination = %destination.name, variable, sources = sources.len(), "chaining request");
        self.http.post("", &request).await
    }
}

pub struct FlexClient {
    http: HttpClient,
    names: PerProgram<String>,
}

impl FlexClient {
    pub fn new(http: HttpClient, names: PerProgram<String>) -> Self {
        Self { http, names }
    }
}

#[async_trait]
impl FlexService for FlexClient {
    async fn flexibilize(&self, case: &CaseRef) -> Result<Vec<Value>, ServiceError> {
        self.http.post("", &CasePayload::new(case, &self.names)).await
    }
}

pub struct ReservoirClient {
    http: HttpClient,
    names: PerProgram<String>,
}

impl ReservoirClient {
    pub fn new(http: HttpClient, names: PerProgram<String>) -> Self {
        Self { http, names }
    }
}

#[async_trait]
impl ReservoirRuleService for ReservoirClient {
    async fn apply_rules(
        &self,
        sources: &[CaseRef],
        destination: &CaseRef,
        rules: &[Value],
    ) -> Result<Vec<Value>, ServiceError> {
        let request = RulesRequest {
            sources: payloads(sources, &self.names),
            destination: CasePayload::new(destination, &self.names),
            rules,
        };
        self.http.post("", &request).await
    }
}

/// Stand-in for a service without a configured URL. Every call is rejected.
#[derive(Debug, Clone, Copy)]
pub struct Unconfigured(pub &'static str);

#[async_trait]
impl ChainingService for Unconfigured {
    async fn chain(
        &self,
        _sources: &[CaseRef],
        _destination: &CaseRef,
        _variable: &str,
    ) -> Result<Vec<ChainedValue>, ServiceError> {
        Err(ServiceError::Unconfigured(self.0))
    }
}

#[async_trait]
impl FlexService for Unconfigured {
    async fn flexibilize(&self, _case: &CaseRef) -> Result<Vec<Value>, ServiceError> {
        Err(ServiceError::Unconfigured(self.0))
    }
}

#[async_trait]
impl ReservoirRuleService for Unconfigured {
    async fn apply_rules(
        &self,
        _sources: &[CaseRef],
        _destination: &CaseRef,
        _rules: &[Value],
    ) -> Result<Vec<Value>, ServiceError> {
        Err(ServiceError::Unconfigured(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hydrochain::model::Program;
    use hydrochain::Settings;
    use serde_json::json;
    use std::path::PathBuf;
    use std::time::Duration;
    use wiremock::matchers::{body_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn names() -> PerProgram<String> {
        Settings::new("pmo", "/data/pmo").program_names
    }

    fn case(path: &str, program: Program) -> CaseRef {
        CaseRef {
            name: path.to_string(),
            path: PathBuf::from(path),
            program,
        }
    }

    fn http(server: &MockServer) -> HttpClient {
        HttpClient::new(&server.uri(), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_chain_posts_encoded_cases() {
        let server = MockServer::start().await;
        let source = case("/data/pmo/2020_01_rv0/newave", Program::LongHorizon);
        let destination = case("/data/pmo/2020_01_rv1/decomp", Program::ShortHorizon);

        Mock::given(method("POST"))
            .and(body_json(json!({
                "sources": [{"id": base62::encode_path(&source.path), "program": "NEWAVE"}],
                "destination": {"id": base62::encode_path(&destination.path), "program": "DECOMP"},
                "variable": "earm",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": "ree1", "value": 42.5}
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let client = ChainingClient::new(http(&server), names());
        let values = client.chain(&[source], &destination, "earm").await.unwrap();
        assert_eq!(
            values,
            vec![ChainedValue {
                id: "ree1".into(),
                value: json!(42.5)
            }]
        );
    }

    #[tokio::test]
    async fn test_non_success_carries_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(422).set_body_string("deck has no hydro block"))
            .mount(&server)
            .await;

        let client = FlexClient::new(http(&server), names());
        let err = client
            .flexibilize(&case("/data/pmo/2020_01_rv1/decomp", Program::ShortHorizon))
            .await
            .unwrap_err();
        match err {
            ServiceError::Status { status, body } => {
                assert_eq!(status, 422);
                assert_eq!(body, "deck has no hydro block");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_reservoir_rules_are_forwarded_opaquely() {
        let server = MockServer::start().await;
        let rules = vec![json!({"reservoir": 6, "month": 2, "min_volume": 0.3})];
        Mock::given(method("POST"))
            .and(body_json(json!({
                "sources": [],
                "destination": {"id": base62::encode_path(std::path::Path::new("/d/2020_02_rv1/decomp")), "program": "DECOMP"},
                "rules": rules.clone(),
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"applied": 1}])))
            .mount(&server)
            .await;

        let client = ReservoirClient::new(http(&server), names());
        let applied = client
            .apply_rules(&[], &case("/d/2020_02_rv1/decomp", Program::ShortHorizon), &rules)
            .await
            .unwrap();
        assert_eq!(applied.len(), 1);
    }

    #[tokio::test]
    async fn test_garbage_payload_is_a_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;
        let client = FlexClient::new(http(&server), names());
        let err = client
            .flexibilize(&case("/x/2020_01_rv1/decomp", Program::ShortHorizon))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Decode(_)));
    }

    #[tokio::test]
    async fn test_unconfigured_rejects() {
        let err = Unconfigured("flex")
            .flexibilize(&case("/x", Program::ShortHorizon))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Unconfigured("flex")));
    }
}
