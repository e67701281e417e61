//! External collaborators of the orchestrator.
//!
//! - [`ChainingClient`], [`FlexClient`] and [`ReservoirClient`] speak to the
//!   auxiliary JSON services. A service without a configured URL is replaced
//!   by [`Unconfigured`], which rejects every call.
//! - [`RemoteRunStore`] keeps Runs in the run-model service; [`SplitStore`]
//!   combines it with a local backend for Studies and Cases.
//! - [`HookStrategies`] implements the per-program strategy operations by
//!   running configured commands.

pub mod auxiliary;
pub mod base62;
pub mod client;
pub mod hooks;
pub mod runs;

pub use auxiliary::{CasePayload, ChainingClient, FlexClient, ReservoirClient, Unconfigured};
pub use client::HttpClient;
pub use hooks::{HookStrategies, HookStrategy};
pub use runs::{RemoteRunScope, RemoteRunStore, SplitStore};

use hydrochain::collaborators::{ChainingService, FlexService, ReservoirRuleService};
use hydrochain::{ServiceError, Settings};
use std::sync::Arc;

/// Auxiliary service clients resolved from [`Settings`].
pub struct Services {
    pub chaining: Arc<dyn ChainingService>,
    pub flex: Arc<dyn FlexService>,
    pub reservoir: Arc<dyn ReservoirRuleService>,
}

impl Services {
    pub fn from_settings(settings: &Settings) -> Result<Self, ServiceError> {
        let timeout = settings.service_timeout();
        let names = &settings.program_names;

        let chaining: Arc<dyn ChainingService> = match &settings.chaining_service_url {
            Some(url) => Arc::new(ChainingClient::new(HttpClient::new(url, timeout)?, names.clone())),
            None => Arc::new(Unconfigured("chaining")),
        };
        let flex: Arc<dyn FlexService> = match &settings.flex_service_url {
            Some(url) => Arc::new(FlexClient::new(HttpClient::new(url, timeout)?, names.clone())),
            None => Arc::new(Unconfigured("flexibilization")),
        };
        let reservoir: Arc<dyn ReservoirRuleService> = match &settings.reservoir_service_url {
            Some(url) => Arc::new(ReservoirClient::new(HttpClient::new(url, timeout)?, names.clone())),
            None => Arc::new(Unconfigured("reservoir rules")),
        };

        Ok(Self {
            chaining,
            flex,
            reservoir,
        })
    }
}

/// The run-model service store, when `run_api_url` is set.
pub fn run_store(settings: &Settings) -> Result<Option<RemoteRunStore>, ServiceError> {
    settings
        .run_api_url
        .as_deref()
        .map(|url| HttpClient::new(url, settings.service_timeout()).map(RemoteRunStore::new))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hydrochain::collaborators::CaseRef;
    use hydrochain::model::Program;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_missing_urls_resolve_to_unconfigured() {
        let settings = Settings::new("pmo", "/data/pmo");
        let services = Services::from_settings(&settings).unwrap();
        let case = CaseRef {
            name: "2020_01_rv0/newave".into(),
            path: PathBuf::from("/data/pmo/2020_01_rv0/newave"),
            program: Program::LongHorizon,
        };
        assert!(matches!(
            services.flex.flexibilize(&case).await,
            Err(ServiceError::Unconfigured(_))
        ));
        assert!(run_store(&settings).unwrap().is_none());
    }

    #[test]
    fn test_run_store_enabled_by_url() {
        let mut settings = Settings::new("pmo", "/data/pmo");
        settings.run_api_url = Some("http://runs.local:8080/".into());
        assert!(run_store(&settings).unwrap().is_some());
    }
}
