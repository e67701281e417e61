//! Contracts of the auxiliary services the Case machine consumes.
//!
//! Implementations live outside the core (HTTP clients, test fakes). The
//! core only names cases by absolute path and program; wire encoding is the
//! implementation's concern.

use crate::error::ServiceError;
use crate::model::{Case, Program};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A case as seen by the auxiliary services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseRef {
    pub name: String,
    pub path: PathBuf,
    pub program: Program,
}

impl CaseRef {
    pub fn of(case: &Case, base_path: &Path) -> Self {
        Self {
            name: case.name.clone(),
            path: case.absolute_path(base_path),
            program: case.program,
        }
    }
}

/// One rewritten value returned by the chaining service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainedValue {
    pub id: String,
    pub value: serde_json::Value,
}

/// Rewrites a case's inputs from earlier cases' outputs for one variable.
#[async_trait]
pub trait ChainingService: Send + Sync {
    async fn chain(
        &self,
        sources: &[CaseRef],
        destination: &CaseRef,
        variable: &str,
    ) -> Result<Vec<ChainedValue>, ServiceError>;
}

/// Relaxes constraints of an infeasible case.
#[async_trait]
pub trait FlexService: Send + Sync {
    async fn flexibilize(&self, case: &CaseRef) -> Result<Vec<serde_json::Value>, ServiceError>;
}

/// Applies monthly reservoir operating rules to a case.
#[async_trait]
pub trait ReservoirRuleService: Send + Sync {
    async fn apply_rules(
        &self,
        sources: &[CaseRef],
        destination: &CaseRef,
        rules: &[serde_json::Value],
    ) -> Result<Vec<serde_json::Value>, ServiceError>;
}
