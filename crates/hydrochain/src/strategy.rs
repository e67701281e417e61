//! Per-program behaviour behind a tagged dispatch.
//!
//! The Case machine never branches on the program itself; it asks the
//! [`StrategyFactory`] for the strategy of the case's [`Program`] and calls
//! the five operations below.

use crate::collaborators::{CaseRef, ReservoirRuleService};
use crate::error::ServiceError;
use crate::model::{Program, Run};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Evaluator verdict on a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Done,
    Infeasible,
    DataError,
    ConvergenceError,
    NotConverged,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Done => "done",
            Outcome::Infeasible => "infeasible",
            Outcome::DataError => "data_error",
            Outcome::ConvergenceError => "convergence_error",
            Outcome::NotConverged => "not_converged",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "done" => Ok(Outcome::Done),
            "infeasible" => Ok(Outcome::Infeasible),
            "data_error" => Ok(Outcome::DataError),
            "convergence_error" => Ok(Outcome::ConvergenceError),
            "not_converged" => Ok(Outcome::NotConverged),
            other => Err(format!("unknown outcome: {other}")),
        }
    }
}

/// Convergence criteria handed to [`ProgramStrategy::relax_convergence`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConvergenceCriteria {
    pub max_gap: f64,
    pub max_iterations: u32,
}

#[async_trait]
pub trait ProgramStrategy: Send + Sync {
    /// Local deck preparation before chaining.
    async fn prepare(&self, case: &CaseRef) -> anyhow::Result<()>;

    /// Classifies the outputs of a finished run.
    async fn evaluate(&self, case: &CaseRef, run: &Run) -> anyhow::Result<Outcome>;

    /// Applies monthly reservoir rules; delegates to the rule service.
    async fn apply_rules(
        &self,
        sources: &[CaseRef],
        destination: &CaseRef,
        rules: &[serde_json::Value],
        service: &dyn ReservoirRuleService,
    ) -> Result<Vec<serde_json::Value>, ServiceError> {
        service.apply_rules(sources, destination, rules).await
    }

    async fn repair_convergence(&self, case: &CaseRef) -> anyhow::Result<()>;

    async fn relax_convergence(
        &self,
        case: &CaseRef,
        criteria: &ConvergenceCriteria,
    ) -> anyhow::Result<()>;
}

/// Resolves the strategy for a program tag.
pub trait StrategyFactory: Send + Sync {
    fn strategy(&self, program: Program) -> Arc<dyn ProgramStrategy>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_tokens() {
        for outcome in [
            Outcome::Done,
            Outcome::Infeasible,
            Outcome::DataError,
            Outcome::ConvergenceError,
            Outcome::NotConverged,
        ] {
            assert_eq!(outcome.as_str().parse::<Outcome>().unwrap(), outcome);
        }
        assert_eq!(" DONE\n".parse::<Outcome>().unwrap(), Outcome::Done);
        assert!("maybe".parse::<Outcome>().is_err());
    }
}
