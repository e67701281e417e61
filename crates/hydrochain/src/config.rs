//! Orchestrator settings.
//!
//! Built once at startup, validated, then shared read-only as
//! `Arc<Settings>`. Loading from files and the environment lives in the
//! binary.

use crate::error::{OrchestratorError, Result};
use crate::model::{Program, StudyId};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Batch scheduler flavour driven by the Queue Adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackendKind {
    Sge,
    Slurm,
}

/// Where Study, Case and Run records live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    Json,
    Sqlite,
}

/// Layout of the JSON state documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncFormat {
    Pretty,
    Compact,
}

/// A value per program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerProgram<T> {
    pub long_horizon: T,
    pub short_horizon: T,
}

impl<T> PerProgram<T> {
    pub fn get(&self, program: Program) -> &T {
        match program {
            Program::LongHorizon => &self.long_horizon,
            Program::ShortHorizon => &self.short_horizon,
        }
    }
}

/// Optional command lines backing the program strategy operations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookCommands {
    #[serde(default)]
    pub prepare: Option<String>,
    #[serde(default)]
    pub evaluate: Option<String>,
    #[serde(default)]
    pub repair_convergence: Option<String>,
    #[serde(default)]
    pub relax_convergence: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub study_name: String,
    pub base_path: PathBuf,
    #[serde(default)]
    pub study_id: Option<StudyId>,
    #[serde(default = "default_case_list_file")]
    pub case_list_file: PathBuf,

    #[serde(default)]
    pub chaining_vars: Vec<String>,
    #[serde(default = "default_max_flex")]
    pub max_flex_per_case: u32,
    #[serde(default = "default_max_resubmissions")]
    pub max_resubmissions_per_case: u32,
    #[serde(default = "default_convergence_gap")]
    pub convergence_max_gap: f64,
    #[serde(default = "default_decomp_iterations")]
    pub max_decomp_iterations: u32,

    #[serde(default = "default_short_dir")]
    pub short_horizon_dir_name: String,
    #[serde(default = "default_long_dir")]
    pub long_horizon_dir_name: String,
    pub short_horizon_version: String,
    pub long_horizon_version: String,
    #[serde(default = "default_processors")]
    pub processors_per_program: PerProgram<u32>,
    #[serde(default = "default_executables")]
    pub executables: PerProgram<PathBuf>,
    #[serde(default = "default_program_names")]
    pub program_names: PerProgram<String>,

    #[serde(default = "default_queue_backend")]
    pub queue_backend: QueueBackendKind,
    /// Seconds without stdout activity before a running job is stuck.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
    /// Seconds between monitor ticks.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,

    #[serde(default = "default_state_backend")]
    pub state_backend: StateBackend,
    #[serde(default = "default_sync_format")]
    pub sync_format: SyncFormat,
    #[serde(default = "default_state_file_name")]
    pub state_file_name: String,

    #[serde(default)]
    pub chaining_service_url: Option<String>,
    #[serde(default)]
    pub flex_service_url: Option<String>,
    #[serde(default)]
    pub reservoir_service_url: Option<String>,
    #[serde(default)]
    pub run_api_url: Option<String>,
    #[serde(default)]
    pub reservoir_rules_file: Option<PathBuf>,

    #[serde(default = "default_service_timeout")]
    pub service_timeout_secs: u64,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default)]
    pub hooks: HookCommands,
}

fn default_case_list_file() -> PathBuf {
    PathBuf::from("casos.txt")
}

fn default_max_flex() -> u32 {
    30
}

fn default_max_resubmissions() -> u32 {
    5
}

fn default_convergence_gap() -> f64 {
    0.001
}

fn default_decomp_iterations() -> u32 {
    500
}

fn default_short_dir() -> String {
    "decomp".to_string()
}

fn default_long_dir() -> String {
    "newave".to_string()
}

fn default_processors() -> PerProgram<u32> {
    PerProgram {
        long_horizon: 72,
        short_horizon: 64,
    }
}

fn default_executables() -> PerProgram<PathBuf> {
    PerProgram {
        long_horizon: PathBuf::from("/usr/bin/newave"),
        short_horizon: PathBuf::from("/usr/bin/decomp"),
    }
}

fn default_program_names() -> PerProgram<String> {
    PerProgram {
        long_horizon: "NEWAVE".to_string(),
        short_horizon: "DECOMP".to_string(),
    }
}

fn default_queue_backend() -> QueueBackendKind {
    QueueBackendKind::Sge
}

fn default_idle_timeout() -> u64 {
    30 * 60
}

fn default_poll_interval() -> u64 {
    5
}

fn default_state_backend() -> StateBackend {
    StateBackend::Json
}

fn default_sync_format() -> SyncFormat {
    SyncFormat::Pretty
}

fn default_state_file_name() -> String {
    "hydrochain.db".to_string()
}

fn default_service_timeout() -> u64 {
    60
}

fn default_command_timeout() -> u64 {
    120
}

fn default_retry_attempts() -> u32 {
    3
}

impl Settings {
    /// Minimal settings for a study; every other key takes its default.
    pub fn new(study_name: impl Into<String>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            study_name: study_name.into(),
            base_path: base_path.into(),
            study_id: None,
            case_list_file: default_case_list_file(),
            chaining_vars: Vec::new(),
            max_flex_per_case: default_max_flex(),
            max_resubmissions_per_case: default_max_resubmissions(),
            convergence_max_gap: default_convergence_gap(),
            max_decomp_iterations: default_decomp_iterations(),
            short_horizon_dir_name: default_short_dir(),
            long_horizon_dir_name: default_long_dir(),
            short_horizon_version: "31.0.2".to_string(),
            long_horizon_version: "28.0.3".to_string(),
            processors_per_program: default_processors(),
            executables: default_executables(),
            program_names: default_program_names(),
            queue_backend: default_queue_backend(),
            idle_timeout: default_idle_timeout(),
            poll_interval: default_poll_interval(),
            state_backend: default_state_backend(),
            sync_format: default_sync_format(),
            state_file_name: default_state_file_name(),
            chaining_service_url: None,
            flex_service_url: None,
            reservoir_service_url: None,
            run_api_url: None,
            reservoir_rules_file: None,
            service_timeout_secs: default_service_timeout(),
            command_timeout_secs: default_command_timeout(),
            retry_attempts: default_retry_attempts(),
            hooks: HookCommands::default(),
        }
    }

    /// Rejects settings the machines cannot run with.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(OrchestratorError::Config(msg.to_string()));
        if self.study_name.trim().is_empty() {
            return fail("study_name must not be empty");
        }
        if self.poll_interval == 0 {
            return fail("poll_interval must be positive");
        }
        if self.idle_timeout == 0 {
            return fail("idle_timeout must be positive");
        }
        if self.processors_per_program.long_horizon == 0
            || self.processors_per_program.short_horizon == 0
        {
            return fail("processors_per_program must be positive");
        }
        if self.long_horizon_dir_name == self.short_horizon_dir_name {
            return fail("long and short horizon directory names must differ");
        }
        if self.retry_attempts == 0 {
            return fail("retry_attempts must be at least 1");
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }

    pub fn service_timeout(&self) -> Duration {
        Duration::from_secs(self.service_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_attempts)
    }

    /// Resolves `path` against the study base path unless it is absolute.
    pub fn resolve(&self, path: &std::path::Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_path.join(path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::new("study", "/data/study");
        assert_eq!(settings.idle_timeout(), Duration::from_secs(1800));
        assert_eq!(settings.poll_interval(), Duration::from_secs(5));
        assert_eq!(settings.queue_backend, QueueBackendKind::Sge);
        assert_eq!(settings.state_backend, StateBackend::Json);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_minimal_document_deserializes_with_defaults() {
        let json = serde_json::json!({
            "study_name": "pmo",
            "base_path": "/data/pmo",
            "short_horizon_version": "31",
            "long_horizon_version": "28",
            "queue_backend": "slurm",
            "processors_per_program": { "long_horizon": 48, "short_horizon": 32 }
        });
        let settings: Settings = serde_json::from_value(json).unwrap();
        assert_eq!(settings.queue_backend, QueueBackendKind::Slurm);
        assert_eq!(*settings.processors_per_program.get(Program::ShortHorizon), 32);
        assert_eq!(settings.max_flex_per_case, 30);
        assert_eq!(settings.program_names.long_horizon, "NEWAVE");
    }

    #[test]
    fn test_validate_rejects_zero_poll_interval() {
        let mut settings = Settings::new("study", "/data/study");
        settings.poll_interval = 0;
        assert!(matches!(
            settings.validate(),
            Err(OrchestratorError::Config(_))
        ));
    }

    #[test]
    fn test_resolve_relative_paths() {
        let settings = Settings::new("study", "/data/study");
        assert_eq!(
            settings.resolve(std::path::Path::new("casos.txt")),
            PathBuf::from("/data/study/casos.txt")
        );
        assert_eq!(
            settings.resolve(std::path::Path::new("/etc/rules.json")),
            PathBuf::from("/etc/rules.json")
        );
    }
}
