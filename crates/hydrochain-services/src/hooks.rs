//! Program strategies backed by configured command lines.
//!
//! Each hook runs in the case directory with the program's wire name
//! appended as the last argument. `evaluate` prints an [`Outcome`] token on
//! stdout; the other hooks only report success through their exit code.

use anyhow::{bail, Context};
use async_trait::async_trait;
use hydrochain::collaborators::CaseRef;
use hydrochain::model::{Program, Run};
use hydrochain::process::{CommandRunner, Invocation};
use hydrochain::strategy::{ConvergenceCriteria, Outcome, ProgramStrategy, StrategyFactory};
use hydrochain::{HookCommands, PerProgram};
use std::sync::Arc;

pub struct HookStrategy {
    hooks: HookCommands,
    runner: Arc<dyn CommandRunner>,
    program_name: String,
}

impl HookStrategy {
    pub fn new(hooks: HookCommands, runner: Arc<dyn CommandRunner>, program_name: impl Into<String>) -> Self {
        Self {
            hooks,
            runner,
            program_name: program_name.into(),
        }
    }

    /// Runs `line` for `case`. `None` when the hook is unset.
    async fn run_hook(
        &self,
        hook: &'static str,
        line: Option<&str>,
        case: &CaseRef,
        extra: &[String],
    ) -> anyhow::Result<Option<String>> {
        let Some(invocation) = line.and_then(Invocation::parse) else {
            tracing::trace!(hook, case = %case.name, "hook not configured");
            return Ok(None);
        };
        let invocation = invocation
            .args(extra.iter().cloned())
            .arg(self.program_name.clone())
            .current_dir(&case.path);

        tracing::debug!(hook, case = %case.name, command = %invocation.display(), "running hook");
        let output = self
            .runner
            .run(&invocation)
            .await
            .with_context(|| format!("{hook} hook for {}", case.name))?;
        if !output.success() {
            bail!(
                "{hook} hook for {} exited with {:?}: {}",
                case.name,
                output.code,
                output.stderr.trim()
            );
        }
        Ok(Some(output.stdout))
    }
}

#[async_trait]
impl ProgramStrategy for HookStrategy {
    async fn prepare(&self, case: &CaseRef) -> anyhow::Result<()> {
        self.run_hook("prepare", self.hooks.prepare.as_deref(), case, &[])
            .await
            .map(drop)
    }

    async fn evaluate(&self, case: &CaseRef, run: &Run) -> anyhow::Result<Outcome> {
        let Some(stdout) = self
            .run_hook("evaluate", self.hooks.evaluate.as_deref(), case, &[])
            .await?
        else {
            return Ok(Outcome::Done);
        };
        let token = stdout.lines().map(str::trim).rfind(|l| !l.is_empty()).unwrap_or_default();
        let outcome = token
            .parse::<Outcome>()
            .map_err(anyhow::Error::msg)
            .with_context(|| format!("evaluating run {} of {}", run.id, case.name))?;
        tracing::debug!(case = %case.name, run_id = run.id, %outcome, "run evaluated");
        Ok(outcome)
    }

    async fn repair_convergence(&self, case: &CaseRef) -> anyhow::Result<()> {
        self.run_hook(
            "repair_convergence",
            self.hooks.repair_convergence.as_deref(),
            case,
            &[],
        )
        .await
        .map(drop)
    }

    async fn relax_convergence(&self, case: &CaseRef, criteria: &ConvergenceCriteria) -> anyhow::Result<()> {
        let extra = [criteria.max_gap.to_string(), criteria.max_iterations.to_string()];
        self.run_hook(
            "relax_convergence",
            self.hooks.relax_convergence.as_deref(),
            case,
            &extra,
        )
        .await
        .map(drop)
    }
}

/// One [`HookStrategy`] per program, sharing the hook commands.
pub struct HookStrategies {
    long_horizon: Arc<dyn ProgramStrategy>,
    short_horizon: Arc<dyn ProgramStrategy>,
}

impl HookStrategies {
    pub fn new(hooks: &HookCommands, runner: Arc<dyn CommandRunner>, names: &PerProgram<String>) -> Self {
        Self {
            long_horizon: Arc::new(HookStrategy::new(
                hooks.clone(),
                runner.clone(),
                names.long_horizon.clone(),
            )),
            short_horizon: Arc::new(HookStrategy::new(hooks.clone(), runner, names.short_horizon.clone())),
        }
    }
}

impl StrategyFactory for HookStrategies {
    fn strategy(&self, program: Program) -> Arc<dyn ProgramStrategy> {
        match program {
            Program::LongHorizon => self.long_horizon.clone(),
            _ => self.short_horizon.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hydrochain::model::RunState;
    use hydrochain::process::CommandOutput;
    use hydrochain::QueueError;
    use std::path::PathBuf;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<Invocation>>,
        reply: Mutex<CommandOutput>,
    }

    impl Recorder {
        fn replying(code: i32, stdout: &str) -> Arc<Self> {
            let recorder = Self::default();
            *recorder.reply.lock().unwrap() = CommandOutput {
                code: Some(code),
                stdout: stdout.to_string(),
                stderr: "deck missing".to_string(),
            };
            Arc::new(recorder)
        }
    }

    #[async_trait]
    impl CommandRunner for Recorder {
        async fn run(&self, invocation: &Invocation) -> Result<CommandOutput, QueueError> {
            self.calls.lock().unwrap().push(invocation.clone());
            Ok(self.reply.lock().unwrap().clone())
        }
    }

    fn case() -> CaseRef {
        CaseRef {
            name: "2020_01_rv1/decomp".into(),
            path: PathBuf::from("/data/pmo/2020_01_rv1/decomp"),
            program: Program::ShortHorizon,
        }
    }

    fn run() -> Run {
        Run {
            id: 7,
            case_id: 2,
            job_id: Some("881".into()),
            name: "decomp".into(),
            working_dir: PathBuf::from("/data/pmo/2020_01_rv1/decomp"),
            program: Program::ShortHorizon,
            version: "31.0.2".into(),
            processors: 64,
            executable: PathBuf::from("/usr/bin/decomp"),
            args: vec![],
            submitted: Utc::now(),
            started: None,
            ended: None,
            state: RunState::Finished,
            end_reason: None,
        }
    }

    fn hooks() -> HookCommands {
        HookCommands {
            prepare: None,
            evaluate: Some("check-outputs --strict".into()),
            repair_convergence: Some("fix-cuts".into()),
            relax_convergence: Some("relax".into()),
        }
    }

    #[tokio::test]
    async fn test_evaluate_parses_last_stdout_line() {
        let runner = Recorder::replying(0, "reading relato.rv1\ninfeasible\n");
        let strategy = HookStrategy::new(hooks(), runner.clone(), "DECOMP");

        assert_eq!(strategy.evaluate(&case(), &run()).await.unwrap(), Outcome::Infeasible);

        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls[0].program, "check-outputs");
        assert_eq!(calls[0].args, vec!["--strict", "DECOMP"]);
        assert_eq!(calls[0].cwd.as_deref(), Some(case().path.as_path()));
    }

    #[tokio::test]
    async fn test_unset_hooks_are_noops() {
        let runner = Recorder::replying(0, "");
        let strategy = HookStrategy::new(HookCommands::default(), runner.clone(), "DECOMP");

        strategy.prepare(&case()).await.unwrap();
        assert_eq!(strategy.evaluate(&case(), &run()).await.unwrap(), Outcome::Done);
        assert!(runner.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_relax_passes_criteria() {
        let runner = Recorder::replying(0, "");
        let strategy = HookStrategy::new(hooks(), runner.clone(), "DECOMP");
        let criteria = ConvergenceCriteria {
            max_gap: 0.001,
            max_iterations: 500,
        };

        strategy.relax_convergence(&case(), &criteria).await.unwrap();
        assert_eq!(runner.calls.lock().unwrap()[0].args, vec!["0.001", "500", "DECOMP"]);
    }

    #[tokio::test]
    async fn test_non_zero_exit_fails_with_context() {
        let runner = Recorder::replying(3, "");
        let strategy = HookStrategy::new(hooks(), runner, "DECOMP");
        let err = strategy.repair_convergence(&case()).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("repair_convergence"));
        assert!(message.contains("deck missing"));
    }

    #[tokio::test]
    async fn test_unknown_outcome_token_is_an_error() {
        let runner = Recorder::replying(0, "maybe\n");
        let strategy = HookStrategy::new(hooks(), runner, "DECOMP");
        assert!(strategy.evaluate(&case(), &run()).await.is_err());
    }

    #[tokio::test]
    async fn test_factory_appends_program_wire_name() {
        let names = PerProgram {
            long_horizon: "NEWAVE".to_string(),
            short_horizon: "DECOMP".to_string(),
        };
        let runner = Recorder::replying(0, "done\n");
        let strategies = HookStrategies::new(&hooks(), runner.clone(), &names);

        strategies.strategy(Program::LongHorizon).evaluate(&case(), &run()).await.unwrap();
        strategies.strategy(Program::ShortHorizon).evaluate(&case(), &run()).await.unwrap();

        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls[0].args.last().map(String::as_str), Some("NEWAVE"));
        assert_eq!(calls[1].args.last().map(String::as_str), Some("DECOMP"));
    }
}
