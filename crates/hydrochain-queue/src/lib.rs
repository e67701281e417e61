//! Batch scheduler adapters.
//!
//! [`BatchQueue`] implements the core [`QueueAdapter`] over any
//! [`SchedulerBackend`] dialect and a [`CommandRunner`]. It owns the one
//! policy shared by every backend: a job the scheduler reports as running
//! whose standard output has not changed for longer than the idle timeout is
//! reported as [`RunState::Timeout`].

mod backend;
mod sge;
mod slurm;

pub use backend::SchedulerBackend;
pub use sge::Sge;
pub use slurm::Slurm;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hydrochain::model::{Run, RunState};
use hydrochain::{CommandRunner, QueueAdapter, QueueBackendKind, QueueError, Settings};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Whether a job whose last activity was at `last_activity` has been idle
/// for at least `threshold` at `now`.
pub fn is_idle(now: DateTime<Utc>, last_activity: DateTime<Utc>, threshold: Duration) -> bool {
    match (now - last_activity).to_std() {
        Ok(elapsed) => elapsed >= threshold,
        // Activity in the future (clock skew on shared storage).
        Err(_) => false,
    }
}

async fn modified_at(path: &Path) -> Option<DateTime<Utc>> {
    let metadata = tokio::fs::metadata(path).await.ok()?;
    metadata.modified().ok().map(DateTime::<Utc>::from)
}

pub struct BatchQueue<B> {
    backend: B,
    runner: Arc<dyn CommandRunner>,
    idle_timeout: Duration,
}

impl<B: SchedulerBackend> BatchQueue<B> {
    pub fn new(backend: B, runner: Arc<dyn CommandRunner>, idle_timeout: Duration) -> Self {
        Self {
            backend,
            runner,
            idle_timeout,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn job_id(run: &Run) -> Result<&str, QueueError> {
        run.job_id.as_deref().ok_or(QueueError::NotSubmitted(run.id))
    }

    /// `Running`, or `Timeout` when the job's output went quiet.
    async fn check_activity(&self, run: &Run, job_id: &str) -> RunState {
        let stdout = self.backend.stdout_file(run, job_id);
        let now = Utc::now();
        let last_activity = match modified_at(&stdout).await {
            Some(mtime) => mtime,
            None => run.started.unwrap_or(now),
        };
        if is_idle(now, last_activity, self.idle_timeout) {
            tracing::warn!(
                run_id = run.id,
                job_id,
                stdout = %stdout.display(),
                idle_secs = (now - last_activity).num_seconds(),
                "job output idle, reporting timeout"
            );
            RunState::Timeout
        } else {
            RunState::Running
        }
    }
}

#[async_trait]
impl<B: SchedulerBackend> QueueAdapter for BatchQueue<B> {
    async fn submit(&self, run: &mut Run) -> Result<(), QueueError> {
        let invocation = self.backend.submit(run);
        let output = self.runner.run(&invocation).await?.into_result(&invocation)?;
        let job_id = self.backend.parse_submission(&output.stdout)?;

        run.name = self.backend.job_name(&run.name);
        run.job_id = Some(job_id);
        tracing::debug!(
            backend = self.backend.name(),
            run_id = run.id,
            job_id = run.job_id.as_deref().unwrap_or_default(),
            "submitted"
        );
        Ok(())
    }

    async fn poll(&self, run: &Run) -> Result<RunState, QueueError> {
        let job_id = Self::job_id(run)?;
        let invocation = self.backend.status(job_id);
        let output = self.runner.run(&invocation).await?.into_result(&invocation)?;

        let Some(token) = self.backend.job_token(&output.stdout, job_id) else {
            // Schedulers drop jobs from the listing once they end.
            return Ok(if run.state == RunState::NotStarted {
                RunState::NotStarted
            } else {
                RunState::Finished
            });
        };

        match self.backend.classify(token) {
            Some(RunState::Running) => Ok(self.check_activity(run, job_id).await),
            Some(state) => Ok(state),
            None => {
                tracing::error!(
                    backend = self.backend.name(),
                    run_id = run.id,
                    job_id,
                    token,
                    "unknown scheduler state token, keeping last state"
                );
                Ok(run.state)
            }
        }
    }

    async fn delete(&self, run: &Run) -> Result<(), QueueError> {
        let job_id = Self::job_id(run)?;
        let invocation = self.backend.delete(job_id);
        self.runner.run(&invocation).await?.into_result(&invocation)?;
        Ok(())
    }
}

/// Adapter for the configured backend.
pub fn from_settings(settings: &Settings, runner: Arc<dyn CommandRunner>) -> Arc<dyn QueueAdapter> {
    let idle = settings.idle_timeout();
    match settings.queue_backend {
        QueueBackendKind::Sge => Arc::new(BatchQueue::new(Sge, runner, idle)),
        QueueBackendKind::Slurm => Arc::new(BatchQueue::new(Slurm, runner, idle)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hydrochain::model::Program;
    use hydrochain::{CommandOutput, Invocation};
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::time::SystemTime;

    /// Replays canned outputs and records every invocation.
    #[derive(Default)]
    struct ScriptedRunner {
        outputs: Mutex<VecDeque<CommandOutput>>,
        seen: Mutex<Vec<Invocation>>,
    }

    impl ScriptedRunner {
        fn with(outputs: impl IntoIterator<Item = (i32, &'static str)>) -> Arc<Self> {
            let runner = Self::default();
            runner.outputs.lock().unwrap().extend(outputs.into_iter().map(|(code, stdout)| {
                CommandOutput {
                    code: Some(code),
                    stdout: stdout.to_string(),
                    stderr: String::new(),
                }
            }));
            Arc::new(runner)
        }

        fn seen(&self) -> Vec<Invocation> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, invocation: &Invocation) -> Result<CommandOutput, QueueError> {
            self.seen.lock().unwrap().push(invocation.clone());
            Ok(self.outputs.lock().unwrap().pop_front().unwrap_or_default())
        }
    }

    fn run_in(dir: &Path) -> Run {
        Run {
            id: 7,
            case_id: 3,
            job_id: None,
            name: "decomp_2020_01_rv1".into(),
            working_dir: dir.to_path_buf(),
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

    fn queue(runner: Arc<ScriptedRunner>) -> BatchQueue<Sge> {
        BatchQueue::new(Sge, runner, Duration::from_secs(600))
    }

    #[test]
    fn test_idle_threshold() {
        let now = Utc::now();
        let threshold = Duration::from_secs(60);
        assert!(!is_idle(now, now - chrono::Duration::seconds(30), threshold));
        assert!(!is_idle(now, now - chrono::Duration::seconds(59), threshold));
        assert!(is_idle(now, now - chrono::Duration::seconds(60), threshold));
        assert!(is_idle(now, now - chrono::Duration::seconds(61), threshold));
        assert!(!is_idle(now, now + chrono::Duration::seconds(30), threshold));
    }

    #[tokio::test]
    async fn test_submit_records_job_id() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::with([(0, "Your job 4711 (\"decomp_2020_01_rv1\") has been submitted\n")]);
        let q = queue(runner.clone());

        let mut run = run_in(dir.path());
        q.submit(&mut run).await.unwrap();
        assert_eq!(run.job_id.as_deref(), Some("4711"));

        let seen = runner.seen();
        assert_eq!(seen[0].program, "qsub");
        assert_eq!(
            seen[0].args,
            vec!["-cwd", "-V", "-N", "decomp_2020_01_rv1", "-pe", "orte", "72", "/opt/decomp/run.sh", "31.0.2"]
        );
        assert_eq!(seen[0].cwd.as_deref(), Some(dir.path()));
    }

    #[tokio::test]
    async fn test_submit_failure_is_transient() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(ScriptedRunner::with([(1, "")]));
        let mut run = run_in(dir.path());
        let err = q.submit(&mut run).await.unwrap_err();
        assert!(matches!(err, QueueError::CommandFailed { .. }));
        assert!(run.job_id.is_none());
    }

    #[tokio::test]
    async fn test_missing_row_means_finished_once_submitted() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(ScriptedRunner::with([(0, ""), (0, "")]));
        let mut run = run_in(dir.path());
        run.job_id = Some("4711".into());
        assert_eq!(q.poll(&run).await.unwrap(), RunState::NotStarted);

        run.state = RunState::Running;
        assert_eq!(q.poll(&run).await.unwrap(), RunState::Finished);
    }

    #[tokio::test]
    async fn test_running_job_with_fresh_output() {
        let dir = tempfile::tempdir().unwrap();
        let mut run = run_in(dir.path());
        run.job_id = Some("4711".into());
        run.state = RunState::Waiting;
        std::fs::write(dir.path().join("decomp_2020_01_rv1.o4711"), "iteration 1\n").unwrap();

        let q = queue(ScriptedRunner::with([(0, "4711 0.5 decomp pmo r 01/10/2020 10:00:00 all.q 72")]));
        assert_eq!(q.poll(&run).await.unwrap(), RunState::Running);
    }

    #[tokio::test]
    async fn test_running_job_with_stale_output_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let mut run = run_in(dir.path());
        run.job_id = Some("4711".into());
        run.state = RunState::Running;

        let stdout = dir.path().join("decomp_2020_01_rv1.o4711");
        let file = std::fs::File::create(&stdout).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(3600)).unwrap();

        let q = queue(ScriptedRunner::with([(0, "4711 0.5 decomp pmo r 01/10/2020 10:00:00 all.q 72")]));
        assert_eq!(q.poll(&run).await.unwrap(), RunState::Timeout);
    }

    #[tokio::test]
    async fn test_missing_output_measured_from_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut run = run_in(dir.path());
        run.job_id = Some("4711".into());
        run.state = RunState::Running;
        run.started = Some(Utc::now() - chrono::Duration::hours(2));

        let q = queue(ScriptedRunner::with([(0, "4711 0.5 decomp pmo r 01/10/2020 10:00:00 all.q 72")]));
        assert_eq!(q.poll(&run).await.unwrap(), RunState::Timeout);
    }

    #[tokio::test]
    async fn test_unknown_token_keeps_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut run = run_in(dir.path());
        run.job_id = Some("4711".into());
        run.state = RunState::Waiting;
        let q = queue(ScriptedRunner::with([(0, "4711 0.5 decomp pmo zz 01/10/2020")]));
        assert_eq!(q.poll(&run).await.unwrap(), RunState::Waiting);
    }

    #[tokio::test]
    async fn test_poll_and_delete_need_a_job_id() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(ScriptedRunner::with([]));
        let run = run_in(dir.path());
        assert!(matches!(q.poll(&run).await, Err(QueueError::NotSubmitted(7))));
        assert!(matches!(q.delete(&run).await, Err(QueueError::NotSubmitted(7))));
    }

    #[tokio::test]
    async fn test_slurm_delete_uses_scancel() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::with([(0, "")]);
        let q = BatchQueue::new(Slurm, runner.clone(), Duration::from_secs(600));
        let mut run = run_in(dir.path());
        run.job_id = Some("8812".into());
        q.delete(&run).await.unwrap();
        assert_eq!(runner.seen()[0].display(), "scancel 8812");
    }
}
