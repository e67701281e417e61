//! Grid Engine dialect: `qsub`, `qstat`, `qdel`.

use crate::backend::SchedulerBackend;
use hydrochain::model::{Run, RunState};
use hydrochain::{Invocation, QueueError};
use std::path::PathBuf;

/// Parallel environment requested for multi-processor jobs.
const PARALLEL_ENV: &str = "orte";

#[derive(Debug, Clone, Default)]
pub struct Sge;

impl SchedulerBackend for Sge {
    fn name(&self) -> &'static str {
        "sge"
    }

    fn submit(&self, run: &Run) -> Invocation {
        Invocation::new("qsub")
            .args(["-cwd", "-V", "-N"])
            .arg(self.job_name(&run.name))
            .args(["-pe", PARALLEL_ENV])
            .arg(run.processors.to_string())
            .arg(run.executable.to_string_lossy())
            .args(run.args.iter().cloned())
            .current_dir(&run.working_dir)
    }

    /// `Your job 4711 ("decomp_2020_01_rv1") has been submitted`
    fn parse_submission(&self, stdout: &str) -> Result<String, QueueError> {
        stdout
            .lines()
            .find_map(|line| {
                let rest = line.trim().strip_prefix("Your job ")?;
                let id = rest.split_whitespace().next()?;
                id.chars().all(|c| c.is_ascii_digit()).then(|| id.to_string())
            })
            .ok_or_else(|| QueueError::Unparseable(stdout.trim().to_string()))
    }

    fn status(&self, _job_id: &str) -> Invocation {
        Invocation::new("qstat")
    }

    /// Rows after the header; job id in the first column, state in the fifth.
    fn job_token<'a>(&self, stdout: &'a str, job_id: &str) -> Option<&'a str> {
        stdout.lines().find_map(|line| {
            let mut columns = line.split_whitespace();
            if columns.next()? != job_id {
                return None;
            }
            columns.nth(3)
        })
    }

    fn classify(&self, token: &str) -> Option<RunState> {
        let state = match token {
            t if t.contains(['e', 'E']) => RunState::Error,
            t if t.starts_with('d') => RunState::Deleting,
            "r" | "Rr" | "hr" => RunState::Running,
            "qw" | "hqw" | "hRwq" | "Rq" | "t" | "Rt" | "s" | "ts" | "S" | "tS" | "T" | "tT" => {
                RunState::Waiting
            }
            _ => return None,
        };
        Some(state)
    }

    fn delete(&self, job_id: &str) -> Invocation {
        Invocation::new("qdel").arg(job_id)
    }

    fn stdout_file(&self, run: &Run, job_id: &str) -> PathBuf {
        run.working_dir
            .join(format!("{}.o{job_id}", self.job_name(&run.name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QSTAT: &str = "\
job-ID  prior   name       user         state submit/start at     queue                          slots ja-task-ID
-----------------------------------------------------------------------------------------------------------------
   4711 0.55500 decomp_202 pmo          r     01/10/2020 10:00:00 all.q@node01                      72
   4712 0.00000 newave_202 pmo          qw    01/10/2020 10:01:00                                   64
   4713 0.00000 decomp_202 pmo          Eqw   01/10/2020 10:02:00                                   72
   4714 0.55500 decomp_202 pmo          dr    01/10/2020 10:03:00 all.q@node02                      72
";

    #[test]
    fn test_parse_submission() {
        let out = "Your job 4711 (\"decomp_2020_01_rv1\") has been submitted\n";
        assert_eq!(Sge.parse_submission(out).unwrap(), "4711");
        assert!(Sge.parse_submission("Unable to run job: denied").is_err());
    }

    #[test]
    fn test_status_rows() {
        let state = |id| Sge.job_token(QSTAT, id).and_then(|t| Sge.classify(t));
        assert_eq!(state("4711"), Some(RunState::Running));
        assert_eq!(state("4712"), Some(RunState::Waiting));
        assert_eq!(state("4713"), Some(RunState::Error));
        assert_eq!(state("4714"), Some(RunState::Deleting));
        assert_eq!(Sge.job_token(QSTAT, "9999"), None);
        assert_eq!(Sge.job_token(QSTAT, "471"), None);
    }

    #[test]
    fn test_error_tokens_in_either_case() {
        for token in ["Eqw", "dEr", "eqw", "re"] {
            assert_eq!(Sge.classify(token), Some(RunState::Error), "token {token}");
        }
    }

    #[test]
    fn test_unknown_token() {
        assert_eq!(Sge.classify("zz"), None);
    }
}
