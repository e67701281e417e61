//! Slurm dialect: `sbatch`, `squeue`, `scancel`.

use crate::backend::SchedulerBackend;
use hydrochain::model::{Run, RunState};
use hydrochain::{Invocation, QueueError};
use std::path::PathBuf;

#[derive(Debug, Clone, Default)]
pub struct Slurm;

impl SchedulerBackend for Slurm {
    fn name(&self) -> &'static str {
        "slurm"
    }

    fn submit(&self, run: &Run) -> Invocation {
        let command = std::iter::once(run.executable.to_string_lossy().into_owned())
            .chain(run.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");
        Invocation::new("sbatch")
            .arg("--parsable")
            .arg("--chdir")
            .arg(run.working_dir.to_string_lossy())
            .arg("--job-name")
            .arg(self.job_name(&run.name))
            .arg("--ntasks")
            .arg(run.processors.to_string())
            .arg("--wrap")
            .arg(command)
    }

    /// `--parsable` prints `<id>` or `<id>;<cluster>`.
    fn parse_submission(&self, stdout: &str) -> Result<String, QueueError> {
        let line = stdout.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or_default();
        let id = line.split(';').next().unwrap_or_default();
        if !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()) {
            Ok(id.to_string())
        } else {
            Err(QueueError::Unparseable(stdout.trim().to_string()))
        }
    }

    fn status(&self, _job_id: &str) -> Invocation {
        Invocation::new("squeue").args(["--noheader", "--format", "%i %t"])
    }

    fn job_token<'a>(&self, stdout: &'a str, job_id: &str) -> Option<&'a str> {
        stdout.lines().find_map(|line| {
            let mut columns = line.split_whitespace();
            if columns.next()? != job_id {
                return None;
            }
            columns.next()
        })
    }

    fn classify(&self, token: &str) -> Option<RunState> {
        let state = match token {
            "PD" | "CF" | "S" | "ST" | "RQ" | "RH" | "RF" | "RS" | "RD" => RunState::Waiting,
            "R" | "CG" | "SO" | "SI" => RunState::Running,
            "CA" => RunState::Deleting,
            "CD" => RunState::Finished,
            "F" | "NF" | "TO" | "OOM" | "BF" | "DL" | "PR" | "SE" => RunState::Error,
            _ => return None,
        };
        Some(state)
    }

    fn delete(&self, job_id: &str) -> Invocation {
        Invocation::new("scancel").arg(job_id)
    }

    fn stdout_file(&self, run: &Run, job_id: &str) -> PathBuf {
        run.working_dir.join(format!("slurm-{job_id}.out"))
    }
}
