//! Scheduler dialects.

use hydrochain::model::{Run, RunState};
use hydrochain::{Invocation, QueueError};
use std::path::PathBuf;

/// Command shapes and output grammar of one batch scheduler.
///
/// Implementations are pure: they build invocations and parse text. Running
/// the commands and timing out stuck jobs is [`crate::BatchQueue`]'s job.
pub trait SchedulerBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Job name accepted by the scheduler.
    fn job_name(&self, name: &str) -> String {
        name.chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect()
    }

    fn submit(&self, run: &Run) -> Invocation;

    /// Extracts the job id from the submission output.
    fn parse_submission(&self, stdout: &str) -> Result<String, QueueError>;

    fn status(&self, job_id: &str) -> Invocation;

    /// State token of `job_id` in the status listing, if the job is listed.
    fn job_token<'a>(&self, stdout: &'a str, job_id: &str) -> Option<&'a str>;

    /// Maps a state token onto the closed run state set. `None` for tokens
    /// the backend does not know.
    fn classify(&self, token: &str) -> Option<RunState>;

    fn delete(&self, job_id: &str) -> Invocation;

    /// File the job writes its standard output to.
    fn stdout_file(&self, run: &Run, job_id: &str) -> PathBuf;
}
