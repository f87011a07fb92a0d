//! Log-line patterns for each runner binary
//!
//! The runner's output is watched by an external collaborator; these
//! patterns let it classify state transitions without the driver tailing
//! logs itself.

use regex::Regex;
use std::sync::LazyLock;

/// Named patterns matching a runner's log format
#[derive(Debug)]
pub struct RunnerLogPatterns {
    /// Runner connected and waiting for work
    pub ready: Regex,
    /// A job was picked up
    pub job_started: Regex,
    /// A job finished, whatever the result
    pub job_ended: Regex,
    /// A job finished successfully
    pub job_ended_succeeded: Regex,
    /// Extracts the job identifier; the first participating group is used
    pub job_id: Regex,
}

/// Runner state transition recognised in a log line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerEvent {
    /// Runner is ready for jobs
    Ready,
    /// Job started
    JobStarted {
        /// Job identifier, when present in the line
        job_id: Option<String>,
    },
    /// Job ended
    JobEnded {
        /// Job identifier, when present in the line
        job_id: Option<String>,
        /// Whether the job succeeded
        succeeded: bool,
    },
}

impl RunnerLogPatterns {
    fn new(ready: &str, started: &str, ended: &str, succeeded: &str, job_id: &str) -> Self {
        let compile = |p: &str| Regex::new(p).expect("runner log pattern is valid");
        Self {
            ready: compile(ready),
            job_started: compile(started),
            job_ended: compile(ended),
            job_ended_succeeded: compile(succeeded),
            job_id: compile(job_id),
        }
    }

    /// Job identifier in a log line, if any
    pub fn job_id(&self, line: &str) -> Option<String> {
        self.job_id
            .captures(line)?
            .iter()
            .skip(1)
            .flatten()
            .next()
            .map(|m| m.as_str().trim().to_string())
    }

    /// Classify one log line
    pub fn classify(&self, line: &str) -> Option<RunnerEvent> {
        if self.job_ended.is_match(line) {
            return Some(RunnerEvent::JobEnded {
                job_id: self.job_id(line),
                succeeded: self.job_ended_succeeded.is_match(line),
            });
        }
        if self.job_started.is_match(line) {
            return Some(RunnerEvent::JobStarted {
                job_id: self.job_id(line),
            });
        }
        if self.ready.is_match(line) {
            return Some(RunnerEvent::Ready);
        }
        None
    }
}

/// `gitlab-runner --log-format=json`
pub static GITLAB: LazyLock<RunnerLogPatterns> = LazyLock::new(|| {
    RunnerLogPatterns::new(
        r"Starting runner for",
        r"Checking for jobs\.\.\. received",
        r#""msg":"Job (?:succeeded|failed|canceled)"#,
        r#""msg":"Job succeeded"#,
        r#""job":(\d+)"#,
    )
});

/// GitHub Actions runner (`run.sh`)
pub static GITHUB: LazyLock<RunnerLogPatterns> = LazyLock::new(|| {
    RunnerLogPatterns::new(
        r"Listening for Jobs",
        r"Running job: ",
        r"Job .+ completed with result: ",
        r"Job .+ completed with result: Succeeded",
        r"Running job: (.+)$|Job (.+) completed with result: ",
    )
});

/// Bitbucket Pipelines runner container
pub static BITBUCKET: LazyLock<RunnerLogPatterns> = LazyLock::new(|| {
    RunnerLogPatterns::new(
        r#"Updating runner status to "ONLINE""#,
        r"Getting step StepId\{",
        r"Completing step with result Result\{status=",
        r"Completing step with result Result\{status=PASSED",
        r"stepUuid=\{([^}]+)\}",
    )
});
