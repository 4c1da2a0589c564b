use std::str::FromStr;
use std::thread;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::{debug, info, warn};

use super::process::Invocation;
use super::{JobHandle, JobSpec, TestLab};
use crate::config::RunSettings;
use crate::error::{PipelineError, Result};
use crate::pipeline::StageKind;
use crate::results::{RunResult, TaskOutcome, Verdict};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Aborted,
    Cancelled,
}

impl JobState {
    fn interrupted(self) -> bool {
        matches!(self, Self::Aborted | Self::Cancelled)
    }
}

/// A result word as the lab spells it, before it is read as a [`Verdict`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum LabResult {
    Pass,
    Fail,
    Warn,
    Panic,
    Error,
    Skipped,
}

impl FromStr for LabResult {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PASS" => Ok(Self::Pass),
            "FAIL" => Ok(Self::Fail),
            "WARN" => Ok(Self::Warn),
            "PANIC" => Ok(Self::Panic),
            "ERROR" | "INFRA" => Ok(Self::Error),
            "SKIPPED" | "SKIP" => Ok(Self::Skipped),
            other => Err(PipelineError::InfraVerdict(format!(
                "unrecognised lab result '{other}'"
            ))),
        }
    }
}

impl TryFrom<String> for LabResult {
    type Error = PipelineError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl LabResult {
    /// A warning out of an aborted or cancelled job is the lab's failure.
    /// Every other non-passing result, a panic included, fails the test.
    pub fn verdict(self, state: JobState) -> Verdict {
        match self {
            Self::Pass => Verdict::Pass,
            Self::Skipped => Verdict::Skipped,
            Self::Error => Verdict::Error,
            Self::Warn if state.interrupted() => Verdict::Error,
            Self::Warn | Self::Fail | Self::Panic => Verdict::Fail,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LabTask {
    pub name: String,
    pub result: LabResult,
    /// Falls back to the job's state.
    #[serde(default)]
    pub status: Option<JobState>,
    #[serde(default)]
    pub log: Option<String>,
}

/// The YAML document a lab status command prints.
#[derive(Debug, Clone, Deserialize)]
pub struct LabStatus {
    pub state: JobState,
    #[serde(default)]
    pub result: Option<LabResult>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub arch: Option<String>,
    #[serde(default)]
    pub tasks: Vec<LabTask>,
    #[serde(default)]
    pub console: Option<String>,
}

impl LabStatus {
    pub fn parse(text: &str) -> Result<Self> {
        serde_yaml::from_str(text)
            .map_err(|err| PipelineError::InfraVerdict(format!("unreadable lab status: {err}")))
    }

    /// `None` while the job is still going.
    pub fn into_result(self, job: &str) -> Option<RunResult> {
        let verdict = match (self.state, self.result) {
            (JobState::Queued | JobState::Running, _) => return None,
            (JobState::Cancelled, _) | (_, None) => Verdict::Error,
            (state, Some(result)) => result.verdict(state),
        };
        let detail = match self.state {
            JobState::Aborted => Some(format!("job {job} was aborted by the lab")),
            JobState::Cancelled => Some(format!("job {job} was cancelled")),
            _ if self.result.is_none() => Some(format!("job {job} finished without a result")),
            _ => None,
        };
        let tasks = self
            .tasks
            .into_iter()
            .map(|task| {
                let result = task.result.verdict(task.status.unwrap_or(self.state));
                // A panic leaves its trace on the console, not in the task log.
                let log = match task.result {
                    LabResult::Pass => None,
                    LabResult::Panic => self.console.clone().or(task.log),
                    _ => task.log,
                };
                TaskOutcome {
                    name: task.name,
                    result,
                    log,
                }
            })
            .collect();
        Some(RunResult {
            verdict: Some(verdict),
            jobs: vec![job.to_string()],
            host: self.host,
            arch: self.arch,
            tasks,
            detail,
            console: self.console,
            traces: Vec::new(),
        })
    }
}

/// A lab driven through two external commands: one that takes a job document
/// on stdin and prints a job id, and one that takes a job id and prints a
/// [`LabStatus`] document.
#[derive(Debug, Clone)]
pub struct CommandLab {
    submit_command: Vec<String>,
    status_command: Vec<String>,
    poll_interval: Duration,
}

impl CommandLab {
    pub fn new(settings: &RunSettings) -> Self {
        Self {
            submit_command: settings.submit_command.clone(),
            status_command: settings.status_command.clone(),
            poll_interval: settings.poll_interval(),
        }
    }

    fn status(&self, job: &str) -> Result<LabStatus> {
        let output = Invocation::from_argv(StageKind::Run, &self.status_command)?
            .arg(job)
            .run()?;
        if !output.succeeded() {
            return Err(PipelineError::InfraVerdict(format!(
                "status query for {job} failed: {}",
                output.describe_failure()
            )));
        }
        LabStatus::parse(&output.stdout)
    }
}

impl TestLab for CommandLab {
    fn submit(&mut self, job: &JobSpec) -> Result<JobHandle> {
        let output = Invocation::from_argv(StageKind::Run, &self.submit_command)?
            .stdin(job.document.clone())
            .run()?;
        if !output.succeeded() {
            return Err(PipelineError::InfraVerdict(format!(
                "job submission failed: {}",
                output.describe_failure()
            )));
        }
        let id = output
            .stdout
            .lines()
            .map(str::trim)
            .rfind(|line| !line.is_empty())
            .ok_or_else(|| {
                PipelineError::InfraVerdict("job submission printed no job id".into())
            })?
            .to_string();
        info!(job = %id, host = ?job.host, "Job submitted");
        Ok(JobHandle { id })
    }

    fn await_completion(
        &mut self,
        handle: &JobHandle,
        timeout: Option<Duration>,
    ) -> Result<RunResult> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let status = self.status(&handle.id)?;
            debug!(job = %handle.id, state = ?status.state, "Polled job");
            if let Some(result) = status.into_result(&handle.id) {
                return Ok(result);
            }
            if let Some(deadline) = deadline
                && Instant::now() >= deadline
            {
                warn!(job = %handle.id, "Gave up waiting for job");
                return Ok(RunResult {
                    jobs: vec![handle.id.clone()],
                    ..RunResult::infra(format!("job {} did not finish in time", handle.id))
                });
            }
            thread::sleep(self.poll_interval);
        }
    }
}
