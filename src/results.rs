//! Typed views of what each stage records in its state namespace.
//!
//! `to_state` is the only writer of a namespace's keys and `from_state` the
//! only reader, so the key names live in one place.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::identity::Uid;
use crate::pipeline::StageKind;
use crate::state::WorkflowState;

const STATUS_OK: &str = "ok";
const STATUS_CONFLICT: &str = "conflict";
const STATUS_FAILED: &str = "failed";
const STATUS_SUBMITTED: &str = "submitted";
const STATUS_COMPLETED: &str = "completed";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeResult {
    pub base_repo: String,
    pub reference: String,
    /// Base commit the ref resolved to.
    pub commit: String,
    pub commit_date: Option<i64>,
    pub patches: Vec<String>,
    /// Tree head once every patch is applied.
    pub head: String,
    pub uid: Uid,
    pub tree: PathBuf,
}

impl MergeResult {
    pub fn to_state(&self, state: &mut WorkflowState) {
        let ns = StageKind::Merge;
        state.set(ns, "status", STATUS_OK);
        state.set(ns, "base_repo", &self.base_repo);
        state.set(ns, "ref", &self.reference);
        state.set(ns, "commit", &self.commit);
        if let Some(date) = self.commit_date {
            state.set(ns, "commit_date", date);
        }
        state.set(ns, "patches", self.patches.clone());
        state.set(ns, "head", &self.head);
        state.set(ns, "uid", self.uid.to_string());
        state.set(ns, "tree", &self.tree);
    }

    /// Refuses with `MergeConflict` when the merge stage recorded one.
    pub fn from_state(state: &WorkflowState) -> Result<Self> {
        let ns = StageKind::Merge;
        if let Some(conflict) = MergeConflict::from_state(state) {
            return Err(conflict.into_error());
        }
        Ok(Self {
            base_repo: state.get_text(ns, "base_repo")?,
            reference: state.get_text(ns, "ref")?,
            commit: state.get_text(ns, "commit")?,
            commit_date: match state.get_opt(ns, "commit_date") {
                Some(value) => value.as_text().parse().ok(),
                None => None,
            },
            patches: state
                .get_opt(ns, "patches")
                .map(|value| value.as_list())
                .unwrap_or_default(),
            head: state.get_text(ns, "head")?,
            uid: state.get_text(ns, "uid")?.parse()?,
            tree: PathBuf::from(state.get_text(ns, "tree")?),
        })
    }
}

/// Recorded when a patch in the series did not apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeConflict {
    pub base_repo: String,
    pub commit: String,
    pub patches: Vec<String>,
    pub uid: Uid,
    pub failed_patch: String,
    pub log: Option<PathBuf>,
}

impl MergeConflict {
    pub fn to_state(&self, state: &mut WorkflowState) {
        let ns = StageKind::Merge;
        state.set(ns, "status", STATUS_CONFLICT);
        state.set(ns, "base_repo", &self.base_repo);
        state.set(ns, "commit", &self.commit);
        state.set(ns, "patches", self.patches.clone());
        state.set(ns, "uid", self.uid.to_string());
        state.set(ns, "failed_patch", &self.failed_patch);
        if let Some(log) = &self.log {
            state.set(ns, "log", log);
        }
    }

    pub fn from_state(state: &WorkflowState) -> Option<Self> {
        let ns = StageKind::Merge;
        if state.text_opt(ns, "status").as_deref() != Some(STATUS_CONFLICT) {
            return None;
        }
        Some(Self {
            base_repo: state.text_opt(ns, "base_repo").unwrap_or_default(),
            commit: state.text_opt(ns, "commit").unwrap_or_default(),
            patches: state
                .get_opt(ns, "patches")
                .map(|value| value.as_list())
                .unwrap_or_default(),
            uid: state
                .text_opt(ns, "uid")
                .and_then(|uid| uid.parse().ok())
                .unwrap_or_else(|| Uid::compute("", "", &[])),
            failed_patch: state.text_opt(ns, "failed_patch").unwrap_or_default(),
            log: state.text_opt(ns, "log").map(PathBuf::from),
        })
    }

    pub fn into_error(self) -> PipelineError {
        PipelineError::MergeConflict {
            patch: self.failed_patch,
            commit: self.commit,
            log: self.log,
        }
    }
}

/// Outcome of one build. A failed build never carries an artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildResult {
    pub commit: String,
    pub succeeded: bool,
    pub artifact: Option<PathBuf>,
    pub config: Option<PathBuf>,
    pub kernel_release: Option<String>,
    pub arch: String,
    pub log: PathBuf,
}

impl BuildResult {
    pub fn failed(commit: impl Into<String>, arch: impl Into<String>, log: PathBuf) -> Self {
        Self {
            commit: commit.into(),
            succeeded: false,
            artifact: None,
            config: None,
            kernel_release: None,
            arch: arch.into(),
            log,
        }
    }

    pub fn to_state(&self, state: &mut WorkflowState) {
        let ns = StageKind::Build;
        state.set(
            ns,
            "status",
            if self.succeeded { STATUS_OK } else { STATUS_FAILED },
        );
        state.set(ns, "commit", &self.commit);
        state.set(ns, "arch", &self.arch);
        state.set(ns, "log", &self.log);
        if self.succeeded {
            if let Some(artifact) = &self.artifact {
                state.set(ns, "artifact", artifact);
            }
            if let Some(config) = &self.config {
                state.set(ns, "config", config);
            }
            if let Some(release) = &self.kernel_release {
                state.set(ns, "kernel_release", release);
            }
        }
    }

    /// Reads back whatever was recorded, failed or not.
    pub fn recorded(state: &WorkflowState) -> Result<Self> {
        let ns = StageKind::Build;
        let succeeded = state.get_text(ns, "status")? == STATUS_OK;
        Ok(Self {
            commit: state.text_opt(ns, "commit").unwrap_or_default(),
            succeeded,
            artifact: state.text_opt(ns, "artifact").map(PathBuf::from),
            config: state.text_opt(ns, "config").map(PathBuf::from),
            kernel_release: state.text_opt(ns, "kernel_release"),
            arch: state.text_opt(ns, "arch").unwrap_or_default(),
            log: PathBuf::from(state.text_opt(ns, "log").unwrap_or_default()),
        })
    }

    /// A build usable downstream. Refuses with `BuildFailure` otherwise.
    pub fn from_state(state: &WorkflowState) -> Result<Self> {
        let result = Self::recorded(state)?;
        if !result.succeeded {
            return Err(PipelineError::BuildFailure {
                commit: result.commit,
                log: result.log,
            });
        }
        if result.artifact.is_none() {
            return Err(PipelineError::PrerequisiteNotMet {
                stage: StageKind::Build,
                key: "artifact".into(),
            });
        }
        Ok(result)
    }

    pub fn artifact_path(&self) -> Result<&PathBuf> {
        self.artifact
            .as_ref()
            .ok_or_else(|| PipelineError::PrerequisiteNotMet {
                stage: StageKind::Build,
                key: "artifact".into(),
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishResult {
    pub artifact_url: String,
    pub config_url: Option<String>,
    pub artifact_sha256: String,
}

impl PublishResult {
    pub fn to_state(&self, state: &mut WorkflowState) {
        let ns = StageKind::Publish;
        state.set(ns, "artifact_url", &self.artifact_url);
        if let Some(url) = &self.config_url {
            state.set(ns, "config_url", url);
        }
        state.set(ns, "artifact_sha256", &self.artifact_sha256);
    }

    pub fn from_state(state: &WorkflowState) -> Result<Self> {
        let ns = StageKind::Publish;
        Ok(Self {
            artifact_url: state.get_text(ns, "artifact_url")?,
            config_url: state.text_opt(ns, "config_url"),
            artifact_sha256: state.text_opt(ns, "artifact_sha256").unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Pass,
    /// A kernel panic is a failed test.
    #[serde(alias = "PANIC")]
    Fail,
    /// The lab could not produce a result. Says nothing about the code.
    #[serde(alias = "INFRA")]
    Error,
    Skipped,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Error => "ERROR",
            Self::Skipped => "SKIPPED",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verdict {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PASS" => Ok(Self::Pass),
            "FAIL" | "PANIC" => Ok(Self::Fail),
            "ERROR" | "INFRA" => Ok(Self::Error),
            "SKIPPED" | "SKIP" => Ok(Self::Skipped),
            other => Err(PipelineError::InfraVerdict(format!(
                "unrecognised verdict '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub name: String,
    pub result: Verdict,
    /// Where the task's output can be read.
    #[serde(default)]
    pub log: Option<String>,
}

impl TaskOutcome {
    /// `RESULT name` with the log appended as ` <log>`.
    fn encode(&self) -> String {
        match &self.log {
            Some(log) => format!("{} {} <{log}>", self.result, self.name),
            None => format!("{} {}", self.result, self.name),
        }
    }

    fn decode(entry: &str) -> Option<Self> {
        let (result, rest) = entry.split_once(' ')?;
        let (name, log) = match rest.strip_suffix('>').and_then(|r| r.rsplit_once(" <")) {
            Some((name, log)) => (name, Some(log.to_string())),
            None => (rest, None),
        };
        Some(Self {
            name: name.to_string(),
            result: result.parse().ok()?,
            log,
        })
    }
}

/// A completed (or submitted) lab run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunResult {
    pub verdict: Option<Verdict>,
    pub jobs: Vec<String>,
    pub host: Option<String>,
    pub arch: Option<String>,
    pub tasks: Vec<TaskOutcome>,
    pub detail: Option<String>,
    /// Serial console log of the test machine.
    pub console: Option<String>,
    /// Call traces found in the console log.
    pub traces: Vec<String>,
}

impl RunResult {
    pub fn completed(verdict: Verdict) -> Self {
        Self {
            verdict: Some(verdict),
            jobs: Vec::new(),
            host: None,
            arch: None,
            tasks: Vec::new(),
            detail: None,
            console: None,
            traces: Vec::new(),
        }
    }

    pub fn infra(detail: impl Into<String>) -> Self {
        Self {
            detail: Some(detail.into()),
            ..Self::completed(Verdict::Error)
        }
    }

    pub fn is_pending(&self) -> bool {
        self.verdict.is_none()
    }

    pub fn to_state(&self, state: &mut WorkflowState) {
        let ns = StageKind::Run;
        match self.verdict {
            Some(verdict) => {
                state.set(ns, "status", STATUS_COMPLETED);
                state.set(ns, "verdict", verdict.as_str());
            }
            None => state.set(ns, "status", STATUS_SUBMITTED),
        }
        state.set(ns, "jobs", self.jobs.clone());
        if let Some(host) = &self.host {
            state.set(ns, "host", host);
        }
        if let Some(arch) = &self.arch {
            state.set(ns, "arch", arch);
        }
        if !self.tasks.is_empty() {
            state.set(
                ns,
                "tasks",
                self.tasks.iter().map(TaskOutcome::encode).collect::<Vec<_>>(),
            );
        }
        if let Some(detail) = &self.detail {
            state.set(ns, "detail", detail);
        }
        if let Some(console) = &self.console {
            state.set(ns, "console", console);
        }
        if !self.traces.is_empty() {
            state.set(ns, "traces", self.traces.clone());
        }
    }

    pub fn from_state(state: &WorkflowState) -> Result<Self> {
        let ns = StageKind::Run;
        let status = state.get_text(ns, "status")?;
        let verdict = if status == STATUS_COMPLETED {
            Some(state.get_text(ns, "verdict")?.parse()?)
        } else {
            None
        };
        Ok(Self {
            verdict,
            jobs: state
                .get_opt(ns, "jobs")
                .map(|value| value.as_list())
                .unwrap_or_default(),
            host: state.text_opt(ns, "host"),
            arch: state.text_opt(ns, "arch"),
            tasks: state
                .get_opt(ns, "tasks")
                .map(|value| value.as_list())
                .unwrap_or_default()
                .iter()
                .filter_map(|entry| TaskOutcome::decode(entry))
                .collect(),
            detail: state.text_opt(ns, "detail"),
            console: state.text_opt(ns, "console"),
            traces: state
                .get_opt(ns, "traces")
                .map(|value| value.as_list())
                .unwrap_or_default(),
        })
    }
}
