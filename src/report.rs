//! Builds one human-readable report from the state records of one or more
//! runs of the same patch series. Nothing here performs I/O; handing the
//! text to a reader is the delivery collaborator's job.

use std::cmp::Ordering;
use std::path::Path;

use minijinja::{Environment, context};
use serde::Serialize;

use crate::config::ReportTemplate;
use crate::error::{PipelineError, Result};
use crate::pipeline::StageKind;
use crate::results::{BuildResult, MergeConflict, MergeResult, RunResult, Verdict};
use crate::state::WorkflowState;

const FULL_TEMPLATE: &str = include_str!("../templates/report_full.j2");
const LIMITED_TEMPLATE: &str = include_str!("../templates/report_limited.j2");

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum MergeOutcome {
    Applied,
    Conflict { patch: String, log: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildSummary {
    pub succeeded: bool,
    pub kernel_release: Option<String>,
    pub arch: String,
    pub log: String,
    pub artifact_url: Option<String>,
    pub config_url: Option<String>,
}

/// Everything the report needs from one state record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportEntry {
    pub source: String,
    pub uid: String,
    pub base_repo: String,
    pub commit: String,
    pub patches: Vec<String>,
    pub merge: MergeOutcome,
    pub build: Option<BuildSummary>,
    pub run: Option<RunResult>,
}

impl ReportEntry {
    pub fn from_state(state: &WorkflowState, source: impl Into<String>) -> Result<Self> {
        let source = source.into();
        if let Some(conflict) = MergeConflict::from_state(state) {
            return Ok(Self {
                source,
                uid: conflict.uid.to_string(),
                base_repo: conflict.base_repo,
                commit: conflict.commit,
                patches: conflict.patches,
                merge: MergeOutcome::Conflict {
                    patch: conflict.failed_patch,
                    log: conflict.log.map(|p| p.to_string_lossy().to_string()),
                },
                build: None,
                run: None,
            });
        }

        let merge = MergeResult::from_state(state)?;
        let build = if state.has_stage(StageKind::Build) {
            let build = BuildResult::recorded(state)?;
            Some(BuildSummary {
                succeeded: build.succeeded,
                kernel_release: build.kernel_release,
                arch: build.arch,
                log: build.log.to_string_lossy().to_string(),
                artifact_url: state.text_opt(StageKind::Publish, "artifact_url"),
                config_url: state.text_opt(StageKind::Publish, "config_url"),
            })
        } else {
            None
        };
        let run = if state.has_stage(StageKind::Run) {
            Some(RunResult::from_state(state)?)
        } else {
            None
        };

        Ok(Self {
            source,
            uid: merge.uid.to_string(),
            base_repo: merge.base_repo,
            commit: merge.commit,
            patches: merge.patches,
            merge: MergeOutcome::Applied,
            build,
            run,
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let state = WorkflowState::load(path)?;
        Self::from_state(&state, path.to_string_lossy())
    }

    pub fn host(&self) -> &str {
        self.run
            .as_ref()
            .and_then(|run| run.host.as_deref())
            .unwrap_or_default()
    }

    pub fn arch(&self) -> &str {
        self.run
            .as_ref()
            .and_then(|run| run.arch.as_deref())
            .or_else(|| self.build.as_ref().map(|b| b.arch.as_str()))
            .unwrap_or_default()
    }

    fn status(&self) -> ReportStatus {
        if matches!(self.merge, MergeOutcome::Conflict { .. }) {
            return ReportStatus::MergeFailed;
        }
        if self.build.as_ref().is_some_and(|b| !b.succeeded) {
            return ReportStatus::BuildFailed;
        }
        match self.run.as_ref().map(|run| run.verdict) {
            Some(Some(Verdict::Fail)) => ReportStatus::TestFailed,
            Some(Some(Verdict::Error)) => ReportStatus::InfraFailed,
            Some(None) => ReportStatus::Incomplete,
            _ => ReportStatus::Pass,
        }
    }

    fn outcome(&self) -> &'static str {
        match self.status() {
            ReportStatus::MergeFailed => "patch application failed",
            ReportStatus::BuildFailed => "build failed",
            ReportStatus::TestFailed => "tests failed",
            ReportStatus::InfraFailed => "test infrastructure error",
            ReportStatus::Incomplete => "results pending",
            ReportStatus::Pass => match self.run.as_ref().and_then(|run| run.verdict) {
                Some(Verdict::Skipped) => "tests skipped",
                Some(_) => "tests passed",
                None if self.build.is_some() => "built, not tested",
                None => "merged, not built",
            },
        }
    }

    fn sort_key(&self) -> (&str, &str, &str) {
        (self.host(), self.arch(), self.source.as_str())
    }
}

/// Overall result, ordered from best to worst. The earliest pipeline failure
/// wins: a merge failure outranks a build failure, which outranks a test
/// failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReportStatus {
    Pass,
    Incomplete,
    InfraFailed,
    TestFailed,
    BuildFailed,
    MergeFailed,
}

impl ReportStatus {
    pub fn is_pass(self) -> bool {
        self == Self::Pass
    }

    fn word(self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Incomplete => "PENDING",
            Self::InfraFailed => "ERROR",
            Self::TestFailed | Self::BuildFailed | Self::MergeFailed => "FAIL",
        }
    }

    fn detail(self) -> &'static str {
        match self {
            Self::MergeFailed => "Patch application failed",
            Self::BuildFailed => "Build failed",
            _ => "Test report",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedReport {
    pub subject: String,
    pub body: String,
    pub status: ReportStatus,
    pub job_ids: Vec<String>,
}

#[derive(Serialize)]
struct EntryView<'a> {
    #[serde(flatten)]
    entry: &'a ReportEntry,
    host: &'a str,
    arch: &'a str,
    outcome: &'static str,
}

/// Combine the entries of one tested change into a single report.
pub fn aggregate(mut entries: Vec<ReportEntry>, template: ReportTemplate) -> Result<RenderedReport> {
    let Some(first) = entries.first() else {
        return Err(PipelineError::Config("no results to report".into()));
    };
    let expected = first.uid.clone();
    if let Some(other) = entries.iter().find(|entry| entry.uid != expected) {
        return Err(PipelineError::MismatchedSeries {
            expected,
            found: other.uid.clone(),
            source_label: other.source.clone(),
        });
    }

    entries.sort_by(|a, b| match a.sort_key().cmp(&b.sort_key()) {
        Ordering::Equal => a.commit.cmp(&b.commit),
        other => other,
    });

    let status = entries
        .iter()
        .map(ReportEntry::status)
        .max()
        .unwrap_or(ReportStatus::Pass);
    let subject = subject(&entries, status);

    let mut job_ids: Vec<String> = entries
        .iter()
        .filter_map(|entry| entry.run.as_ref())
        .flat_map(|run| run.jobs.iter().cloned())
        .collect();
    job_ids.sort();
    job_ids.dedup();

    let views: Vec<EntryView<'_>> = entries
        .iter()
        .map(|entry| EntryView {
            entry,
            host: entry.host(),
            arch: entry.arch(),
            outcome: entry.outcome(),
        })
        .collect();
    let lead = &entries[0];
    let body = render_body(
        template,
        context! {
            subject => &subject,
            status => status.word(),
            detail => status.detail(),
            repo => repo_name(&lead.base_repo),
            base_repo => &lead.base_repo,
            commit => &lead.commit,
            patches => &lead.patches,
            uid => &lead.uid,
            entries => views,
        },
    )?;

    Ok(RenderedReport {
        subject,
        body,
        status,
        job_ids,
    })
}

fn render_body(template: ReportTemplate, ctx: minijinja::Value) -> Result<String> {
    let mut env = Environment::new();
    env.set_trim_blocks(true);
    env.set_lstrip_blocks(true);
    let source = match template {
        ReportTemplate::Full => FULL_TEMPLATE,
        ReportTemplate::Limited => LIMITED_TEMPLATE,
    };
    env.add_template(template.name(), source)
        .map_err(|err| PipelineError::Template(err.to_string()))?;
    env.get_template(template.name())
        .and_then(|tmpl| tmpl.render(ctx))
        .map_err(|err| PipelineError::Template(err.to_string()))
}

fn subject(entries: &[ReportEntry], status: ReportStatus) -> String {
    let release = entries
        .iter()
        .filter_map(|entry| entry.build.as_ref())
        .find_map(|build| build.kernel_release.clone());
    let suffix = match (release, entries.first()) {
        (Some(release), Some(entry)) => {
            format!(" for kernel {release} ({})", repo_name(&entry.base_repo))
        }
        _ => String::new(),
    };
    format!("{}: {}{suffix}", status.word(), status.detail())
}

/// `git://host/path/linux-stable.git` → `linux-stable`
pub fn repo_name(base_repo: &str) -> String {
    let last = base_repo
        .trim_end_matches('/')
        .rsplit(['/', ':'])
        .next()
        .unwrap_or(base_repo);
    last.strip_suffix(".git").unwrap_or(last).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_name_strips_path_and_suffix() {
        assert_eq!(repo_name("git://git.kernel.org/pub/scm/linux-stable.git"), "linux-stable");
        assert_eq!(repo_name("https://example.org/net-next/"), "net-next");
        assert_eq!(repo_name("git@host:linux.git"), "linux");
    }

    #[test]
    fn earliest_failure_wins() {
        assert!(ReportStatus::MergeFailed > ReportStatus::BuildFailed);
        assert!(ReportStatus::BuildFailed > ReportStatus::TestFailed);
        assert!(ReportStatus::TestFailed > ReportStatus::InfraFailed);
        assert!(ReportStatus::InfraFailed > ReportStatus::Pass);
    }

    #[test]
    fn empty_input_is_rejected() {
        assert!(aggregate(Vec::new(), ReportTemplate::Full).is_err());
    }
}
