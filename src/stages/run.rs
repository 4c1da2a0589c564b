use std::fs;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::RunSettings;
use crate::console::ConsoleLog;
use crate::error::{PipelineError, Result};
use crate::observability::MetricsCollector;
use crate::pipeline::{Stage, StageContext, StageKind, StageStatus};
use crate::results::{BuildResult, MergeResult, PublishResult, RunResult, Verdict};
use crate::retry::LinearBackoff;
use crate::state::WorkflowState;
use crate::template::{self, TemplateVar, TemplateVars};
use crate::tools::{JobHandle, JobSpec, TestLab};

/// Runs a failed job gets in total before the verdict is settled.
const RESCHEDULED_RUNS: usize = 3;

/// Submits the published kernel to the test lab and, when asked to, waits
/// for the verdict.
pub struct RunStage;

impl RunStage {
    fn job_vars(
        merge: &MergeResult,
        build: &BuildResult,
        publish: &PublishResult,
        host: Option<&str>,
        arch: &str,
    ) -> TemplateVars {
        let mut vars = TemplateVars::new()
            .with(
                TemplateVar::KernelVersion,
                build.kernel_release.clone().unwrap_or_default(),
            )
            .with(TemplateVar::KernelPackageUrl, &publish.artifact_url)
            .with(TemplateVar::Uid, merge.uid.to_string())
            .with(TemplateVar::Arch, arch);
        if let Some(host) = host {
            vars.set(TemplateVar::Hostname, format!("({host}) "));
            vars.set(
                TemplateVar::HostnameTag,
                format!("<hostname op=\"=\" value=\"{host}\"/>"),
            );
        }
        vars
    }
}

/// One stage's conversation with the lab.
struct LabSession<'a> {
    lab: &'a mut dyn TestLab,
    settings: &'a RunSettings,
    metrics: &'a MetricsCollector,
}

impl LabSession<'_> {
    /// An infrastructure refusal comes back as an ERROR run.
    fn submit(&mut self, job: &JobSpec) -> Result<std::result::Result<JobHandle, RunResult>> {
        let backoff = LinearBackoff::new(
            self.settings.submit_retries,
            Duration::from_secs(self.settings.submit_delay_secs),
        );
        let lab = &mut *self.lab;
        let metrics = self.metrics;
        match backoff.run(
            || lab.submit(job),
            |err| matches!(err, PipelineError::InfraVerdict(_)),
            |_, _| metrics.record_submit_retry(),
        ) {
            Ok(handle) => Ok(Ok(handle)),
            Err(PipelineError::InfraVerdict(detail)) => Ok(Err(RunResult::infra(detail))),
            Err(err) => Err(err),
        }
    }

    fn wait(&mut self, handle: JobHandle) -> Result<RunResult> {
        match self.lab.await_completion(&handle, self.settings.timeout()) {
            Ok(mut result) => {
                if result.jobs.is_empty() {
                    result.jobs.push(handle.id);
                }
                Ok(result)
            }
            Err(PipelineError::InfraVerdict(detail)) => Ok(RunResult {
                jobs: vec![handle.id],
                ..RunResult::infra(detail)
            }),
            Err(err) => Err(err),
        }
    }

    fn install_failed(&self, result: &RunResult) -> bool {
        result.tasks.iter().any(|task| {
            task.name == self.settings.install_task && task.result != Verdict::Pass
        })
    }

    /// Submit `job` and wait for it. A job that dies before the kernel is
    /// installed says nothing about the kernel and is submitted again.
    fn complete(&mut self, job: &JobSpec) -> Result<RunResult> {
        let mut jobs = Vec::new();
        let mut resubmits = 0;
        loop {
            let mut result = match self.submit(job)? {
                Ok(handle) => self.wait(handle)?,
                Err(refused) => refused,
            };
            jobs.append(&mut result.jobs);
            if self.install_failed(&result) && resubmits < self.settings.install_resubmits {
                resubmits += 1;
                self.metrics.record_lab_resubmit();
                warn!(jobs = ?jobs, resubmit = resubmits, "Kernel install failed, resubmitting");
                continue;
            }
            result.jobs = jobs;
            return Ok(result);
        }
    }

    /// Settle a failed run by running the job again on the failing host and
    /// wherever the lab places it. A single failure out of three is a fluke.
    fn reschedule(
        &mut self,
        failed: RunResult,
        render: impl Fn(Option<&str>) -> Result<JobSpec>,
    ) -> Result<RunResult> {
        let same_host = render(failed.host.as_deref())?;
        let any_host = render(self.settings.host.as_deref())?;
        info!(host = ?failed.host, "Run failed, rescheduling");

        let mut runs = vec![failed];
        for job in [same_host, any_host] {
            self.metrics.record_lab_resubmit();
            runs.push(self.complete(&job)?);
        }
        Ok(settle(runs))
    }
}

/// Merge the runs of a rescheduled job into one result.
fn settle(runs: Vec<RunResult>) -> RunResult {
    let finished = runs
        .iter()
        .filter(|run| matches!(run.verdict, Some(Verdict::Pass | Verdict::Fail)))
        .count();
    let failed: Vec<&RunResult> = runs
        .iter()
        .filter(|run| run.verdict == Some(Verdict::Fail))
        .collect();
    let failures = failed.len();
    let mut hosts: Vec<String> = failed.iter().filter_map(|run| run.host.clone()).collect();
    hosts.sort_unstable();
    hosts.dedup();
    let jobs: Vec<String> = runs.iter().flat_map(|run| run.jobs.clone()).collect();

    let fluke = finished >= RESCHEDULED_RUNS && failures < 2;
    let base = if fluke {
        runs.iter()
            .position(|run| run.verdict == Some(Verdict::Pass))
            .unwrap_or(0)
    } else {
        0
    };
    let mut result = runs.into_iter().nth(base).unwrap_or_else(|| RunResult::infra("no runs"));
    result.jobs = jobs;
    if fluke {
        result.verdict = Some(Verdict::Pass);
        result.detail = Some(format!(
            "FAILED {failures}/{finished}, passed on reschedule"
        ));
    } else {
        result.verdict = Some(Verdict::Fail);
        result.detail = Some(match hosts.as_slice() {
            [] => format!("FAILED {failures}/{finished}"),
            [host] => format!("FAILED {failures}/{finished} on a single host: {host}"),
            _ => format!("FAILED {failures}/{finished} on multiple hosts"),
        });
    }
    result
}

/// Attach the call traces found in the run's console log. A log that cannot
/// be read is only logged.
fn check_console(result: &mut RunResult, kernel_release: Option<&str>) {
    let (Some(console), Some(release)) = (result.console.as_deref(), kernel_release) else {
        return;
    };
    match ConsoleLog::fetch(release, console).and_then(|log| log.traces()) {
        Ok(traces) => {
            if !traces.is_empty() {
                warn!(console, traces = traces.len(), "Call traces in the console log");
            }
            result.traces = traces;
        }
        Err(err) => warn!(console, error = %err, "Console log not checked"),
    }
}

impl Stage for RunStage {
    fn kind(&self) -> StageKind {
        StageKind::Run
    }

    fn execute(&self, state: &mut WorkflowState, ctx: &mut StageContext<'_>) -> Result<StageStatus> {
        let merge = MergeResult::from_state(state)?;
        let build = BuildResult::from_state(state)?;
        let publish = PublishResult::from_state(state)?;
        let settings = &ctx.config.run;

        let template_path = settings
            .job_template
            .as_ref()
            .ok_or_else(|| PipelineError::Config("run.job_template is required".into()))?;
        let template_text = fs::read_to_string(template_path)
            .map_err(|err| PipelineError::io(template_path, err))?;
        let host = settings.host.clone();
        let arch = settings.arch.clone().unwrap_or_else(|| build.arch.clone());
        let render = |host: Option<&str>| -> Result<JobSpec> {
            let vars = Self::job_vars(&merge, &build, &publish, host, &arch);
            Ok(JobSpec {
                document: template::render(&template_text, &vars)?,
                vars,
                host: host.map(str::to_string),
            })
        };
        let job = render(host.as_deref())?;

        let mut session = LabSession {
            lab: &mut *ctx.tools.lab,
            settings,
            metrics: ctx.metrics,
        };
        let mut result = if settings.wait {
            let mut result = session.complete(&job)?;
            if result.verdict == Some(Verdict::Fail) && settings.reschedule {
                result = session.reschedule(result, render)?;
            }
            if settings.console_check {
                check_console(&mut result, build.kernel_release.as_deref());
            }
            result
        } else {
            match session.submit(&job)? {
                Ok(handle) => {
                    info!(job = %handle.id, "Submitted, not waiting for results");
                    RunResult {
                        verdict: None,
                        jobs: vec![handle.id],
                        ..RunResult::completed(Verdict::Pass)
                    }
                }
                Err(refused) => refused,
            }
        };
        if result.host.is_none() {
            result.host = host;
        }
        if result.arch.is_none() {
            result.arch = Some(arch);
        }
        result.to_state(state);

        match result.verdict {
            None => Ok(StageStatus::Pending),
            Some(Verdict::Pass) | Some(Verdict::Skipped) => {
                info!(verdict = ?result.verdict, jobs = ?result.jobs, "Run recorded");
                Ok(StageStatus::Passed)
            }
            Some(verdict) => {
                warn!(%verdict, detail = ?result.detail, jobs = ?result.jobs, "Run recorded");
                Ok(StageStatus::Failed)
            }
        }
    }
}
