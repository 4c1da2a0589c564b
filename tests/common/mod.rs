#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use kpatch_ci::config::{PipelineConfig, ReportSettings};
use kpatch_ci::error::{PipelineError, Result};
use kpatch_ci::identity::PatchSource;
use kpatch_ci::pipeline::StageKind;
use kpatch_ci::report::RenderedReport;
use kpatch_ci::results::{BuildResult, RunResult, TaskOutcome, Verdict};
use kpatch_ci::template::TemplateVar;
use kpatch_ci::tools::{
    BuildRequest, CommitGraph, CopyPublisher, Delivery, JobHandle, JobSpec, KernelBuilder, TestLab, Toolbox,
    Vcs,
};
use tempfile::TempDir;

pub const REPO: &str = "git://git.example.org/linux-stable.git";
const RELEASE_PREFIX: &str = "6.1.0-";
pub const INSTALL_TASK: &str = "/distribution/install";

/// `c00`, `c01`, ... oldest first.
pub fn linear_history(len: usize) -> Vec<String> {
    (0..len).map(|idx| format!("c{idx:02}")).collect()
}

/// Base commit of a tree head; patched heads look like `c03+2`.
fn base_of(head: &str) -> &str {
    head.split('+').next().unwrap_or(head)
}

/// A linear history held in memory.
pub struct FakeVcs {
    history: Vec<String>,
    tree: PathBuf,
    base: Option<String>,
    applied: usize,
    conflicting: HashSet<String>,
}

impl FakeVcs {
    pub fn new(history: Vec<String>, tree: PathBuf) -> Self {
        Self {
            history,
            tree,
            base: None,
            applied: 0,
            conflicting: HashSet::new(),
        }
    }

    pub fn with_conflict(mut self, patch: &str) -> Self {
        self.conflicting.insert(patch.to_string());
        self
    }

    fn position(&self, commit: &str) -> Result<usize> {
        self.history
            .iter()
            .position(|c| c == commit)
            .ok_or_else(|| PipelineError::Config(format!("unknown commit {commit}")))
    }
}

impl Vcs for FakeVcs {
    fn fetch(&mut self, _repo: &str, _reference: &str, _depth: Option<u32>) -> Result<()> {
        Ok(())
    }

    fn checkout(&mut self, reference: &str) -> Result<String> {
        let commit = if reference == "master" {
            self.history
                .last()
                .cloned()
                .ok_or_else(|| PipelineError::Config("empty history".into()))?
        } else {
            self.history[self.position(reference)?].clone()
        };
        self.base = Some(commit.clone());
        self.applied = 0;
        Ok(commit)
    }

    fn apply_patch(&mut self, patch: &PatchSource) -> Result<()> {
        let commit = self.head()?;
        if self.conflicting.contains(&patch.id()) {
            return Err(PipelineError::MergeConflict {
                patch: patch.id(),
                commit,
                log: None,
            });
        }
        self.applied += 1;
        Ok(())
    }

    fn head(&self) -> Result<String> {
        let base = self
            .base
            .clone()
            .ok_or_else(|| PipelineError::Config("nothing checked out".into()))?;
        Ok(if self.applied == 0 {
            base
        } else {
            format!("{base}+{}", self.applied)
        })
    }

    fn commit_date(&self, commit: &str) -> Result<i64> {
        Ok(1_700_000_000 + self.position(base_of(commit))? as i64)
    }

    fn tree_path(&self) -> &Path {
        &self.tree
    }
}

impl CommitGraph for FakeVcs {
    fn candidates(&self, bad: &str, good: &[String]) -> Result<Vec<String>> {
        let bad = self.position(bad)?;
        let mut lo = 0;
        for commit in good {
            lo = lo.max(self.position(commit)? + 1);
        }
        if lo > bad {
            return Ok(Vec::new());
        }
        Ok(self.history[lo..=bad].to_vec())
    }
}

/// Writes a fake tarball, or fails for commits listed as broken.
pub struct FakeBuilder {
    broken: HashSet<String>,
}

impl FakeBuilder {
    pub fn new() -> Self {
        Self {
            broken: HashSet::new(),
        }
    }

    pub fn broken<I: IntoIterator<Item = S>, S: Into<String>>(commits: I) -> Self {
        Self {
            broken: commits.into_iter().map(Into::into).collect(),
        }
    }
}

impl KernelBuilder for FakeBuilder {
    fn build(&mut self, request: &BuildRequest) -> Result<BuildResult> {
        fs::create_dir_all(&request.output_dir)
            .map_err(|err| PipelineError::io(&request.output_dir, err))?;
        let log = request.output_dir.join("build.log");
        if self.broken.contains(base_of(&request.commit)) {
            return Ok(BuildResult::failed(&request.commit, "x86_64", log));
        }
        let artifact = request.output_dir.join(format!("{}.tar.gz", request.commit));
        let config = request.output_dir.join(format!("{}.config", request.commit));
        fs::write(&artifact, request.commit.as_bytes())
            .map_err(|err| PipelineError::io(&artifact, err))?;
        fs::write(&config, b"CONFIG_TINY=y\n").map_err(|err| PipelineError::io(&config, err))?;
        Ok(BuildResult {
            commit: request.commit.clone(),
            succeeded: true,
            artifact: Some(artifact),
            config: Some(config),
            kernel_release: Some(format!("{RELEASE_PREFIX}{}", request.commit)),
            arch: "x86_64".into(),
            log,
        })
    }
}

#[derive(Debug, Default)]
pub struct LabLog {
    pub submitted: Vec<JobSpec>,
    /// Commit of every completed run, in order.
    pub completed: Vec<String>,
}

/// Passes every commit before `first_bad` and fails the rest.
pub struct FakeLab {
    history: Vec<String>,
    first_bad: Option<usize>,
    /// Remaining ERROR verdicts per commit.
    flaky: HashMap<String, u32>,
    skipped: HashSet<String>,
    jobs: HashMap<String, (String, Option<String>)>,
    submit_failures: u32,
    /// Completed runs before the lab becomes unreachable.
    outage_after: Option<usize>,
    /// Runs that die in the install task, whatever the commit.
    install_failures: u32,
    /// Runs that fail, whatever the commit.
    failing_runs: u32,
    console: Option<String>,
    pub log: Rc<RefCell<LabLog>>,
}

impl FakeLab {
    pub fn new(history: Vec<String>, first_bad: Option<usize>) -> Self {
        Self {
            history,
            first_bad,
            flaky: HashMap::new(),
            skipped: HashSet::new(),
            jobs: HashMap::new(),
            submit_failures: 0,
            outage_after: None,
            install_failures: 0,
            failing_runs: 0,
            console: None,
            log: Rc::default(),
        }
    }

    pub fn flaky(mut self, commit: &str, errors: u32) -> Self {
        self.flaky.insert(commit.to_string(), errors);
        self
    }

    pub fn skips(mut self, commit: &str) -> Self {
        self.skipped.insert(commit.to_string());
        self
    }

    pub fn failing_submissions(mut self, count: u32) -> Self {
        self.submit_failures = count;
        self
    }

    pub fn outage_after(mut self, runs: usize) -> Self {
        self.outage_after = Some(runs);
        self
    }

    pub fn install_failures(mut self, runs: u32) -> Self {
        self.install_failures = runs;
        self
    }

    pub fn failing_runs(mut self, runs: u32) -> Self {
        self.failing_runs = runs;
        self
    }

    pub fn console(mut self, source: impl Into<String>) -> Self {
        self.console = Some(source.into());
        self
    }
}

impl TestLab for FakeLab {
    fn submit(&mut self, job: &JobSpec) -> Result<JobHandle> {
        if self.submit_failures > 0 {
            self.submit_failures -= 1;
            return Err(PipelineError::InfraVerdict("lab scheduler unavailable".into()));
        }
        let release = job.vars.get(TemplateVar::KernelVersion).unwrap_or_default();
        let head = release.strip_prefix(RELEASE_PREFIX).unwrap_or(release);
        let id = format!("J:{}", self.log.borrow().submitted.len() + 1);
        self.jobs
            .insert(id.clone(), (base_of(head).to_string(), job.host.clone()));
        self.log.borrow_mut().submitted.push(job.clone());
        Ok(JobHandle { id })
    }

    fn await_completion(
        &mut self,
        handle: &JobHandle,
        _timeout: Option<Duration>,
    ) -> Result<RunResult> {
        let (commit, host) = self
            .jobs
            .get(&handle.id)
            .cloned()
            .ok_or_else(|| PipelineError::InfraVerdict(format!("unknown job {}", handle.id)))?;
        if self
            .outage_after
            .is_some_and(|limit| self.log.borrow().completed.len() >= limit)
        {
            return Err(PipelineError::environment(StageKind::Run, "lab controller unreachable"));
        }
        self.log.borrow_mut().completed.push(commit.clone());

        let host = host.unwrap_or_else(|| "lab-01.example.org".into());
        if let Some(remaining) = self.flaky.get_mut(&commit)
            && *remaining > 0
        {
            *remaining -= 1;
            return Ok(RunResult {
                host: Some(host),
                ..RunResult::infra("machine did not boot")
            });
        }
        if self.install_failures > 0 {
            self.install_failures -= 1;
            return Ok(RunResult {
                jobs: vec![handle.id.clone()],
                host: Some(host),
                tasks: vec![TaskOutcome {
                    name: INSTALL_TASK.into(),
                    result: Verdict::Fail,
                    log: Some(format!("https://lab.example.org/{}/install.log", handle.id)),
                }],
                ..RunResult::completed(Verdict::Fail)
            });
        }
        let verdict = if self.skipped.contains(&commit) {
            Verdict::Skipped
        } else if self.failing_runs > 0 {
            self.failing_runs -= 1;
            Verdict::Fail
        } else {
            let idx = self.history.iter().position(|c| *c == commit);
            match (idx, self.first_bad) {
                (Some(idx), Some(first_bad)) if idx >= first_bad => Verdict::Fail,
                _ => Verdict::Pass,
            }
        };
        Ok(RunResult {
            jobs: vec![handle.id.clone()],
            host: Some(host),
            arch: Some("x86_64".into()),
            tasks: vec![TaskOutcome {
                name: INSTALL_TASK.into(),
                result: Verdict::Pass,
                log: None,
            }],
            console: self.console.clone(),
            ..RunResult::completed(verdict)
        })
    }
}

#[derive(Default)]
pub struct CapturingDelivery {
    pub reports: Rc<RefCell<Vec<RenderedReport>>>,
}

impl Delivery for CapturingDelivery {
    fn deliver(&mut self, report: &RenderedReport, _channel: &ReportSettings) -> Result<()> {
        self.reports.borrow_mut().push(report.clone());
        Ok(())
    }
}

/// A temporary working area with a configuration wired to it.
pub struct Fixture {
    pub dir: TempDir,
    pub config: PipelineConfig,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("job.xml");
        fs::write(
            &template,
            "<job kver=\"##KVER##\" url=\"##KPKG_URL##\" uid=\"##UID##\">##HOSTNAMETAG##</job>\n",
        )
        .unwrap();

        let mut config = PipelineConfig::default();
        config.workdir = Some(dir.path().join("work"));
        config.state = Some(dir.path().join("state.yaml"));
        config.merge.baserepo = Some(REPO.into());
        config.build.cfgtype = Some("tinyconfig".into());
        config.publish.destination = Some(dir.path().join("public").display().to_string());
        config.publish.url_prefix = Some("http://artifacts.example.org/kernels".into());
        config.run.job_template = Some(template);
        config.run.wait = true;
        config.run.submit_delay_secs = 0;
        Self { dir, config }
    }

    pub fn state_path(&self) -> PathBuf {
        self.config.state_path()
    }

    pub fn toolbox(&self, vcs: FakeVcs, builder: FakeBuilder, lab: FakeLab) -> Toolbox {
        self.toolbox_with_delivery(vcs, builder, lab, CapturingDelivery::default())
    }

    pub fn toolbox_with_delivery(
        &self,
        vcs: FakeVcs,
        builder: FakeBuilder,
        lab: FakeLab,
        delivery: CapturingDelivery,
    ) -> Toolbox {
        Toolbox::new(
            Box::new(vcs),
            Box::new(builder),
            Box::new(CopyPublisher),
            Box::new(lab),
            Box::new(delivery),
        )
    }

    pub fn vcs(&self, history: &[String]) -> FakeVcs {
        FakeVcs::new(history.to_vec(), self.dir.path().join("work/source"))
    }
}
