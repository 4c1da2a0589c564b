//! Collaborators the stages drive: version control, the kernel build, artifact
//! transport, the test lab and report delivery.
//!
//! Each is a trait so the stages and the bisection engine can be exercised
//! against in-memory fakes. The bundled adapters shell out to the usual tools.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::{ConfigSelection, PipelineConfig, PublisherKind, ReportSettings};
use crate::error::Result;
use crate::identity::PatchSource;
use crate::report::RenderedReport;
use crate::results::{BuildResult, RunResult};
use crate::template::TemplateVars;

pub mod delivery;
pub mod git;
pub mod lab;
pub mod make;
pub mod process;
pub mod publish;

pub use delivery::ReportDelivery;
pub use git::GitTree;
pub use lab::CommandLab;
pub use make::MakeBuilder;
pub use publish::{CopyPublisher, ScpPublisher};

/// Ancestry queries a bisection needs. Commits are ids the graph itself
/// handed out, or references it can resolve.
pub trait CommitGraph {
    /// Commits reachable from `bad` but from none of `good`, parents before
    /// children, ending with `bad`. Empty when `bad` is itself reachable from
    /// a good commit.
    fn candidates(&self, bad: &str, good: &[String]) -> Result<Vec<String>>;

    /// Commit that best halves the candidates, ignoring those in `exclude`.
    /// Picks element `len / 2` of the remaining candidates unless the graph
    /// knows better.
    fn midpoint(&self, bad: &str, good: &[String], exclude: &[String]) -> Result<Option<String>> {
        let remaining: Vec<String> = self
            .candidates(bad, good)?
            .into_iter()
            .filter(|commit| !exclude.contains(commit))
            .collect();
        Ok(remaining.get(remaining.len() / 2).cloned())
    }
}

pub trait Vcs: CommitGraph {
    /// Make `reference` of `repo` available locally.
    fn fetch(&mut self, repo: &str, reference: &str, depth: Option<u32>) -> Result<()>;
    /// Check out `reference` and return the commit it resolves to.
    fn checkout(&mut self, reference: &str) -> Result<String>;
    /// Apply one patch. A patch that does not apply is a `MergeConflict` and
    /// leaves the tree as it was before the call.
    fn apply_patch(&mut self, patch: &PatchSource) -> Result<()>;
    fn head(&self) -> Result<String>;
    /// Commit timestamp, seconds since the epoch.
    fn commit_date(&self, commit: &str) -> Result<i64>;
    fn tree_path(&self) -> &Path;
    /// Log of the most recent patch applications, if one is kept.
    fn merge_log(&self) -> Option<PathBuf> {
        None
    }
}

#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub tree: PathBuf,
    pub commit: String,
    pub selection: ConfigSelection,
    pub make_args: Vec<String>,
    pub localversion: String,
    pub enable_debuginfo: bool,
    pub wipe: bool,
    pub timeout: Duration,
    pub output_dir: PathBuf,
}

pub trait KernelBuilder {
    /// A code-side failure comes back as `BuildResult { succeeded: false }`.
    /// Only problems with the build environment are errors.
    fn build(&mut self, request: &BuildRequest) -> Result<BuildResult>;
}

pub trait Publisher {
    /// Copy `artifact` to `destination` and return its URL under `url_prefix`.
    fn publish(&mut self, artifact: &Path, destination: &str, url_prefix: &str) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct JobSpec {
    pub document: String,
    pub vars: TemplateVars,
    pub host: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub id: String,
}

pub trait TestLab {
    fn submit(&mut self, job: &JobSpec) -> Result<JobHandle>;
    /// Block until the job finishes. Running out of time yields an ERROR
    /// verdict, not an error.
    fn await_completion(&mut self, handle: &JobHandle, timeout: Option<Duration>)
    -> Result<RunResult>;
}

pub trait Delivery {
    fn deliver(&mut self, report: &RenderedReport, channel: &ReportSettings) -> Result<()>;
}

pub struct Toolbox {
    pub vcs: Box<dyn Vcs>,
    pub builder: Box<dyn KernelBuilder>,
    pub publisher: Box<dyn Publisher>,
    pub lab: Box<dyn TestLab>,
    pub delivery: Box<dyn Delivery>,
}

impl Toolbox {
    pub fn new(
        vcs: Box<dyn Vcs>,
        builder: Box<dyn KernelBuilder>,
        publisher: Box<dyn Publisher>,
        lab: Box<dyn TestLab>,
        delivery: Box<dyn Delivery>,
    ) -> Self {
        Self {
            vcs,
            builder,
            publisher,
            lab,
            delivery,
        }
    }

    /// The bundled adapters, configured from `config`. Nothing is touched on
    /// disk or the network until a stage calls into them.
    pub fn from_config(config: &PipelineConfig) -> Self {
        let workdir = config.workdir();
        let publisher: Box<dyn Publisher> = match config.publish.kind {
            PublisherKind::Cp => Box::new(CopyPublisher),
            PublisherKind::Scp => Box::new(ScpPublisher),
        };
        Self::new(
            Box::new(GitTree::new(workdir.join("source"), workdir.join("patches"))),
            Box::new(MakeBuilder::new()),
            publisher,
            Box::new(CommandLab::new(&config.run)),
            Box::new(ReportDelivery),
        )
    }
}
