use tracing::debug;

use super::{ProbeOracle, ProbeOutcome};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::observability::MetricsCollector;
use crate::pipeline::{StageKind, StageRegistry, build_pipeline};
use crate::results::{BuildResult, MergeConflict, RunResult};
use crate::state::WorkflowState;
use crate::tools::{CommitGraph, Toolbox};

const PROBE_STAGES: [StageKind; 4] = [
    StageKind::Merge,
    StageKind::Build,
    StageKind::Publish,
    StageKind::Run,
];

/// Probes commits by running the regular stages on a scratch record that is
/// never persisted.
pub struct PipelineOracle<'a> {
    registry: &'a StageRegistry,
    config: PipelineConfig,
    tools: &'a mut Toolbox,
    metrics: MetricsCollector,
    scratch: WorkflowState,
    scratch_commit: Option<String>,
}

impl<'a> PipelineOracle<'a> {
    /// Probes apply `bisect.patches`, always wait for the lab and take its
    /// first verdict without rescheduling.
    pub fn new(
        registry: &'a StageRegistry,
        base: &PipelineConfig,
        tools: &'a mut Toolbox,
        metrics: &MetricsCollector,
    ) -> Self {
        let mut config = base.clone();
        config.merge.patches = base.bisect.patches.clone();
        config.run.wait = true;
        config.run.reschedule = false;
        Self {
            registry,
            config,
            tools,
            metrics: metrics.clone(),
            scratch: WorkflowState::new(),
            scratch_commit: None,
        }
    }

    fn run_stages(&mut self, kinds: &[StageKind]) -> Result<()> {
        let executor = build_pipeline(self.registry, kinds, &self.config, self.metrics.clone())?;
        executor.execute(&mut self.scratch, None, &self.config, &mut *self.tools)?;
        Ok(())
    }

    fn outcome(&self) -> Result<ProbeOutcome> {
        if let Some(conflict) = MergeConflict::from_state(&self.scratch) {
            return Ok(ProbeOutcome::Conflict {
                patch: conflict.failed_patch,
            });
        }
        if self.scratch.has_stage(StageKind::Build) {
            let build = BuildResult::recorded(&self.scratch)?;
            if !build.succeeded {
                return Ok(ProbeOutcome::BuildFailed { log: build.log });
            }
        }
        let run = RunResult::from_state(&self.scratch)?;
        match run.verdict {
            Some(verdict) => Ok(ProbeOutcome::Tested {
                verdict,
                host: run.host,
                detail: run.detail,
            }),
            None => Err(PipelineError::InfraVerdict(
                "the lab did not report a verdict".into(),
            )),
        }
    }
}

impl CommitGraph for PipelineOracle<'_> {
    fn candidates(&self, bad: &str, good: &[String]) -> Result<Vec<String>> {
        self.tools.vcs.candidates(bad, good)
    }

    fn midpoint(&self, bad: &str, good: &[String], exclude: &[String]) -> Result<Option<String>> {
        self.tools.vcs.midpoint(bad, good, exclude)
    }
}

impl ProbeOracle for PipelineOracle<'_> {
    fn probe(&mut self, commit: &str) -> Result<ProbeOutcome> {
        self.config.merge.reference = commit.to_string();
        self.scratch = WorkflowState::new();
        self.scratch_commit = Some(commit.to_string());
        self.run_stages(&PROBE_STAGES)?;
        self.outcome()
    }

    fn rerun(&mut self, commit: &str) -> Result<ProbeOutcome> {
        let reusable = self.scratch_commit.as_deref() == Some(commit)
            && self.scratch.has_stage(StageKind::Publish);
        if !reusable {
            return self.probe(commit);
        }
        debug!(%commit, "Reusing published build, repeating the run only");
        self.scratch.remove_stage(StageKind::Run);
        self.run_stages(&[StageKind::Run])?;
        self.outcome()
    }

    fn pin_host(&mut self, host: &str) {
        self.config.run.host = Some(host.to_string());
    }
}
