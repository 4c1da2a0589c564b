use tracing::{info, warn};

use crate::bisect::{BisectEngine, BisectSeries, Conclusion, PipelineOracle};
use crate::error::{PipelineError, Result};
use crate::pipeline::{Stage, StageContext, StageKind, StageStatus};
use crate::state::WorkflowState;
use crate::tools::CommitGraph;

/// Narrows `bisect.good_ref..bisect.bad_ref` down to the first failing
/// commit. Progress lives in its own record next to the workflow state.
pub struct BisectStage;

impl Stage for BisectStage {
    fn kind(&self) -> StageKind {
        StageKind::Bisect
    }

    fn execute(&self, state: &mut WorkflowState, ctx: &mut StageContext<'_>) -> Result<StageStatus> {
        let config = ctx.config;
        let settings = &config.bisect;
        let repo = config
            .merge
            .baserepo
            .as_deref()
            .ok_or_else(|| PipelineError::Config("merge.baserepo is required".into()))?;
        let bad_ref = settings
            .bad_ref
            .as_deref()
            .ok_or_else(|| PipelineError::Config("bisect.bad_ref is required".into()))?;

        let vcs = &mut ctx.tools.vcs;
        vcs.fetch(repo, &settings.good_ref, config.merge.fetch_depth)?;
        let good = vcs.checkout(&settings.good_ref)?;
        let bad = vcs.checkout(bad_ref)?;
        let candidates = vcs.candidates(&bad, std::slice::from_ref(&good))?;
        info!(%good, %bad, commits = candidates.len(), "Bisecting");

        let record_path = settings.record_path(&config.workdir());
        let engine = BisectEngine::new(settings, &record_path, ctx.metrics);
        let series = BisectSeries::from_config(config);
        let mut record = engine.open(&series, &good, &bad, &candidates)?;

        let registry = super::default_registry();
        let mut oracle = PipelineOracle::new(&registry, config, &mut *ctx.tools, ctx.metrics);
        let conclusion = engine.run(&mut record, &mut oracle)?;

        let ns = StageKind::Bisect;
        state.set(ns, "record", &record_path);
        state.set(ns, "good", &record.good);
        state.set(ns, "bad", &record.bad);
        state.set(ns, "probes", record.probes.len() as i64);
        match conclusion {
            Conclusion::Culprit(commit) => {
                info!(culprit = %commit, "First bad commit found");
                state.set(ns, "status", "found");
                state.set(ns, "culprit", commit);
                Ok(StageStatus::Passed)
            }
            Conclusion::Inconclusive { untestable, .. } => {
                warn!(good = %record.good, bad = %record.bad, ?untestable, "Bisection inconclusive");
                state.set(ns, "status", "inconclusive");
                state.set(ns, "untestable", untestable);
                Ok(StageStatus::Failed)
            }
        }
    }
}
