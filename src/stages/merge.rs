use tracing::{info, warn};

use crate::error::{PipelineError, Result};
use crate::identity::{PatchSource, Uid};
use crate::pipeline::{Stage, StageContext, StageKind, StageStatus};
use crate::results::{MergeConflict, MergeResult};
use crate::state::WorkflowState;

/// Checks out the base commit and applies the patch series in order.
pub struct MergeStage;

impl MergeStage {
    /// A record that already identifies a run belongs to that run.
    fn ensure_unclaimed(state: &WorkflowState, ctx: &StageContext<'_>) -> Result<()> {
        let Some(uid) = state.text_opt(StageKind::Merge, "uid") else {
            return Ok(());
        };
        Err(PipelineError::StateInUse {
            path: ctx.state_path.map(|p| p.to_path_buf()).unwrap_or_default(),
            run_id: state.run().id.clone(),
            uid,
        })
    }
}

impl Stage for MergeStage {
    fn kind(&self) -> StageKind {
        StageKind::Merge
    }

    fn execute(&self, state: &mut WorkflowState, ctx: &mut StageContext<'_>) -> Result<StageStatus> {
        Self::ensure_unclaimed(state, ctx)?;
        let settings = &ctx.config.merge;
        let repo = settings
            .baserepo
            .clone()
            .ok_or_else(|| PipelineError::Config("merge.baserepo is required".into()))?;
        let sources = settings.patch_sources();
        let ids: Vec<String> = sources.iter().map(PatchSource::id).collect();

        let vcs = &mut ctx.tools.vcs;
        vcs.fetch(&repo, &settings.reference, settings.fetch_depth)?;
        let commit = vcs.checkout(&settings.reference)?;
        let commit_date = match vcs.commit_date(&commit) {
            Ok(date) => Some(date),
            Err(err) => {
                warn!(error = %err, "Could not read commit date");
                None
            }
        };
        let uid = Uid::compute(&repo, &commit, &ids);
        info!(%commit, %uid, patches = ids.len(), "Base checked out");

        for patch in &sources {
            match vcs.apply_patch(patch) {
                Ok(()) => info!(patch = %patch, "Applied"),
                Err(PipelineError::MergeConflict { log, .. }) => {
                    warn!(patch = %patch, %commit, "Patch does not apply, stopping");
                    MergeConflict {
                        base_repo: repo,
                        commit,
                        patches: ids,
                        uid,
                        failed_patch: patch.id(),
                        log: log.or_else(|| vcs.merge_log()),
                    }
                    .to_state(state);
                    return Ok(StageStatus::Failed);
                }
                Err(err) => return Err(err),
            }
        }

        MergeResult {
            base_repo: repo,
            reference: settings.reference.clone(),
            commit,
            commit_date,
            patches: ids,
            head: vcs.head()?,
            uid,
            tree: vcs.tree_path().to_path_buf(),
        }
        .to_state(state);
        Ok(StageStatus::Passed)
    }
}
