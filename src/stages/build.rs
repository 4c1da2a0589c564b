use tracing::{info, warn};

use crate::error::Result;
use crate::pipeline::{Stage, StageContext, StageKind, StageStatus};
use crate::results::MergeResult;
use crate::state::WorkflowState;
use crate::tools::BuildRequest;

/// Builds the merged tree. Only the build namespace is written.
pub struct BuildStage;

impl Stage for BuildStage {
    fn kind(&self) -> StageKind {
        StageKind::Build
    }

    fn execute(&self, state: &mut WorkflowState, ctx: &mut StageContext<'_>) -> Result<StageStatus> {
        let merge = MergeResult::from_state(state)?;
        let settings = &ctx.config.build;
        let request = BuildRequest {
            tree: merge.tree,
            commit: merge.head,
            selection: settings.selection()?,
            make_args: settings.extra_make_args(),
            localversion: settings.localversion.clone(),
            enable_debuginfo: settings.enable_debuginfo,
            wipe: settings.wipe,
            timeout: settings.timeout(),
            output_dir: ctx.config.workdir().join("build"),
        };

        let result = ctx.tools.builder.build(&request)?;
        result.to_state(state);
        if result.succeeded {
            info!(release = ?result.kernel_release, arch = %result.arch, "Build recorded");
            Ok(StageStatus::Passed)
        } else {
            warn!(commit = %result.commit, log = %result.log.display(), "Build failure recorded");
            Ok(StageStatus::Failed)
        }
    }
}
