use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use tracing::{debug, info};

use crate::error::{PipelineError, Result};
use crate::pipeline::{Stage, StageContext, StageKind, StageStatus};
use crate::state::WorkflowState;

/// Namespaces a cleanup drops when the record itself is kept.
const TRANSIENT: [StageKind; 5] = [
    StageKind::Merge,
    StageKind::Build,
    StageKind::Publish,
    StageKind::Run,
    StageKind::Report,
];

pub struct CleanupStage;

fn remove_file(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!(file = %path.display(), "Removed");
            Ok(())
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(PipelineError::io(path, err)),
    }
}

impl Stage for CleanupStage {
    fn kind(&self) -> StageKind {
        StageKind::Cleanup
    }

    fn execute(&self, state: &mut WorkflowState, ctx: &mut StageContext<'_>) -> Result<StageStatus> {
        for key in ["artifact", "config"] {
            if let Some(path) = state.text_opt(StageKind::Build, key) {
                remove_file(Path::new(&path))?;
            }
        }

        let settings = &ctx.config.cleanup;
        if settings.wipe {
            let workdir = ctx.config.workdir();
            match fs::remove_dir_all(&workdir) {
                Ok(()) => info!(workdir = %workdir.display(), "Working directory removed"),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(PipelineError::io(workdir, err)),
            }
        }

        if settings.all {
            state.clear();
        } else {
            for kind in TRANSIENT {
                state.remove_stage(kind);
            }
        }
        info!(all = settings.all, "Record cleaned");
        Ok(StageStatus::Passed)
    }
}
