use tracing::info;

use crate::error::{PipelineError, Result};
use crate::pipeline::{Stage, StageContext, StageKind, StageStatus};
use crate::results::{BuildResult, PublishResult};
use crate::state::WorkflowState;
use crate::tools::publish::compute_sha256;

pub struct PublishStage;

impl Stage for PublishStage {
    fn kind(&self) -> StageKind {
        StageKind::Publish
    }

    fn execute(&self, state: &mut WorkflowState, ctx: &mut StageContext<'_>) -> Result<StageStatus> {
        let build = BuildResult::from_state(state)?;
        let artifact = build.artifact_path()?;
        let settings = &ctx.config.publish;
        let destination = settings
            .destination
            .as_deref()
            .ok_or_else(|| PipelineError::Config("publish.destination is required".into()))?;
        let prefix = settings.url_prefix.as_deref().unwrap_or_default();

        let publisher = &mut ctx.tools.publisher;
        let artifact_url = publisher.publish(artifact, destination, prefix)?;
        let config_url = match &build.config {
            Some(config) => Some(publisher.publish(config, destination, prefix)?),
            None => None,
        };

        let result = PublishResult {
            artifact_url,
            config_url,
            artifact_sha256: compute_sha256(artifact)?,
        };
        info!(url = %result.artifact_url, sha256 = %result.artifact_sha256, "Artifact published");
        result.to_state(state);
        Ok(StageStatus::Passed)
    }
}
