use crate::pipeline::{StageKind, StageRegistry};

pub mod bisect;
pub mod build;
pub mod cleanup;
pub mod merge;
pub mod publish;
pub mod report;
pub mod run;

pub use bisect::BisectStage;
pub use build::BuildStage;
pub use cleanup::CleanupStage;
pub use merge::MergeStage;
pub use publish::PublishStage;
pub use report::ReportStage;
pub use run::RunStage;

pub fn register_defaults(registry: &mut StageRegistry) {
    registry.register(StageKind::Merge, |_| Ok(Box::new(MergeStage)));
    registry.register(StageKind::Build, |config| {
        config.build.selection()?;
        Ok(Box::new(BuildStage))
    });
    registry.register(StageKind::Publish, |_| Ok(Box::new(PublishStage)));
    registry.register(StageKind::Run, |_| Ok(Box::new(RunStage)));
    registry.register(StageKind::Report, |_| Ok(Box::new(ReportStage)));
    registry.register(StageKind::Cleanup, |_| Ok(Box::new(CleanupStage)));
    registry.register(StageKind::Bisect, |_| Ok(Box::new(BisectStage)));
}

pub fn default_registry() -> StageRegistry {
    let mut registry = StageRegistry::new();
    register_defaults(&mut registry);
    registry
}
