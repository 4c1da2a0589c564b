use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::observability::MetricsCollector;
use crate::state::WorkflowState;
use crate::tools::Toolbox;

/// Closed set of workflow stages. Each kind owns one namespace in the state.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Merge,
    Build,
    Publish,
    Run,
    Report,
    Cleanup,
    Bisect,
}

impl StageKind {
    pub const ALL: [StageKind; 7] = [
        StageKind::Merge,
        StageKind::Build,
        StageKind::Publish,
        StageKind::Run,
        StageKind::Report,
        StageKind::Cleanup,
        StageKind::Bisect,
    ];

    /// The stages a full pass runs, in order.
    pub const SEQUENCE: [StageKind; 5] = [
        StageKind::Merge,
        StageKind::Build,
        StageKind::Publish,
        StageKind::Run,
        StageKind::Report,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Merge => "merge",
            Self::Build => "build",
            Self::Publish => "publish",
            Self::Run => "run",
            Self::Report => "report",
            Self::Cleanup => "cleanup",
            Self::Bisect => "bisect",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| PipelineError::Config(format!("unknown stage '{s}'")))
    }
}

/// What a stage reports back once it has recorded its outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Passed,
    /// A code-side failure (conflict, build failure, failed test) was recorded.
    Failed,
    /// Work was handed off and its result is not known yet.
    Pending,
}

/// Everything a stage may touch besides the state record.
pub struct StageContext<'a> {
    pub config: &'a PipelineConfig,
    pub tools: &'a mut Toolbox,
    pub metrics: &'a MetricsCollector,
    /// Where the record is persisted, when it is.
    pub state_path: Option<&'a Path>,
}

pub trait Stage: Send + Sync {
    fn kind(&self) -> StageKind;
    fn execute(&self, state: &mut WorkflowState, ctx: &mut StageContext<'_>)
    -> Result<StageStatus>;
}

type StageConstructor = Arc<dyn Fn(&PipelineConfig) -> Result<Box<dyn Stage>> + Send + Sync>;

pub struct StageRegistry {
    factories: HashMap<StageKind, StageConstructor>,
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StageRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, kind: StageKind, constructor: F)
    where
        F: Fn(&PipelineConfig) -> Result<Box<dyn Stage>> + Send + Sync + 'static,
    {
        self.factories.insert(kind, Arc::new(constructor));
    }

    pub fn create(&self, kind: StageKind, config: &PipelineConfig) -> Result<Box<dyn Stage>> {
        let factory = self.factories.get(&kind).ok_or_else(|| {
            PipelineError::Config(format!(
                "stage '{}' is not registered. Available stages: {}",
                kind,
                self.known_stages().join(", ")
            ))
        })?;
        factory(config)
    }

    pub fn known_stages(&self) -> Vec<String> {
        let mut kinds: Vec<_> = self.factories.keys().copied().collect();
        kinds.sort();
        kinds.into_iter().map(|k| k.to_string()).collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutcome {
    pub completed: Vec<(StageKind, StageStatus)>,
    pub status: StageStatus,
}

impl PipelineOutcome {
    pub fn last_stage(&self) -> Option<StageKind> {
        self.completed.last().map(|(kind, _)| *kind)
    }
}

pub struct PipelineExecutor {
    stages: Vec<Box<dyn Stage>>,
    metrics: MetricsCollector,
}

impl PipelineExecutor {
    pub fn new(stages: Vec<Box<dyn Stage>>, metrics: MetricsCollector) -> Self {
        Self { stages, metrics }
    }

    /// Run the stages in order against `state`.
    ///
    /// A stage that returns an error leaves `state` exactly as it was before
    /// the stage started. After every stage that returns normally the record is
    /// saved to `state_path`, if one is given. Execution stops at the first
    /// stage that does not pass.
    #[instrument(skip_all, fields(run = %state.run().id))]
    pub fn execute(
        &self,
        state: &mut WorkflowState,
        state_path: Option<&Path>,
        config: &PipelineConfig,
        tools: &mut Toolbox,
    ) -> Result<PipelineOutcome> {
        let total_start = Instant::now();
        let mut completed = Vec::with_capacity(self.stages.len());
        let mut status = StageStatus::Passed;

        for stage in &self.stages {
            let kind = stage.kind();
            let span = tracing::span!(tracing::Level::INFO, "stage", stage = %kind);
            let _span_guard = span.enter();
            let _timer = self.metrics.start_stage(kind.as_str());

            let snapshot = state.clone();
            let mut ctx = StageContext {
                config,
                tools: &mut *tools,
                metrics: &self.metrics,
                state_path,
            };
            let stage_status = match stage.execute(state, &mut ctx) {
                Ok(stage_status) => stage_status,
                Err(err) => {
                    *state = snapshot;
                    warn!(error = %err, "Stage aborted, state left untouched");
                    return Err(err);
                }
            };

            if let Some(path) = state_path {
                state.save(path)?;
            }
            debug!(status = ?stage_status, "Stage finished");
            completed.push((kind, stage_status));

            if stage_status != StageStatus::Passed {
                info!(status = ?stage_status, "Stopping pipeline");
                status = stage_status;
                break;
            }
        }

        self.metrics.record_total_duration(total_start.elapsed());
        Ok(PipelineOutcome { completed, status })
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.metrics.clone()
    }
}

pub fn build_pipeline(
    registry: &StageRegistry,
    kinds: &[StageKind],
    config: &PipelineConfig,
    metrics: MetricsCollector,
) -> Result<PipelineExecutor> {
    let mut stages = Vec::with_capacity(kinds.len());
    for kind in kinds {
        stages.push(registry.create(*kind, config)?);
    }
    Ok(PipelineExecutor::new(stages, metrics))
}
