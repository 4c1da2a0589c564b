//! Typed failures shared by the stages, the state store and the bisection
//! engine.

use std::path::PathBuf;

use crate::pipeline::StageKind;

/// Every failure a stage or collaborator can surface.
///
/// Merge conflicts, build failures and test failures are normally recorded in
/// the workflow state as outcomes; they only travel as errors between a
/// collaborator and the stage that records them, or when a downstream stage
/// refuses to consume a failed upstream result.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// An upstream stage has not written the key a reader needs.
    #[error("'{key}' has not been recorded by the {stage} stage; run `{stage}` first")]
    PrerequisiteNotMet { stage: StageKind, key: String },

    /// A patch did not apply cleanly.
    #[error("patch {patch} does not apply on top of {commit}")]
    MergeConflict {
        patch: String,
        commit: String,
        log: Option<PathBuf>,
    },

    /// The code under test did not compile.
    #[error("build of {commit} failed, see {}", .log.display())]
    BuildFailure { commit: String, log: PathBuf },

    /// Toolchain or host problem unrelated to the code under test.
    #[error("{stage} stage environment error: {message}")]
    Environment { stage: StageKind, message: String },

    /// The test lab could not produce a verdict.
    #[error("test lab infrastructure failure: {0}")]
    InfraVerdict(String),

    #[error(
        "cannot report different series together: expected {expected}, found {found} in {source_label}"
    )]
    MismatchedSeries {
        expected: String,
        found: String,
        source_label: String,
    },

    #[error("state record {} is corrupt: {reason}", .path.display())]
    CorruptState { path: PathBuf, reason: String },

    /// The record already carries identity of another workflow run.
    #[error(
        "state record {} already belongs to run {run_id} (uid {uid}); run `cleanup` or pass --reset",
        .path.display()
    )]
    StateInUse {
        path: PathBuf,
        run_id: String,
        uid: String,
    },

    /// A bisection bound did not behave as its label claims.
    #[error("bisect bound {commit} should be {expected} but was {found}")]
    InconsistentBounds {
        commit: String,
        expected: String,
        found: String,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("template error: {0}")]
    Template(String),

    #[error("i/o error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PipelineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn environment(stage: StageKind, message: impl Into<String>) -> Self {
        Self::Environment {
            stage,
            message: message.into(),
        }
    }

    /// Errors that must stop a whole bisection rather than a single probe.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Environment { .. }
                | Self::CorruptState { .. }
                | Self::StateInUse { .. }
                | Self::InconsistentBounds { .. }
                | Self::Config(_)
                | Self::Io { .. }
                | Self::Template(_)
                | Self::PrerequisiteNotMet { .. }
                | Self::MismatchedSeries { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
