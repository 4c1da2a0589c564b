pub mod bisect;
pub mod config;
pub mod console;
pub mod error;
pub mod identity;
pub mod junit;
pub mod observability;
pub mod pipeline;
pub mod report;
pub mod results;
pub mod retry;
pub mod stages;
pub mod state;
pub mod template;
pub mod tools;
pub mod validation;

pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
pub use pipeline::{PipelineExecutor, StageKind, StageRegistry, StageStatus};
pub use state::WorkflowState;
