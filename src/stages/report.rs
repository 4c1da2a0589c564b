use std::path::Path;

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::pipeline::{Stage, StageContext, StageKind, StageStatus};
use crate::report::{self, ReportEntry};
use crate::state::WorkflowState;

/// Aggregates the current record, plus any configured sibling records, into
/// one report and hands it to the delivery collaborator.
pub struct ReportStage;

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

impl Stage for ReportStage {
    fn kind(&self) -> StageKind {
        StageKind::Report
    }

    fn execute(&self, state: &mut WorkflowState, ctx: &mut StageContext<'_>) -> Result<StageStatus> {
        let settings = &ctx.config.report;
        let mut entries = Vec::new();
        if state.has_stage(StageKind::Merge) {
            let label = ctx
                .state_path
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| state.run().id.clone());
            entries.push(ReportEntry::from_state(state, label)?);
        }
        for path in settings.expand_results()? {
            if ctx.state_path.is_some_and(|own| same_file(own, &path)) {
                debug!(record = %path.display(), "Skipping the current record");
                continue;
            }
            entries.push(ReportEntry::load(&path)?);
        }

        let rendered = report::aggregate(entries, settings.template)?;
        ctx.tools.delivery.deliver(&rendered, settings)?;

        state.set(StageKind::Report, "subject", &rendered.subject);
        state.set(
            StageKind::Report,
            "status",
            if rendered.status.is_pass() { "pass" } else { "fail" },
        );
        state.set(StageKind::Report, "jobs", rendered.job_ids.clone());

        if rendered.status.is_pass() {
            info!(subject = %rendered.subject, "Report delivered");
            Ok(StageStatus::Passed)
        } else {
            warn!(subject = %rendered.subject, "Report delivered");
            Ok(StageStatus::Failed)
        }
    }
}
