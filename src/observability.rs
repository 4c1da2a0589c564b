use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

#[derive(Debug, Default, Serialize, Clone)]
pub struct MetricsSnapshot {
    pub stages: BTreeMap<String, StageMetrics>,
    pub total_duration_ms: f64,
    pub bisect_probes: u64,
    pub infra_retries: u64,
    pub submit_retries: u64,
    pub lab_resubmits: u64,
}

#[derive(Debug, Default, Serialize, Clone)]
pub struct StageMetrics {
    pub calls: u64,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
}

#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsSnapshot::default())),
        }
    }

    pub fn start_stage(&self, stage_name: &str) -> StageTimer {
        StageTimer {
            stage: stage_name.to_string(),
            started_at: Instant::now(),
            collector: self.inner.clone(),
            recorded: false,
        }
    }

    /// Accumulates, so nested executors (bisection probes) add up.
    pub fn record_total_duration(&self, duration: Duration) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.total_duration_ms += duration.as_secs_f64() * 1_000.0;
        }
    }

    pub fn record_probe(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.bisect_probes += 1;
        }
    }

    pub fn record_infra_retry(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.infra_retries += 1;
        }
    }

    pub fn record_submit_retry(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.submit_retries += 1;
        }
    }

    pub fn record_lab_resubmit(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.lab_resubmits += 1;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn reset(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            *guard = MetricsSnapshot::default();
        }
    }
}

pub struct StageTimer {
    stage: String,
    started_at: Instant,
    collector: Arc<Mutex<MetricsSnapshot>>,
    recorded: bool,
}

impl StageTimer {
    fn record(&mut self) {
        if self.recorded {
            return;
        }
        let duration_ms = self.started_at.elapsed().as_secs_f64() * 1_000.0;
        if let Ok(mut guard) = self.collector.lock() {
            let metrics = guard.stages.entry(self.stage.clone()).or_default();
            metrics.calls += 1;
            metrics.total_duration_ms += duration_ms;
            if duration_ms > metrics.max_duration_ms {
                metrics.max_duration_ms = duration_ms;
            }
        }
        debug!(
            stage = self.stage.as_str(),
            duration_ms, "Stage duration recorded"
        );
        self.recorded = true;
    }
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        self.record();
    }
}

pub fn log_snapshot(snapshot: &MetricsSnapshot) {
    info!(
        total_duration_ms = snapshot.total_duration_ms,
        stage_count = snapshot.stages.len(),
        bisect_probes = snapshot.bisect_probes,
        infra_retries = snapshot.infra_retries,
        submit_retries = snapshot.submit_retries,
        lab_resubmits = snapshot.lab_resubmits,
        "Workflow metrics summary"
    );
    for (stage, metrics) in &snapshot.stages {
        info!(
            stage = stage.as_str(),
            calls = metrics.calls,
            total_ms = metrics.total_duration_ms,
            max_ms = metrics.max_duration_ms,
            "Stage metrics"
        );
    }
}

impl MetricsSnapshot {
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        let counters = [
            (
                "kpatch_bisect_probes_total",
                "Bisection probe attempts",
                self.bisect_probes,
            ),
            (
                "kpatch_infra_retries_total",
                "Probes retried after an infrastructure verdict",
                self.infra_retries,
            ),
            (
                "kpatch_submit_retries_total",
                "Test lab submissions retried",
                self.submit_retries,
            ),
            (
                "kpatch_lab_resubmits_total",
                "Jobs submitted again after an install failure or a failed run",
                self.lab_resubmits,
            ),
        ];
        for (name, help, value) in counters {
            output.push_str(&format!("# HELP {name} {help}\n"));
            output.push_str(&format!("# TYPE {name} counter\n"));
            output.push_str(&format!("{name} {value}\n"));
        }

        output.push_str("# HELP kpatch_stage_calls_total Stage invocation count\n");
        output.push_str("# TYPE kpatch_stage_calls_total counter\n");
        output.push_str(
            "# HELP kpatch_stage_duration_seconds_total Accumulated stage duration in seconds\n",
        );
        output.push_str("# TYPE kpatch_stage_duration_seconds_total counter\n");
        output.push_str("# HELP kpatch_stage_duration_seconds_max Maximum stage duration in seconds\n");
        output.push_str("# TYPE kpatch_stage_duration_seconds_max gauge\n");
        for (stage, metrics) in &self.stages {
            output.push_str(&format!(
                "kpatch_stage_calls_total{{stage=\"{}\"}} {}\n",
                stage, metrics.calls
            ));
            output.push_str(&format!(
                "kpatch_stage_duration_seconds_total{{stage=\"{}\"}} {:.6}\n",
                stage,
                metrics.total_duration_ms / 1_000.0
            ));
            output.push_str(&format!(
                "kpatch_stage_duration_seconds_max{{stage=\"{}\"}} {:.6}\n",
                stage,
                metrics.max_duration_ms / 1_000.0
            ));
        }
        output.push_str("# HELP kpatch_workflow_duration_seconds Total workflow duration\n");
        output.push_str("# TYPE kpatch_workflow_duration_seconds gauge\n");
        output.push_str(&format!(
            "kpatch_workflow_duration_seconds {:.6}\n",
            self.total_duration_ms / 1_000.0
        ));
        output
    }
}
