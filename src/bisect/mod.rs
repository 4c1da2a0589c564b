//! Binary search for the commit that introduced a test failure.
//!
//! The search is an explicit loop over a [`BisectRecord`] that is written to
//! disk after every probe attempt, so an interrupted bisection resumes at the
//! same midpoint a fresh run would pick. Probing itself is delegated to a
//! [`ProbeOracle`], normally the Merge→Build→Publish→Run pipeline, which also
//! answers the ancestry queries that pick each midpoint.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn};

use crate::config::{BisectSettings, PipelineConfig};
use crate::error::{PipelineError, Result};
use crate::observability::MetricsCollector;
use crate::results::Verdict;
use crate::state::write_atomic;
use crate::tools::CommitGraph;

pub mod oracle;

pub use oracle::PipelineOracle;

/// What one pipeline pass at a commit produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The fixed patch set does not apply on this commit.
    Conflict { patch: String },
    BuildFailed { log: PathBuf },
    Tested {
        verdict: Verdict,
        host: Option<String>,
        detail: Option<String>,
    },
}

/// Drives the pipeline at one commit.
pub trait ProbeOracle: CommitGraph {
    /// Full pass: merge, build, publish and run.
    fn probe(&mut self, commit: &str) -> Result<ProbeOutcome>;

    /// Repeat only the test run, reusing the build of the previous probe when
    /// it was for the same commit.
    fn rerun(&mut self, commit: &str) -> Result<ProbeOutcome> {
        self.probe(commit)
    }

    /// Run every later probe on `host`.
    fn pin_host(&mut self, _host: &str) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Classification {
    Good,
    Bad,
    /// Does not merge or build, or the lab skipped it.
    Untestable,
    /// The lab kept returning ERROR. Says nothing about the code.
    InfraExhausted,
}

impl Classification {
    pub fn is_skip(self) -> bool {
        matches!(self, Self::Untestable | Self::InfraExhausted)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeAttempt {
    pub commit: String,
    /// 1-based attempt number for this commit.
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
    /// Unset while the attempt is going to be retried.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<Classification>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BisectStatus {
    Running,
    Found,
    Inconclusive,
}

/// How a finished bisection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conclusion {
    Culprit(String),
    /// Skipped commits lie between the final bounds.
    Inconclusive {
        good: String,
        bad: String,
        untestable: Vec<String>,
    },
}

impl Conclusion {
    pub fn is_culprit(&self) -> bool {
        matches!(self, Self::Culprit(_))
    }
}

impl fmt::Display for Conclusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Culprit(commit) => write!(f, "first bad commit: {commit}"),
            Self::Inconclusive {
                good,
                bad,
                untestable,
            } => write!(
                f,
                "inconclusive: first bad commit is in {good}..{bad}, untestable: {}",
                untestable.join(" ")
            ),
        }
    }
}

/// The change under test: what every probe merges on top of the commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BisectSeries {
    pub base_repo: String,
    #[serde(default)]
    pub patches: Vec<String>,
}

impl BisectSeries {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            base_repo: config.merge.baserepo.clone().unwrap_or_default(),
            patches: config.bisect.patches.clone(),
        }
    }
}

/// Persistent progress of one bisection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BisectRecord {
    pub series: BisectSeries,
    /// Bounds the bisection was started with.
    pub start_good: String,
    pub start_bad: String,
    /// Latest good and bad commits. Every other good commit is still a bound
    /// and can be listed with [`Self::goods`].
    pub good: String,
    pub bad: String,
    #[serde(default)]
    pub probes: Vec<ProbeAttempt>,
    #[serde(default)]
    pub verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned_host: Option<String>,
    pub status: BisectStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub culprit: Option<String>,
}

impl BisectRecord {
    /// `candidates` is what the graph reports between the bounds and must
    /// end with `bad`.
    pub fn new(
        series: BisectSeries,
        good: impl Into<String>,
        bad: impl Into<String>,
        candidates: &[String],
    ) -> Result<Self> {
        let good = good.into();
        let bad = bad.into();
        if candidates.last() != Some(&bad) {
            return Err(PipelineError::Config(format!(
                "{bad} is not a descendant of {good}, nothing to bisect"
            )));
        }
        Ok(Self {
            series,
            start_good: good.clone(),
            start_bad: bad.clone(),
            good,
            bad,
            probes: Vec::new(),
            verified: false,
            pinned_host: None,
            status: BisectStatus::Running,
            culprit: None,
        })
    }

    /// Load a record. A missing file yields `None`.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path).map_err(|err| PipelineError::CorruptState {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        serde_yaml::from_str(&content)
            .map(Some)
            .map_err(|err| PipelineError::CorruptState {
                path: path.to_path_buf(),
                reason: err.to_string(),
            })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let yaml = serde_yaml::to_string(self).map_err(|err| PipelineError::CorruptState {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        write_atomic(path, yaml.as_bytes())
    }

    /// Classification of the latest classified attempt on `commit`.
    pub fn classification(&self, commit: &str) -> Option<Classification> {
        self.probes
            .iter()
            .rev()
            .filter(|probe| probe.commit == commit)
            .find_map(|probe| probe.classification)
    }

    /// Unclassified attempts on `commit` since it was last classified.
    pub fn pending_attempts(&self, commit: &str) -> u32 {
        self.probes
            .iter()
            .rev()
            .filter(|probe| probe.commit == commit)
            .take_while(|probe| probe.classification.is_none())
            .count() as u32
    }

    fn attempts(&self, commit: &str) -> u32 {
        self.probes.iter().filter(|probe| probe.commit == commit).count() as u32
    }

    /// `start_good` and every commit classified good since.
    pub fn goods(&self) -> Vec<String> {
        let mut goods = vec![self.start_good.clone()];
        for probe in &self.probes {
            if probe.classification == Some(Classification::Good)
                && probe.commit != self.start_bad
                && !goods.contains(&probe.commit)
            {
                goods.push(probe.commit.clone());
            }
        }
        goods
    }

    /// Commits whose latest classification is a skip, in probe order.
    pub fn skipped(&self) -> Vec<String> {
        let mut skipped: Vec<String> = Vec::new();
        for probe in &self.probes {
            if !skipped.contains(&probe.commit)
                && self.classification(&probe.commit).is_some_and(Classification::is_skip)
            {
                skipped.push(probe.commit.clone());
            }
        }
        skipped
    }

    /// Candidates the midpoint must not land on: the bad bound and skips.
    pub fn excluded(&self) -> Vec<String> {
        let mut excluded = self.skipped();
        excluded.push(self.bad.clone());
        excluded
    }

    /// Append an attempt and move a bound when it classifies the commit.
    /// Neither starting bound can flip the other one.
    pub fn record(&mut self, attempt: ProbeAttempt) {
        match attempt.classification {
            Some(Classification::Good) if attempt.commit != self.start_bad => {
                self.good = attempt.commit.clone();
            }
            Some(Classification::Bad) if attempt.commit != self.start_good => {
                self.bad = attempt.commit.clone();
            }
            _ => {}
        }
        self.probes.push(attempt);
    }

    /// Close the search once no midpoint is left. `candidates` is what the
    /// graph still reports between the good commits and `bad`.
    pub fn conclude(&mut self, candidates: &[String]) -> Conclusion {
        let untestable: Vec<String> = candidates
            .iter()
            .filter(|commit| {
                **commit != self.bad
                    && self.classification(commit).is_some_and(Classification::is_skip)
            })
            .cloned()
            .collect();
        if untestable.is_empty() {
            self.status = BisectStatus::Found;
            self.culprit = Some(self.bad.clone());
            Conclusion::Culprit(self.bad.clone())
        } else {
            self.status = BisectStatus::Inconclusive;
            self.culprit = None;
            Conclusion::Inconclusive {
                good: self.good.clone(),
                bad: self.bad.clone(),
                untestable,
            }
        }
    }
}

pub struct BisectEngine<'a> {
    settings: &'a BisectSettings,
    record_path: PathBuf,
    metrics: &'a MetricsCollector,
}

impl<'a> BisectEngine<'a> {
    pub fn new(
        settings: &'a BisectSettings,
        record_path: impl Into<PathBuf>,
        metrics: &'a MetricsCollector,
    ) -> Self {
        Self {
            settings,
            record_path: record_path.into(),
            metrics,
        }
    }

    /// Resume the record on disk when it bisects the same bounds and series.
    /// A finished record is replaced. A running one for anything else is
    /// refused with `StateInUse`.
    pub fn open(
        &self,
        series: &BisectSeries,
        good: &str,
        bad: &str,
        candidates: &[String],
    ) -> Result<BisectRecord> {
        if let Some(record) = BisectRecord::load(&self.record_path)? {
            let same = record.start_good == good
                && record.start_bad == bad
                && record.series == *series;
            if same {
                info!(
                    record = %self.record_path.display(),
                    probes = record.probes.len(),
                    "Resuming bisection"
                );
                return Ok(record);
            }
            if record.status == BisectStatus::Running {
                return Err(PipelineError::StateInUse {
                    path: self.record_path.clone(),
                    run_id: format!("bisect {}..{}", record.start_good, record.start_bad),
                    uid: format!("{} +{} patches", record.series.base_repo, record.series.patches.len()),
                });
            }
            warn!(
                record = %self.record_path.display(),
                "Replacing a finished bisection record"
            );
        }
        let record = BisectRecord::new(series.clone(), good, bad, candidates)?;
        record.save(&self.record_path)?;
        Ok(record)
    }

    pub fn run(&self, record: &mut BisectRecord, oracle: &mut dyn ProbeOracle) -> Result<Conclusion> {
        if let Some(host) = &record.pinned_host {
            oracle.pin_host(host);
        }

        if self.settings.verify_bounds && !record.verified {
            self.verify(record, oracle)?;
        }

        loop {
            let goods = record.goods();
            let next = oracle.midpoint(&record.bad, &goods, &record.excluded())?;
            let Some(commit) = next else {
                let candidates = oracle.candidates(&record.bad, &goods)?;
                let conclusion = record.conclude(&candidates);
                record.save(&self.record_path)?;
                info!(%conclusion, probes = record.probes.len(), "Bisection finished");
                return Ok(conclusion);
            };
            let _span = info_span!("probe", %commit).entered();
            let classification = self.classify(record, oracle, &commit)?;
            info!(%commit, ?classification, good = %record.good, bad = %record.bad, "Probed");
        }
    }

    fn verify(&self, record: &mut BisectRecord, oracle: &mut dyn ProbeOracle) -> Result<()> {
        let good = record.start_good.clone();
        let bad = record.start_bad.clone();
        for (commit, expected) in [(good, Classification::Good), (bad, Classification::Bad)] {
            let found = match record.classification(&commit) {
                Some(found) => found,
                None => {
                    let _span = info_span!("verify", %commit).entered();
                    self.classify(record, oracle, &commit)?
                }
            };
            if found != expected {
                return Err(PipelineError::InconsistentBounds {
                    commit,
                    expected: label(expected).into(),
                    found: label(found).into(),
                });
            }
        }
        record.verified = true;
        record.save(&self.record_path)
    }

    /// Probe `commit` until it classifies, saving every attempt.
    fn classify(
        &self,
        record: &mut BisectRecord,
        oracle: &mut dyn ProbeOracle,
        commit: &str,
    ) -> Result<Classification> {
        loop {
            let retrying = record.pending_attempts(commit);
            self.metrics.record_probe();
            let outcome = if retrying == 0 {
                oracle.probe(commit)
            } else {
                oracle.rerun(commit)
            };

            let mut attempt = ProbeAttempt {
                commit: commit.to_string(),
                attempt: record.attempts(commit) + 1,
                verdict: None,
                classification: None,
                host: None,
                detail: None,
                at: Utc::now(),
            };
            match outcome {
                Ok(ProbeOutcome::Conflict { patch }) => {
                    attempt.classification = Some(Classification::Untestable);
                    attempt.detail = Some(format!("{patch} does not apply"));
                }
                Ok(ProbeOutcome::BuildFailed { log }) => {
                    attempt.classification = Some(Classification::Untestable);
                    attempt.detail = Some(format!("build failed, see {}", log.display()));
                }
                Ok(ProbeOutcome::Tested {
                    verdict,
                    host,
                    detail,
                }) => {
                    attempt.verdict = Some(verdict);
                    attempt.host = host;
                    attempt.detail = detail;
                    attempt.classification = match verdict {
                        Verdict::Pass => Some(Classification::Good),
                        Verdict::Fail => Some(Classification::Bad),
                        Verdict::Skipped => Some(Classification::Untestable),
                        Verdict::Error => self.after_infra_error(retrying),
                    };
                }
                Err(err) if err.is_fatal() => {
                    record.save(&self.record_path)?;
                    return Err(err);
                }
                Err(err @ PipelineError::InfraVerdict(_)) => {
                    attempt.verdict = Some(Verdict::Error);
                    attempt.detail = Some(err.to_string());
                    attempt.classification = self.after_infra_error(retrying);
                }
                Err(err) => {
                    attempt.classification = Some(Classification::Untestable);
                    attempt.detail = Some(err.to_string());
                }
            }

            if self.settings.pin_host
                && record.pinned_host.is_none()
                && let Some(host) = attempt.host.clone()
            {
                info!(%host, "Pinning further probes to host");
                oracle.pin_host(&host);
                record.pinned_host = Some(host);
            }

            let classification = attempt.classification;
            record.record(attempt);
            record.save(&self.record_path)?;
            match classification {
                Some(classification) => return Ok(classification),
                None => {
                    self.metrics.record_infra_retry();
                    warn!(
                        %commit,
                        retry = retrying + 1,
                        limit = self.settings.infra_retries,
                        "Lab returned ERROR, retrying"
                    );
                }
            }
        }
    }

    fn after_infra_error(&self, retried: u32) -> Option<Classification> {
        if retried < self.settings.infra_retries {
            None
        } else {
            Some(Classification::InfraExhausted)
        }
    }
}

fn label(classification: Classification) -> &'static str {
    match classification {
        Classification::Good => "PASS",
        Classification::Bad => "FAIL",
        Classification::Untestable => "untestable",
        Classification::InfraExhausted => "infra-exhausted",
    }
}
