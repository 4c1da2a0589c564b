use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::ValueEnum;
use glob::glob;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::identity::PatchSource;

pub const DEFAULT_CONFIG_FILE: &str = "kpatch-ci.yaml";
pub const DEFAULT_STATE_FILE: &str = "kpatch-state.yaml";
pub const DEFAULT_WORKDIR: &str = "kpatch-work";

/// Everything a workflow run can be told, from the YAML file and the CLI.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub workdir: Option<PathBuf>,
    pub state: Option<PathBuf>,
    pub merge: MergeSettings,
    pub build: BuildSettings,
    pub publish: PublishSettings,
    pub run: RunSettings,
    pub report: ReportSettings,
    pub cleanup: CleanupSettings,
    pub bisect: BisectSettings,
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|err| {
            PipelineError::Config(format!(
                "failed to read config file {}: {err}",
                path.display()
            ))
        })?;
        serde_yaml::from_str(&content).map_err(|err| {
            PipelineError::Config(format!(
                "failed to parse config YAML {}: {err}",
                path.display()
            ))
        })
    }

    /// Load an explicitly requested file, or the default file when present.
    pub fn discover(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::load(path),
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.is_file() {
                    Self::load(default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn workdir(&self) -> PathBuf {
        self.workdir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_WORKDIR))
    }

    pub fn state_path(&self) -> PathBuf {
        self.state
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_FILE))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MergeSettings {
    pub baserepo: Option<String>,
    #[serde(rename = "ref")]
    pub reference: String,
    pub patches: Vec<String>,
    pub fetch_depth: Option<u32>,
}

impl Default for MergeSettings {
    fn default() -> Self {
        Self {
            baserepo: None,
            reference: "master".to_string(),
            patches: Vec::new(),
            fetch_depth: None,
        }
    }
}

impl MergeSettings {
    pub fn patch_sources(&self) -> Vec<PatchSource> {
        self.patches.iter().map(|p| PatchSource::parse(p)).collect()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BuildSettings {
    /// Base kernel config file, processed with `cfgtype`.
    pub baseconfig: Option<PathBuf>,
    /// Make target used to process `baseconfig`, or `tinyconfig`/`rh-configs`.
    pub cfgtype: Option<String>,
    /// Selects one of the configs generated by `make rh-configs`.
    pub rh_configs_glob: Option<String>,
    pub make_opts: Option<String>,
    pub localversion: String,
    pub enable_debuginfo: bool,
    pub wipe: bool,
    pub timeout_secs: u64,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            baseconfig: None,
            cfgtype: None,
            rh_configs_glob: None,
            make_opts: None,
            localversion: "kpatch".to_string(),
            enable_debuginfo: false,
            wipe: false,
            timeout_secs: 12 * 60 * 60,
        }
    }
}

/// How the kernel configuration is materialised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSelection {
    File { path: PathBuf, target: String },
    Tiny,
    Glob { pattern: String },
}

impl BuildSettings {
    pub fn selection(&self) -> Result<ConfigSelection> {
        match self.cfgtype.as_deref() {
            Some("tinyconfig") | Some("tiny") => Ok(ConfigSelection::Tiny),
            Some("rh-configs") => {
                let pattern = self.rh_configs_glob.clone().ok_or_else(|| {
                    PipelineError::Config("cfgtype rh-configs requires rh_configs_glob".into())
                })?;
                Ok(ConfigSelection::Glob { pattern })
            }
            other => {
                if other.is_none()
                    && let Some(pattern) = &self.rh_configs_glob
                {
                    return Ok(ConfigSelection::Glob {
                        pattern: pattern.clone(),
                    });
                }
                let path = self.baseconfig.clone().ok_or_else(|| {
                    PipelineError::Config(
                        "a base config file, the tiny profile or an rh-configs glob is required"
                            .into(),
                    )
                })?;
                Ok(ConfigSelection::File {
                    path,
                    target: other.unwrap_or("olddefconfig").to_string(),
                })
            }
        }
    }

    pub fn extra_make_args(&self) -> Vec<String> {
        self.make_opts
            .as_deref()
            .map(|opts| opts.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum PublisherKind {
    #[default]
    Cp,
    Scp,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PublishSettings {
    pub kind: PublisherKind,
    pub destination: Option<String>,
    pub url_prefix: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RunSettings {
    pub job_template: Option<PathBuf>,
    /// Command that reads a job document on stdin and prints the job id.
    pub submit_command: Vec<String>,
    /// Command invoked with the job id that prints a YAML status document.
    pub status_command: Vec<String>,
    pub wait: bool,
    pub timeout_secs: Option<u64>,
    pub poll_interval_secs: u64,
    pub host: Option<String>,
    pub arch: Option<String>,
    pub submit_retries: u32,
    pub submit_delay_secs: u64,
    /// Run a failed job twice more, once on the failing host and once
    /// wherever the lab puts it, before calling it a failure.
    pub reschedule: bool,
    /// Task whose failure means the kernel never got installed.
    pub install_task: String,
    /// Resubmissions allowed for install failures.
    pub install_resubmits: u32,
    /// Scan the console log for call traces once the job is done.
    pub console_check: bool,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            job_template: None,
            submit_command: Vec::new(),
            status_command: Vec::new(),
            wait: false,
            timeout_secs: None,
            poll_interval_secs: 60,
            host: None,
            arch: None,
            submit_retries: 3,
            submit_delay_secs: 3,
            reschedule: true,
            install_task: "/distribution/install".to_string(),
            install_resubmits: 3,
            console_check: false,
        }
    }
}

impl RunSettings {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryKind {
    #[default]
    Stdout,
    Mail,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ReportTemplate {
    #[default]
    Full,
    Limited,
}

impl ReportTemplate {
    pub fn name(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Limited => "limited",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReportSettings {
    pub delivery: DeliveryKind,
    pub template: ReportTemplate,
    /// Additional state records (glob patterns) reported together.
    pub results: Vec<String>,
    pub mail: MailSettings,
}

impl Default for ReportSettings {
    fn default() -> Self {
        Self {
            delivery: DeliveryKind::Stdout,
            template: ReportTemplate::Full,
            results: Vec::new(),
            mail: MailSettings::default(),
        }
    }
}

impl ReportSettings {
    pub fn expand_results(&self) -> Result<Vec<PathBuf>> {
        let mut resolved = Vec::new();
        for pattern in &self.results {
            let matches = glob(pattern).map_err(|err| {
                PipelineError::Config(format!("invalid glob pattern {pattern}: {err}"))
            })?;
            let mut found = false;
            for entry in matches {
                let path = entry
                    .map_err(|err| PipelineError::Config(format!("{pattern}: {err}")))?;
                if path.is_file() {
                    resolved.push(path);
                    found = true;
                }
            }
            if !found {
                return Err(PipelineError::Config(format!(
                    "no state records matched pattern: {pattern}"
                )));
            }
        }
        Ok(resolved)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MailSettings {
    pub from: Option<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: Option<String>,
    pub subject_prefix: Option<String>,
    pub headers: Vec<String>,
    pub sendmail: Vec<String>,
}

impl Default for MailSettings {
    fn default() -> Self {
        Self {
            from: None,
            to: Vec::new(),
            cc: Vec::new(),
            bcc: Vec::new(),
            subject: None,
            subject_prefix: None,
            headers: Vec::new(),
            sendmail: vec!["sendmail".into(), "-t".into(), "-oi".into()],
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct CleanupSettings {
    /// Delete the whole state record instead of the stage namespaces.
    pub all: bool,
    /// Remove the working directory too.
    pub wipe: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BisectSettings {
    /// Known-good reference, typically the head of a stable branch.
    pub good_ref: String,
    pub bad_ref: Option<String>,
    /// Patches applied on top of every probed commit.
    pub patches: Vec<String>,
    /// How many times an ERROR verdict is retried before the commit is skipped.
    pub infra_retries: u32,
    pub verify_bounds: bool,
    /// Run every probe on the host that tested the good commit.
    pub pin_host: bool,
    pub record: Option<PathBuf>,
}

impl Default for BisectSettings {
    fn default() -> Self {
        Self {
            good_ref: "master".to_string(),
            bad_ref: None,
            patches: Vec::new(),
            infra_retries: 3,
            verify_bounds: true,
            pin_host: true,
            record: None,
        }
    }
}

impl BisectSettings {
    pub fn record_path(&self, workdir: &Path) -> PathBuf {
        self.record
            .clone()
            .unwrap_or_else(|| workdir.join("bisect.yaml"))
    }
}
