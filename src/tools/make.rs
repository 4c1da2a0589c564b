use std::fs;
use std::path::{Path, PathBuf};
use std::thread;

use glob::glob;
use tracing::{info, warn};

use super::process::Invocation;
use super::{BuildRequest, KernelBuilder};
use crate::config::ConfigSelection;
use crate::error::{PipelineError, Result};
use crate::pipeline::StageKind;
use crate::results::BuildResult;

const BUILD_LOG: &str = "build.log";
const TARBALL_MARKER: &str = "Tarball successfully created in";

/// Builds a kernel tarball with the kernel's own make targets.
#[derive(Debug, Default)]
pub struct MakeBuilder {
    jobs: Option<usize>,
}

impl MakeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_jobs(jobs: usize) -> Self {
        Self { jobs: Some(jobs) }
    }

    fn jobs(&self) -> usize {
        self.jobs.unwrap_or_else(|| {
            thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    fn make(&self, request: &BuildRequest, log: &Path) -> Invocation {
        Invocation::new(StageKind::Build, "make")
            .current_dir(&request.tree)
            .arg("-C")
            .arg(request.tree.to_string_lossy())
            .log(log)
    }

    /// Put a `.config` in place. `Ok(false)` means a make target failed.
    fn prepare_config(&self, request: &BuildRequest, log: &Path) -> Result<bool> {
        let dot_config = request.tree.join(".config");
        let target = match &request.selection {
            ConfigSelection::File { path, target } => {
                if !path.is_file() {
                    return Err(PipelineError::Config(format!(
                        "base config {} does not exist",
                        path.display()
                    )));
                }
                fs::copy(path, &dot_config).map_err(|err| PipelineError::io(path, err))?;
                target.clone()
            }
            ConfigSelection::Tiny => "tinyconfig".to_string(),
            ConfigSelection::Glob { pattern } => {
                if !self.make(request, log).arg("rh-configs").run()?.succeeded() {
                    return Ok(false);
                }
                let selected = first_match(&request.tree, pattern)?;
                info!(config = %selected.display(), "Selected generated config");
                fs::copy(&selected, &dot_config)
                    .map_err(|err| PipelineError::io(&selected, err))?;
                "olddefconfig".to_string()
            }
        };

        if !self.make(request, log).arg(target).run()?.succeeded() {
            return Ok(false);
        }

        if !request.enable_debuginfo {
            let script = request.tree.join("scripts/config");
            if script.is_file() {
                Invocation::new(StageKind::Build, script.to_string_lossy())
                    .current_dir(&request.tree)
                    .args(["--file", ".config", "--disable", "debug_info"])
                    .log(log)
                    .run()?;
            } else {
                warn!("scripts/config not found, leaving debuginfo setting untouched");
            }
        }
        Ok(true)
    }

    fn kernel_release(&self, request: &BuildRequest, log: &Path) -> Result<Option<String>> {
        let output = self
            .make(request, log)
            .args(["-s", "kernelrelease"])
            .run()?;
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .find(|line| looks_like_release(line))
            .map(str::to_string))
    }
}

impl KernelBuilder for MakeBuilder {
    fn build(&mut self, request: &BuildRequest) -> Result<BuildResult> {
        fs::create_dir_all(&request.output_dir)
            .map_err(|err| PipelineError::io(&request.output_dir, err))?;
        let log = request.output_dir.join(BUILD_LOG);
        let _ = fs::remove_file(&log);
        let arch = std::env::var("ARCH").unwrap_or_else(|_| std::env::consts::ARCH.to_string());
        let failed = || BuildResult::failed(&request.commit, &arch, log.clone());

        if request.wipe && !self.make(request, &log).arg("mrproper").run()?.succeeded() {
            return Ok(failed());
        }
        if !self.prepare_config(request, &log)? {
            return Ok(failed());
        }

        let mut make = self
            .make(request, &log)
            .arg("INSTALL_MOD_STRIP=1")
            .arg(format!("-j{}", self.jobs()))
            .arg("targz-pkg")
            .timeout(Some(request.timeout));
        if !request.localversion.is_empty() {
            make = make.arg(format!("LOCALVERSION=-{}", request.localversion));
        }
        let output = make.args(request.make_args.iter().cloned()).run()?;
        if !output.succeeded() {
            warn!(commit = %request.commit, reason = %output.describe_failure(), "Kernel build failed");
            return Ok(failed());
        }

        let Some(tarball) = tarball_path(&output.stdout, &request.tree) else {
            warn!("Build succeeded but no tarball was reported");
            return Ok(failed());
        };

        let artifact = request.output_dir.join(format!("{}.tar.gz", request.commit));
        fs::rename(&tarball, &artifact)
            .or_else(|_| fs::copy(&tarball, &artifact).map(|_| ()))
            .map_err(|err| PipelineError::io(&tarball, err))?;
        let config = request.output_dir.join(format!("{}.config", request.commit));
        let dot_config = request.tree.join(".config");
        fs::copy(&dot_config, &config).map_err(|err| PipelineError::io(&dot_config, err))?;

        let kernel_release = self.kernel_release(request, &log)?;
        info!(artifact = %artifact.display(), release = ?kernel_release, "Kernel built");
        Ok(BuildResult {
            commit: request.commit.clone(),
            succeeded: true,
            artifact: Some(artifact),
            config: Some(config),
            kernel_release,
            arch,
            log,
        })
    }
}

fn first_match(tree: &Path, pattern: &str) -> Result<PathBuf> {
    let full = tree.join(pattern);
    let full = full.to_string_lossy();
    let mut matches: Vec<PathBuf> = glob(&full)
        .map_err(|err| PipelineError::Config(format!("invalid config glob {pattern}: {err}")))?
        .filter_map(|entry| entry.ok())
        .collect();
    matches.sort();
    matches
        .into_iter()
        .next()
        .ok_or_else(|| PipelineError::Config(format!("no generated config matched {pattern}")))
}

fn tarball_path(stdout: &str, tree: &Path) -> Option<PathBuf> {
    stdout.lines().find_map(|line| {
        let (_, rest) = line.split_once(TARBALL_MARKER)?;
        let path = PathBuf::from(rest.trim());
        Some(if path.is_absolute() { path } else { tree.join(path) })
    })
}

/// `6.6.0-rc1+` and friends: three dot-separated numbers up front.
fn looks_like_release(line: &str) -> bool {
    let mut parts = line.splitn(3, '.');
    let numeric = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit());
    match (parts.next(), parts.next(), parts.next()) {
        (Some(major), Some(minor), Some(rest)) => {
            let patch: String = rest.chars().take_while(char::is_ascii_digit).collect();
            numeric(major) && numeric(minor) && !patch.is_empty()
        }
        _ => false,
    }
}
