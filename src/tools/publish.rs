use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::Path;

use sha2::{Digest, Sha256};
use tracing::info;

use super::Publisher;
use super::process::Invocation;
use crate::error::{PipelineError, Result};
use crate::pipeline::StageKind;

/// Copies artifacts into a local directory, typically one served over HTTP.
#[derive(Debug, Default, Clone, Copy)]
pub struct CopyPublisher;

/// Copies artifacts to `host:path` with `scp`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScpPublisher;

impl Publisher for CopyPublisher {
    fn publish(&mut self, artifact: &Path, destination: &str, url_prefix: &str) -> Result<String> {
        let name = file_name(artifact)?;
        let dir = Path::new(destination);
        fs::create_dir_all(dir).map_err(|err| PipelineError::io(dir, err))?;
        let target = dir.join(name);
        fs::copy(artifact, &target).map_err(|err| PipelineError::io(artifact, err))?;
        info!(artifact = %artifact.display(), copy = %target.display(), "Published");
        public_url(artifact, destination, url_prefix)
    }
}

impl Publisher for ScpPublisher {
    fn publish(&mut self, artifact: &Path, destination: &str, url_prefix: &str) -> Result<String> {
        let target = format!("{}/", destination.trim_end_matches('/'));
        let output = Invocation::new(StageKind::Publish, "scp")
            .args(["-q", "-B"])
            .arg(artifact.to_string_lossy())
            .arg(&target)
            .run()?;
        if !output.succeeded() {
            return Err(PipelineError::environment(
                StageKind::Publish,
                format!(
                    "scp of {} to {target} failed: {}",
                    artifact.display(),
                    output.describe_failure()
                ),
            ));
        }
        info!(artifact = %artifact.display(), remote = %target, "Published");
        public_url(artifact, destination, url_prefix)
    }
}

/// `<prefix>/<file name>`, falling back to the destination when no prefix is
/// configured. Depends only on its inputs.
pub fn public_url(artifact: &Path, destination: &str, url_prefix: &str) -> Result<String> {
    let base = if url_prefix.is_empty() {
        destination
    } else {
        url_prefix
    };
    Ok(format!("{}/{}", base.trim_end_matches('/'), file_name(artifact)?))
}

fn file_name(path: &Path) -> Result<&str> {
    path.file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| PipelineError::Config(format!("{} has no file name", path.display())))
}

pub fn compute_sha256(path: &Path) -> Result<String> {
    let file = File::open(path).map_err(|err| PipelineError::io(path, err))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let read = reader
            .read(&mut buffer)
            .map_err(|err| PipelineError::io(path, err))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}
