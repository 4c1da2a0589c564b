use std::fs::{self, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::pipeline::StageKind;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out
    }

    pub fn describe_failure(&self) -> String {
        if self.timed_out {
            return "timed out".to_string();
        }
        let code = self
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            format!("exit status {code}")
        } else {
            format!("exit status {code}: {}", last_line(stderr))
        }
    }
}

fn last_line(text: &str) -> &str {
    text.lines().last().unwrap_or(text)
}

/// One external command, run to completion with its output captured.
///
/// A program that cannot be started is an environment error attributed to
/// `stage`. A non-zero exit is not an error; callers decide what it means.
#[derive(Debug, Clone)]
pub struct Invocation {
    stage: StageKind,
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    env: Vec<(String, String)>,
    stdin: Option<String>,
    timeout: Option<Duration>,
    log: Option<PathBuf>,
}

impl Invocation {
    pub fn new(stage: StageKind, program: impl Into<String>) -> Self {
        Self {
            stage,
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            stdin: None,
            timeout: None,
            log: None,
        }
    }

    /// First element is the program, the rest its arguments.
    pub fn from_argv(stage: StageKind, argv: &[String]) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| PipelineError::Config(format!("{stage}: empty command line")))?;
        Ok(Self::new(stage, program.clone()).args(args.iter().cloned()))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Append the command line and its output to `path`.
    pub fn log(mut self, path: impl AsRef<Path>) -> Self {
        self.log = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn run(&self) -> Result<CommandOutput> {
        debug!(stage = %self.stage, command = %self.command_line(), "Running command");
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });
        if let Some(dir) = &self.cwd {
            command.current_dir(dir);
        }
        for (key, value) in &self.env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|err| {
            let reason = if err.kind() == io::ErrorKind::NotFound {
                format!("'{}' is not installed or not on PATH", self.program)
            } else {
                format!("failed to start '{}': {err}", self.program)
            };
            PipelineError::environment(self.stage, reason)
        })?;

        if let (Some(input), Some(mut pipe)) = (&self.stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes()).map_err(|err| {
                PipelineError::environment(
                    self.stage,
                    format!("failed to feed '{}': {err}", self.program),
                )
            })?;
        }

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        let (exit_code, timed_out) = self.wait(&mut child)?;
        let output = CommandOutput {
            exit_code,
            timed_out,
            stdout: stdout.join().unwrap_or_default(),
            stderr: stderr.join().unwrap_or_default(),
        };

        if let Some(path) = &self.log {
            self.append_log(path, &output)?;
        }
        Ok(output)
    }

    fn wait(&self, child: &mut Child) -> Result<(Option<i32>, bool)> {
        let failed = |err: io::Error| {
            PipelineError::environment(
                self.stage,
                format!("failed waiting for '{}': {err}", self.program),
            )
        };
        let Some(timeout) = self.timeout else {
            let status = child.wait().map_err(failed)?;
            return Ok((status.code(), false));
        };

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = child.try_wait().map_err(failed)? {
                return Ok((status.code(), false));
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Ok((None, true));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn append_log(&self, path: &Path, output: &CommandOutput) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|err| PipelineError::io(parent, err))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|err| PipelineError::io(path, err))?;
        let entry = format!(
            "$ {}\n{}{}",
            self.command_line(),
            output.stdout,
            output.stderr
        );
        file.write_all(entry.as_bytes())
            .map_err(|err| PipelineError::io(path, err))
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buffer);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    })
}
