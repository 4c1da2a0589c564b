//! JUnit XML results, one test case per command run.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use minijinja::{Environment, context};
use serde::Serialize;

use crate::error::{PipelineError, Result};

const JUNIT_TEMPLATE: &str = include_str!("../templates/junit.xml.j2");
/// The `.xml` suffix turns on escaping.
const TEMPLATE_NAME: &str = "junit.xml";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestCase {
    pub name: String,
    pub classname: String,
    /// Seconds.
    pub time: f64,
    pub failure: Option<String>,
    pub stdout: Option<String>,
}

impl TestCase {
    pub fn new(name: impl Into<String>, classname: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            name: name.into(),
            classname: classname.into(),
            time: elapsed.as_secs_f64(),
            failure: None,
            stdout: None,
        }
    }

    pub fn failed(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    pub fn with_stdout(mut self, stdout: impl Into<String>) -> Self {
        self.stdout = Some(stdout.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestSuite {
    pub name: String,
    pub cases: Vec<TestCase>,
}

impl TestSuite {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cases: Vec::new(),
        }
    }

    pub fn push(&mut self, case: TestCase) {
        self.cases.push(case);
    }

    pub fn render(&self) -> Result<String> {
        let mut env = Environment::new();
        env.set_trim_blocks(true);
        env.add_template(TEMPLATE_NAME, JUNIT_TEMPLATE)
            .map_err(|err| PipelineError::Template(err.to_string()))?;
        let failures = self.cases.iter().filter(|case| case.failure.is_some()).count();
        let time: f64 = self.cases.iter().map(|case| case.time).sum();
        env.get_template(TEMPLATE_NAME)
            .and_then(|tmpl| {
                tmpl.render(context! {
                    name => &self.name,
                    cases => &self.cases,
                    failures => failures,
                    time => time,
                })
            })
            .map_err(|err| PipelineError::Template(err.to_string()))
    }

    /// Write `<dir>/<stem>.xml`, creating `dir` when needed.
    pub fn write(&self, dir: &Path, stem: &str) -> Result<PathBuf> {
        fs::create_dir_all(dir).map_err(|err| PipelineError::io(dir, err))?;
        let path = dir.join(format!("{stem}.xml"));
        fs::write(&path, self.render()?).map_err(|err| PipelineError::io(&path, err))?;
        Ok(path)
    }
}
