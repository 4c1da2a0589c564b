//! Cross-invocation workflow state.
//!
//! Each stage owns one namespace in the record. A later stage reads the keys
//! an earlier one wrote and never re-derives them. The record is YAML so it
//! can be inspected, copied and branched by hand.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::pipeline::StageKind;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StateValue {
    Bool(bool),
    Integer(i64),
    Text(String),
    List(Vec<String>),
}

impl StateValue {
    pub fn as_text(&self) -> String {
        match self {
            Self::Bool(b) => b.to_string(),
            Self::Integer(n) => n.to_string(),
            Self::Text(s) => s.clone(),
            Self::List(items) => items.join(" "),
        }
    }

    pub fn as_list(&self) -> Vec<String> {
        match self {
            Self::List(items) => items.clone(),
            other => vec![other.as_text()],
        }
    }
}

impl From<&str> for StateValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for StateValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&String> for StateValue {
    fn from(value: &String) -> Self {
        Self::Text(value.clone())
    }
}

impl From<&Path> for StateValue {
    fn from(value: &Path) -> Self {
        Self::Text(value.to_string_lossy().to_string())
    }
}

impl From<&PathBuf> for StateValue {
    fn from(value: &PathBuf) -> Self {
        Self::from(value.as_path())
    }
}

impl From<i64> for StateValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<bool> for StateValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<Vec<String>> for StateValue {
    fn from(value: Vec<String>) -> Self {
        Self::List(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunHeader {
    pub id: String,
    pub created_at: DateTime<Utc>,
}

pub type Namespace = BTreeMap<String, StateValue>;

/// The persisted record shared by every stage of one workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowState {
    run: RunHeader,
    #[serde(default)]
    stages: BTreeMap<StageKind, Namespace>,
}

impl Default for WorkflowState {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowState {
    pub fn new() -> Self {
        Self {
            run: RunHeader {
                id: uuid::Uuid::new_v4().to_string(),
                created_at: Utc::now(),
            },
            stages: BTreeMap::new(),
        }
    }

    /// Load a record from disk. A missing or empty file yields a fresh record.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(state = %path.display(), "No state record yet, starting a new run");
            return Ok(Self::new());
        }

        let content = fs::read_to_string(path).map_err(|err| PipelineError::CorruptState {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        if content.trim().is_empty() {
            return Ok(Self::new());
        }

        serde_yaml::from_str(&content).map_err(|err| PipelineError::CorruptState {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })
    }

    /// Persist the record. Readers only ever observe a complete file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let yaml = serde_yaml::to_string(self).map_err(|err| PipelineError::CorruptState {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        write_atomic(path, yaml.as_bytes())?;
        debug!(state = %path.display(), run = %self.run.id, "State saved");
        Ok(())
    }

    pub fn run(&self) -> &RunHeader {
        &self.run
    }

    pub fn get(&self, stage: StageKind, key: &str) -> Result<&StateValue> {
        self.stages
            .get(&stage)
            .and_then(|ns| ns.get(key))
            .ok_or_else(|| PipelineError::PrerequisiteNotMet {
                stage,
                key: key.to_string(),
            })
    }

    pub fn get_text(&self, stage: StageKind, key: &str) -> Result<String> {
        self.get(stage, key).map(StateValue::as_text)
    }

    pub fn get_list(&self, stage: StageKind, key: &str) -> Result<Vec<String>> {
        self.get(stage, key).map(StateValue::as_list)
    }

    pub fn get_opt(&self, stage: StageKind, key: &str) -> Option<&StateValue> {
        self.stages.get(&stage).and_then(|ns| ns.get(key))
    }

    pub fn text_opt(&self, stage: StageKind, key: &str) -> Option<String> {
        self.get_opt(stage, key).map(StateValue::as_text)
    }

    pub fn set(&mut self, stage: StageKind, key: &str, value: impl Into<StateValue>) {
        let value = value.into();
        debug!(stage = %stage, key, value = %value.as_text(), "state");
        self.stages
            .entry(stage)
            .or_default()
            .insert(key.to_string(), value);
    }

    pub fn has_stage(&self, stage: StageKind) -> bool {
        self.stages.get(&stage).is_some_and(|ns| !ns.is_empty())
    }

    pub fn namespace(&self, stage: StageKind) -> Option<&Namespace> {
        self.stages.get(&stage)
    }

    pub fn remove_stage(&mut self, stage: StageKind) -> Option<Namespace> {
        self.stages.remove(&stage)
    }

    /// Drop every namespace. The run header is kept.
    pub fn clear(&mut self) {
        self.stages.clear();
    }

    pub fn stage_kinds(&self) -> Vec<StageKind> {
        self.stages.keys().copied().collect()
    }
}

/// Write `bytes` next to `path` and rename the file into place.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).map_err(|err| PipelineError::io(&parent, err))?;

    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("state");
    let tmp = parent.join(format!(
        ".{}.{}.{}.tmp",
        name,
        std::process::id(),
        Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));

    let written = fs::File::create(&tmp).and_then(|mut file| {
        file.write_all(bytes)?;
        file.sync_all()
    });
    if let Err(err) = written {
        let _ = fs::remove_file(&tmp);
        return Err(PipelineError::io(&tmp, err));
    }

    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(PipelineError::io(path, err));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_key_names_upstream_stage() {
        let state = WorkflowState::new();
        match state.get(StageKind::Build, "artifact") {
            Err(PipelineError::PrerequisiteNotMet { stage, key }) => {
                assert_eq!(stage, StageKind::Build);
                assert_eq!(key, "artifact");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn values_round_trip_through_disk() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("state.yaml");

        let mut state = WorkflowState::new();
        state.set(StageKind::Merge, "commit", "0123456789");
        state.set(StageKind::Merge, "commit_date", 1_700_000_000i64);
        state.set(
            StageKind::Merge,
            "patches",
            vec!["a.patch".to_string(), "b.patch".to_string()],
        );
        state.set(StageKind::Run, "wait", true);
        state.save(&path).unwrap();

        let loaded = WorkflowState::load(&path).unwrap();
        assert_eq!(loaded, state);
        assert_eq!(
            loaded.get_text(StageKind::Merge, "commit").unwrap(),
            "0123456789"
        );
        assert_eq!(
            loaded.get_list(StageKind::Merge, "patches").unwrap(),
            vec!["a.patch", "b.patch"]
        );
    }

    #[test]
    fn unparseable_record_is_corrupt() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("state.yaml");
        fs::write(&path, "run: [unterminated").unwrap();

        let err = WorkflowState::load(&path).unwrap_err();
        assert!(matches!(err, PipelineError::CorruptState { .. }), "{err}");
    }

    #[test]
    fn atomic_save_leaves_no_temporary_files() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("state.yaml");
        let mut state = WorkflowState::new();
        state.set(StageKind::Merge, "uid", "baseline-0000");
        state.save(&path).unwrap();
        state.set(StageKind::Build, "status", "ok");
        state.save(&path).unwrap();

        let names: Vec<_> = fs::read_dir(temp.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["state.yaml".to_string()]);
    }
}
