use anyhow::{Context, Result};
use bench_core::{atomic_write_json_pretty, CampaignState};
use bench_schemas::{compile_schema, validate_value, CAMPAIGN_STATE_SCHEMA};
use serde_json::Value;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Single-writer store for the resume record. Every mutation is written
/// through to disk before returning.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    state: CampaignState,
}

impl StateStore {
    /// Opens the store at `path`, loading whatever is already there.
    pub fn open(path: &Path) -> Self {
        let mut store = Self {
            path: path.to_path_buf(),
            state: CampaignState::default(),
        };
        store.load();
        store
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> &CampaignState {
        &self.state
    }

    /// Replaces the in-memory state with the file contents. A missing file
    /// is an empty state; an unreadable or corrupt one is logged and treated
    /// as empty.
    pub fn load(&mut self) {
        self.state = match read_state(&self.path) {
            Ok(Some(state)) => state,
            Ok(None) => CampaignState::default(),
            Err(err) => {
                warn!(
                    path = %self.path.display(),
                    error = %format!("{:#}", err),
                    "ignoring unreadable state file"
                );
                CampaignState::default()
            }
        };
        debug!(
            completed = self.state.completed.len(),
            failed = self.state.failed.len(),
            "state loaded"
        );
    }

    pub fn save(&self) -> Result<()> {
        atomic_write_json_pretty(&self.path, &self.state)
            .with_context(|| format!("failed to write state {}", self.path.display()))
    }

    pub fn mark_completed(&mut self, benchmark_id: &str, success: bool) -> Result<()> {
        self.state.record(benchmark_id, success);
        self.save()
    }

    pub fn is_completed(&self, benchmark_id: &str) -> bool {
        self.state.is_completed(benchmark_id)
    }

    /// `ids` minus those already completed, in input order. Failed IDs stay.
    pub fn remaining(&self, ids: &[String]) -> Vec<String> {
        ids.iter()
            .filter(|id| !self.state.is_completed(id))
            .cloned()
            .collect()
    }

    pub fn clear(&mut self) -> Result<()> {
        self.state = CampaignState::default();
        self.save()
    }
}

fn read_state(path: &Path) -> Result<Option<CampaignState>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let value: Value = serde_json::from_str(&raw).context("state file is not valid JSON")?;
    let schema = compile_schema(CAMPAIGN_STATE_SCHEMA)?;
    validate_value(&schema, &value)?;
    let mut state: CampaignState = serde_json::from_value(value)?;
    state.normalize();
    Ok(Some(state))
}
