use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

pub mod model;

pub use model::{
    resolve_status, BenchmarkDefinition, CampaignState, CampaignSummary, ExecutionOutcome,
    FlagValidationMode, OutcomeStatus, ProgressEvent, RunEvidence,
};

pub const BENCHMARK_METADATA_FILE: &str = "benchmark.json";
pub const BENCHMARK_ENV_FILE: &str = ".env";
pub const BENCHMARK_COMPOSE_FILE: &str = "docker-compose.yml";
pub const BENCHMARK_FLAG_KEY: &str = "FLAG";

pub const DEFAULT_ID_PREFIX: &str = "XBEN";
pub const DEFAULT_ID_SUFFIX: &str = "24";
pub const DEFAULT_ID_WIDTH: usize = 3;

pub const STATE_FILE_NAME: &str = "state.json";
pub const RUN_DIR_PREFIX: &str = "benchmark_run_";
pub const RUN_TRANSCRIPTS_DIR: &str = "benchmarks";
pub const RUN_EVENTS_FILE: &str = "events.jsonl";
pub const RUN_SUMMARY_JSON_FILE: &str = "summary.json";
pub const RUN_SUMMARY_TEXT_FILE: &str = "summary.txt";

/// Sortable timestamp layout used in summaries.
pub const SORTABLE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
/// Layout embedded in campaign directory names.
pub const RUN_DIR_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Debug, Clone)]
pub struct CampaignPaths {
    pub run_dir: PathBuf,
    pub transcripts_dir: PathBuf,
    pub events: PathBuf,
    pub summary_json: PathBuf,
    pub summary_text: PathBuf,
}

impl CampaignPaths {
    pub fn transcript(&self, benchmark_id: &str) -> PathBuf {
        self.transcripts_dir.join(format!("{}.log", benchmark_id))
    }
}

pub fn campaign_paths(run_dir: &Path) -> CampaignPaths {
    CampaignPaths {
        run_dir: run_dir.to_path_buf(),
        transcripts_dir: run_dir.join(RUN_TRANSCRIPTS_DIR),
        events: run_dir.join(RUN_EVENTS_FILE),
        summary_json: run_dir.join(RUN_SUMMARY_JSON_FILE),
        summary_text: run_dir.join(RUN_SUMMARY_TEXT_FILE),
    }
}

pub fn run_dir_name(started_at: &DateTime<Utc>) -> String {
    format!(
        "{}{}",
        RUN_DIR_PREFIX,
        started_at.format(RUN_DIR_TIMESTAMP_FORMAT)
    )
}

pub fn sortable_timestamp(at: &DateTime<Utc>) -> String {
    at.format(SORTABLE_TIMESTAMP_FORMAT).to_string()
}

/// Formats a zero-padded benchmark identifier, e.g. `XBEN-007-24`.
pub fn format_benchmark_id(prefix: &str, ordinal: u32, width: usize, suffix: &str) -> String {
    format!(
        "{}-{:0width$}-{}",
        prefix,
        ordinal,
        suffix,
        width = width
    )
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(sha256_bytes(&buf))
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// Writes `bytes` to a hidden sibling of `path` and renames it into place, so
/// readers observe either the previous contents or the new ones, never a
/// partial file.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            ensure_dir(parent)?;
        }
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(err.into());
    }
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn atomic_write_json_pretty<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}
