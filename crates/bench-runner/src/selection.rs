use crate::config::NamingConfig;
use bench_core::{
    BenchmarkDefinition, FlagValidationMode, RUN_DIR_PREFIX, RUN_SUMMARY_JSON_FILE,
};
use bench_schemas::{compile_schema, validate_value, CAMPAIGN_SUMMARY_SCHEMA};
use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SelectionError {
    #[error("invalid range '{0}': use 'A-B' or 'A B' with 1 <= A <= B")]
    InvalidRange(String),
    #[error("range '{spec}' reaches past the highest benchmark ordinal ({max})")]
    RangeOutOfBounds { spec: String, max: u32 },
    #[error("invalid benchmark id '{0}'")]
    InvalidId(String),
    #[error("no benchmark ids given")]
    Empty,
    #[error("no previous benchmark runs with summary.json found in {0}")]
    NoPreviousRun(PathBuf),
    #[error("run directory not found: {0}")]
    RunDirNotFound(PathBuf),
    #[error("summary.json not found in {0}; not a benchmark run directory?")]
    SummaryMissing(PathBuf),
    #[error("failed to parse {path}: {detail}")]
    SummaryInvalid { path: PathBuf, detail: String },
}

/// Which benchmarks a campaign should run, before catalog lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionRequest {
    Range(String),
    Ids(String),
    All,
    /// `None` picks the most recent run directory under the output dir.
    RetryFailed(Option<PathBuf>),
}

/// Read-only description of a campaign once selection has been resolved.
#[derive(Debug, Clone)]
pub struct RunSelection {
    pub benchmark_ids: Vec<String>,
    pub timeout: Duration,
    pub mode: FlagValidationMode,
    pub output_dir: PathBuf,
    pub resume: bool,
}

/// A benchmark that did not succeed in an earlier run.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedBenchmark {
    pub benchmark_id: String,
    pub status: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct RetryPlan {
    pub run_dir: PathBuf,
    pub failed: Vec<FailedBenchmark>,
}

impl RetryPlan {
    /// Sorted, deduplicated identifiers to re-run.
    pub fn benchmark_ids(&self) -> Vec<String> {
        self.failed
            .iter()
            .map(|f| f.benchmark_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Parses `A-B` or `A B` into the inclusive ordinal range.
/// Parses `A-B` or `A B` into ordinals. `B` may not exceed `max_ordinal`.
pub fn parse_range(spec: &str, max_ordinal: u32) -> Result<Vec<u32>, SelectionError> {
    let invalid = || SelectionError::InvalidRange(spec.to_string());
    let normalized = spec.replace('-', " ");
    let parts: Vec<&str> = normalized.split_whitespace().collect();
    if parts.len() != 2 {
        return Err(invalid());
    }
    let start = parts[0].parse::<u32>().map_err(|_| invalid())?;
    let end = parts[1].parse::<u32>().map_err(|_| invalid())?;
    if start < 1 || start > end {
        return Err(invalid());
    }
    if end > max_ordinal {
        return Err(SelectionError::RangeOutOfBounds {
            spec: spec.to_string(),
            max: max_ordinal,
        });
    }
    Ok((start..=end).collect())
}

/// Parses a comma-separated list of ordinals and/or full identifiers,
/// keeping first-seen order.
pub fn parse_ids(spec: &str, naming: &NamingConfig) -> Result<Vec<String>, SelectionError> {
    let id_re = Regex::new(&format!("(?i){}", naming.id_pattern()))
        .map_err(|_| SelectionError::InvalidId(spec.to_string()))?;
    let mut seen = BTreeSet::new();
    let mut ids = Vec::new();
    for raw in spec.split(',') {
        let token = raw.trim();
        if token.is_empty() {
            continue;
        }
        let id = if let Ok(ordinal) = token.parse::<u32>() {
            if ordinal == 0 {
                return Err(SelectionError::InvalidId(token.to_string()));
            }
            naming.format_id(ordinal)
        } else if id_re.is_match(token) {
            token.to_ascii_uppercase()
        } else {
            return Err(SelectionError::InvalidId(token.to_string()));
        };
        if seen.insert(id.clone()) {
            ids.push(id);
        }
    }
    if ids.is_empty() {
        return Err(SelectionError::Empty);
    }
    Ok(ids)
}

/// Turns a request into benchmark identifiers. `All` yields every catalog
/// entry in identifier order.
pub fn request_ids(
    request: &SelectionRequest,
    naming: &NamingConfig,
    catalog: &BTreeMap<String, BenchmarkDefinition>,
    output_dir: &Path,
) -> Result<Vec<String>, SelectionError> {
    match request {
        SelectionRequest::Range(spec) => {
            let max_ordinal = catalog
                .keys()
                .filter_map(|id| naming.ordinal_of(id))
                .max()
                .unwrap_or(0);
            Ok(parse_range(spec, max_ordinal)?
                .into_iter()
                .map(|ordinal| naming.format_id(ordinal))
                .collect())
        }
        SelectionRequest::Ids(spec) => parse_ids(spec, naming),
        SelectionRequest::All => Ok(catalog.keys().cloned().collect()),
        SelectionRequest::RetryFailed(run_dir) => {
            Ok(load_retry_plan(run_dir.as_deref(), output_dir)?.benchmark_ids())
        }
    }
}

/// Splits `ids` into catalog entries (selection order kept) and the ids the
/// catalog does not know.
pub fn resolve_definitions(
    ids: &[String],
    catalog: &BTreeMap<String, BenchmarkDefinition>,
) -> (Vec<BenchmarkDefinition>, Vec<String>) {
    let mut found = Vec::new();
    let mut missing = Vec::new();
    for id in ids {
        match catalog.get(id) {
            Some(def) => found.push(def.clone()),
            None => missing.push(id.clone()),
        }
    }
    (found, missing)
}

/// The lexicographically greatest `benchmark_run_*` directory holding a
/// summary. Directory names embed a sortable timestamp.
pub fn latest_run_dir(output_dir: &Path) -> Result<PathBuf, SelectionError> {
    let entries = fs::read_dir(output_dir)
        .map_err(|_| SelectionError::NoPreviousRun(output_dir.to_path_buf()))?;
    entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .map(|name| name.starts_with(RUN_DIR_PREFIX))
                .unwrap_or(false)
        })
        .map(|entry| entry.path())
        .filter(|path| path.join(RUN_SUMMARY_JSON_FILE).is_file())
        .max()
        .ok_or_else(|| SelectionError::NoPreviousRun(output_dir.to_path_buf()))
}

pub fn load_retry_plan(
    run_dir: Option<&Path>,
    output_dir: &Path,
) -> Result<RetryPlan, SelectionError> {
    let run_dir = match run_dir {
        Some(dir) => {
            if !dir.is_dir() {
                return Err(SelectionError::RunDirNotFound(dir.to_path_buf()));
            }
            dir.to_path_buf()
        }
        None => latest_run_dir(output_dir)?,
    };
    let failed = load_failed_benchmarks(&run_dir)?;
    Ok(RetryPlan { run_dir, failed })
}

/// Outcomes with `success == false` from a run's summary, in file order.
pub fn load_failed_benchmarks(run_dir: &Path) -> Result<Vec<FailedBenchmark>, SelectionError> {
    let path = run_dir.join(RUN_SUMMARY_JSON_FILE);
    if !path.is_file() {
        return Err(SelectionError::SummaryMissing(run_dir.to_path_buf()));
    }
    let invalid = |detail: String| SelectionError::SummaryInvalid {
        path: path.clone(),
        detail,
    };
    let raw = fs::read_to_string(&path).map_err(|e| invalid(e.to_string()))?;
    let value: Value = serde_json::from_str(&raw).map_err(|e| invalid(e.to_string()))?;
    let schema = compile_schema(CAMPAIGN_SUMMARY_SCHEMA).map_err(|e| invalid(e.to_string()))?;
    validate_value(&schema, &value).map_err(|e| invalid(e.to_string()))?;

    let results = value
        .get("results")
        .and_then(|v| v.as_array())
        .ok_or_else(|| invalid("missing results".to_string()))?;
    Ok(results
        .iter()
        .filter(|r| !r.get("success").and_then(|v| v.as_bool()).unwrap_or(false))
        .map(|r| FailedBenchmark {
            benchmark_id: r
                .get("benchmark_id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            status: r
                .get("status")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            reason: failure_reason(r),
        })
        .collect())
}

/// Human-readable cause for a non-successful outcome record.
pub fn failure_reason(result: &Value) -> String {
    let status = result.get("status").and_then(|v| v.as_str()).unwrap_or("");
    match status {
        "TIMEOUT" => {
            let secs = result
                .get("duration_seconds")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0);
            format!("timeout after {}m", (secs / 60.0) as u64)
        }
        "ERROR" => result
            .get("error_message")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .unwrap_or("unknown error")
            .to_string(),
        "FAILURE" => {
            let found_any = result
                .get("found_flags")
                .and_then(|v| v.as_array())
                .map(|flags| !flags.is_empty())
                .unwrap_or(false);
            if found_any {
                "incorrect flag".to_string()
            } else {
                "no flags found".to_string()
            }
        }
        _ => "unknown".to_string(),
    }
}
