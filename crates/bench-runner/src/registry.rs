use crate::config::NamingConfig;
use anyhow::{anyhow, Result};
use bench_core::{
    BenchmarkDefinition, BENCHMARK_ENV_FILE, BENCHMARK_FLAG_KEY, BENCHMARK_METADATA_FILE,
};
use bench_schemas::{compile_schema, validate_value, BENCHMARK_METADATA_SCHEMA};
use jsonschema::JSONSchema;
use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Why a candidate directory was left out of the catalog.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("missing {0}")]
    MissingFile(&'static str),
    #[error("failed to read {file}: {source}")]
    Read {
        file: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid benchmark.json: {0}")]
    InvalidMetadata(String),
    #[error("no non-empty FLAG= line in .env")]
    MissingFlag,
}

#[derive(Debug, Clone)]
pub struct Registry {
    root: PathBuf,
    benchmarks: BTreeMap<String, BenchmarkDefinition>,
}

impl Registry {
    /// Scans the immediate subdirectories of `root`. Individual entries that
    /// fail validation are skipped with a warning; only an unreadable `root`
    /// is an error.
    pub fn load(root: &Path, naming: &NamingConfig) -> Result<Self> {
        if !root.is_dir() {
            return Err(anyhow!(
                "benchmarks directory not found: {}",
                root.display()
            ));
        }
        fs::read_dir(root)
            .map_err(|e| anyhow!("failed to read benchmarks directory {}: {}", root.display(), e))?;

        let candidates = discover_candidates(root, naming)?;
        let schema = compile_schema(BENCHMARK_METADATA_SCHEMA)?;
        let mut benchmarks = BTreeMap::new();
        for (id, path) in candidates {
            match load_definition(&id, &path, &schema) {
                Ok(def) => {
                    debug!(benchmark_id = %id, level = def.level, "registered benchmark");
                    benchmarks.insert(id, def);
                }
                Err(err) => {
                    warn!(benchmark_id = %id, reason = %err, "skipping benchmark");
                }
            }
        }
        Ok(Self {
            root: root.to_path_buf(),
            benchmarks,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn catalog(&self) -> &BTreeMap<String, BenchmarkDefinition> {
        &self.benchmarks
    }

    pub fn len(&self) -> usize {
        self.benchmarks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.benchmarks.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&BenchmarkDefinition> {
        self.benchmarks.get(id)
    }

    /// Benchmarks carrying any of `tags` and sitting at any of `levels`.
    /// An empty criterion matches everything.
    pub fn filter(&self, tags: &[String], levels: &[u32]) -> Vec<&BenchmarkDefinition> {
        self.benchmarks
            .values()
            .filter(|def| tags.is_empty() || def.tags.iter().any(|t| tags.contains(t)))
            .filter(|def| levels.is_empty() || levels.contains(&def.level))
            .collect()
    }

    pub fn all_tags(&self) -> BTreeSet<String> {
        self.benchmarks
            .values()
            .flat_map(|def| def.tags.iter().cloned())
            .collect()
    }
}

/// Phase one: directory names matching the naming convention.
fn discover_candidates(root: &Path, naming: &NamingConfig) -> Result<Vec<(String, PathBuf)>> {
    let id_re = Regex::new(&naming.id_pattern())
        .map_err(|e| anyhow!("invalid benchmark naming convention: {}", e))?;
    let mut out = Vec::new();
    for entry in WalkDir::new(root).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(error = %err, "unreadable entry in benchmarks directory");
                continue;
            }
        };
        if !entry.file_type().is_dir() {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        if id_re.is_match(name) {
            out.push((name.to_string(), entry.path().to_path_buf()));
        }
    }
    Ok(out)
}

/// Phase two: metadata, flag, and construction.
fn load_definition(
    id: &str,
    path: &Path,
    schema: &JSONSchema,
) -> Result<BenchmarkDefinition, RegistryError> {
    let metadata_path = path.join(BENCHMARK_METADATA_FILE);
    if !metadata_path.is_file() {
        return Err(RegistryError::MissingFile(BENCHMARK_METADATA_FILE));
    }
    let env_path = path.join(BENCHMARK_ENV_FILE);
    if !env_path.is_file() {
        return Err(RegistryError::MissingFile(BENCHMARK_ENV_FILE));
    }

    let raw = fs::read_to_string(&metadata_path).map_err(|source| RegistryError::Read {
        file: BENCHMARK_METADATA_FILE,
        source,
    })?;
    let metadata: Value =
        serde_json::from_str(&raw).map_err(|e| RegistryError::InvalidMetadata(e.to_string()))?;
    validate_value(schema, &metadata).map_err(|e| RegistryError::InvalidMetadata(e.to_string()))?;

    // Missing name falls back to the directory id, missing level to 1.
    let name = match metadata.get("name") {
        None => id.to_string(),
        Some(v) => match v.as_str() {
            Some(s) if s.trim().is_empty() => id.to_string(),
            Some(s) => s.to_string(),
            None => {
                return Err(RegistryError::InvalidMetadata(
                    "name must be a string".to_string(),
                ))
            }
        },
    };
    let level = match metadata.get("level") {
        None => DEFAULT_LEVEL,
        Some(v) => coerce_level(v).ok_or_else(|| {
            RegistryError::InvalidMetadata("level must be a positive integer".to_string())
        })?,
    };
    let tags = metadata
        .get("tags")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|t| t.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();

    let env_raw = fs::read_to_string(&env_path).map_err(|source| RegistryError::Read {
        file: BENCHMARK_ENV_FILE,
        source,
    })?;
    let expected_flag = parse_flag(&env_raw).ok_or(RegistryError::MissingFlag)?;

    Ok(BenchmarkDefinition {
        id: id.to_string(),
        name,
        level,
        tags,
        path: path.to_path_buf(),
        expected_flag,
    })
}

const DEFAULT_LEVEL: u32 = 1;

fn coerce_level(value: &Value) -> Option<u32> {
    let level = match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse::<u32>().ok(),
        _ => None,
    }?;
    (level >= 1).then_some(level)
}

/// Value of the first `FLAG=` line, trimmed and unquoted. Empty is absent.
pub fn parse_flag(env_contents: &str) -> Option<String> {
    let prefix = format!("{}=", BENCHMARK_FLAG_KEY);
    let line = env_contents
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with(&prefix))?;
    let value = line[prefix.len()..]
        .trim()
        .trim_matches('"')
        .trim_matches('\'');
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}
