use crate::process::CommandSpec;
use anyhow::{anyhow, Context, Result};
use bench_core::{DEFAULT_ID_PREFIX, DEFAULT_ID_SUFFIX, DEFAULT_ID_WIDTH, STATE_FILE_NAME};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_BENCHMARKS_DIR: &str = "BENCHLAB_BENCHMARKS_DIR";
pub const ENV_OUTPUT_DIR: &str = "BENCHLAB_OUTPUT_DIR";
pub const ENV_TIMEOUT_SECONDS: &str = "BENCHLAB_TIMEOUT_SECONDS";
pub const ENV_PROGRESS_QUEUE_CAPACITY: &str = "BENCHLAB_PROGRESS_QUEUE_CAPACITY";

pub const DEFAULT_TIMEOUT_SECONDS: u64 = 900;
pub const DEFAULT_OUTPUT_DIR: &str = "logs";
pub const DEFAULT_TARGET_HOST: &str = "host.docker.internal";

/// Checked in order when no benchmarks directory is configured.
pub const BENCHMARKS_DIR_CANDIDATES: &[&str] = &[
    "../xbow-validation-benchmarks/benchmarks",
    "../xbow-benchmarks/benchmarks",
    "../../xbow-benchmarks/benchmarks",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NamingConfig {
    pub prefix: String,
    pub suffix: String,
    pub width: usize,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_ID_PREFIX.to_string(),
            suffix: DEFAULT_ID_SUFFIX.to_string(),
            width: DEFAULT_ID_WIDTH,
        }
    }
}

impl NamingConfig {
    pub fn format_id(&self, ordinal: u32) -> String {
        bench_core::format_benchmark_id(&self.prefix, ordinal, self.width, &self.suffix)
    }

    /// Inverse of `format_id`; `None` for ids outside this convention.
    pub fn ordinal_of(&self, id: &str) -> Option<u32> {
        let digits = id
            .strip_prefix(self.prefix.as_str())?
            .strip_prefix('-')?
            .strip_suffix(self.suffix.as_str())?
            .strip_suffix('-')?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }

    /// Pattern matching directory names such as `XBEN-001-24`.
    pub fn id_pattern(&self) -> String {
        format!(
            "^{}-[0-9]{{{},}}-{}$",
            regex::escape(&self.prefix),
            self.width.max(1),
            regex::escape(&self.suffix)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    /// Program and arguments; `{target}`, `{benchmark_id}`, `{timeout}`,
    /// `{transcript}` and `{model}` are substituted per invocation.
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub model: Option<String>,
    pub model_aliases: BTreeMap<String, String>,
    /// Extra time past the deadline before the orchestrator force-stops
    /// an agent that ignored it.
    pub stop_grace_seconds: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let model_aliases = [
            ("opus", "claude-opus-4-5-20251101"),
            ("sonnet", "claude-sonnet-4-5-20250929"),
            ("haiku", "claude-haiku-4-5-20251001"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        Self {
            command: ["pentestgpt", "--target", "{target}", "--non-interactive", "--model", "{model}"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            env: BTreeMap::new(),
            model: None,
            model_aliases,
            stop_grace_seconds: 10,
        }
    }
}

impl AgentConfig {
    /// Maps a friendly alias (case-insensitive) to its full identifier;
    /// anything else passes through unchanged.
    pub fn resolve_model(&self, model: &str) -> String {
        self.model_aliases
            .get(&model.to_ascii_lowercase())
            .cloned()
            .unwrap_or_else(|| model.to_string())
    }

    pub fn resolved_model(&self) -> Option<String> {
        self.model.as_deref().map(|m| self.resolve_model(m))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EnvironmentConfig {
    pub build: CommandSpec,
    pub up: CommandSpec,
    pub ports: CommandSpec,
    pub down: CommandSpec,
    pub build_timeout_seconds: u64,
    pub up_timeout_seconds: u64,
    pub ports_timeout_seconds: u64,
    pub down_timeout_seconds: u64,
    pub target_host: String,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            build: CommandSpec::new("make", &["build"]),
            up: CommandSpec::new("docker", &["compose", "up", "-d", "--wait"]),
            ports: CommandSpec::new("docker", &["compose", "ps", "--format", "{{.Ports}}"]),
            down: CommandSpec::new("docker", &["compose", "down", "--remove-orphans"]),
            build_timeout_seconds: 300,
            up_timeout_seconds: 120,
            ports_timeout_seconds: 30,
            down_timeout_seconds: 60,
            target_host: DEFAULT_TARGET_HOST.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProgressConfig {
    pub queue_capacity: usize,
    pub poll_interval_ms: u64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            poll_interval_ms: 50,
        }
    }
}

impl ProgressConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CampaignConfig {
    pub benchmarks_dir: Option<PathBuf>,
    pub output_dir: PathBuf,
    pub state_file: Option<PathBuf>,
    pub timeout_seconds: u64,
    pub naming: NamingConfig,
    pub agent: AgentConfig,
    pub environment: EnvironmentConfig,
    pub progress: ProgressConfig,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            benchmarks_dir: None,
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            state_file: None,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            naming: NamingConfig::default(),
            agent: AgentConfig::default(),
            environment: EnvironmentConfig::default(),
            progress: ProgressConfig::default(),
        }
    }
}

impl CampaignConfig {
    /// Defaults, overlaid by the YAML file when given, then by environment
    /// variables. CLI flags are applied by the caller afterwards.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_yaml_str(&raw).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(dir) = parse_optional_path_env(ENV_BENCHMARKS_DIR)? {
            self.benchmarks_dir = Some(dir);
        }
        if let Some(dir) = parse_optional_path_env(ENV_OUTPUT_DIR)? {
            self.output_dir = dir;
        }
        if let Some(secs) = parse_optional_positive_u64_env(ENV_TIMEOUT_SECONDS)? {
            self.timeout_seconds = secs;
        }
        if let Some(cap) = parse_optional_positive_u64_env(ENV_PROGRESS_QUEUE_CAPACITY)? {
            self.progress.queue_capacity = cap as usize;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout_seconds == 0 {
            return Err(anyhow!("timeout_seconds must be > 0"));
        }
        if self.progress.queue_capacity == 0 {
            return Err(anyhow!("progress.queue_capacity must be > 0"));
        }
        if self.agent.command.is_empty() || self.agent.command[0].trim().is_empty() {
            return Err(anyhow!("agent.command must name a program"));
        }
        if self.naming.prefix.is_empty() || self.naming.suffix.is_empty() {
            return Err(anyhow!("naming.prefix and naming.suffix must be non-empty"));
        }
        for (label, spec) in [
            ("build", &self.environment.build),
            ("up", &self.environment.up),
            ("ports", &self.environment.ports),
            ("down", &self.environment.down),
        ] {
            if spec.program.trim().is_empty() {
                return Err(anyhow!("environment.{}.program must be non-empty", label));
            }
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn state_file_path(&self) -> PathBuf {
        self.state_file
            .clone()
            .unwrap_or_else(|| self.output_dir.join(STATE_FILE_NAME))
    }

    /// The configured benchmarks directory, or the first existing
    /// well-known candidate relative to `cwd`.
    pub fn resolve_benchmarks_dir(&self, cwd: &Path) -> Result<PathBuf> {
        if let Some(dir) = &self.benchmarks_dir {
            return Ok(dir.clone());
        }
        BENCHMARKS_DIR_CANDIDATES
            .iter()
            .map(|candidate| cwd.join(candidate))
            .find(|candidate| candidate.is_dir())
            .ok_or_else(|| {
                anyhow!(
                    "no benchmarks directory configured and none of [{}] exist; pass --benchmarks-dir or set {}",
                    BENCHMARKS_DIR_CANDIDATES.join(", "),
                    ENV_BENCHMARKS_DIR
                )
            })
    }
}

fn parse_optional_positive_u64_env(name: &str) -> Result<Option<u64>> {
    match env::var(name) {
        Ok(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            let parsed = trimmed.parse::<u64>().map_err(|_| {
                anyhow!(
                    "{} must be a positive integer when set (got: {})",
                    name,
                    raw
                )
            })?;
            if parsed == 0 {
                return Err(anyhow!("{} must be > 0 when set", name));
            }
            Ok(Some(parsed))
        }
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(anyhow!("failed reading {}: {}", name, err)),
    }
}

fn parse_optional_path_env(name: &str) -> Result<Option<PathBuf>> {
    match env::var(name) {
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => Ok(Some(PathBuf::from(raw.trim()))),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(anyhow!("failed reading {}: {}", name, err)),
    }
}
