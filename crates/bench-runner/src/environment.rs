use crate::config::EnvironmentConfig;
use crate::process::{run_bounded, BoundedOutput, CommandSpec};
use bench_core::{BenchmarkDefinition, BENCHMARK_COMPOSE_FILE};
use regex::Regex;
use std::fmt;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{info, warn};

static PORT_REGEX: OnceLock<Regex> = OnceLock::new();

fn port_regex() -> &'static Regex {
    PORT_REGEX.get_or_init(|| Regex::new(r"0\.0\.0\.0:(\d+)->").expect("regex for port mapping"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartReport {
    pub success: bool,
    pub endpoint: Option<Endpoint>,
    pub message: String,
}

impl StartReport {
    fn failed(message: String) -> Self {
        Self {
            success: false,
            endpoint: None,
            message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopReport {
    pub success: bool,
    pub message: String,
}

/// Brings a benchmark's isolated environment up and down. `stop` must be
/// safe to call whatever `start` returned.
pub trait EnvironmentManager: Send + Sync {
    fn start(&self, definition: &BenchmarkDefinition) -> StartReport;
    fn stop(&self, definition: &BenchmarkDefinition) -> StopReport;
}

/// Drives a compose-style runtime through configured subprocesses.
#[derive(Debug, Clone)]
pub struct ComposeEnvironment {
    config: EnvironmentConfig,
}

impl ComposeEnvironment {
    pub fn new(config: EnvironmentConfig) -> Self {
        Self { config }
    }

    fn run_step(
        &self,
        spec: &CommandSpec,
        cwd: &Path,
        step: &str,
        timeout_seconds: u64,
    ) -> Result<BoundedOutput, String> {
        let output = run_bounded(
            spec.to_command(cwd),
            step,
            Duration::from_secs(timeout_seconds),
        )
        .map_err(|e| e.to_string())?;
        if !output.success() {
            return Err(format!("{} failed: {}", step, output.diagnostic()));
        }
        Ok(output)
    }
}

impl EnvironmentManager for ComposeEnvironment {
    fn start(&self, definition: &BenchmarkDefinition) -> StartReport {
        let path = &definition.path;
        if !path.is_dir() {
            return StartReport::failed(format!("path not found: {}", path.display()));
        }
        if !path.join(BENCHMARK_COMPOSE_FILE).is_file() {
            return StartReport::failed(format!("no {} found", BENCHMARK_COMPOSE_FILE));
        }

        info!(benchmark_id = %definition.id, command = %self.config.build.display(), "building environment");
        if let Err(message) = self.run_step(
            &self.config.build,
            path,
            "build",
            self.config.build_timeout_seconds,
        ) {
            return StartReport::failed(message);
        }

        info!(benchmark_id = %definition.id, "starting environment");
        if let Err(message) =
            self.run_step(&self.config.up, path, "up", self.config.up_timeout_seconds)
        {
            return StartReport::failed(message);
        }

        let ports = match self.run_step(
            &self.config.ports,
            path,
            "port discovery",
            self.config.ports_timeout_seconds,
        ) {
            Ok(output) => output,
            Err(message) => return StartReport::failed(message),
        };
        let Some(port) = parse_exposed_port(&ports.stdout) else {
            return StartReport::failed("failed to detect exposed port".to_string());
        };

        let endpoint = Endpoint {
            host: self.config.target_host.clone(),
            port,
        };
        info!(benchmark_id = %definition.id, endpoint = %endpoint, "environment ready");
        StartReport {
            success: true,
            message: format!("benchmark started at {}", endpoint),
            endpoint: Some(endpoint),
        }
    }

    fn stop(&self, definition: &BenchmarkDefinition) -> StopReport {
        let path = &definition.path;
        if !path.is_dir() {
            let message = format!("path not found: {}", path.display());
            warn!(benchmark_id = %definition.id, %message, "teardown skipped");
            return StopReport {
                success: false,
                message,
            };
        }
        info!(benchmark_id = %definition.id, "stopping environment");
        match self.run_step(
            &self.config.down,
            path,
            "down",
            self.config.down_timeout_seconds,
        ) {
            Ok(_) => StopReport {
                success: true,
                message: "benchmark stopped".to_string(),
            },
            Err(message) => {
                warn!(benchmark_id = %definition.id, %message, "teardown failed");
                StopReport {
                    success: false,
                    message,
                }
            }
        }
    }
}

/// First host port bound on all interfaces, from output such as
/// `0.0.0.0:32768->80/tcp, :::32769->80/tcp`.
pub fn parse_exposed_port(ps_output: &str) -> Option<u16> {
    ps_output.lines().find_map(|line| {
        port_regex()
            .captures(line)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<u16>().ok())
    })
}
