use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use crate::sortable_timestamp;

/// One benchmark directory as loaded by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BenchmarkDefinition {
    pub id: String,
    pub name: String,
    pub level: u32,
    pub tags: Vec<String>,
    pub path: PathBuf,
    pub expected_flag: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeStatus {
    Success,
    Failure,
    Timeout,
    Error,
}

impl OutcomeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OutcomeStatus::Success => "SUCCESS",
            OutcomeStatus::Failure => "FAILURE",
            OutcomeStatus::Timeout => "TIMEOUT",
            OutcomeStatus::Error => "ERROR",
        }
    }
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagValidationMode {
    /// The expected flag (case-folded) must be among the extracted tokens.
    #[default]
    Exact,
    /// Any reported or extracted flag counts.
    AnyFlag,
    /// At least one token must match the strict high-entropy pattern.
    StrictPattern,
}

impl FlagValidationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            FlagValidationMode::Exact => "exact",
            FlagValidationMode::AnyFlag => "any_flag",
            FlagValidationMode::StrictPattern => "strict_pattern",
        }
    }
}

/// Precedence: timeout, then agent-reported error, then flag verdict.
pub fn resolve_status(timed_out: bool, has_error: bool, correct_flag: bool) -> OutcomeStatus {
    if timed_out {
        OutcomeStatus::Timeout
    } else if has_error {
        OutcomeStatus::Error
    } else if correct_flag {
        OutcomeStatus::Success
    } else {
        OutcomeStatus::Failure
    }
}

/// What one agent invocation produced once its transcript has been parsed
/// and validated.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunEvidence {
    pub found_flags: Vec<String>,
    pub correct_flag: bool,
    pub timed_out: bool,
    pub has_error: bool,
    pub cost_usd: f64,
    pub session_id: String,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub benchmark_id: String,
    pub benchmark_name: String,
    pub level: u32,
    pub tags: Vec<String>,
    pub status: OutcomeStatus,
    pub success: bool,
    pub expected_flag: String,
    pub found_flags: Vec<String>,
    pub correct_flag: bool,
    pub duration_seconds: f64,
    pub cost_usd: f64,
    pub session_id: String,
    pub error_message: Option<String>,
    pub timeout_occurred: bool,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl ExecutionOutcome {
    pub fn from_evidence(
        benchmark: &BenchmarkDefinition,
        evidence: RunEvidence,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Self {
        let status = resolve_status(evidence.timed_out, evidence.has_error, evidence.correct_flag);
        let mut found_flags = evidence.found_flags;
        dedup_preserving_order(&mut found_flags);
        Self {
            benchmark_id: benchmark.id.clone(),
            benchmark_name: benchmark.name.clone(),
            level: benchmark.level,
            tags: benchmark.tags.clone(),
            status,
            success: status == OutcomeStatus::Success,
            expected_flag: benchmark.expected_flag.clone(),
            found_flags,
            correct_flag: evidence.correct_flag,
            duration_seconds: elapsed_seconds(&start_time, &end_time),
            cost_usd: evidence.cost_usd,
            session_id: evidence.session_id,
            error_message: evidence.error_message,
            timeout_occurred: evidence.timed_out,
            start_time,
            end_time,
        }
    }

    /// An outcome for a pipeline that never produced a parseable transcript.
    pub fn error(
        benchmark: &BenchmarkDefinition,
        message: impl Into<String>,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Self {
        Self {
            benchmark_id: benchmark.id.clone(),
            benchmark_name: benchmark.name.clone(),
            level: benchmark.level,
            tags: benchmark.tags.clone(),
            status: OutcomeStatus::Error,
            success: false,
            expected_flag: benchmark.expected_flag.clone(),
            found_flags: Vec::new(),
            correct_flag: false,
            duration_seconds: elapsed_seconds(&start_time, &end_time),
            cost_usd: 0.0,
            session_id: String::new(),
            error_message: Some(message.into()),
            timeout_occurred: false,
            start_time,
            end_time,
        }
    }
}

fn elapsed_seconds(start: &DateTime<Utc>, end: &DateTime<Utc>) -> f64 {
    let millis = (*end - *start).num_milliseconds().max(0);
    millis as f64 / 1000.0
}

fn dedup_preserving_order(items: &mut Vec<String>) {
    let mut seen = BTreeSet::new();
    items.retain(|item| seen.insert(item.clone()));
}

/// Durable resume record. An ID present in `completed` is never also
/// reported as `failed`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignState {
    #[serde(default)]
    pub completed: BTreeSet<String>,
    #[serde(default)]
    pub failed: BTreeSet<String>,
}

impl CampaignState {
    pub fn record(&mut self, benchmark_id: &str, success: bool) {
        if success {
            self.completed.insert(benchmark_id.to_string());
            self.failed.remove(benchmark_id);
        } else if !self.completed.contains(benchmark_id) {
            self.failed.insert(benchmark_id.to_string());
        }
    }

    pub fn normalize(&mut self) {
        let completed = &self.completed;
        self.failed.retain(|id| !completed.contains(id));
    }

    pub fn is_completed(&self, benchmark_id: &str) -> bool {
        self.completed.contains(benchmark_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignSummary {
    pub total_benchmarks: usize,
    pub successful: usize,
    pub failed: usize,
    pub timeout: usize,
    pub error: usize,
    pub total_duration_seconds: f64,
    pub average_duration_seconds: f64,
    pub total_cost_usd: f64,
    pub average_cost_usd: f64,
    /// Percentage in `0.0..=100.0`.
    pub success_rate: f64,
    pub campaign_start: String,
    pub campaign_end: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default)]
    pub interrupted: bool,
    pub results: Vec<ExecutionOutcome>,
}

impl CampaignSummary {
    pub fn from_outcomes(
        outcomes: &[ExecutionOutcome],
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        interrupted: bool,
    ) -> Self {
        let count = |status: OutcomeStatus| outcomes.iter().filter(|o| o.status == status).count();
        let total = outcomes.len();
        let total_duration: f64 = outcomes.iter().map(|o| o.duration_seconds).sum();
        let total_cost: f64 = outcomes.iter().map(|o| o.cost_usd).sum();
        let successful = count(OutcomeStatus::Success);
        let average = |sum: f64| if total > 0 { sum / total as f64 } else { 0.0 };
        Self {
            total_benchmarks: total,
            successful,
            failed: count(OutcomeStatus::Failure),
            timeout: count(OutcomeStatus::Timeout),
            error: count(OutcomeStatus::Error),
            total_duration_seconds: total_duration,
            average_duration_seconds: average(total_duration),
            total_cost_usd: total_cost,
            average_cost_usd: average(total_cost),
            success_rate: average(successful as f64) * 100.0,
            campaign_start: sortable_timestamp(&start_time),
            campaign_end: sortable_timestamp(&end_time),
            start_time,
            end_time,
            interrupted,
            results: outcomes.to_vec(),
        }
    }

    pub fn with_status(&self, status: OutcomeStatus) -> impl Iterator<Item = &ExecutionOutcome> {
        self.results.iter().filter(move |o| o.status == status)
    }
}

/// Live progress reported by the agent while it works.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    ToolStart {
        #[serde(default)]
        tool: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    ToolOutput {
        #[serde(default)]
        tool: String,
        #[serde(default)]
        output: String,
    },
}

impl ProgressEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ProgressEvent::ToolStart { .. } => "tool_start",
            ProgressEvent::ToolOutput { .. } => "tool_output",
        }
    }

    pub fn tool(&self) -> &str {
        match self {
            ProgressEvent::ToolStart { tool, .. } | ProgressEvent::ToolOutput { tool, .. } => tool,
        }
    }
}
