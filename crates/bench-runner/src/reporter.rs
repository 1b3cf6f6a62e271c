use anyhow::{Context, Result};
use bench_core::{
    atomic_write_bytes, atomic_write_json_pretty, campaign_paths, ensure_dir, run_dir_name,
    sha256_file, sortable_timestamp, BenchmarkDefinition, CampaignPaths, CampaignSummary,
    ExecutionOutcome, FlagValidationMode, OutcomeStatus, ProgressEvent,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;

const RULE: &str = "============================================================";

/// One row of `events.jsonl`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CampaignEvent<'a> {
    CampaignStart {
        ts: DateTime<Utc>,
        total: usize,
        timeout_seconds: u64,
        mode: FlagValidationMode,
        resume: bool,
    },
    BenchmarkStart {
        ts: DateTime<Utc>,
        benchmark_id: &'a str,
        index: usize,
        total: usize,
    },
    Progress {
        ts: DateTime<Utc>,
        benchmark_id: &'a str,
        progress: &'a ProgressEvent,
    },
    BenchmarkResult {
        ts: DateTime<Utc>,
        outcome: &'a ExecutionOutcome,
        #[serde(skip_serializing_if = "Option::is_none")]
        transcript_sha256: Option<String>,
    },
    Interrupted {
        ts: DateTime<Utc>,
        #[serde(skip_serializing_if = "Option::is_none")]
        benchmark_id: Option<&'a str>,
        recorded: usize,
    },
    CampaignEnd {
        ts: DateTime<Utc>,
        total: usize,
        successful: usize,
        interrupted: bool,
    },
}

/// Owns one campaign's log directory.
pub struct Reporter {
    paths: CampaignPaths,
    events: BufWriter<File>,
}

impl Reporter {
    /// Creates `<output_dir>/benchmark_run_<timestamp>/` and its
    /// transcript directory.
    pub fn create(output_dir: &Path, started_at: &DateTime<Utc>) -> Result<Self> {
        let run_dir = output_dir.join(run_dir_name(started_at));
        let paths = campaign_paths(&run_dir);
        ensure_dir(&paths.transcripts_dir)
            .with_context(|| format!("failed to create {}", paths.transcripts_dir.display()))?;
        let events = open_append(&paths.events)?;
        info!(run_dir = %run_dir.display(), "campaign log directory ready");
        println!("\nLogs directory: {}\n", run_dir.display());
        Ok(Self { paths, events })
    }

    pub fn run_dir(&self) -> &Path {
        &self.paths.run_dir
    }

    pub fn paths(&self) -> &CampaignPaths {
        &self.paths
    }

    pub fn transcript_path(&self, benchmark_id: &str) -> PathBuf {
        self.paths.transcript(benchmark_id)
    }

    /// Appends and flushes one event so a crash loses at most the row
    /// being written.
    pub fn append_event(&mut self, event: &CampaignEvent<'_>) -> Result<()> {
        append_row(&mut self.events, event)?;
        self.events.flush()?;
        Ok(())
    }

    pub fn log_campaign_start(
        &mut self,
        total: usize,
        timeout_seconds: u64,
        mode: FlagValidationMode,
        resume: bool,
    ) -> Result<()> {
        println!("Starting benchmark run: {} benchmarks", total);
        println!("Timeout: {}s per benchmark", timeout_seconds);
        println!("Flag validation: {}", mode.as_str());
        println!("{}", RULE);
        self.append_event(&CampaignEvent::CampaignStart {
            ts: Utc::now(),
            total,
            timeout_seconds,
            mode,
            resume,
        })
    }

    pub fn log_start(
        &mut self,
        definition: &BenchmarkDefinition,
        index: usize,
        total: usize,
    ) -> Result<()> {
        println!("\n[{}/{}] {}", index, total, definition.id);
        self.append_event(&CampaignEvent::BenchmarkStart {
            ts: Utc::now(),
            benchmark_id: &definition.id,
            index,
            total,
        })
    }

    pub fn log_progress(&mut self, benchmark_id: &str, progress: &ProgressEvent) -> Result<()> {
        self.append_event(&CampaignEvent::Progress {
            ts: Utc::now(),
            benchmark_id,
            progress,
        })
    }

    pub fn log_result(&mut self, outcome: &ExecutionOutcome) -> Result<()> {
        let transcript = self.transcript_path(&outcome.benchmark_id);
        let transcript_sha256 = if transcript.is_file() {
            sha256_file(&transcript).ok()
        } else {
            None
        };
        println!("{}", result_line(outcome));
        self.append_event(&CampaignEvent::BenchmarkResult {
            ts: Utc::now(),
            outcome,
            transcript_sha256,
        })
    }

    pub fn log_interrupted(&mut self, benchmark_id: Option<&str>, recorded: usize) -> Result<()> {
        println!("\n\nInterrupt received. Cleaning up...");
        self.append_event(&CampaignEvent::Interrupted {
            ts: Utc::now(),
            benchmark_id,
            recorded,
        })
    }

    /// Writes `summary.json` and `summary.txt`, records the campaign end
    /// and prints the console summary.
    pub fn write_summary(&mut self, summary: &CampaignSummary) -> Result<()> {
        atomic_write_json_pretty(&self.paths.summary_json, summary)?;
        let text = render_summary_text(summary, &self.paths.run_dir);
        atomic_write_bytes(&self.paths.summary_text, text.as_bytes())?;
        self.append_event(&CampaignEvent::CampaignEnd {
            ts: Utc::now(),
            total: summary.total_benchmarks,
            successful: summary.successful,
            interrupted: summary.interrupted,
        })?;
        print_console_summary(summary, &self.paths.run_dir);
        Ok(())
    }
}

fn open_append(path: &Path) -> Result<BufWriter<File>> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    Ok(BufWriter::new(file))
}

fn append_row<T: Serialize>(writer: &mut BufWriter<File>, row: &T) -> Result<()> {
    serde_json::to_writer(&mut *writer, row)?;
    writer.write_all(b"\n")?;
    Ok(())
}

/// `3m 12s`; fractional seconds are truncated.
pub fn format_duration(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    format!("{}m {}s", total / 60, total % 60)
}

fn status_symbol(outcome: &ExecutionOutcome) -> &'static str {
    match outcome.status {
        OutcomeStatus::Success => "✓",
        OutcomeStatus::Timeout => "⏱",
        OutcomeStatus::Failure | OutcomeStatus::Error => "✗",
    }
}

/// One-line console result, e.g. `  ✓ SUCCESS (3m 12s, $0.42)`.
pub fn result_line(outcome: &ExecutionOutcome) -> String {
    let mut line = format!(
        "  {} {} ({}, ${:.2})",
        status_symbol(outcome),
        outcome.status,
        format_duration(outcome.duration_seconds),
        outcome.cost_usd
    );
    if let Some(err) = &outcome.error_message {
        line.push_str(&format!("\n    Error: {}", err));
    }
    line
}

pub fn render_summary_text(summary: &CampaignSummary, run_dir: &Path) -> String {
    let mut lines = vec![
        RULE.to_string(),
        "Benchmark Campaign Results".to_string(),
        RULE.to_string(),
        format!("Run Date: {}", summary.campaign_start),
        format!("Finished: {}", summary.campaign_end),
    ];
    let total_secs = summary.total_duration_seconds.max(0.0) as u64;
    lines.push(format!(
        "Duration: {}h {}m",
        total_secs / 3600,
        (total_secs % 3600) / 60
    ));
    if summary.interrupted {
        lines.push("Status: INTERRUPTED (partial results)".to_string());
    }
    lines.push(String::new());

    lines.push(format!("Total Benchmarks: {}", summary.total_benchmarks));
    lines.push(format!(
        "Successful: {} ({:.1}%)",
        summary.successful, summary.success_rate
    ));
    lines.push(format!("Failed: {}", summary.failed));
    lines.push(format!("Timeout: {}", summary.timeout));
    lines.push(format!("Errors: {}", summary.error));
    lines.push(String::new());

    lines.push("Cost Analysis:".to_string());
    lines.push(format!("  Total Cost: ${:.2}", summary.total_cost_usd));
    lines.push(format!("  Average Cost: ${:.2}", summary.average_cost_usd));
    lines.push(String::new());

    lines.push("Time Analysis:".to_string());
    lines.push(format!(
        "  Average Duration: {}",
        format_duration(summary.average_duration_seconds)
    ));
    lines.push(String::new());

    push_section(
        &mut lines,
        "Success Details",
        summary.with_status(OutcomeStatus::Success).map(|r| {
            format!(
                "  ✓ {} ({}, ${:.2})",
                r.benchmark_id,
                format_duration(r.duration_seconds),
                r.cost_usd
            )
        }),
    );
    push_section(
        &mut lines,
        "Failure Details",
        summary.with_status(OutcomeStatus::Failure).map(|r| {
            let reason = match (&r.error_message, r.found_flags.is_empty()) {
                (Some(msg), _) => msg.clone(),
                (None, true) => "No flags found".to_string(),
                (None, false) => "Incorrect flag".to_string(),
            };
            format!("  ✗ {}: {}", r.benchmark_id, reason)
        }),
    );
    push_section(
        &mut lines,
        "Timeout Details",
        summary.with_status(OutcomeStatus::Timeout).map(|r| {
            format!(
                "  ⏱ {}: Timeout after {}m",
                r.benchmark_id,
                (r.duration_seconds.max(0.0) as u64) / 60
            )
        }),
    );
    push_section(
        &mut lines,
        "Error Details",
        summary.with_status(OutcomeStatus::Error).map(|r| {
            format!(
                "  ✗ {}: {}",
                r.benchmark_id,
                r.error_message.as_deref().unwrap_or("Unknown error")
            )
        }),
    );

    lines.push(RULE.to_string());
    lines.push(format!("Detailed logs: {}", run_dir.display()));
    lines.push(RULE.to_string());
    lines.join("\n") + "\n"
}

fn push_section(lines: &mut Vec<String>, title: &str, rows: impl Iterator<Item = String>) {
    let rows: Vec<String> = rows.collect();
    if rows.is_empty() {
        return;
    }
    lines.push(format!("{}:", title));
    lines.extend(rows);
    lines.push(String::new());
}

fn print_console_summary(summary: &CampaignSummary, run_dir: &Path) {
    println!("\n{}", RULE);
    if summary.interrupted {
        println!("BENCHMARK RUN INTERRUPTED");
    } else {
        println!("BENCHMARK RUN COMPLETE");
    }
    println!("{}", RULE);
    println!("Total: {}", summary.total_benchmarks);
    println!(
        "Success: {} ({:.1}%)",
        summary.successful, summary.success_rate
    );
    println!("Failed: {}", summary.failed);
    println!("Timeout: {}", summary.timeout);
    println!("Errors: {}", summary.error);
    println!("Total Cost: ${:.2}", summary.total_cost_usd);
    println!(
        "Total Time: {:.2}h",
        summary.total_duration_seconds / 3600.0
    );
    println!("Ended: {}", sortable_timestamp(&summary.end_time));
    println!("\nDetailed results: {}", run_dir.display());
    println!("{}", RULE);
}
