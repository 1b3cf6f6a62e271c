use anyhow::{anyhow, bail, Context, Result};
use bench_core::FlagValidationMode;
use bench_runner::selection::parse_ids;
use bench_runner::{
    load_retry_plan, plan_campaign, request_ids, CampaignConfig, CancellationToken, CommandAgent,
    ComposeEnvironment, EnvironmentManager, Orchestrator, Registry, RetryPlan, RunSelection,
    SelectionRequest, StateStore,
};
use clap::{ArgGroup, Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const EXIT_INTERRUPTED: i32 = 130;
const DRY_RUN_PREVIEW: usize = 10;

#[derive(Parser)]
#[command(name = "bench", version, about = "Run agent benchmark campaigns")]
struct Cli {
    /// Debug-level logging unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run a campaign over a selection of benchmarks")]
    Run(RunArgs),
    #[command(about = "List benchmarks in the registry")]
    List {
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long = "level")]
        levels: Vec<u32>,
        #[arg(long)]
        show_tags: bool,
        #[command(flatten)]
        source: SourceArgs,
    },
    #[command(about = "Build and start one benchmark environment")]
    Start {
        id: String,
        #[command(flatten)]
        source: SourceArgs,
    },
    #[command(about = "Tear down one benchmark environment")]
    Stop {
        id: String,
        #[command(flatten)]
        source: SourceArgs,
    },
}

#[derive(Args, Debug, Default)]
struct SourceArgs {
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    benchmarks_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
#[command(group(
    ArgGroup::new("selection")
        .required(true)
        .args(["range", "ids", "all", "retry_failed"])
))]
struct RunArgs {
    /// Inclusive ordinal range, `1-10` or `"1 10"`.
    #[arg(long)]
    range: Option<String>,
    /// Comma-separated ordinals and/or full identifiers.
    #[arg(long)]
    ids: Option<String>,
    #[arg(long)]
    all: bool,
    /// Re-run the failures of RUN_DIR, or of the latest run.
    #[arg(long, value_name = "RUN_DIR", num_args = 0..=1)]
    retry_failed: Option<Option<PathBuf>>,
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    timeout: Option<u64>,
    #[arg(long, conflicts_with = "pattern_flag")]
    any_flag: bool,
    #[arg(long)]
    pattern_flag: bool,
    #[arg(long)]
    resume: bool,
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    output_dir: Option<PathBuf>,
    #[arg(long)]
    state_file: Option<PathBuf>,
    #[arg(long)]
    model: Option<String>,
    #[command(flatten)]
    source: SourceArgs,
}

impl RunArgs {
    fn request(&self) -> SelectionRequest {
        if let Some(range) = &self.range {
            SelectionRequest::Range(range.clone())
        } else if let Some(ids) = &self.ids {
            SelectionRequest::Ids(ids.clone())
        } else if let Some(run_dir) = &self.retry_failed {
            SelectionRequest::RetryFailed(run_dir.clone())
        } else {
            SelectionRequest::All
        }
    }

    fn mode(&self) -> FlagValidationMode {
        if self.any_flag {
            FlagValidationMode::AnyFlag
        } else if self.pattern_flag {
            FlagValidationMode::StrictPattern
        } else {
            FlagValidationMode::Exact
        }
    }
}

enum CommandOutcome {
    Completed,
    Interrupted,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match run_command(cli.command)? {
        CommandOutcome::Completed => Ok(()),
        CommandOutcome::Interrupted => std::process::exit(EXIT_INTERRUPTED),
    }
}

fn init_tracing(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .try_init()
        .ok();
}

fn run_command(command: Commands) -> Result<CommandOutcome> {
    match command {
        Commands::Run(args) => run_campaign(args),
        Commands::List {
            tags,
            levels,
            show_tags,
            source,
        } => {
            let config = load_config(&source)?;
            let registry = load_registry(&config)?;
            if show_tags {
                for tag in registry.all_tags() {
                    println!("{}", tag);
                }
                return Ok(CommandOutcome::Completed);
            }
            let rows = registry.filter(&tags, &levels);
            for def in &rows {
                println!(
                    "{}  L{}  {}  [{}]",
                    def.id,
                    def.level,
                    def.name,
                    def.tags.join(", ")
                );
            }
            println!("\n{} benchmark(s)", rows.len());
            Ok(CommandOutcome::Completed)
        }
        Commands::Start { id, source } => {
            let config = load_config(&source)?;
            let registry = load_registry(&config)?;
            let definition = lookup(&registry, &config, &id)?;
            let environment = ComposeEnvironment::new(config.environment.clone());
            let report = environment.start(definition);
            if !report.success {
                bail!("failed to start {}: {}", definition.id, report.message);
            }
            match &report.endpoint {
                Some(endpoint) => println!("{} running at {}", definition.id, endpoint.url()),
                None => println!("{}", report.message),
            }
            Ok(CommandOutcome::Completed)
        }
        Commands::Stop { id, source } => {
            let config = load_config(&source)?;
            let registry = load_registry(&config)?;
            let definition = lookup(&registry, &config, &id)?;
            let environment = ComposeEnvironment::new(config.environment.clone());
            let report = environment.stop(definition);
            if !report.success {
                bail!("failed to stop {}: {}", definition.id, report.message);
            }
            println!("{} stopped", definition.id);
            Ok(CommandOutcome::Completed)
        }
    }
}

fn load_config(source: &SourceArgs) -> Result<CampaignConfig> {
    let mut config = CampaignConfig::load(source.config.as_deref())?;
    if let Some(dir) = &source.benchmarks_dir {
        config.benchmarks_dir = Some(dir.clone());
    }
    Ok(config)
}

fn load_registry(config: &CampaignConfig) -> Result<Registry> {
    let cwd = std::env::current_dir().context("failed to resolve working directory")?;
    let root = config.resolve_benchmarks_dir(&cwd)?;
    let registry = Registry::load(&root, &config.naming)?;
    info!(root = %root.display(), benchmarks = registry.len(), "registry loaded");
    Ok(registry)
}

fn lookup<'a>(
    registry: &'a Registry,
    config: &CampaignConfig,
    raw_id: &str,
) -> Result<&'a bench_core::BenchmarkDefinition> {
    let ids = parse_ids(raw_id, &config.naming)?;
    let id = ids
        .first()
        .ok_or_else(|| anyhow!("no benchmark id given"))?;
    registry
        .get(id)
        .ok_or_else(|| anyhow!("benchmark {} not found in {}", id, registry.root().display()))
}

fn run_campaign(args: RunArgs) -> Result<CommandOutcome> {
    let mut config = load_config(&args.source)?;
    if let Some(dir) = &args.output_dir {
        config.output_dir = dir.clone();
    }
    if let Some(path) = &args.state_file {
        config.state_file = Some(path.clone());
    }
    if let Some(seconds) = args.timeout {
        config.timeout_seconds = seconds;
    }
    if let Some(model) = &args.model {
        config.agent.model = Some(model.clone());
    }
    let registry = load_registry(&config)?;

    let request = args.request();
    let mut retry: Option<RetryPlan> = None;
    let benchmark_ids = match &request {
        SelectionRequest::RetryFailed(run_dir) => {
            let plan = load_retry_plan(run_dir.as_deref(), &config.output_dir)?;
            if plan.failed.is_empty() {
                println!(
                    "No failed benchmarks in {}; nothing to retry",
                    plan.run_dir.display()
                );
                return Ok(CommandOutcome::Completed);
            }
            let ids = plan.benchmark_ids();
            retry = Some(plan);
            ids
        }
        _ => request_ids(&request, &config.naming, registry.catalog(), &config.output_dir)?,
    };
    debug!(selected = benchmark_ids.len(), "selection parsed");

    let selection = RunSelection {
        benchmark_ids,
        timeout: config.timeout(),
        mode: args.mode(),
        output_dir: config.output_dir.clone(),
        resume: args.resume,
    };
    let state = StateStore::open(&config.state_file_path());

    if args.dry_run {
        let plan = plan_campaign(&registry, selection, &state)?;
        let ids: Vec<String> = plan.benchmarks.iter().map(|b| b.id.clone()).collect();
        println!("Dry run: nothing will be executed");
        println!("Benchmarks dir: {}", registry.root().display());
        if let Some(retry) = &retry {
            println!(
                "Retrying {} failed benchmark(s) from {}:",
                retry.failed.len(),
                retry.run_dir.display()
            );
            for failed in &retry.failed {
                println!(
                    "  - {}: {} ({})",
                    failed.benchmark_id, failed.status, failed.reason
                );
            }
        }
        println!("Benchmarks: {}", ids.len());
        for line in preview_ids(&ids, DRY_RUN_PREVIEW) {
            println!("{}", line);
        }
        if !plan.missing.is_empty() {
            println!("Not in registry: {}", plan.missing.join(", "));
        }
        println!("Timeout: {}s", config.timeout_seconds);
        println!(
            "Model: {}",
            config.agent.resolved_model().as_deref().unwrap_or("agent default")
        );
        println!("Flag validation: {}", plan.selection.mode.as_str());
        println!("Output dir: {}", config.output_dir.display());
        if plan.selection.resume {
            println!(
                "Resume: yes ({} already completed)",
                plan.already_completed.len()
            );
        } else {
            println!("Resume: no");
        }
        return Ok(CommandOutcome::Completed);
    }

    let cancel = CancellationToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || handler_token.cancel())
        .context("failed to install interrupt handler")?;

    let mut orchestrator = Orchestrator::new(
        Arc::new(ComposeEnvironment::new(config.environment.clone())),
        Arc::new(CommandAgent::new(config.agent.clone())),
        state,
        cancel,
    )
    .with_progress(config.progress.clone())
    .with_stop_grace(Duration::from_secs(config.agent.stop_grace_seconds));
    let plan = orchestrator.plan(&registry, selection)?;
    if plan.benchmarks.is_empty() {
        println!(
            "All {} selected benchmark(s) already completed",
            plan.already_completed.len()
        );
        return Ok(CommandOutcome::Completed);
    }
    let report = orchestrator.run(&plan)?;
    if report.interrupted {
        Ok(CommandOutcome::Interrupted)
    } else {
        Ok(CommandOutcome::Completed)
    }
}

fn preview_ids(ids: &[String], limit: usize) -> Vec<String> {
    let mut lines: Vec<String> = ids.iter().take(limit).map(|id| format!("  {}", id)).collect();
    if ids.len() > limit {
        lines.push(format!("  ... and {} more", ids.len() - limit));
    }
    lines
}
