use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand, ValueHint};
use coverage_relay::config::PipelineConfig;
use coverage_relay::fragment::{CoverageData, DATABASE_FILE, DEFAULT_FRAGMENT_PATTERN};
use coverage_relay::observability::{ExchangeMetrics, log_snapshot};
use coverage_relay::plan::{build_plan, write_plan};
use coverage_relay::report::{CoverageReport, ReportOptions};
use coverage_relay::validation::validate_config;
use coverage_relay::{
    CollectMode, ExchangeError, ExchangeStrategy, FragmentCollector, FragmentProducer, FsStore,
    TestCommand,
};
use serde_json::to_writer_pretty;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

fn main() -> Result<()> {
    let cli = Cli::parse();
    configure_tracing()?;

    match cli.command {
        Commands::Produce {
            store,
            workdir,
            pattern,
            run_segment,
            tick,
            metrics,
            command,
        } => produce(store, workdir, pattern, run_segment, tick, metrics, command),
        Commands::Collect {
            store,
            workdir,
            pattern,
            run_segment,
            expected,
            report,
            keep_fragments,
            metrics,
        } => collect(
            store,
            workdir,
            pattern,
            run_segment,
            expected,
            report,
            keep_fragments,
            metrics,
        ),
        Commands::Report { workdir, report } => report_database(&workdir, report),
        Commands::Validate { config } => validate_config_cmd(config),
        Commands::Plan { config, output } => plan_command(config, output),
    }
}

fn configure_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // Keep stdout for the coverage report itself.
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .try_init()
        .map_err(|err| anyhow!(err.to_string()))?;

    Ok(())
}

fn produce(
    store: PathBuf,
    workdir: PathBuf,
    pattern: String,
    run_segment: Option<String>,
    tick: Option<u32>,
    metrics_args: MetricsArgs,
    command: Vec<String>,
) -> Result<()> {
    let strategy = match (run_segment, tick) {
        (Some(segment), None) => ExchangeStrategy::path_partition(segment),
        (None, Some(tick)) => ExchangeStrategy::explicit_tick(tick),
        _ => bail!("Exactly one of --run-segment or --tick must be given"),
    };
    let command =
        TestCommand::from_argv(&command).context("A test command must follow '--'")?;
    let store = FsStore::open(&store)
        .with_context(|| format!("Failed to open shared store: {}", store.display()))?;

    let producer = FragmentProducer::new(command, workdir, strategy, Arc::new(store))?
        .with_pattern(&pattern)?;
    let outcome = producer.run();
    emit_metrics(&producer.metrics(), &metrics_args)?;

    let report = outcome?;
    info!(fragments = report.records.len(), "Producer finished");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn collect(
    store: PathBuf,
    workdir: PathBuf,
    pattern: String,
    run_segment: Option<String>,
    expected: Option<u32>,
    report_args: ReportArgs,
    keep_fragments: bool,
    metrics_args: MetricsArgs,
) -> Result<()> {
    let mode = match (run_segment, expected) {
        (Some(run_segment), None) => CollectMode::Wildcard { run_segment },
        (None, Some(expected)) => CollectMode::Count { expected },
        _ => bail!("Exactly one of --run-segment or --expected must be given"),
    };
    let store = FsStore::open(&store)
        .with_context(|| format!("Failed to open shared store: {}", store.display()))?;

    let collector = FragmentCollector::new(Arc::new(store), mode, workdir)?
        .with_pattern(&pattern)?
        .with_report_options(report_args.options())
        .with_fail_under(report_args.fail_under)
        .keep_fragments(keep_fragments);
    let outcome = collector.run(io::stdout().lock());
    emit_metrics(&collector.metrics(), &metrics_args)?;

    let outcome = outcome?;
    let issues = outcome.issues().count();
    if issues > 0 {
        warn!(issues, "Coverage report completed with skipped entries");
    }
    Ok(())
}

fn report_database(workdir: &Path, report_args: ReportArgs) -> Result<()> {
    let path = workdir.join(DATABASE_FILE);
    let database = CoverageData::load(&path)?;
    let report = CoverageReport::build(&database, &report_args.options());
    for issue in &report.issues {
        warn!(%issue, "File omitted from coverage report");
    }
    report
        .write_to(io::stdout().lock())
        .context("Failed to write coverage report")?;

    if let Some(required) = report_args.fail_under {
        let actual = report.total_percent();
        if actual < required {
            return Err(ExchangeError::BelowThreshold { actual, required }.into());
        }
    }
    Ok(())
}

fn validate_config_cmd(config_path: PathBuf) -> Result<()> {
    let config = PipelineConfig::load(&config_path)?;
    let report = validate_config(&config);

    for warning in &report.warnings {
        warn!(file = %config_path.display(), "{warning}");
    }

    if report.is_ok() {
        info!(file = %config_path.display(), "Pipeline validation passed");
        Ok(())
    } else {
        for error_msg in &report.errors {
            error!(file = %config_path.display(), "{error_msg}");
        }
        Err(anyhow!(
            "Pipeline validation failed with {} error(s)",
            report.errors.len()
        ))
    }
}

fn plan_command(config_path: PathBuf, output: Option<PathBuf>) -> Result<()> {
    let config = PipelineConfig::load(&config_path)?;
    for warning in &validate_config(&config).warnings {
        warn!(file = %config_path.display(), "{warning}");
    }
    let plan = build_plan(&config)?;

    match output {
        Some(path) => {
            write_plan(&plan, &path)?;
            info!(
                plan = %path.display(),
                steps = plan.steps.len(),
                "Pipeline plan written"
            );
        }
        None => {
            let rendered = serde_yaml::to_string(&plan).context("Failed to render plan")?;
            print!("{rendered}");
        }
    }
    Ok(())
}

fn emit_metrics(metrics: &ExchangeMetrics, args: &MetricsArgs) -> Result<()> {
    if !args.print_metrics && args.metrics_json.is_none() && args.metrics_prometheus.is_none() {
        return Ok(());
    }

    let snapshot = metrics.snapshot();
    if args.print_metrics {
        log_snapshot(&snapshot);
    }
    if let Some(path) = &args.metrics_json {
        create_parent_dir(path)?;
        let file = File::create(path)
            .with_context(|| format!("Failed to create metrics file: {}", path.display()))?;
        to_writer_pretty(file, &snapshot)
            .with_context(|| format!("Failed to write metrics JSON: {}", path.display()))?;
        info!(metrics = %path.display(), "Metrics JSON written");
    }
    if let Some(path) = &args.metrics_prometheus {
        create_parent_dir(path)?;
        fs::write(path, snapshot.to_prometheus()).with_context(|| {
            format!("Failed to write Prometheus metrics: {}", path.display())
        })?;
        info!(metrics = %path.display(), "Prometheus metrics written");
    }
    Ok(())
}

fn create_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).with_context(|| {
            format!("Failed to create metrics directory: {}", parent.display())
        })?;
    }
    Ok(())
}

#[derive(Parser)]
#[command(
    name = "coverage-relay",
    version,
    about = "Exchange coverage fragments between isolated CI containers"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tests and export their coverage fragments to the shared store.
    Produce {
        #[arg(long, value_hint = ValueHint::DirPath)]
        store: PathBuf,
        #[arg(long, default_value = ".", value_hint = ValueHint::DirPath)]
        workdir: PathBuf,
        #[arg(long, default_value = DEFAULT_FRAGMENT_PATTERN)]
        pattern: String,
        #[arg(long = "run-segment", conflicts_with = "tick", required_unless_present = "tick")]
        run_segment: Option<String>,
        #[arg(long)]
        tick: Option<u32>,
        #[command(flatten)]
        metrics: MetricsArgs,
        #[arg(last = true, required = true, value_name = "COMMAND")]
        command: Vec<String>,
    },
    /// Gather fragments from the shared store, combine them and print the report.
    Collect {
        #[arg(long, value_hint = ValueHint::DirPath)]
        store: PathBuf,
        #[arg(long, default_value = ".", value_hint = ValueHint::DirPath)]
        workdir: PathBuf,
        #[arg(long, default_value = DEFAULT_FRAGMENT_PATTERN)]
        pattern: String,
        #[arg(
            long = "run-segment",
            conflicts_with = "expected",
            required_unless_present = "expected"
        )]
        run_segment: Option<String>,
        #[arg(long)]
        expected: Option<u32>,
        #[command(flatten)]
        report: ReportArgs,
        #[arg(long = "keep-fragments")]
        keep_fragments: bool,
        #[command(flatten)]
        metrics: MetricsArgs,
    },
    /// Print the report for an already combined database.
    Report {
        #[arg(long, default_value = ".", value_hint = ValueHint::DirPath)]
        workdir: PathBuf,
        #[command(flatten)]
        report: ReportArgs,
    },
    Validate {
        config: PathBuf,
    },
    Plan {
        config: PathBuf,
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[derive(Args)]
struct ReportArgs {
    #[arg(long = "skip-covered")]
    skip_covered: bool,
    #[arg(long = "show-missing")]
    show_missing: bool,
    #[arg(long = "source-root", value_hint = ValueHint::DirPath)]
    source_root: Option<PathBuf>,
    #[arg(long = "fail-under")]
    fail_under: Option<f64>,
}

impl ReportArgs {
    fn options(&self) -> ReportOptions {
        ReportOptions {
            skip_covered: self.skip_covered,
            show_missing: self.show_missing,
            source_root: self.source_root.clone(),
        }
    }
}

#[derive(Args)]
struct MetricsArgs {
    #[arg(long)]
    print_metrics: bool,
    #[arg(long = "metrics-json")]
    metrics_json: Option<PathBuf>,
    #[arg(long = "metrics-prometheus")]
    metrics_prometheus: Option<PathBuf>,
}
