use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use clap::{ArgAction, CommandFactory, Parser, Subcommand, ValueHint};
use clap_complete::Shell;
use kpatch_ci::config::{DeliveryKind, PipelineConfig, PublisherKind, ReportTemplate};
use kpatch_ci::console::ConsoleLog;
use kpatch_ci::junit::{TestCase, TestSuite};
use kpatch_ci::observability::{MetricsCollector, log_snapshot};
use kpatch_ci::pipeline::{PipelineOutcome, StageKind, StageStatus, build_pipeline};
use kpatch_ci::stages;
use kpatch_ci::state::WorkflowState;
use kpatch_ci::tools::Toolbox;
use kpatch_ci::validation::validate_config;
use serde_json::to_writer_pretty;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

#[cfg(feature = "otel")]
use opentelemetry::KeyValue;
#[cfg(feature = "otel")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "otel")]
use opentelemetry_sdk::{resource::Resource, trace as sdktrace};

const EXIT_FAILED: u8 = 1;
const EXIT_ERROR: u8 = 2;

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(err) = configure_tracing(cli.otlp_endpoint.as_deref(), cli.verbose) {
        eprintln!("error: {err:#}");
        return ExitCode::from(EXIT_ERROR);
    }

    let command = cli.command.name();
    let started = Instant::now();
    let result = dispatch(cli.command, &cli.globals);
    if let Some(dir) = &cli.globals.junit
        && let Err(err) = write_junit(dir, command, started.elapsed(), &result, &cli.globals)
    {
        warn!("{err:#}");
    }

    #[cfg(feature = "otel")]
    if cli.otlp_endpoint.is_some() {
        opentelemetry::global::shutdown_tracer_provider();
    }

    match result {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            error!("{err:#}");
            eprintln!("error: {err:#}");
            ExitCode::from(EXIT_ERROR)
        }
    }
}

fn configure_tracing(otlp_endpoint: Option<&str>, verbose: u8) -> Result<()> {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    #[cfg(feature = "otel")]
    {
        if let Some(endpoint) = otlp_endpoint {
            let tracer =
                opentelemetry_otlp::new_pipeline()
                    .tracing()
                    .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(
                        vec![KeyValue::new("service.name", "kpatch-ci")],
                    )))
                    .with_exporter(
                        opentelemetry_otlp::new_exporter()
                            .tonic()
                            .with_endpoint(endpoint),
                    )
                    .install_simple()?;

            tracing_subscriber::registry()
                .with(filter.clone())
                .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
        } else {
            tracing_subscriber::registry()
                .with(filter.clone())
                .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
        }
    }

    #[cfg(not(feature = "otel"))]
    {
        if let Some(endpoint) = otlp_endpoint {
            eprintln!(
                "warning: --otlp-endpoint '{}' requested but OpenTelemetry support is not enabled. Rebuild with --features otel.",
                endpoint
            );
        }

        tracing_subscriber::registry()
            .with(filter.clone())
            .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
            .try_init()
            .map_err(|err| anyhow!(err.to_string()))?;
    }

    Ok(())
}

fn dispatch(command: Commands, globals: &GlobalArgs) -> Result<u8> {
    match command {
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "kpatch-ci", &mut io::stdout());
            Ok(0)
        }
        Commands::ListStages => {
            println!("Available stages:");
            for name in stages::default_registry().known_stages() {
                println!("- {name}");
            }
            Ok(0)
        }
        Commands::ConsoleCheck(args) => console_check(&args),
        Commands::Check => {
            let config = globals.load_config()?;
            check_config(&config, globals.config.as_deref())
        }
        Commands::Merge(args) => {
            let mut config = globals.load_config()?;
            args.apply(&mut config);
            run_stages(&config, &[StageKind::Merge], args.reset, globals)
        }
        Commands::Build(args) => {
            let mut config = globals.load_config()?;
            args.apply(&mut config);
            run_stages(&config, &[StageKind::Build], false, globals)
        }
        Commands::Publish(args) => {
            let mut config = globals.load_config()?;
            args.apply(&mut config);
            run_stages(&config, &[StageKind::Publish], false, globals)
        }
        Commands::Run(args) => {
            let mut config = globals.load_config()?;
            args.apply(&mut config);
            run_stages(&config, &[StageKind::Run], false, globals)
        }
        Commands::Report(args) => {
            let mut config = globals.load_config()?;
            args.apply(&mut config);
            run_stages(&config, &[StageKind::Report], false, globals)
        }
        Commands::Cleanup(args) => {
            let mut config = globals.load_config()?;
            args.apply(&mut config);
            let code = run_stages(&config, &[StageKind::Cleanup], false, globals)?;
            if config.cleanup.all {
                remove_record(&config.state_path())?;
            }
            Ok(code)
        }
        Commands::All(args) => {
            let mut config = globals.load_config()?;
            if args.wait {
                config.run.wait = true;
            }
            run_all(&config, &args, globals)
        }
        Commands::Bisect(args) => {
            let mut config = globals.load_config()?;
            args.apply(&mut config);
            if args.reset {
                remove_record(&config.bisect.record_path(&config.workdir()))?;
            }
            run_bisect(&config, globals)
        }
    }
}

fn check_config(config: &PipelineConfig, file: Option<&Path>) -> Result<u8> {
    let label = file
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| kpatch_ci::config::DEFAULT_CONFIG_FILE.to_string());
    let report = validate_config(config, &stages::default_registry());

    for warning in &report.warnings {
        warn!(file = %label, "{warning}");
    }

    if report.is_ok() {
        info!(file = %label, "Configuration check passed");
        Ok(0)
    } else {
        for error_msg in &report.errors {
            error!(file = %label, "{error_msg}");
        }
        eprintln!(
            "Configuration check failed with {} error(s)",
            report.errors.len()
        );
        Ok(EXIT_FAILED)
    }
}

/// Print the first call trace of each console log. Fails when any log has one.
fn console_check(args: &ConsoleCheckArgs) -> Result<u8> {
    let mut found = false;
    for source in &args.console {
        let log = ConsoleLog::fetch(&args.krelease, source)?;
        if let Some(trace) = log.traces()?.first() {
            println!("This is the first trace we found in\n{source}:\n\n{trace}\n");
            found = true;
        }
    }
    if found {
        Ok(EXIT_FAILED)
    } else {
        println!("No call traces were detected.");
        Ok(0)
    }
}

/// One test case named after the command, failed when it did not exit 0.
fn write_junit(
    dir: &Path,
    command: &str,
    elapsed: Duration,
    result: &Result<u8>,
    globals: &GlobalArgs,
) -> Result<()> {
    let mut case = TestCase::new(command, "kpatch-ci", elapsed);
    match result {
        Ok(0) => {}
        Ok(code) => case = case.failed(format!("Step finished with exit code {code}")),
        Err(err) => case = case.failed(format!("{err:#}")),
    }
    if let Ok(config) = globals.load_config() {
        case = case.with_stdout(serde_json::to_string_pretty(&config)?);
    }
    let mut suite = TestSuite::new("kpatch-ci");
    suite.push(case);
    let path = suite.write(dir, command)?;
    info!(junit = %path.display(), "JUnit results written");
    Ok(())
}

/// Run `kinds` against the persisted record and map the outcome to an exit
/// code.
fn execute(
    config: &PipelineConfig,
    kinds: &[StageKind],
    reset: bool,
    metrics: &MetricsCollector,
) -> Result<(PipelineOutcome, WorkflowState)> {
    let state_path = config.state_path();
    let mut state = if reset {
        info!(state = %state_path.display(), "Starting a fresh record");
        WorkflowState::new()
    } else {
        WorkflowState::load(&state_path)?
    };

    let registry = stages::default_registry();
    let executor = build_pipeline(&registry, kinds, config, metrics.clone())?;
    let mut tools = Toolbox::from_config(config);
    let outcome = executor
        .execute(&mut state, Some(&state_path), config, &mut tools)
        .with_context(|| {
            format!(
                "{} failed, record {} left as it was",
                kinds
                    .iter()
                    .map(|k| k.as_str())
                    .collect::<Vec<_>>()
                    .join("/"),
                state_path.display()
            )
        })?;
    Ok((outcome, state))
}

fn run_stages(
    config: &PipelineConfig,
    kinds: &[StageKind],
    reset: bool,
    globals: &GlobalArgs,
) -> Result<u8> {
    let metrics = MetricsCollector::new();
    let result = execute(config, kinds, reset, &metrics);
    globals.emit_metrics(&metrics)?;
    let (outcome, _) = result?;
    Ok(exit_code(outcome.status))
}

/// Merge, build, publish and run, then report whatever was recorded.
fn run_all(config: &PipelineConfig, args: &AllArgs, globals: &GlobalArgs) -> Result<u8> {
    let metrics = MetricsCollector::new();
    let result = execute(
        config,
        &[
            StageKind::Merge,
            StageKind::Build,
            StageKind::Publish,
            StageKind::Run,
        ],
        args.reset,
        &metrics,
    )
    .and_then(|(outcome, _)| {
        let reportable = match outcome.status {
            StageStatus::Passed => config.run.wait,
            StageStatus::Failed => true,
            StageStatus::Pending => false,
        };
        if !reportable {
            info!("Results are not in yet, skipping the report");
            return Ok(outcome.status);
        }
        let (report, _) = execute(config, &[StageKind::Report], false, &metrics)?;
        Ok(worst(outcome.status, report.status))
    })
    .and_then(|status| {
        if args.cleanup {
            execute(config, &[StageKind::Cleanup], false, &metrics)?;
            if config.cleanup.all {
                remove_record(&config.state_path())?;
            }
        }
        Ok(status)
    });
    globals.emit_metrics(&metrics)?;
    Ok(exit_code(result?))
}

fn run_bisect(config: &PipelineConfig, globals: &GlobalArgs) -> Result<u8> {
    let metrics = MetricsCollector::new();
    let result = execute(config, &[StageKind::Bisect], false, &metrics);
    globals.emit_metrics(&metrics)?;
    let (outcome, state) = result?;

    let ns = StageKind::Bisect;
    match state.text_opt(ns, "culprit") {
        Some(culprit) if outcome.status == StageStatus::Passed => {
            println!("first bad commit: {culprit}");
        }
        _ => {
            let good = state.text_opt(ns, "good").unwrap_or_default();
            let bad = state.text_opt(ns, "bad").unwrap_or_default();
            let untestable = state
                .get_opt(ns, "untestable")
                .map(|value| value.as_list())
                .unwrap_or_default();
            println!("inconclusive: first bad commit is in {good}..{bad}");
            if !untestable.is_empty() {
                println!("untestable: {}", untestable.join(" "));
            }
        }
    }
    Ok(exit_code(outcome.status))
}

fn worst(a: StageStatus, b: StageStatus) -> StageStatus {
    if a == StageStatus::Failed || b == StageStatus::Failed {
        StageStatus::Failed
    } else if a == StageStatus::Pending || b == StageStatus::Pending {
        StageStatus::Pending
    } else {
        StageStatus::Passed
    }
}

fn exit_code(status: StageStatus) -> u8 {
    match status {
        StageStatus::Passed | StageStatus::Pending => 0,
        StageStatus::Failed => EXIT_FAILED,
    }
}

fn remove_record(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            info!(state = %path.display(), "State record deleted");
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => {
            Err(err).with_context(|| format!("Failed to delete state record {}", path.display()))
        }
    }
}

#[derive(Parser)]
#[command(
    name = "kpatch-ci",
    version,
    about = "Merge, build, test, report and bisect kernel patch series"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    #[command(flatten)]
    globals: GlobalArgs,
    /// Increase log verbosity (-v debug, -vv trace). RUST_LOG wins when set.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[arg(long = "otlp-endpoint", global = true)]
    otlp_endpoint: Option<String>,
}

#[derive(clap::Args)]
struct GlobalArgs {
    /// Configuration file. Defaults to ./kpatch-ci.yaml when present.
    #[arg(long, global = true, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,
    /// Workflow state record.
    #[arg(long, global = true, value_hint = ValueHint::FilePath)]
    state: Option<PathBuf>,
    #[arg(long, global = true, value_hint = ValueHint::DirPath)]
    workdir: Option<PathBuf>,
    #[arg(long, global = true)]
    print_metrics: bool,
    #[arg(long = "metrics-json", global = true)]
    metrics_json: Option<PathBuf>,
    #[arg(long = "metrics-prometheus", global = true)]
    metrics_prometheus: Option<PathBuf>,
    /// Write JUnit results for the command into this directory.
    #[arg(long, global = true, value_hint = ValueHint::DirPath)]
    junit: Option<PathBuf>,
}

impl GlobalArgs {
    fn load_config(&self) -> Result<PipelineConfig> {
        let mut config = PipelineConfig::discover(self.config.as_deref())?;
        if let Some(state) = &self.state {
            config.state = Some(state.clone());
        }
        if let Some(workdir) = &self.workdir {
            config.workdir = Some(workdir.clone());
        }
        Ok(config)
    }

    fn emit_metrics(&self, metrics: &MetricsCollector) -> Result<()> {
        if !self.print_metrics && self.metrics_json.is_none() && self.metrics_prometheus.is_none()
        {
            return Ok(());
        }
        let snapshot = metrics.snapshot();
        if self.print_metrics {
            log_snapshot(&snapshot);
        }
        if let Some(path) = &self.metrics_json {
            create_parent(path)?;
            let file = File::create(path)
                .with_context(|| format!("Failed to create metrics file: {}", path.display()))?;
            to_writer_pretty(file, &snapshot)
                .with_context(|| format!("Failed to write metrics JSON: {}", path.display()))?;
            info!(metrics = %path.display(), "Metrics JSON written");
        }
        if let Some(path) = &self.metrics_prometheus {
            create_parent(path)?;
            fs::write(path, snapshot.to_prometheus()).with_context(|| {
                format!("Failed to write Prometheus metrics: {}", path.display())
            })?;
            info!(metrics = %path.display(), "Prometheus metrics written");
        }
        Ok(())
    }
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).with_context(|| {
            format!("Failed to create metrics directory: {}", parent.display())
        })?;
    }
    Ok(())
}

#[derive(Subcommand)]
enum Commands {
    /// Check out the base ref and apply the patch series.
    Merge(MergeArgs),
    /// Configure and build the merged tree.
    Build(BuildArgs),
    /// Copy the built kernel somewhere the lab can fetch it.
    Publish(PublishArgs),
    /// Submit the published kernel to the test lab.
    Run(RunArgs),
    /// Summarise one or more records and deliver the report.
    Report(ReportArgs),
    /// Drop stage results and build outputs.
    Cleanup(CleanupArgs),
    /// Merge, build, publish, run and report in one go.
    All(AllArgs),
    /// Find the first commit between a good and a bad ref that fails testing.
    Bisect(BisectArgs),
    /// Look for oopses and call traces in serial console logs.
    ConsoleCheck(ConsoleCheckArgs),
    /// Validate the configuration without running anything.
    Check,
    ListStages,
    /// Print shell completions.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Merge(_) => "merge",
            Commands::Build(_) => "build",
            Commands::Publish(_) => "publish",
            Commands::Run(_) => "run",
            Commands::Report(_) => "report",
            Commands::Cleanup(_) => "cleanup",
            Commands::All(_) => "all",
            Commands::Bisect(_) => "bisect",
            Commands::ConsoleCheck(_) => "console-check",
            Commands::Check => "check",
            Commands::ListStages => "list-stages",
            Commands::Completions { .. } => "completions",
        }
    }
}

#[derive(clap::Args)]
struct ConsoleCheckArgs {
    /// Release of the kernel under test, as in its `Linux version` banner.
    #[arg(long)]
    krelease: String,
    /// Console log path or URL. Repeat to check several.
    #[arg(long, required = true)]
    console: Vec<String>,
}

#[derive(clap::Args)]
struct MergeArgs {
    #[arg(long)]
    baserepo: Option<String>,
    #[arg(long = "ref")]
    reference: Option<String>,
    /// Patch file or patchwork URL. Repeat to apply several, in order.
    #[arg(long = "patch")]
    patches: Vec<String>,
    /// Shallow-fetch depth.
    #[arg(long)]
    depth: Option<u32>,
    /// Start a new record even if the current one belongs to another run.
    #[arg(long)]
    reset: bool,
}

impl MergeArgs {
    fn apply(&self, config: &mut PipelineConfig) {
        if let Some(repo) = &self.baserepo {
            config.merge.baserepo = Some(repo.clone());
        }
        if let Some(reference) = &self.reference {
            config.merge.reference = reference.clone();
        }
        if !self.patches.is_empty() {
            config.merge.patches = self.patches.clone();
        }
        if self.depth.is_some() {
            config.merge.fetch_depth = self.depth;
        }
    }
}

#[derive(clap::Args)]
struct BuildArgs {
    /// Base kernel config file.
    #[arg(long, value_hint = ValueHint::FilePath)]
    baseconfig: Option<PathBuf>,
    /// Make target used on the base config, or `tinyconfig` / `rh-configs`.
    #[arg(long)]
    cfgtype: Option<String>,
    #[arg(long)]
    rh_configs_glob: Option<String>,
    #[arg(long)]
    makeopts: Option<String>,
    #[arg(long)]
    localversion: Option<String>,
    #[arg(long)]
    enable_debuginfo: bool,
    /// Run `make mrproper` first.
    #[arg(long)]
    wipe: bool,
}

impl BuildArgs {
    fn apply(&self, config: &mut PipelineConfig) {
        let build = &mut config.build;
        if self.baseconfig.is_some() {
            build.baseconfig = self.baseconfig.clone();
        }
        if self.cfgtype.is_some() {
            build.cfgtype = self.cfgtype.clone();
        }
        if self.rh_configs_glob.is_some() {
            build.rh_configs_glob = self.rh_configs_glob.clone();
        }
        if self.makeopts.is_some() {
            build.make_opts = self.makeopts.clone();
        }
        if let Some(localversion) = &self.localversion {
            build.localversion = localversion.clone();
        }
        build.enable_debuginfo |= self.enable_debuginfo;
        build.wipe |= self.wipe;
    }
}

#[derive(clap::Args)]
struct PublishArgs {
    #[arg(long, value_enum)]
    publisher: Option<PublisherKind>,
    #[arg(long)]
    destination: Option<String>,
    #[arg(long)]
    url_prefix: Option<String>,
}

impl PublishArgs {
    fn apply(&self, config: &mut PipelineConfig) {
        if let Some(kind) = self.publisher {
            config.publish.kind = kind;
        }
        if self.destination.is_some() {
            config.publish.destination = self.destination.clone();
        }
        if self.url_prefix.is_some() {
            config.publish.url_prefix = self.url_prefix.clone();
        }
    }
}

#[derive(clap::Args)]
struct RunArgs {
    /// Job template with ##KVER##-style placeholders.
    #[arg(long, value_hint = ValueHint::FilePath)]
    template: Option<PathBuf>,
    /// Block until the lab reports a verdict.
    #[arg(long)]
    wait: bool,
    /// Give up waiting after this many seconds.
    #[arg(long)]
    timeout: Option<u64>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    arch: Option<String>,
}

impl RunArgs {
    fn apply(&self, config: &mut PipelineConfig) {
        let run = &mut config.run;
        if self.template.is_some() {
            run.job_template = self.template.clone();
        }
        run.wait |= self.wait;
        if self.timeout.is_some() {
            run.timeout_secs = self.timeout;
        }
        if self.host.is_some() {
            run.host = self.host.clone();
        }
        if self.arch.is_some() {
            run.arch = self.arch.clone();
        }
    }
}

#[derive(clap::Args)]
struct ReportArgs {
    #[arg(long, value_enum)]
    delivery: Option<DeliveryKind>,
    #[arg(long, value_enum)]
    template: Option<ReportTemplate>,
    /// Further state records to report together with this one (glob).
    #[arg(long = "result")]
    results: Vec<String>,
    #[arg(long = "from")]
    mail_from: Option<String>,
    #[arg(long = "to")]
    mail_to: Vec<String>,
    #[arg(long = "cc")]
    mail_cc: Vec<String>,
    #[arg(long)]
    subject: Option<String>,
}

impl ReportArgs {
    fn apply(&self, config: &mut PipelineConfig) {
        let report = &mut config.report;
        if let Some(delivery) = self.delivery {
            report.delivery = delivery;
        }
        if let Some(template) = self.template {
            report.template = template;
        }
        report.results.extend(self.results.iter().cloned());
        if self.mail_from.is_some() {
            report.mail.from = self.mail_from.clone();
        }
        report.mail.to.extend(self.mail_to.iter().cloned());
        report.mail.cc.extend(self.mail_cc.iter().cloned());
        if self.subject.is_some() {
            report.mail.subject = self.subject.clone();
        }
    }
}

#[derive(clap::Args)]
struct CleanupArgs {
    /// Delete the whole state record.
    #[arg(long)]
    all: bool,
    /// Remove the working directory.
    #[arg(long)]
    wipe: bool,
}

impl CleanupArgs {
    fn apply(&self, config: &mut PipelineConfig) {
        config.cleanup.all |= self.all;
        config.cleanup.wipe |= self.wipe;
    }
}

#[derive(clap::Args)]
struct AllArgs {
    #[arg(long)]
    wait: bool,
    #[arg(long)]
    reset: bool,
    /// Run cleanup once the report is out.
    #[arg(long)]
    cleanup: bool,
}

#[derive(clap::Args)]
struct BisectArgs {
    /// Known-bad ref or commit.
    bad: Option<String>,
    /// Known-good ref or commit.
    #[arg(long)]
    good: Option<String>,
    /// Patch applied on top of every probed commit.
    #[arg(long = "patch")]
    patches: Vec<String>,
    #[arg(long)]
    infra_retries: Option<u32>,
    /// Skip probing the bounds before searching.
    #[arg(long)]
    no_verify: bool,
    #[arg(long)]
    no_pin_host: bool,
    #[arg(long, value_hint = ValueHint::FilePath)]
    record: Option<PathBuf>,
    /// Discard the bisection record even if it tracks another bisection.
    #[arg(long)]
    reset: bool,
}

impl BisectArgs {
    fn apply(&self, config: &mut PipelineConfig) {
        let bisect = &mut config.bisect;
        if self.bad.is_some() {
            bisect.bad_ref = self.bad.clone();
        }
        if let Some(good) = &self.good {
            bisect.good_ref = good.clone();
        }
        if !self.patches.is_empty() {
            bisect.patches = self.patches.clone();
        }
        if let Some(retries) = self.infra_retries {
            bisect.infra_retries = retries;
        }
        if self.no_verify {
            bisect.verify_bounds = false;
        }
        if self.no_pin_host {
            bisect.pin_host = false;
        }
        if self.record.is_some() {
            bisect.record = self.record.clone();
        }
    }
}
