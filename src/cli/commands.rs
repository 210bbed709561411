//! CLI command definitions for qsm-ci.
//!
//! Two commands: `parse` groups a dataset and exports one input document per
//! work unit; `run` executes an algorithm against every selected unit.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use crate::algorithm::AlgorithmDescriptor;
use crate::bids::{
    save_groups, select_units, DatasetFamily, FieldDirectionMap, Grouper, RunSelection, WorkUnit,
};
use crate::error::DiscoveryWarning;
use crate::orchestrator::{BatchReport, Orchestrator, OrchestratorConfig};
use crate::sandbox::{
    ApptainerBackend, ApptainerOptions, BackendKind, DockerBackend, DockerOptions,
    SandboxBackend, TinyRangeBackend, TinyRangeOptions,
};

/// Default field-direction side-channel file.
const DEFAULT_PARAMS_FILE: &str = "qsm-forward-params.json";

/// QSM algorithm benchmarking against BIDS datasets.
#[derive(Parser)]
#[command(name = "qsm-ci")]
#[command(about = "Group BIDS multi-echo data and run QSM algorithms in isolated sandboxes")]
#[command(version)]
#[command(
    long_about = "qsm-ci groups multi-echo gradient-echo acquisitions of a BIDS dataset into work units and runs a reconstruction algorithm against each of them inside Docker, Apptainer or a TinyRange VM.\n\nExample usage:\n  qsm-ci parse ./bids ./groups\n  qsm-ci run ./algos/tgv ./bids ./work --container-engine apptainer --cosmos-runs 1-3"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Group a BIDS dataset and write one input document per work unit.
    Parse(ParseArgs),

    /// Run an algorithm against the work units of a BIDS dataset.
    Run(Box<RunArgs>),
}

/// Arguments for `qsm-ci parse`.
#[derive(Parser, Debug)]
pub struct ParseArgs {
    /// BIDS dataset root.
    pub bids_dir: PathBuf,

    /// Directory receiving group_001.json, group_002.json, ...
    pub output_dir: PathBuf,

    /// Field-direction file (list of {"--acq", "--B0-dir"} entries).
    #[arg(long, default_value = DEFAULT_PARAMS_FILE)]
    pub params: PathBuf,
}

/// Arguments for `qsm-ci run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Algorithm directory containing main.sh.
    pub algo_dir: PathBuf,

    /// BIDS dataset root.
    pub bids_dir: PathBuf,

    /// Working directory for dataset copy, unit directories and results.
    pub work_dir: PathBuf,

    /// Run a single pre-built input document instead of grouping the dataset.
    pub inputs_json: Option<PathBuf>,

    /// Sandbox backend (docker, apptainer, tinyrange).
    #[arg(long, default_value = "docker", env = "QSM_CI_ENGINE")]
    pub container_engine: BackendKind,

    /// Writable overlay image for Apptainer; created when missing.
    #[arg(long)]
    pub overlay: Option<PathBuf>,

    /// Size in MB of a newly created overlay.
    #[arg(long, default_value = "4096")]
    pub overlay_size: u64,

    /// COSMOS runs to process (e.g. "1", "1,2,5" or "1-3").
    #[arg(long, default_value = "1")]
    pub cosmos_runs: RunSelection,

    /// Field-direction file (list of {"--acq", "--B0-dir"} entries).
    #[arg(long, default_value = DEFAULT_PARAMS_FILE)]
    pub params: PathBuf,

    /// Units executed at the same time.
    #[arg(long, default_value = "1", env = "QSM_CI_CONCURRENCY")]
    pub concurrency: usize,

    /// Per-unit timeout in seconds.
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Run Docker containers as this user (UID:GID).
    #[arg(long)]
    pub docker_user: Option<String>,

    /// Use the dataset in place instead of copying it to <work_dir>/bids.
    #[arg(long)]
    pub no_copy_dataset: bool,
}

/// Parse CLI arguments and return the Cli struct.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Parse(args) => run_parse_command(args),
        Commands::Run(args) => run_run_command(*args).await,
    }
}

fn load_field_directions(path: &Path) -> FieldDirectionMap {
    match FieldDirectionMap::load(path) {
        Ok(map) => {
            if !map.is_empty() {
                info!(params = %path.display(), "Loaded field directions");
            }
            map
        }
        Err(e) => {
            let warning = DiscoveryWarning::FieldDirections {
                path: path.to_path_buf(),
                reason: e.to_string(),
            };
            warn!("{}", warning);
            FieldDirectionMap::default()
        }
    }
}

fn run_parse_command(args: ParseArgs) -> anyhow::Result<()> {
    let grouper = Grouper::new().with_field_directions(load_field_directions(&args.params));
    let grouping = grouper.run(&args.bids_dir)?;

    let written = save_groups(&grouping.units, &args.output_dir)?;
    info!(
        units = grouping.units.len(),
        warnings = grouping.warnings.len(),
        output = %args.output_dir.display(),
        "Saved {} group files",
        written.len()
    );
    Ok(())
}

async fn run_run_command(args: RunArgs) -> anyhow::Result<()> {
    let algorithm = AlgorithmDescriptor::load(&args.algo_dir)?;
    let image = algorithm.image_for(args.container_engine)?;
    info!(
        algorithm = %algorithm.name,
        engine = %args.container_engine,
        image,
        "Loaded algorithm"
    );

    std::fs::create_dir_all(&args.work_dir)
        .with_context(|| format!("Cannot create work dir {}", args.work_dir.display()))?;

    let dataset_root = if args.no_copy_dataset {
        args.bids_dir.clone()
    } else {
        copy_dataset(&args.bids_dir, &args.work_dir.join("bids"))?
    };

    let units = match &args.inputs_json {
        Some(path) => vec![load_input_document(path, &args.bids_dir, &dataset_root)?],
        None => discover_units(&dataset_root, &args)?,
    };
    if units.is_empty() {
        warn!("No work units to run");
        return Ok(());
    }

    let mut config = OrchestratorConfig::new(&args.work_dir, &dataset_root)
        .with_concurrency(args.concurrency);
    if let Some(secs) = args.timeout {
        config = config.with_timeout(Duration::from_secs(secs));
    }

    let orchestrator = Orchestrator::new(build_backend(&args)?, config);
    let report = orchestrator
        .run_batch_cancellable(&units, &algorithm, interrupted(tokio::signal::ctrl_c()))
        .await?;

    write_report(&report, &args.work_dir.join("results.json"))?;
    summarize(&report);

    if report.all_failed() {
        anyhow::bail!("All {} units failed", report.results.len());
    }
    Ok(())
}

/// Resolves when the signal fires. A signal that cannot be installed never
/// fires, so the batch runs to completion instead of being cancelled at once.
async fn interrupted<F>(signal: F)
where
    F: std::future::Future<Output = std::io::Result<()>>,
{
    if let Err(e) = signal.await {
        warn!(error = %e, "Cannot listen for Ctrl-C, batch is not interruptible");
        futures::future::pending::<()>().await;
    }
}

fn build_backend(args: &RunArgs) -> anyhow::Result<Arc<dyn SandboxBackend>> {
    let backend: Arc<dyn SandboxBackend> = match args.container_engine {
        BackendKind::Docker => {
            let mut options = DockerOptions::default();
            if let Some(user) = &args.docker_user {
                options = options.with_user(user);
            }
            Arc::new(DockerBackend::connect(options)?)
        }
        BackendKind::Apptainer => {
            let mut options = ApptainerOptions::default();
            if let Some(overlay) = &args.overlay {
                options = options.with_overlay(overlay, args.overlay_size);
            }
            Arc::new(ApptainerBackend::new(options))
        }
        BackendKind::TinyRange => Arc::new(TinyRangeBackend::new(TinyRangeOptions::default())),
    };
    Ok(backend)
}

/// Replaces `dest` with a fresh copy of the dataset and returns it.
fn copy_dataset(src: &Path, dest: &Path) -> anyhow::Result<PathBuf> {
    if !src.is_dir() {
        anyhow::bail!("BIDS directory {} does not exist", src.display());
    }
    if dest.exists() {
        info!(dir = %dest.display(), "Removing existing dataset copy");
        std::fs::remove_dir_all(dest)?;
    }

    info!(from = %src.display(), to = %dest.display(), "Copying dataset");
    for entry in walkdir::WalkDir::new(src) {
        let entry = entry?;
        let relative = entry.path().strip_prefix(src)?;
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            std::fs::copy(entry.path(), &target)
                .with_context(|| format!("Cannot copy {}", entry.path().display()))?;
        }
    }
    Ok(dest.to_path_buf())
}

/// Reads a pre-built input document, moving paths under the source
/// dataset root to the dataset actually used.
fn load_input_document(path: &Path, bids_dir: &Path, dataset_root: &Path) -> anyhow::Result<WorkUnit> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read input document {}", path.display()))?;
    let unit: WorkUnit = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid input document {}", path.display()))?;

    Ok(unit.map_paths(|p| match p.strip_prefix(bids_dir) {
        Ok(relative) => dataset_root.join(relative),
        Err(_) if p.is_relative() => dataset_root.join(p),
        Err(_) => p.to_path_buf(),
    }))
}

fn discover_units(dataset_root: &Path, args: &RunArgs) -> anyhow::Result<Vec<WorkUnit>> {
    let grouper = Grouper::new().with_field_directions(load_field_directions(&args.params));
    let grouping = grouper.run(dataset_root)?;

    let family = DatasetFamily::detect(&grouping.units);
    let selected: Vec<WorkUnit> = select_units(&grouping.units, &args.cosmos_runs)
        .into_iter()
        .cloned()
        .collect();

    info!(
        family = %family,
        found = grouping.units.len(),
        selected = selected.len(),
        "Selected work units"
    );
    Ok(selected)
}

fn write_report(report: &BatchReport, path: &Path) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(path, json).with_context(|| format!("Cannot write {}", path.display()))?;
    Ok(())
}

fn summarize(report: &BatchReport) {
    for result in &report.results {
        match result.failure() {
            None => info!(
                unit = %result.unit_name,
                outputs = result.outputs.len(),
                duration_secs = result.duration.as_secs(),
                "Succeeded"
            ),
            Some(failure) => {
                warn!(unit = %result.unit_name, "Failed: {}", failure);
                for line in &result.log_tail {
                    warn!(unit = %result.unit_name, "  {}", line);
                }
            }
        }
    }
    info!(
        succeeded = report.succeeded(),
        failed = report.failed(),
        "Run complete"
    );
}
