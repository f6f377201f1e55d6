use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use kira_genomes::catalog::{self, Worklist};
use kira_genomes::config::{ConfigLoader, ConfigOverrides, ProviderKind, ResolvedConfig};
use kira_genomes::domain::{AssemblyLevel, GenomeSource};
use kira_genomes::error::KiraError;
use kira_genomes::fs_util::ZipExtractor;
use kira_genomes::ledger::{self, Ledger};
use kira_genomes::ncbi;
use kira_genomes::orchestrator::{AcquisitionOptions, Orchestrator, ProgressSink};
use kira_genomes::output::{
    CleanResult, JsonOutput, OutputMode, RunResult, SilentProgress, StderrProgress, TextOutput,
    WorklistResult,
};
use kira_genomes::preflight::{self, SystemProbe};
use kira_genomes::store::FsArtifactStore;

#[derive(Parser)]
#[command(name = "kira-genomes")]
#[command(about = "Acquire reference genomes for a catalog of organisms (RefSeq, then GenBank)")]
#[command(version, author)]
struct Cli {
    /// Print machine-readable JSON on stdout.
    #[arg(long, global = true)]
    json: bool,

    /// Path to a kira-genomes.json config file.
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Acquire genomes for every organism in the worklist")]
    Run(RunArgs),
    #[command(about = "Extract (or show the cached) organism worklist")]
    Worklist(WorklistArgs),
    #[command(about = "Summarize the most recent run from the event log")]
    Summary(CommonArgs),
    #[command(about = "Remove scratch directories left by interrupted runs")]
    Clean(CommonArgs),
}

#[derive(Args, Clone, Default)]
struct CommonArgs {
    /// Directory holding artifacts (and, by default, the ledger).
    #[arg(long)]
    output_dir: Option<String>,
}

#[derive(Args, Clone)]
struct WorklistArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Catalog URL or local TSV path.
    #[arg(long)]
    catalog: Option<String>,

    /// Re-extract even when a cached worklist exists.
    #[arg(long)]
    refresh: bool,
}

#[derive(Args, Clone)]
struct RunArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Catalog URL or local TSV path.
    #[arg(long)]
    catalog: Option<String>,

    #[arg(long, value_enum)]
    assembly_level: Option<AssemblyLevel>,

    /// Keep only the uncompressed sequence file.
    #[arg(long)]
    no_compress: bool,

    #[arg(long, value_enum)]
    provider: Option<ProviderKind>,

    /// Number of organisms processed concurrently.
    #[arg(long)]
    jobs: Option<usize>,

    /// Re-extract the worklist even when a cached one exists.
    #[arg(long)]
    refresh_worklist: bool,

    /// Leave out organisms already listed in failed.txt.
    #[arg(long)]
    skip_known_failures: bool,

    /// Process at most this many organisms.
    #[arg(long)]
    limit: Option<usize>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(kira) = report.downcast_ref::<KiraError>() {
            return ExitCode::from(map_exit_code(kira));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &KiraError) -> u8 {
    match error {
        KiraError::ConfigRead(_)
        | KiraError::ConfigParse(_)
        | KiraError::InvalidAssemblyLevel(_) => 2,
        KiraError::MissingDependency(_) | KiraError::MissingTool(_) => 3,
        KiraError::CatalogFetch(_) | KiraError::EmptyCatalog | KiraError::MissingCatalogSource => 4,
        KiraError::LedgerWrite { .. } => 5,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Text
    };

    match cli.command {
        Commands::Run(args) => run_acquisition(cli.config.as_deref(), args, output_mode),
        Commands::Worklist(args) => run_worklist(cli.config.as_deref(), args, output_mode),
        Commands::Summary(args) => run_summary(cli.config.as_deref(), args, output_mode),
        Commands::Clean(args) => run_clean(cli.config.as_deref(), args, output_mode),
    }
}

fn resolve(config: Option<&str>, overrides: ConfigOverrides) -> miette::Result<ResolvedConfig> {
    Ok(ConfigLoader::resolve(config, overrides)?)
}

fn load_worklist(
    resolved: &ResolvedConfig,
    refresh: bool,
) -> miette::Result<(Worklist, catalog::WorklistOrigin)> {
    let cached = resolved.worklist_path.as_std_path().exists();
    let source: Box<dyn catalog::CatalogSource> = match &resolved.catalog {
        Some(location) => catalog::catalog_source(location)?,
        None if cached && !refresh => Box::new(NoCatalog),
        None => return Err(KiraError::MissingCatalogSource.into()),
    };
    Ok(catalog::load_or_extract(
        &resolved.worklist_path,
        source.as_ref(),
        refresh,
    )?)
}

fn run_acquisition(
    config: Option<&str>,
    args: RunArgs,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let overrides = ConfigOverrides {
        catalog: args.catalog,
        output_dir: args.common.output_dir,
        assembly_level: args.assembly_level,
        no_compress: args.no_compress,
        provider: args.provider,
        jobs: args.jobs,
    };
    let resolved = resolve(config, overrides)?;

    preflight::verify(
        &preflight::requirements(&resolved),
        &SystemProbe::new(resolved.provider),
    )?;

    let (mut worklist, _) = load_worklist(&resolved, args.refresh_worklist)?;
    if args.skip_known_failures {
        let known = ledger::known_failures(&resolved.ledger_dir)?;
        let before = worklist.len();
        worklist.retain(|organism| !known.contains(organism));
        tracing::info!(
            skipped = before - worklist.len(),
            "left out organisms with recorded failures"
        );
    }
    if let Some(limit) = args.limit {
        worklist.truncate(limit);
    }

    let primary = ncbi::provider_for(resolved.provider, GenomeSource::RefSeq)?;
    let secondary = ncbi::provider_for(resolved.provider, GenomeSource::GenBank)?;
    let store = FsArtifactStore::new(
        resolved.output_dir.clone(),
        resolved.sequence_extension.clone(),
    );
    store.ensure_root()?;
    let ledger = Ledger::open(&resolved.ledger_dir)?;

    let orchestrator = Orchestrator::new(
        primary,
        secondary,
        store,
        ZipExtractor,
        AcquisitionOptions::from(&resolved),
    );
    let sink: Box<dyn ProgressSink> = match output_mode {
        OutputMode::Text => Box::new(StderrProgress::new(worklist.len())),
        OutputMode::Json => Box::new(SilentProgress),
    };
    let summary = orchestrator.run(&worklist, &ledger, sink.as_ref())?;

    let result = RunResult {
        run_id: ledger.run_id().to_string(),
        worklist_len: worklist.len(),
        summary,
        compression_warnings: ledger.warnings(),
        output_dir: resolved.output_dir.to_string(),
        ledger_dir: resolved.ledger_dir.to_string(),
    };
    match output_mode {
        OutputMode::Json => JsonOutput::print_run(&result).into_diagnostic()?,
        OutputMode::Text => TextOutput::print_run(&result),
    }
    Ok(())
}

fn run_worklist(
    config: Option<&str>,
    args: WorklistArgs,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let overrides = ConfigOverrides {
        catalog: args.catalog,
        output_dir: args.common.output_dir,
        ..ConfigOverrides::default()
    };
    let resolved = resolve(config, overrides)?;
    let (worklist, origin) = load_worklist(&resolved, args.refresh)?;
    let result = WorklistResult::new(&resolved.worklist_path, origin, &worklist);
    match output_mode {
        OutputMode::Json => JsonOutput::print_worklist(&result).into_diagnostic()?,
        OutputMode::Text => TextOutput::print_worklist(&result),
    }
    Ok(())
}

fn run_summary(
    config: Option<&str>,
    args: CommonArgs,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let overrides = ConfigOverrides {
        output_dir: args.output_dir,
        ..ConfigOverrides::default()
    };
    let resolved = resolve(config, overrides)?;
    let report = ledger::scan_latest_run(&resolved.ledger_dir)?;
    match output_mode {
        OutputMode::Json => JsonOutput::print_report(report.as_ref()).into_diagnostic()?,
        OutputMode::Text => TextOutput::print_report(report.as_ref()),
    }
    Ok(())
}

fn run_clean(
    config: Option<&str>,
    args: CommonArgs,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let overrides = ConfigOverrides {
        output_dir: args.output_dir,
        ..ConfigOverrides::default()
    };
    let resolved = resolve(config, overrides)?;
    let store = FsArtifactStore::new(
        resolved.output_dir.clone(),
        resolved.sequence_extension.clone(),
    );
    let removed = store.clean_scratch()?;
    tracing::info!(removed, "scratch cleaned");
    let result = CleanResult {
        scratch_dir: store.scratch_root().to_string(),
        removed,
    };
    match output_mode {
        OutputMode::Json => JsonOutput::print_clean(&result).into_diagnostic()?,
        OutputMode::Text => TextOutput::print_clean(&result),
    }
    Ok(())
}

/// Stand-in source when only a cached worklist is available.
struct NoCatalog;

impl catalog::CatalogSource for NoCatalog {
    fn fetch_catalog(&self) -> Result<String, KiraError> {
        Err(KiraError::MissingCatalogSource)
    }
}
