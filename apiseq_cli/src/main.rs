use apiseq_core::catalog::{BUILTIN_LIBRARIES, Catalog, builtin};
use apiseq_core::config::{ApiseqConfig, CorpusType};
use apiseq_core::corpus::{Corpus, InMemoryCorpus, OnDiskCorpus};
use apiseq_core::enforcer::LintOptions;
use apiseq_core::{Batch, lint_file, write_artifacts};

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Exit status of a run that could not complete. Violation and shortfall
/// counts saturate one below it.
const FATAL_STATUS: u8 = u8::MAX;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file; `config.toml` in the working directory is used when absent.
    #[clap(long = "config", value_parser, global = true)]
    config_file: Option<PathBuf>,
    /// Log at debug level unless RUST_LOG says otherwise.
    #[clap(short, long, global = true)]
    verbose: bool,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Synthesize a batch of C test functions.
    Generate(GenerateArgs),
    /// Check a sequence (`.json`, `.seq` or C source) for resource-safety violations.
    Lint(LintArgs),
    /// List the built-in library catalogs.
    Catalogs,
}

#[derive(Args, Debug)]
struct CatalogArgs {
    #[clap(short, long)]
    library: Option<String>,
    /// Catalog TOML file used instead of a built-in library.
    #[clap(long, value_parser)]
    catalog: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct GenerateArgs {
    #[clap(flatten)]
    target: CatalogArgs,
    #[clap(short = 'n', long)]
    count: Option<usize>,
    #[clap(long)]
    min_len: Option<usize>,
    #[clap(long)]
    max_len: Option<usize>,
    #[clap(short, long)]
    seed: Option<u64>,
    #[clap(short, long, value_parser)]
    out_dir: Option<PathBuf>,
    #[clap(short, long)]
    threads: Option<usize>,
    #[clap(long)]
    retries: Option<usize>,
    #[clap(long)]
    first_id: Option<u64>,
    #[clap(long)]
    negative_rate: Option<f64>,
    /// Keep only sequences that add an unseen API triple.
    #[clap(long)]
    minimize: bool,
    /// Always run cleanup, never emit leaked sequences.
    #[clap(long)]
    no_leak: bool,
}

#[derive(Args, Debug)]
struct LintArgs {
    #[clap(flatten)]
    target: CatalogArgs,
    #[clap(short, long, value_parser)]
    file: PathBuf,
    /// Report resources still alive at the end.
    #[clap(long)]
    no_leak: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Command::Generate(args) => {
            load_config(cli.config_file).and_then(|config| generate(config, args))
        }
        Command::Lint(args) => lint(args),
        Command::Catalogs => catalogs(),
    };
    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(FATAL_STATUS)
        }
    }
}

fn load_config(path: Option<PathBuf>) -> Result<ApiseqConfig, anyhow::Error> {
    match path {
        Some(config_path) => {
            info!(path = ?config_path, "Loading configuration");
            ApiseqConfig::load_from_file(&config_path)
        }
        None => {
            let default_config_path = PathBuf::from("config.toml");
            if default_config_path.exists() {
                info!(path = ?default_config_path, "Loading default configuration");
                ApiseqConfig::load_from_file(&default_config_path)
            } else {
                debug!("No config file found, using built-in defaults");
                Ok(ApiseqConfig::default())
            }
        }
    }
}

fn load_catalog(
    library: Option<&str>,
    catalog: Option<&PathBuf>,
) -> Result<Arc<Catalog>, anyhow::Error> {
    if let Some(path) = catalog {
        let loaded = Catalog::load_from_file(path)
            .with_context(|| format!("Failed to load catalog {:?}", path))?;
        if let Some(library) = library.filter(|l| *l != loaded.library) {
            warn!(requested = library, catalog = %loaded.library, "Library name differs from catalog");
        }
        return Ok(Arc::new(loaded));
    }
    match library {
        Some(name) => builtin(name).with_context(|| {
            format!(
                "No catalog for `{}`; built-in libraries are {}",
                name,
                BUILTIN_LIBRARIES.join(", ")
            )
        }),
        None => bail!("Either --library or --catalog is required"),
    }
}

fn generate(mut config: ApiseqConfig, args: GenerateArgs) -> Result<ExitCode, anyhow::Error> {
    let generation = &mut config.generation;
    if args.target.library.is_some() {
        generation.library = args.target.library;
    }
    if args.target.catalog.is_some() {
        generation.catalog = args.target.catalog;
    }
    if let Some(count) = args.count {
        generation.count = count;
    }
    if let Some(seed) = args.seed {
        generation.seed = seed;
    }
    if let Some(threads) = args.threads {
        generation.threads = threads;
    }
    if let Some(retries) = args.retries {
        generation.retries = retries;
    }
    if let Some(first_id) = args.first_id {
        generation.first_id = first_id;
    }
    generation.minimize |= args.minimize;

    let synthesis = &mut config.synthesis;
    if let Some(min_len) = args.min_len {
        synthesis.min_len = min_len;
    }
    if let Some(max_len) = args.max_len {
        synthesis.max_len = max_len;
    }
    if let Some(rate) = args.negative_rate {
        synthesis.negative_rate = rate;
    }
    if args.no_leak {
        synthesis.leak_rate = 0.0;
    }
    if let Some(out_dir) = args.out_dir {
        config.output.out_dir = out_dir;
    }
    config.validate().context("Invalid settings")?;
    debug!(?config, "Effective configuration");

    let catalog = load_catalog(
        config.generation.library.as_deref(),
        config.generation.catalog.as_ref(),
    )?;

    let mut corpus: Box<dyn Corpus> = match config.output.corpus_type {
        CorpusType::OnDisk => {
            let path = config.output.out_dir.join("corpus");
            Box::new(
                OnDiskCorpus::new(path.clone())
                    .with_context(|| format!("Failed to open corpus at {:?}", path))?,
            )
        }
        CorpusType::InMemory => Box::new(InMemoryCorpus::new()),
    };

    info!(
        library = %catalog.library,
        count = config.generation.count,
        seed = config.generation.seed,
        threads = config.generation.threads,
        corpus = config.output.corpus_type.to_string(),
        "Generating"
    );
    let start_time = Instant::now();
    let outcome = Batch::new(&catalog, config.synthesis.clone(), config.generation.clone())
        .run(corpus.as_mut())
        .context("Generation failed")?;
    let written = write_artifacts(&outcome, &config.output).context("Failed to write artifacts")?;

    info!(
        written = written.len(),
        dead_ends = outcome.dead_ends,
        rejected = outcome.rejected,
        corpus = corpus.len(),
        elapsed = ?start_time.elapsed(),
        out_dir = ?config.output.out_dir,
        "Generation finished"
    );
    if outcome.shortfall > 0 {
        warn!(
            shortfall = outcome.shortfall,
            requested = config.generation.count,
            "Fewer sequences than requested"
        );
        return Ok(ExitCode::from(count_status(outcome.shortfall)));
    }
    Ok(ExitCode::SUCCESS)
}

fn lint(args: LintArgs) -> Result<ExitCode, anyhow::Error> {
    let catalog = load_catalog(args.target.library.as_deref(), args.target.catalog.as_ref())?;
    let options = LintOptions {
        no_leak: args.no_leak,
    };
    let report = lint_file(&catalog, &args.file, options)
        .with_context(|| format!("Failed to lint {:?}", args.file))?;

    for violation in &report.violations {
        match report.line_of(violation) {
            Some(line) => println!("{}:{}: {}", args.file.display(), line, violation),
            None => println!("{}: {}", args.file.display(), violation),
        }
    }
    info!(
        calls = report.calls.len(),
        violations = report.violations.len(),
        "Lint finished"
    );
    Ok(ExitCode::from(count_status(report.violations.len())))
}

fn catalogs() -> Result<ExitCode, anyhow::Error> {
    for library in BUILTIN_LIBRARIES {
        let catalog = builtin(library).with_context(|| format!("Bundled catalog `{}`", library))?;
        println!(
            "{:<10} {:>3} apis {:>2} classes  {}",
            catalog.library,
            catalog.apis().len(),
            catalog.classes().count(),
            catalog.description
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn count_status(n: usize) -> u8 {
    n.min(FATAL_STATUS as usize - 1) as u8
}
