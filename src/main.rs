//! tabular-ingest CLI
//!
//! Classify single files, push them through the pipeline, or run the polling worker.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use tabular_ingest::PipelineConfig;
use tabular_ingest::classifier::{KnownHeaders, classify_file};
use tabular_ingest::config::PathsConfig;
use tabular_ingest::pipeline::{InMemoryRunStore, Orchestrator, RunStatus, Worker, scan_inbound};

#[derive(Parser)]
#[command(name = "tabular-ingest")]
#[command(about = "Classify, map and normalize tabular files", long_about = None)]
struct Cli {
    /// Path to a TOML or JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Root directory for the default data/ and logs/ layout (ignored with --config)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify a file and print the result as JSON
    Classify { file: PathBuf },

    /// Run the full pipeline on a single file
    Process { file: PathBuf },

    /// Poll for enqueued runs and process them one at a time
    Worker {
        /// Enqueue new files found in the inbound directory before every poll
        #[arg(long)]
        scan: bool,

        /// Scan the inbound directory once, drain the queue, then exit
        #[arg(long)]
        once: bool,
    },

    /// Print the effective configuration as TOML
    PrintConfig,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref(), cli.root.as_deref())?;

    match cli.command {
        Commands::Classify { file } => classify_command(&config, &file),
        Commands::Process { file } => process_command(config, &file),
        Commands::Worker { scan, once } => worker_command(config, scan, once),
        Commands::PrintConfig => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>, root: Option<&Path>) -> Result<PipelineConfig> {
    let config = match (path, root) {
        (Some(p), _) => PipelineConfig::from_file(p)
            .with_context(|| format!("loading configuration from {}", p.display()))?,
        (None, Some(r)) => PipelineConfig {
            paths: PathsConfig::rooted_at(r),
            ..Default::default()
        },
        (None, None) => PipelineConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn known_headers(config: &PipelineConfig) -> Result<KnownHeaders> {
    let known = match &config.paths.known_headers {
        Some(p) => KnownHeaders::from_path(p)
            .with_context(|| format!("loading known headers from {}", p.display()))?,
        None => KnownHeaders::bundled()?,
    };
    tracing::debug!(entries = known.len(), "loaded known headers");
    Ok(known)
}

fn build_orchestrator(config: PipelineConfig) -> Result<Orchestrator> {
    config.ensure_directories()?;
    let known = Arc::new(known_headers(&config)?);

    #[cfg(feature = "http-mapper")]
    let mapper = tabular_ingest::mapping::http::HttpSchemaMapper::from_config(&config.mapping)?;

    let orchestrator = Orchestrator::new(config, known, Arc::new(InMemoryRunStore::new()));

    #[cfg(feature = "http-mapper")]
    let orchestrator = match mapper {
        Some(m) => orchestrator.with_mapper(Arc::new(m)),
        None => orchestrator,
    };

    Ok(orchestrator)
}

fn classify_command(config: &PipelineConfig, file: &Path) -> Result<()> {
    let known = known_headers(config)?;
    let result = classify_file(file, &config.classifier, &known);
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn process_command(config: PipelineConfig, file: &Path) -> Result<()> {
    let orchestrator = build_orchestrator(config)?;
    let run = orchestrator.process_file(file)?;
    println!("{}", serde_json::to_string_pretty(&run)?);
    if run.status != RunStatus::Ok {
        anyhow::bail!(
            "run {} ended with status {:?}: {}",
            run.id,
            run.status,
            run.error_message.unwrap_or_default()
        );
    }
    Ok(())
}

fn worker_command(config: PipelineConfig, scan: bool, once: bool) -> Result<()> {
    let orchestrator = Arc::new(build_orchestrator(config)?);

    if once {
        scan_inbound(&orchestrator, &orchestrator.config().paths.inbound_dir)?;
        let worker = Worker::new(Arc::clone(&orchestrator));
        let mut processed = 0usize;
        while let Some(run) = worker.run_once()? {
            tracing::info!(run_id = %run.id, status = ?run.status, "run finished");
            processed += 1;
        }
        tracing::info!(processed, "queue drained");
        return Ok(());
    }

    Worker::new(orchestrator).with_inbound_scan(scan).run();
    Ok(())
}
