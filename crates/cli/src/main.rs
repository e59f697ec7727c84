//! CLI entry point for the backup media transformer.
//!
//! Two modes share one pipeline: `watch` follows a directory tree via
//! filesystem events, `run` drives the backup extraction subprocess and
//! follows its completion protocol. Both drain in-flight conversions on
//! ctrl-c before exiting.

use backup_transformer::{shutdown, Config, ExtractionRunner, Pipeline, ToolResolver, WatchSource};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Backup media transformer - converts media files in place while a backup
/// is being written
#[derive(Parser, Debug)]
#[command(name = "backup-transformer")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to an optional configuration file (config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Duplicate all output into this log file
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Show verbose output including filtered extractor lines
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Watch a directory tree and convert media files as they appear
    Watch {
        /// Directory to watch
        dir: PathBuf,
    },
    /// Run the backup extraction tool and convert files as it reports them
    Run {
        /// Backup directory path (the device directory the extractor
        /// writes into)
        backup_dir: PathBuf,

        /// Name or path of the extraction executable
        #[arg(long, default_value = "ios_backup")]
        extractor: String,
    },
}

fn init_logging(verbose: bool, log_file: Option<&PathBuf>) -> Result<(), String> {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    let file_layer = match log_file {
        Some(path) => {
            let file = std::fs::File::create(path)
                .map_err(|e| format!("failed to create log file {}: {e}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Arc::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = init_logging(args.verbose, args.log_file.as_ref()) {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }

    let config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                error!("failed to load configuration: {e}");
                return ExitCode::FAILURE;
            }
        },
        None => {
            let mut config = Config::default();
            config.apply_env_overrides();
            config
        }
    };

    let (trigger, shutdown_signal) = shutdown::channel();
    let pipeline = Arc::new(Pipeline::new(&config, shutdown_signal.clone()));

    // First ctrl-c requests a graceful drain.
    let _signal_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested, draining in-flight conversions");
            trigger.trigger();
        }
    });

    let run_result = match &args.command {
        Command::Watch { dir } => {
            if !dir.is_dir() {
                error!("watch directory does not exist: {}", dir.display());
                return ExitCode::FAILURE;
            }
            info!(dir = %dir.display(), "starting watch mode");

            WatchSource::new(dir.clone(), config.watch.clone())
                .run(pipeline.clone(), shutdown_signal.clone())
                .await
                .map_err(|e| e.to_string())
        }
        Command::Run {
            backup_dir,
            extractor,
        } => {
            // The backup directory itself may not exist yet, but its parent
            // must.
            let parent_exists = backup_dir
                .parent()
                .map(|p| p.is_dir())
                .unwrap_or(false);
            if !parent_exists {
                error!(
                    "backup directory parent does not exist: {}",
                    backup_dir.display()
                );
                return ExitCode::FAILURE;
            }
            info!(backup_dir = %backup_dir.display(), "starting extraction run");

            let tools = ToolResolver::new(config.transform.libraries_dir.clone());
            ExtractionRunner::new(
                backup_dir.clone(),
                extractor.clone(),
                args.verbose,
                config.extractor.clone(),
            )
            .run(pipeline.clone(), &tools, shutdown_signal.clone())
            .await
            .map_err(|e| e.to_string())
        }
    };

    // Whatever happened to the source, drain the jobs it already admitted.
    let ledger = pipeline.drain().await;
    info!(
        total = ledger.total,
        "all jobs completed, pipeline drained"
    );

    match run_result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("run failed: {e}");
            ExitCode::FAILURE
        }
    }
}
