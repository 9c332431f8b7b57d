use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs::OpenOptions;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use treemirror::health::CheckResult;
use treemirror::{Config, HealthCheck, InitialSync, MirrorDaemon, RunOptions, SyncRoots};

#[derive(Parser)]
#[command(name = "treemirror")]
#[command(about = "One-way directory mirror for intermittently reachable sources")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (defaults to XDG config location)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log file path (overrides the configured one)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Mirror the source into the destination, then keep it in sync
    Run {
        /// Source directory (may live on a network share)
        #[arg(short, long, visible_alias = "resource")]
        source: PathBuf,

        /// Local destination directory
        #[arg(short, long)]
        destination: PathBuf,

        /// Run the initial sync without asking, even into a populated destination
        #[arg(long)]
        initial_sync: bool,

        /// Exit after the initial sync instead of monitoring changes
        #[arg(long)]
        no_watch: bool,
    },

    /// System health check and diagnostics
    Doctor {
        /// Source directory
        #[arg(short, long, visible_alias = "resource")]
        source: PathBuf,

        /// Local destination directory
        #[arg(short, long)]
        destination: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(log_file) = &cli.log_file {
        config.logging.log_file = log_file.to_string_lossy().into_owned();
    }

    init_logging(cli.verbose, &config)?;
    info!("Starting treemirror v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Run {
            source,
            destination,
            initial_sync,
            no_watch,
        } => cmd_run(source, destination, initial_sync, no_watch, &config).await,
        Commands::Doctor {
            source,
            destination,
        } => cmd_doctor(source, destination, &config).await,
    }
}

/// Initialize console and log file output
fn init_logging(verbose: bool, config: &Config) -> Result<()> {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.logging.level.as_str()))
    };

    let log_path = Path::new(&config.logging.log_file);
    if let Some(parent) = log_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory: {}", parent.display()))?;
    }
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("Failed to open log file: {}", log_path.display()))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_ansi(config.logging.color))
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_writer(Arc::new(log_file)),
        )
        .init();

    Ok(())
}

/// Load configuration from specified path or default location
fn load_config(config_path: Option<&Path>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load(path),
        None => Config::load_or_default(),
    }
}

async fn cmd_run(
    source: PathBuf,
    destination: PathBuf,
    initial_sync: bool,
    no_watch: bool,
    config: &Config,
) -> Result<()> {
    let roots = SyncRoots::new(&source, &destination)?;

    let initial_sync = if initial_sync {
        InitialSync::Full
    } else if ask_skip_initial_sync()? {
        InitialSync::SkipIfPopulated
    } else {
        InitialSync::Full
    };

    let daemon = MirrorDaemon::new(config, roots)?;
    let report = daemon
        .run(RunOptions {
            initial_sync,
            watch: !no_watch,
        })
        .await?;

    if let Some(stats) = report.supervisor {
        info!(
            "Handled {} events; {} outages, {} recoveries",
            report.events_handled, stats.outages, stats.recoveries
        );
    }

    Ok(())
}

/// Ask whether an already populated destination may be left as it is
fn ask_skip_initial_sync() -> Result<bool> {
    print!("Skip initial sync? (y/n) ");
    io::stdout().flush().context("Failed to flush stdout")?;

    let mut answer = String::new();
    io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("Failed to read answer")?;

    Ok(answer.trim().eq_ignore_ascii_case("y"))
}

async fn cmd_doctor(source: PathBuf, destination: PathBuf, config: &Config) -> Result<()> {
    let roots = SyncRoots::new(&source, &destination)?;
    let health = HealthCheck::run(config, &roots).await;
    print_health_report(&health);

    if !health.all_passed() {
        std::process::exit(1);
    }
    Ok(())
}

/// Print health check report to stdout
fn print_health_report(health: &HealthCheck) {
    fn print_check(name: &str, result: &CheckResult) {
        println!("{}:", name);
        let icon = if result.passed {
            if result.is_warning { "⚠️ " } else { "✅" }
        } else {
            "❌"
        };
        println!("  {} {}", icon, result.message);
        if let Some(details) = &result.details {
            for line in details.lines() {
                println!("     {}", line);
            }
        }
    }

    println!("🔍 treemirror System Diagnostics");
    println!();

    for (name, result) in health.all_checks() {
        print_check(name, result);
        println!();
    }

    if health.all_passed() {
        println!("✅ All checks passed");
    } else {
        println!("❌ Some checks failed");
    }
}
