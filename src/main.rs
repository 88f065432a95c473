//! c2c-scraper main entry point
//!
//! This is the command-line interface for the c2c listings scraper.

use anyhow::Context;
use c2c_scraper::config::{load_config_with_hash, Config, SourceFormat};
use c2c_scraper::crawler::{run_crawl, Extractors, StartMode};
use c2c_scraper::output::{load_statistics, print_statistics};
use c2c_scraper::storage::{read_checkpoint, RunStatus, SqliteStore};
use c2c_scraper::ScraperError;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Exit code for a run halted by a persistence failure
const EXIT_HALTED: u8 = 2;

/// Exit code for start-up failures
const EXIT_STARTUP: u8 = 1;

/// c2c-scraper: a polite, resumable listings scraper
///
/// Pulls listing pages from the configured sources, keeps only records it
/// has never stored before and commits them to the data directory. An
/// interrupted crawl resumes from its last checkpoint.
#[derive(Parser, Debug)]
#[command(name = "c2c-scraper")]
#[command(version = "1.0.0")]
#[command(about = "A polite, resumable listings scraper", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Ignore the checkpoint and start from the seeds (stored records are kept)
    #[arg(long)]
    fresh: bool,

    /// Re-crawl outings dated from the latest stored one (minus update-margin-days) to today
    #[arg(long, conflicts_with_all = ["fresh", "dry_run", "stats"])]
    update: bool,

    /// Validate config and show what would be crawled without actually crawling
    #[arg(long, conflicts_with = "stats")]
    dry_run: bool,

    /// Show statistics from the data directory and exit
    #[arg(long, conflicts_with = "dry_run")]
    stats: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    setup_logging(cli.verbose, cli.quiet, cli.log_format);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::from(EXIT_STARTUP)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    // Load and validate configuration
    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (config, config_hash) = load_config_with_hash(&cli.config)
        .with_context(|| format!("invalid configuration {}", cli.config.display()))?;
    tracing::info!(hash = %config_hash, "Configuration loaded successfully");

    // Handle different modes
    if cli.dry_run {
        handle_dry_run(&config)?;
        Ok(ExitCode::SUCCESS)
    } else if cli.stats {
        handle_stats(&config)?;
        Ok(ExitCode::SUCCESS)
    } else {
        let mode = if cli.update {
            StartMode::Update
        } else if cli.fresh {
            StartMode::Fresh
        } else {
            StartMode::Resume
        };
        handle_crawl(config, config_hash, mode).await
    }
}

/// Sets up the logging/tracing subscriber
///
/// `RUST_LOG` wins over `-v`/`-q` when set.
fn setup_logging(verbose: u8, quiet: bool, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if quiet {
            // Only show errors
            EnvFilter::new("error")
        } else {
            match verbose {
                0 => EnvFilter::new("c2c_scraper=info,warn"),
                1 => EnvFilter::new("c2c_scraper=debug,info"),
                2 => EnvFilter::new("c2c_scraper=trace,debug"),
                _ => EnvFilter::new("trace"),
            }
        }
    });

    match format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .init(),
    }
}

/// Cancels the token on SIGINT or SIGTERM
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = term.recv() => {}
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Cannot listen for SIGTERM");
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }

        tracing::info!("Shutdown signal received");
        cancel.cancel();
    });
}

/// Handles the --dry-run mode: validates config and shows what would be crawled
fn handle_dry_run(config: &Config) -> anyhow::Result<()> {
    Extractors::from_config(config).context("source extraction rules are invalid")?;

    println!("=== c2c-scraper Dry Run ===\n");

    println!("Crawler Configuration:");
    println!("  Max depth: {}", config.crawler.max_depth);
    println!("  Workers: {}", config.crawler.workers);
    println!(
        "  Minimum request interval: {}ms",
        config.crawler.min_request_interval
    );
    println!("  Max attempts: {}", config.crawler.max_attempts);
    println!(
        "  Backoff: {}ms doubling up to {}ms",
        config.crawler.backoff_base, config.crawler.backoff_max
    );
    println!("  Respect robots.txt: {}", config.crawler.respect_robots);

    println!("\nCheckpoints:");
    println!(
        "  Every {} cycles or {}s",
        config.checkpoint.interval_cycles, config.checkpoint.interval_secs
    );

    println!("\nUser Agent:");
    println!("  {}", config.user_agent.header_value());

    println!("\nOutput:");
    println!("  Data directory: {}", config.output.data_dir.display());
    match read_checkpoint(&config.output.data_dir) {
        Ok(Some(checkpoint)) => println!(
            "  Would resume from checkpoint #{} ({} pending targets)",
            checkpoint.sequence,
            checkpoint.frontier.pending.len()
        ),
        Ok(None) => println!("  No checkpoint, would start from the seeds"),
        Err(e) => println!("  Checkpoint unreadable: {}", e),
    }

    println!("\nSources ({}):", config.sources.len());
    for source in &config.sources {
        let format = match source.format {
            SourceFormat::C2cApi => "c2c-api",
            SourceFormat::Html => "html",
        };
        println!(
            "  - {} [{}] ({} seeds)",
            source.name,
            format,
            source.seeds.len()
        );
        for seed in &source.seeds {
            println!("    * {}", seed);
        }
    }

    println!("\n✓ Configuration is valid");
    println!(
        "✓ Would start crawling with {} seed URLs",
        config.seed_count()
    );

    Ok(())
}

/// Handles the --stats mode: shows statistics from the data directory
fn handle_stats(config: &Config) -> anyhow::Result<()> {
    println!("Data directory: {}\n", config.output.data_dir.display());

    let store = SqliteStore::open(&config.output.data_dir)
        .with_context(|| format!("cannot open {}", config.output.data_dir.display()))?;
    let stats = load_statistics(&store)?;
    print_statistics(&stats);

    Ok(())
}

/// Handles the main crawl operation
async fn handle_crawl(
    config: Config,
    config_hash: String,
    mode: StartMode,
) -> anyhow::Result<ExitCode> {
    match mode {
        StartMode::Resume => {
            tracing::info!("Starting crawl (will resume from the checkpoint if present)")
        }
        StartMode::Fresh => tracing::info!(
            "Starting fresh crawl (ignoring the checkpoint, keeping stored records)"
        ),
        StartMode::Update => tracing::info!(
            margin_days = config.crawler.update_margin_days,
            "Starting update crawl (ignoring the checkpoint, re-crawling recent outings)"
        ),
    }
    tracing::info!(
        sources = config.sources.len(),
        seeds = config.seed_count(),
        "Crawl plan"
    );

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    match run_crawl(config, config_hash, mode, cancel).await {
        Ok(report) => {
            match report.status {
                RunStatus::Interrupted => tracing::info!(
                    pending = report.pending,
                    checkpoint = ?report.last_checkpoint,
                    "Crawl interrupted, resume by running again"
                ),
                _ => tracing::info!(
                    written = report.counters.records_written,
                    "Crawl completed successfully"
                ),
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(e @ ScraperError::Halted { .. }) => {
            tracing::error!("{}", e);
            Ok(ExitCode::from(EXIT_HALTED))
        }
        Err(e) => Err(e.into()),
    }
}
